// =============================================================================
// Recent Sells — "was this symbol sold in the last N hours?"
// =============================================================================
//
// A symbol → last-sell-time map persisted as JSON.  The exit engine only
// writes it; entry logic elsewhere reads it to avoid rebuying straight after
// a sell.  Writes use the atomic tmp + rename pattern.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct RecentSells {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl RecentSells {
    /// Open the store at `path`; a missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::read(&path) {
            Ok(entries) => entries,
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "recent sells unreadable — starting empty");
                }
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), count = entries.len(), "recent sells loaded");
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn read(path: &Path) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read recent sells from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse recent sells from {}", path.display()))
    }

    pub fn record(&self, symbol: &str, at: DateTime<Utc>) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock();
            entries.insert(symbol.to_string(), at);
            entries.clone()
        };
        self.persist(&snapshot)?;
        info!(symbol, at = %at.to_rfc3339(), "recent sell recorded");
        Ok(())
    }

    pub fn last_sell(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.entries.lock().get(symbol).copied()
    }

    pub fn sold_within(&self, symbol: &str, window: Duration, now: DateTime<Utc>) -> bool {
        self.last_sell(symbol)
            .map(|at| now - at < window)
            .unwrap_or(false)
    }

    /// Drop entries older than `max_age`; returns how many were removed.
    pub fn cleanup(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let (removed, snapshot) = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, at| now - *at < max_age);
            (before - entries.len(), entries.clone())
        };
        if removed > 0 {
            self.persist(&snapshot)?;
        }
        Ok(removed)
    }

    fn persist(&self, entries: &BTreeMap<String, DateTime<Utc>>) -> Result<()> {
        let content =
            serde_json::to_string_pretty(entries).context("failed to serialise recent sells")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("recent_sells_{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn record_persists_across_reopen() {
        let path = temp_path();
        let now = Utc::now();
        RecentSells::open(&path).record("CAKEUSDT", now).unwrap();

        let reopened = RecentSells::open(&path);
        assert_eq!(reopened.last_sell("CAKEUSDT"), Some(now));
        assert!(reopened.sold_within("CAKEUSDT", Duration::hours(1), now + Duration::minutes(30)));
        assert!(!reopened.sold_within("CAKEUSDT", Duration::hours(1), now + Duration::hours(2)));
        assert!(!reopened.sold_within("ETHUSDT", Duration::hours(1), now));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn cleanup_drops_old_entries() {
        let path = temp_path();
        let store = RecentSells::open(&path);
        let now = Utc::now();
        store.record("OLDUSDT", now - Duration::hours(30)).unwrap();
        store.record("NEWUSDT", now - Duration::hours(1)).unwrap();

        assert_eq!(store.cleanup(Duration::hours(24), now).unwrap(), 1);
        assert!(store.last_sell("OLDUSDT").is_none());
        assert!(RecentSells::open(&path).last_sell("NEWUSDT").is_some());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let path = temp_path();
        std::fs::write(&path, "not json").unwrap();
        assert!(RecentSells::open(&path).last_sell("X").is_none());
        let _ = std::fs::remove_file(path);
    }
}
