// =============================================================================
// Position Lifecycle Manager — owns every tracked position
// =============================================================================
//
// Inputs and what they do:
//   buy fill        -> add a lot (commission-adjusted), open or re-threshold
//   sell fill       -> consume FIFO, retire below minQty (our own echoes skipped)
//   price tick      -> evaluate; on a sell verdict liquidate through the executor
//   polling cycle   -> same evaluation for one rotating group of positions
//   balance scan    -> rebuild ledgers for held assets not yet tracked
//
// Locking:
//   * one tokio Mutex per position; a tick that finds it held is dropped
//   * the position map is a parking_lot RwLock never held across an await
//   * lock order for the two sync maps is dormant -> positions
//
// Holdings too small to follow keep their ledger in a dormant map so later
// fills continue the same cost basis instead of starting from scratch.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::binance::filters::SymbolRules;
use crate::config::EngineConfig;
use crate::cost_basis::CostBasisTracker;
use crate::error::ExchangeError;
use crate::events::{CloseReason, EngineEvent, EventBus, OpenSource};
use crate::exchange::Exchange;
use crate::execution::{ExecutionResult, SellExecutor};
use crate::exit::decision::{ExitEngine, ExitInputs, ExitReason, Verdict};
use crate::indicators::atr::calculate_atr;
use crate::indicators::trend::volatility_hint;
use crate::indicators::TrendFilter;
use crate::market_data::candle::last_closed;
use crate::market_data::trade_tape::TAPE_SAMPLE_SIZE;
use crate::market_data::TapeSample;
use crate::position::{Position, PositionSnapshot};
use crate::reconcile::{discover_position, Discovery, WALLET_TOLERANCE};
use crate::recent_sells::RecentSells;
use crate::types::{BalanceInfo, FillReport, Side};

/// Knobs the lifecycle reads on every cycle.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub quote_asset: String,
    pub min_follow_notional: Decimal,
    pub candle_interval: String,
    pub check_interval: Duration,
    pub group_size: i64,
    pub rate_limit_per_minute: u32,
    pub concurrency_limit: usize,
}

impl LifecycleSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            quote_asset: config.quote_asset.clone(),
            min_follow_notional: config.min_follow_notional,
            candle_interval: config.candle_interval.clone(),
            check_interval: Duration::from_secs(config.check_interval_secs),
            group_size: config.group_size,
            rate_limit_per_minute: config.rate_limit_per_minute,
            concurrency_limit: config.concurrency_limit.max(1),
        }
    }

    /// Positions re-checked per polling cycle when `n` are tracked.
    pub fn group_size_for(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        if self.group_size > 0 {
            return (self.group_size as usize).min(n);
        }
        let interval = self.check_interval.as_secs().max(1);
        let per_minute = n as u64 * 60 / interval;
        let budget = u64::from(self.rate_limit_per_minute);
        if per_minute > budget {
            ((budget * interval / 60).max(1) as usize).min(n)
        } else {
            n
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

type PositionSlot = Arc<Mutex<Position>>;

/// One account read shared by every check of a polling cycle.
#[derive(Debug)]
struct WalletSnapshot {
    taken_at: Instant,
    totals: HashMap<String, Decimal>,
}

impl WalletSnapshot {
    fn new(balances: &[BalanceInfo], taken_at: Instant) -> Self {
        Self {
            taken_at,
            totals: balances
                .iter()
                .map(|b| (b.asset.clone(), b.total()))
                .collect(),
        }
    }

    /// Holding of `asset`, or `None` when lots were added after the read.
    fn wallet_for(&self, asset: &str, ledger_changed_at: Instant) -> Option<Decimal> {
        if self.taken_at < ledger_changed_at {
            return None;
        }
        Some(self.totals.get(asset).copied().unwrap_or_default())
    }
}

/// Result of adding a lot to an untracked ledger.
enum DormantOutcome {
    Opened { quantity: Decimal, average_price: Decimal },
    Held { average_price: Decimal },
}

pub struct PositionLifecycle {
    exchange: Arc<dyn Exchange>,
    engine: ExitEngine,
    settings: LifecycleSettings,
    positions: RwLock<HashMap<String, PositionSlot>>,
    dormant: SyncMutex<HashMap<String, CostBasisTracker>>,
    rules: RwLock<HashMap<String, SymbolRules>>,
    symbols_tx: watch::Sender<BTreeSet<String>>,
    executor: SellExecutor,
    admission: Arc<Semaphore>,
    trend: Arc<TrendFilter>,
    events: EventBus,
    recent_sells: Arc<RecentSells>,
    api_down: AtomicBool,
    group_cursor: AtomicUsize,
}

impl PositionLifecycle {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        engine: ExitEngine,
        settings: LifecycleSettings,
        trend: Arc<TrendFilter>,
        events: EventBus,
        recent_sells: Arc<RecentSells>,
    ) -> Self {
        let (symbols_tx, _) = watch::channel(BTreeSet::new());
        Self {
            executor: SellExecutor::new(Arc::clone(&exchange)),
            admission: Arc::new(Semaphore::new(settings.concurrency_limit)),
            exchange,
            engine,
            settings,
            positions: RwLock::new(HashMap::new()),
            dormant: SyncMutex::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
            symbols_tx,
            trend,
            events,
            recent_sells,
            api_down: AtomicBool::new(false),
            group_cursor: AtomicUsize::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn recent_sells(&self) -> &RecentSells {
        &self.recent_sells
    }

    /// Receiver that observes every change of the tracked symbol set.
    pub fn subscribe_symbols(&self) -> watch::Receiver<BTreeSet<String>> {
        self.symbols_tx.subscribe()
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.positions.read().contains_key(symbol)
    }

    pub fn is_api_down(&self) -> bool {
        self.api_down.load(Ordering::SeqCst)
    }

    /// Point-in-time view of every tracked position.
    pub async fn snapshots(&self) -> Vec<PositionSnapshot> {
        let slots: Vec<PositionSlot> = self.positions.read().values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let pos = slot.lock().await;
            if !pos.retired {
                out.push(pos.snapshot());
            }
        }
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    fn slot(&self, symbol: &str) -> Option<PositionSlot> {
        self.positions.read().get(symbol).cloned()
    }

    /// Record an API reachability change; returns whether it was a transition.
    pub fn set_api_status(&self, up: bool, detail: Option<String>) -> bool {
        let was_down = self.api_down.swap(!up, Ordering::SeqCst);
        if was_down != up {
            return false;
        }
        if up {
            info!("exchange API reachable again");
        } else {
            warn!(detail = ?detail, "exchange API unreachable — polling paused");
        }
        self.events.publish(EngineEvent::ApiStatus { up, detail });
        true
    }

    async fn rules_for(&self, symbol: &str) -> Result<Option<SymbolRules>, ExchangeError> {
        if let Some(rules) = self.rules.read().get(symbol) {
            return Ok(Some(rules.clone()));
        }
        let fetched = self.exchange.symbol_rules(symbol).await?;
        if let Some(rules) = &fetched {
            self.rules.write().insert(symbol.to_string(), rules.clone());
        }
        Ok(fetched)
    }

    fn publish_symbols(&self) {
        let current: BTreeSet<String> = self.positions.read().keys().cloned().collect();
        self.symbols_tx.send_if_modified(|symbols| {
            if *symbols == current {
                false
            } else {
                *symbols = current;
                true
            }
        });
    }

    // -------------------------------------------------------------------------
    // Opening and retiring
    // -------------------------------------------------------------------------

    /// Start following a balance found by the scan; `false` when the symbol
    /// is already tracked.
    fn track(&self, found: Discovery) -> bool {
        let mut position = Position::with_tracker(
            &found.symbol,
            found.tracker,
            found.rules.min_qty,
            found.min_notional,
        );
        position.observe_price(found.last_price);
        let quantity = position.quantity();
        let average_price = position.average_price();
        {
            let mut dormant = self.dormant.lock();
            let mut positions = self.positions.write();
            if positions.contains_key(&found.symbol) {
                return false;
            }
            dormant.remove(&found.symbol);
            positions.insert(found.symbol.clone(), Arc::new(Mutex::new(position)));
        }
        self.rules.write().insert(found.symbol.clone(), found.rules);
        self.publish_symbols();

        info!(
            symbol = %found.symbol,
            quantity = %quantity,
            avg_price = %average_price.round_dp(8),
            last_price = %found.last_price,
            "tracking balance"
        );
        self.events.publish(EngineEvent::PositionOpened {
            symbol: found.symbol,
            quantity,
            average_price,
            last_price: found.last_price,
            source: OpenSource::BalanceScan,
        });
        true
    }

    /// Drop `position` from the book.  Any remaining ledger is kept dormant.
    fn retire(&self, position: &mut Position, reason: CloseReason) {
        position.retire();
        let removed = self.positions.write().remove(&position.symbol).is_some();
        if !position.tracker.is_empty() {
            self.dormant
                .lock()
                .insert(position.symbol.clone(), position.tracker.clone());
        }
        self.publish_symbols();
        if removed {
            info!(
                symbol = %position.symbol,
                remaining = %position.quantity(),
                reason = %reason,
                "position closed"
            );
            self.events.publish(EngineEvent::PositionClosed {
                symbol: position.symbol.clone(),
                reason,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply a completed order reported by the user data stream.
    pub async fn on_fill(&self, fill: FillReport) -> Result<()> {
        if fill.side == Side::Sell {
            if let Some(id) = fill.client_order_id.as_deref() {
                if self.executor.take_own_order(id) {
                    debug!(symbol = %fill.symbol, client_order_id = id, "own sell echoed — already applied");
                    return Ok(());
                }
            }
        }

        let Some(rules) = self
            .rules_for(&fill.symbol)
            .await
            .with_context(|| format!("failed to load rules for {}", fill.symbol))?
        else {
            warn!(symbol = %fill.symbol, "fill for unknown symbol ignored");
            return Ok(());
        };
        if rules.quote_asset != self.settings.quote_asset {
            debug!(symbol = %fill.symbol, quote = %rules.quote_asset, "fill outside quote asset ignored");
            return Ok(());
        }

        let base_commission = match fill.commission_asset.as_deref() {
            Some(asset) if asset == rules.base_asset => fill.commission,
            _ => Decimal::ZERO,
        };

        match fill.side {
            Side::Buy => {
                self.record_buy(&rules, fill.quantity - base_commission, fill.price)
                    .await
            }
            Side::Sell => {
                self.record_disposal(&rules, fill.quantity + base_commission)
                    .await;
                Ok(())
            }
        }
    }

    async fn record_buy(&self, rules: &SymbolRules, quantity: Decimal, price: Decimal) -> Result<()> {
        let symbol = rules.symbol.as_str();
        if quantity <= Decimal::ZERO {
            debug!(symbol, quantity = %quantity, "buy fill nets to nothing after commission");
            return Ok(());
        }
        let min_notional = rules.min_notional.max(self.settings.min_follow_notional);
        let last_price = match self.exchange.ticker_price(symbol).await {
            Ok(p) => p,
            Err(e) => {
                debug!(symbol, error = %e, "ticker unavailable — using fill price");
                price
            }
        };

        let average_price = loop {
            if let Some(slot) = self.slot(symbol) {
                let mut pos = slot.lock().await;
                if pos.retired {
                    continue;
                }
                pos.tracker.add_lot(quantity, price);
                pos.ledger_changed_at = Instant::now();
                pos.min_qty = rules.min_qty;
                pos.min_notional = min_notional;
                let avg = pos.average_price();
                if !pos.is_tradeable(last_price) {
                    self.retire(&mut pos, CloseReason::BelowThreshold);
                }
                break avg;
            }

            let Some(opened) = self.open_from_dormant(rules, quantity, price, min_notional, last_price) else {
                continue;
            };
            match opened {
                DormantOutcome::Opened { quantity: qty, average_price: avg } => {
                    self.publish_symbols();
                    info!(symbol, quantity = %qty, avg_price = %avg.round_dp(8), "position opened from fill");
                    self.events.publish(EngineEvent::PositionOpened {
                        symbol: symbol.to_string(),
                        quantity: qty,
                        average_price: avg,
                        last_price,
                        source: OpenSource::Fill,
                    });
                    break avg;
                }
                DormantOutcome::Held { average_price: avg } => {
                    debug!(symbol, avg_price = %avg.round_dp(8), "holding below follow threshold");
                    break avg;
                }
            }
        };

        info!(symbol, quantity = %quantity, price = %price, avg_price = %average_price.round_dp(8), "buy recorded");
        self.events.publish(EngineEvent::BuyRecorded {
            symbol: symbol.to_string(),
            quantity,
            price,
            average_price,
        });
        Ok(())
    }

    async fn record_disposal(&self, rules: &SymbolRules, quantity: Decimal) {
        let symbol = rules.symbol.as_str();
        loop {
            if let Some(slot) = self.slot(symbol) {
                let mut pos = slot.lock().await;
                if pos.retired {
                    continue;
                }
                pos.tracker.consume(quantity);
                info!(symbol, quantity = %quantity, remaining = %pos.quantity(), "external sell recorded");
                if pos.below_min_qty() {
                    self.retire(&mut pos, CloseReason::ExternalDisposal);
                }
                return;
            }

            if self.consume_dormant(symbol, quantity) {
                return;
            }
        }
    }

    /// Add a lot to an untracked symbol's ledger, opening a position when it
    /// now qualifies.  `None` when a position appeared concurrently.
    fn open_from_dormant(
        &self,
        rules: &SymbolRules,
        quantity: Decimal,
        price: Decimal,
        min_notional: Decimal,
        last_price: Decimal,
    ) -> Option<DormantOutcome> {
        let symbol = rules.symbol.as_str();
        let mut dormant = self.dormant.lock();
        let mut positions = self.positions.write();
        if positions.contains_key(symbol) {
            return None;
        }
        let mut tracker = dormant.remove(symbol).unwrap_or_default();
        tracker.add_lot(quantity, price);
        let mut position = Position::with_tracker(symbol, tracker, rules.min_qty, min_notional);
        if position.is_tradeable(last_price) {
            position.observe_price(last_price);
            let outcome = DormantOutcome::Opened {
                quantity: position.quantity(),
                average_price: position.average_price(),
            };
            positions.insert(symbol.to_string(), Arc::new(Mutex::new(position)));
            Some(outcome)
        } else {
            let average_price = position.average_price();
            dormant.insert(symbol.to_string(), position.tracker);
            Some(DormantOutcome::Held { average_price })
        }
    }

    /// Apply a disposal to an untracked ledger; `false` when a position
    /// appeared concurrently.
    fn consume_dormant(&self, symbol: &str, quantity: Decimal) -> bool {
        let mut dormant = self.dormant.lock();
        if self.positions.read().contains_key(symbol) {
            return false;
        }
        if let Some(tracker) = dormant.get_mut(symbol) {
            tracker.consume(quantity);
            if tracker.is_empty() {
                dormant.remove(symbol);
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Hand a streamed price to the symbol's position.  Returns the spawned
    /// evaluation, or `None` when the symbol is untracked or busy.
    pub fn on_price(self: &Arc<Self>, symbol: &str, price: Decimal) -> Option<JoinHandle<()>> {
        let slot = self.slot(symbol)?;
        let Ok(mut guard) = slot.try_lock_owned() else {
            debug!(symbol, price = %price, "position busy — tick dropped");
            return None;
        };
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&this.admission).acquire_owned().await else {
                return;
            };
            if let Err(e) = this.check_position(&mut guard, Some(price), None).await {
                warn!(symbol = %guard.symbol, error = %e, "price check failed");
            }
        }))
    }

    /// Evaluate one symbol now, waiting for its lock.  `price` of `None`
    /// fetches the ticker.
    pub async fn check_symbol(&self, symbol: &str, price: Option<Decimal>) -> Result<()> {
        self.check_symbol_with(symbol, price, None).await
    }

    async fn check_symbol_with(
        &self,
        symbol: &str,
        price: Option<Decimal>,
        wallets: Option<&WalletSnapshot>,
    ) -> Result<()> {
        let Some(slot) = self.slot(symbol) else {
            return Ok(());
        };
        let mut pos = slot.lock().await;
        self.check_position(&mut pos, price, wallets).await
    }

    async fn check_position(
        &self,
        pos: &mut Position,
        price: Option<Decimal>,
        wallets: Option<&WalletSnapshot>,
    ) -> Result<()> {
        if pos.retired || pos.below_min_qty() {
            return Ok(());
        }
        let symbol = pos.symbol.clone();

        let Some(rules) = self
            .rules_for(&symbol)
            .await
            .with_context(|| format!("failed to load rules for {symbol}"))?
        else {
            warn!(symbol = %symbol, "symbol no longer listed — skipping");
            return Ok(());
        };

        let cached = wallets.and_then(|w| w.wallet_for(&rules.base_asset, pos.ledger_changed_at));
        let wallet = match cached {
            Some(w) => w,
            None => match self.exchange.asset_balance(&rules.base_asset).await {
                Ok(w) => w,
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "wallet unavailable — using tracked quantity");
                    pos.quantity()
                }
            },
        };
        if wallet + WALLET_TOLERANCE < pos.quantity() {
            let shortfall = pos.quantity() - wallet;
            pos.tracker.consume(shortfall);
            info!(
                symbol = %symbol,
                shortfall = %shortfall,
                remaining = %pos.quantity(),
                "wallet below tracked quantity — ledger reduced"
            );
            if pos.below_min_qty() {
                self.retire(pos, CloseReason::ExternalDisposal);
                return Ok(());
            }
        }

        let price = match price {
            Some(p) => p,
            None => self
                .exchange
                .ticker_price(&symbol)
                .await
                .with_context(|| format!("failed to fetch price for {symbol}"))?,
        };

        if pos.observe_price(price) {
            let avg = pos.average_price();
            let pnl_pct = if avg.is_zero() {
                Decimal::ZERO
            } else {
                (price - avg) / avg * Decimal::ONE_HUNDRED
            };
            info!(
                symbol = %symbol,
                price = %price,
                avg_price = %avg.round_dp(8),
                pnl_pct = %pnl_pct.round_dp(2),
                targets = ?pos.targets.iter().map(|t| t.round_dp(8).to_string()).collect::<Vec<_>>(),
                "price update"
            );
        }

        if pos.quantity() * price < pos.min_notional {
            debug!(symbol = %symbol, notional = %(pos.quantity() * price), "below min notional — not evaluated");
            return Ok(());
        }

        let inputs = self.exit_inputs(&symbol, price).await;
        let mut verdict = self.engine.evaluate(pos, &inputs);
        if let Verdict::ConfirmBreakout { top_target } = verdict {
            verdict = match self.exchange.recent_trades(&symbol, TAPE_SAMPLE_SIZE).await {
                Ok(trades) => self
                    .engine
                    .confirm_breakout(pos, &TapeSample::from_trades(&trades)),
                Err(e) => {
                    warn!(symbol = %symbol, top_target = %top_target, error = %e, "trade tape unavailable — breakout check deferred");
                    Verdict::Hold
                }
            };
        }

        if let Verdict::Sell(reason) = verdict {
            self.liquidate(pos, &rules, wallet, reason).await;
        }
        Ok(())
    }

    async fn exit_inputs(&self, symbol: &str, price: Decimal) -> ExitInputs {
        let interval = self.settings.candle_interval.as_str();
        let candles = match self.exchange.klines(symbol, interval, 2).await {
            Ok(c) => c,
            Err(e) => {
                debug!(symbol, error = %e, "candles unavailable — no volatility hint");
                Vec::new()
            }
        };

        let atr = match self.engine.atr_period() {
            Some(period) => match self.exchange.klines(symbol, interval, period as u32 + 1).await {
                Ok(c) => calculate_atr(&c, period),
                Err(e) => {
                    debug!(symbol, error = %e, "candles unavailable — stop-loss skipped");
                    None
                }
            },
            None => None,
        };

        ExitInputs {
            price,
            trend_active: self.trend.is_active(),
            volatility_hint: volatility_hint(&candles),
            last_closed_open: last_closed(&candles).map(|c| c.open),
            atr,
        }
    }

    async fn liquidate(&self, pos: &mut Position, rules: &SymbolRules, wallet: Decimal, reason: ExitReason) {
        match self.executor.liquidate(pos, rules, wallet, reason).await {
            Ok(ExecutionResult::Dust { .. }) => self.retire(pos, CloseReason::Dust),
            Ok(ExecutionResult::Filled { report, closed }) => {
                if let Err(e) = self.recent_sells.record(&report.symbol, Utc::now()) {
                    warn!(symbol = %report.symbol, error = %e, "failed to record recent sell");
                }
                self.events.publish(EngineEvent::SellCompleted(report));
                if closed {
                    self.retire(pos, CloseReason::Sold);
                }
            }
            Err(e) => {
                self.events.publish(EngineEvent::SellFailed {
                    symbol: pos.symbol.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Polling and scanning
    // -------------------------------------------------------------------------

    /// Re-check the next group of positions; returns how many were checked.
    pub async fn check_group(self: &Arc<Self>) -> usize {
        if self.is_api_down() {
            debug!("exchange unreachable — polling cycle skipped");
            return 0;
        }
        let symbols = self.tracked_symbols();
        let size = self.settings.group_size_for(symbols.len());
        if size == 0 {
            return 0;
        }
        let start = self.group_cursor.fetch_add(size, Ordering::SeqCst) % symbols.len();
        let group: Vec<String> = symbols.iter().cycle().skip(start).take(size).cloned().collect();
        debug!(group = ?group, tracked = symbols.len(), "polling group");

        let taken_at = Instant::now();
        let wallets = match self.exchange.balances().await {
            Ok(balances) => Some(Arc::new(WalletSnapshot::new(&balances, taken_at))),
            Err(e) => {
                debug!(error = %e, "account read failed — wallets fetched per symbol");
                None
            }
        };

        let mut tasks = JoinSet::new();
        for symbol in group {
            let this = Arc::clone(self);
            let wallets = wallets.clone();
            tasks.spawn(async move {
                let _permit = Arc::clone(&this.admission).acquire_owned().await?;
                this.check_symbol_with(&symbol, None, wallets.as_deref())
                    .await
                    .with_context(|| format!("re-check of {symbol} failed"))
            });
        }

        let mut checked = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => checked += 1,
                Ok(Err(e)) => warn!(error = %e, "polling check failed"),
                Err(e) => error!(error = %e, "polling task panicked"),
            }
        }
        checked
    }

    /// Look for held assets that are not tracked yet; returns how many
    /// positions were opened.
    pub async fn scan_balances(self: &Arc<Self>) -> Result<usize> {
        let balances = match self.exchange.balances().await {
            Ok(b) => {
                self.set_api_status(true, None);
                b
            }
            Err(e) => {
                self.set_api_status(false, Some(e.to_string()));
                return Err(e).context("failed to fetch balances");
            }
        };

        let mut tasks = JoinSet::new();
        for balance in balances {
            let symbol = format!("{}{}", balance.asset, self.settings.quote_asset);
            if self.is_tracked(&symbol) {
                continue;
            }
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = Arc::clone(&this.admission).acquire_owned().await?;
                discover_position(
                    this.exchange.as_ref(),
                    &balance,
                    &this.settings.quote_asset,
                    this.settings.min_follow_notional,
                )
                .await
            });
        }

        let mut opened = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(found))) => {
                    if self.track(found) {
                        opened += 1;
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => warn!(error = %e, "balance discovery failed"),
                Err(e) => error!(error = %e, "balance discovery task panicked"),
            }
        }
        if opened > 0 {
            info!(opened, tracked = self.tracked_symbols().len(), "balance scan complete");
        }
        Ok(opened)
    }
}

impl std::fmt::Debug for PositionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionLifecycle")
            .field("tracked", &self.positions.read().len())
            .field("dormant", &self.dormant.lock().len())
            .field("api_down", &self.is_api_down())
            .finish_non_exhaustive()
    }
}
