// =============================================================================
// Exit Management Module
// =============================================================================
//
// The take-profit ladder, the per-tick decision engine built on it, and the
// background loops that feed price observations to the lifecycle manager.

pub mod decision;
pub mod ladder;
pub mod monitor;
