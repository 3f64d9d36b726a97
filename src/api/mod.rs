// =============================================================================
// Status API
// =============================================================================
//
// Read-only HTTP surface over the running engine: health, tracked positions
// and the request-weight budget.

pub mod auth;
pub mod rest;
