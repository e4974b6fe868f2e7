//! Remote API boundary for the harvest coordinator.
//!
//! Provides the typed HTTP client for the pull-mode endpoints (status,
//! results, bulk poll, delivery acknowledgment), the SSE stream processor
//! for push mode, and the wire-level response decoding. Every remote
//! response is decoded once at this boundary into a tagged type; nothing
//! downstream re-checks optional JSON fields.

pub mod api;
pub mod error;
pub mod responses;
pub mod stream;
