//! Carrytrack backend library.
//!
//! Real-time synthetic-future analytics: tick ingestion, ATM strike and
//! expiry tracking, put-call-parity derivation, rolling spread statistics,
//! throttled persistence, and broadcast fan-out.

pub mod api;
pub mod feed;
pub mod instruments;
pub mod models;
pub mod pipeline;
pub mod storage;
pub mod throttle;
