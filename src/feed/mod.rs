//! Upstream feed connectivity: transport boundary and resilience supervisor.

pub mod resilience;
pub mod transport;

pub use resilience::{BackoffPolicy, ConnectionMonitor, FeedResilience};
pub use transport::{FeedCommand, FeedConnection, FeedHandle, FeedTransport, WsFeedTransport};
