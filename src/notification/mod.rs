//! Alert destinations.
//!
//! Every destination implements [`crate::core::AlertSink`], so the consumer
//! never needs to know which one it is talking to.
pub mod slack;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use slack::SlackWebhookSink;
