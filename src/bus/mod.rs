//! Event bus boundary.
//!
//! The alerter only needs a narrow slice of a streaming bus: connect, bind a
//! durable queue-group subscription, read deliveries, acknowledge them,
//! unsubscribe and close. These traits describe that slice so the consumer can
//! be driven by NATS JetStream in production and by an in-memory bus in tests.

pub mod nats;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use crate::config::BusConfig;
use crate::core::Event;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use nats::NatsEventBus;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("subscription stream failed: {0}")]
    Stream(String),

    #[error("failed to acknowledge message {sequence}: {reason}")]
    Ack { sequence: u64, reason: String },

    #[error("failed to unsubscribe: {0}")]
    Unsubscribe(String),

    #[error("failed to close connection: {0}")]
    Close(String),
}

/// Parameters of a durable, queue-grouped subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub topic: String,
    pub queue_group: String,
    pub durable_name: String,
    /// Only consulted when the durable does not exist yet. An existing durable
    /// always resumes from its last acknowledged position.
    pub deliver_all_available: bool,
    pub ack_wait: Duration,
}

impl SubscribeOptions {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            queue_group: config.queue_group.clone(),
            durable_name: config.durable_name.clone(),
            deliver_all_available: config.deliver_all_available,
            ack_wait: Duration::from_secs(config.ack_wait_seconds),
        }
    }
}

/// Builds a client identifier that is unique to this process instance.
pub fn unique_client_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

/// Acknowledges a single delivery back to the bus.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
}

/// A message handed to the consumer by a [`Subscription`].
pub struct Delivery {
    pub event: Event,
    /// Position of the message in the topic.
    pub sequence: u64,
    /// How many times the bus has delivered this message, this delivery included.
    pub attempt: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(event: Event, sequence: u64, attempt: u64, acker: Box<dyn Acker>) -> Self {
        Self {
            event,
            sequence,
            attempt,
            acker,
        }
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("sequence", &self.sequence)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Connects to an event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Opens a connection identified by `client_id`.
    ///
    /// # Arguments
    /// * `cluster_id` - The bus cluster the topic lives in
    /// * `client_id` - Identity of this process on the bus; must be unique per instance
    /// * `url` - Where to reach the bus
    async fn connect(
        &self,
        cluster_id: &str,
        client_id: &str,
        url: &str,
    ) -> Result<Box<dyn BusConnection>, BusError>;
}

/// A live connection to the bus.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Binds a durable queue-group subscription.
    async fn subscribe_queue_durable(
        &self,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Closes the connection. Subscriptions still bound through it stop delivering.
    async fn close(self: Box<Self>) -> Result<(), BusError>;
}

/// A live, durable, queue-grouped binding to a topic.
#[async_trait]
pub trait Subscription: Send {
    fn options(&self) -> &SubscribeOptions;

    /// Waits for the next delivery.
    ///
    /// # Returns
    /// * `Some(Ok(Delivery))` when a message was delivered
    /// * `Some(Err(error))` when the stream failed
    /// * `None` when the bus ended the stream
    ///
    /// Dropping the returned future before it completes must not lose a message.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>>;

    /// Stops delivery to this process. The durable itself stays on the bus so
    /// that the next subscription with the same durable name resumes from the
    /// last acknowledged message.
    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_unique_per_call() {
        let a = unique_client_id("interest-registered-alerter");
        let b = unique_client_id("interest-registered-alerter");
        assert_ne!(a, b);
        assert!(a.starts_with("interest-registered-alerter-"));
    }

    #[test]
    fn test_subscribe_options_follow_config() {
        let config = BusConfig::default();
        let options = SubscribeOptions::from_config(&config);
        assert_eq!(options.topic, "interest.registered");
        assert_eq!(options.queue_group, "slack-alerter");
        assert_eq!(options.durable_name, "slack-alerter");
        assert!(options.deliver_all_available);
        assert_eq!(options.ack_wait, Duration::from_secs(30));
    }
}
