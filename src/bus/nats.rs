//! NATS JetStream implementation of the bus boundary.
//!
//! The cluster identifier names the JetStream stream that stores the topic.
//! A subscription is a durable push consumer with a deliver group, so every
//! alerter instance sharing the queue group receives a disjoint share of the
//! messages and the delivery position survives restarts.

use super::{Acker, BusConnection, BusError, Delivery, EventBus, SubscribeOptions, Subscription};
use crate::core::Event;
use async_nats::jetstream::{
    self,
    consumer::{push, AckPolicy, DeliverPolicy},
    Context,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info, instrument};

/// Connects to a NATS server with JetStream enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NatsEventBus;

#[async_trait]
impl EventBus for NatsEventBus {
    #[instrument(skip(self))]
    async fn connect(
        &self,
        cluster_id: &str,
        client_id: &str,
        url: &str,
    ) -> Result<Box<dyn BusConnection>, BusError> {
        let client = async_nats::ConnectOptions::new()
            .name(client_id)
            .connect(url)
            .await
            .map_err(|e| BusError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let context = jetstream::new(client.clone());

        Ok(Box::new(NatsConnection {
            client,
            context,
            stream_name: cluster_id.to_string(),
        }))
    }
}

/// A connection to NATS plus the JetStream context bound to it.
pub struct NatsConnection {
    client: async_nats::Client,
    context: Context,
    stream_name: String,
}

#[async_trait]
impl BusConnection for NatsConnection {
    #[instrument(skip(self), fields(stream = %self.stream_name))]
    async fn subscribe_queue_durable(
        &self,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let subscribe_error = |reason: String| BusError::Subscribe {
            topic: options.topic.clone(),
            reason,
        };

        let stream = self
            .context
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;

        // The deliver policy only applies when the consumer is created; an
        // existing durable keeps its acknowledged position.
        let deliver_policy = if options.deliver_all_available {
            DeliverPolicy::All
        } else {
            DeliverPolicy::New
        };
        let config = push::Config {
            durable_name: Some(options.durable_name.clone()),
            deliver_subject: self.client.new_inbox(),
            deliver_group: Some(options.queue_group.clone()),
            filter_subject: options.topic.clone(),
            deliver_policy,
            ack_policy: AckPolicy::Explicit,
            ack_wait: options.ack_wait,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&options.durable_name, config)
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;

        debug!(durable = %options.durable_name, "JetStream push consumer bound");
        Ok(Box::new(NatsSubscription {
            options: options.clone(),
            messages: messages
                .map(|message| message.map_err(|e| BusError::Stream(e.to_string())))
                .boxed(),
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), BusError> {
        let NatsConnection {
            client, context, ..
        } = *self;
        client
            .flush()
            .await
            .map_err(|e| BusError::Close(e.to_string()))?;
        // The connection shuts down once the last client handle is gone.
        drop(context);
        drop(client);
        info!("NATS connection closed");
        Ok(())
    }
}

type MessageStream = BoxStream<'static, Result<jetstream::Message, BusError>>;

/// Deliveries from a durable push consumer.
pub struct NatsSubscription {
    options: SubscribeOptions,
    messages: MessageStream,
}

#[async_trait]
impl Subscription for NatsSubscription {
    fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BusError>> {
        let message = match self.messages.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e)),
        };

        let (sequence, attempt) = match message.info() {
            Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
            Err(e) => return Some(Err(BusError::Stream(e.to_string()))),
        };
        let event = Event::new(message.payload.clone());

        Some(Ok(Delivery::new(
            event,
            sequence,
            attempt,
            Box::new(NatsAcker { message, sequence }),
        )))
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        // Dropping the push subscription unsubscribes from the deliver subject
        // without deleting the durable consumer.
        let NatsSubscription { options, messages } = *self;
        drop(messages);
        debug!(durable = %options.durable_name, "Unsubscribed from deliver subject");
        Ok(())
    }
}

struct NatsAcker {
    message: jetstream::Message,
    sequence: u64,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.message.ack().await.map_err(|e| BusError::Ack {
            sequence: self.sequence,
            reason: e.to_string(),
        })
    }
}
