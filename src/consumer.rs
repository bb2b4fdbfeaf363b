//! Drives a bus subscription into an alert sink.
//!
//! Messages are handled one at a time in delivery order. A message that has
//! been pulled off the subscription is always handled to completion, even if
//! shutdown is requested meanwhile; shutdown only stops the consumer from
//! pulling the next one.

use crate::bus::{BusError, Delivery, Subscription};
use crate::config::AckPolicy;
use crate::core::{AlertOutcome, AlertSink};
use crate::shutdown::LifecycleState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Why the consumer loop returned.
#[derive(Debug)]
pub enum StopReason {
    /// The lifecycle left `Running`.
    Shutdown,
    /// The bus ended the delivery stream.
    StreamEnded,
    /// The delivery stream failed.
    StreamFailed(BusError),
}

/// What the consumer hands back when it stops. The subscription is returned
/// untouched so that the shutdown coordinator can unsubscribe it.
pub struct ConsumerReport {
    pub subscription: Box<dyn Subscription>,
    pub reason: StopReason,
    /// Deliveries handled, whatever their outcome.
    pub processed: u64,
    /// Deliveries whose alert could not be sent.
    pub failed: u64,
}

/// Sends the alert for a single delivery and acknowledges it.
///
/// Holds no reference to the subscription; the consumer future stays `Send`
/// while a dispatch is in flight.
#[derive(Clone)]
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    ack_policy: AckPolicy,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>, ack_policy: AckPolicy) -> Self {
        Self { sink, ack_policy }
    }

    /// Dispatches one delivery to the sink and acknowledges it according to
    /// the ack policy. Sink failures are logged and returned, never retried.
    #[instrument(skip(self, delivery), fields(sequence = delivery.sequence, attempt = delivery.attempt))]
    pub async fn handle(&self, delivery: Delivery) -> AlertOutcome {
        metrics::counter!("bus_messages_received_total").increment(1);
        if delivery.is_redelivery() {
            metrics::counter!("bus_messages_redelivered_total").increment(1);
            warn!("Message redelivered; the alert may be sent more than once");
        }

        let outcome = if delivery.event.is_empty() {
            warn!("Received message with an empty payload, skipping alert");
            Ok(())
        } else {
            self.sink.notify(&delivery.event.identifier()).await
        };

        match &outcome {
            Ok(()) => {
                metrics::counter!("alerts_sent_total").increment(1);
                debug!(sink = self.sink.name(), "Interest alert sent");
            }
            Err(e) => {
                metrics::counter!("alerts_failed_total").increment(1);
                error!(sink = self.sink.name(), error = %e, "Failed to send interest alert");
            }
        }

        let should_ack = match self.ack_policy {
            AckPolicy::AfterDispatch => true,
            AckPolicy::OnSuccess => outcome.is_ok(),
        };
        if should_ack {
            if let Err(e) = delivery.ack().await {
                metrics::counter!("bus_ack_failures_total").increment(1);
                error!(error = %e, "Failed to acknowledge message");
            }
        } else {
            warn!("Leaving message unacknowledged for redelivery by the bus");
        }

        outcome
    }
}

pub struct SubscriptionConsumer {
    subscription: Box<dyn Subscription>,
    dispatcher: AlertDispatcher,
    lifecycle: watch::Receiver<LifecycleState>,
}

impl SubscriptionConsumer {
    pub fn new(
        subscription: Box<dyn Subscription>,
        sink: Arc<dyn AlertSink>,
        ack_policy: AckPolicy,
        lifecycle: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self {
            subscription,
            dispatcher: AlertDispatcher::new(sink, ack_policy),
            lifecycle,
        }
    }

    /// Runs until shutdown is requested or the bus ends the stream.
    pub async fn run(self) -> ConsumerReport {
        let Self {
            mut subscription,
            dispatcher,
            mut lifecycle,
        } = self;
        let topic = subscription.options().topic.clone();
        info!(topic = %topic, sink = dispatcher.sink.name(), "Subscription consumer started");
        let mut processed = 0u64;
        let mut failed = 0u64;

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut lifecycle) => {
                    info!("Subscription consumer received shutdown signal.");
                    break StopReason::Shutdown;
                }
                next = subscription.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if dispatcher.handle(delivery).await.is_err() {
                        failed += 1;
                    }
                    processed += 1;
                }
                Some(Err(e)) => {
                    error!(error = %e, "Subscription stream failed");
                    break StopReason::StreamFailed(e);
                }
                None => {
                    info!("Subscription stream ended by the bus");
                    break StopReason::StreamEnded;
                }
            }
        };

        info!(processed, failed, ?reason, "Subscription consumer finished.");
        ConsumerReport {
            subscription,
            reason,
            processed,
            failed,
        }
    }
}

async fn shutdown_requested(lifecycle: &mut watch::Receiver<LifecycleState>) {
    // A dropped sender means nobody can ever signal shutdown; stop as well.
    let _ = lifecycle
        .wait_for(|state| *state != LifecycleState::Running)
        .await;
}
