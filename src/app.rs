//! The main application logic, decoupled from the entry point.

use crate::{
    bus::{unique_client_id, BusConnection, EventBus, NatsEventBus, SubscribeOptions, Subscription},
    config::Config,
    consumer::SubscriptionConsumer,
    core::AlertSink,
    notification::SlackWebhookSink,
    shutdown::{self, LifecycleState, ShutdownCoordinator, ShutdownReport, TerminationSignal},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument, warn};

/// A connected, subscribed alerter that has not started consuming yet.
pub struct App {
    config: Config,
    client_id: String,
    connection: Box<dyn BusConnection>,
    subscription: Box<dyn Subscription>,
    sink: Arc<dyn AlertSink>,
    coordinator: ShutdownCoordinator,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// The client identifier this process registered on the bus with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Observes the shutdown state machine.
    pub fn lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.coordinator.subscribe()
    }

    /// Consumes until SIGINT or SIGTERM, then shuts down in order.
    pub async fn run(self) -> ShutdownReport {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        shutdown::spawn_signal_listener(signal_tx);
        self.run_until(signal_rx).await
    }

    /// Consumes until a signal arrives on `signals`, then shuts down in order.
    ///
    /// Returns once the subscription is unsubscribed and the connection closed.
    pub async fn run_until(self, signals: mpsc::Receiver<TerminationSignal>) -> ShutdownReport {
        let consumer = SubscriptionConsumer::new(
            self.subscription,
            self.sink,
            self.config.bus.ack_policy,
            self.coordinator.subscribe(),
        );
        let consumer_task = tokio::spawn(consumer.run());

        let report = self
            .coordinator
            .run(signals, consumer_task, self.connection)
            .await;
        info!(trigger = ?report.trigger, processed = ?report.processed, failed = ?report.failed, "Interest alerter stopped.");
        report
    }
}

/// Builder for the main application.
///
/// Building performs the startup preconditions: it connects to the bus and
/// binds the subscription, failing if either step fails. The bus and the alert
/// sink can be overridden for testing.
pub struct AppBuilder {
    config: Config,
    bus_override: Option<Arc<dyn EventBus>>,
    alert_sink_override: Option<Arc<dyn AlertSink>>,
}

impl AppBuilder {
    /// Creates a new `AppBuilder` with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            bus_override: None,
            alert_sink_override: None,
        }
    }

    /// Overrides the event bus for testing.
    pub fn bus_override(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus_override = Some(bus);
        self
    }

    /// Overrides the alert sink for testing.
    pub fn alert_sink_override(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink_override = Some(sink);
        self
    }

    /// Connects, subscribes and returns a runnable `App`.
    #[instrument(skip_all)]
    pub async fn build(self) -> Result<App> {
        let config = self.config;

        let sink = match self.alert_sink_override {
            Some(sink) => sink,
            None => Arc::new(
                SlackWebhookSink::from_config(&config.webhook)
                    .context("Failed to create Slack alert sink")?,
            ) as Arc<dyn AlertSink>,
        };
        let bus = self
            .bus_override
            .unwrap_or_else(|| Arc::new(NatsEventBus) as Arc<dyn EventBus>);

        let bus_config = &config.bus;
        let client_id = unique_client_id(&bus_config.client_id);
        let connection = bus
            .connect(&bus_config.cluster_id, &client_id, &bus_config.endpoint)
            .await
            .with_context(|| {
                format!(
                    "Can't connect. Make sure a NATS server is running at: {}",
                    bus_config.endpoint
                )
            })?;
        info!(
            "Connected to {} clusterID: [{}] clientID: [{}]",
            bus_config.endpoint, bus_config.cluster_id, client_id
        );

        let options = SubscribeOptions::from_config(bus_config);
        let subscription = match connection.subscribe_queue_durable(&options).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close connection after subscribe failure");
                }
                return Err(e).with_context(|| format!("Can't subscribe to {}", options.topic));
            }
        };
        info!(
            "Listening on [{}], clientID=[{}], qgroup=[{}] durable=[{}]",
            options.topic, client_id, options.queue_group, options.durable_name
        );

        Ok(App {
            config,
            client_id,
            connection,
            subscription,
            sink,
            coordinator: ShutdownCoordinator::new(),
        })
    }
}
