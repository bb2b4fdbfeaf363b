#![allow(dead_code)]
//! Test helpers for running the full application instance.

use anyhow::Result;
use interest_alerter::{
    app::App,
    bus::test_utils::InMemoryBus,
    config::Config,
    core::AlertSink,
    notification::test_utils::RecordingAlertSink,
    shutdown::{LifecycleState, ShutdownReport, TerminationSignal},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};

pub const TOPIC: &str = "interest.registered";
pub const DURABLE: &str = "slack-alerter";

/// Represents a running instance of the application for testing purposes.
pub struct TestApp {
    pub client_id: String,
    pub signals_tx: mpsc::Sender<TerminationSignal>,
    pub lifecycle: watch::Receiver<LifecycleState>,
    pub app_handle: JoinHandle<ShutdownReport>,
}

impl TestApp {
    /// Sends one termination signal.
    pub async fn signal(&self, signal: TerminationSignal) {
        // The coordinator may already have stopped listening.
        let _ = self.signals_tx.send(signal).await;
    }

    /// Sends an interrupt and waits for the application to reach `Stopped`.
    /// Fails if it does not stop within the specified timeout.
    pub async fn shutdown(self, timeout_duration: Duration) -> Result<ShutdownReport> {
        self.signal(TerminationSignal::Interrupt).await;
        self.wait(timeout_duration).await
    }

    /// Waits for the application to stop without signalling it.
    pub async fn wait(self, timeout_duration: Duration) -> Result<ShutdownReport> {
        match timeout(timeout_duration, self.app_handle).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow::anyhow!("App failed to shut down within the timeout")),
        }
    }
}

/// A builder for creating `TestApp` instances with specific configurations.
pub struct TestAppBuilder {
    pub config: Config,
    bus: InMemoryBus,
    sink: Arc<dyn AlertSink>,
}

impl TestAppBuilder {
    pub fn new(bus: &InMemoryBus) -> Self {
        let mut config = Config::default();
        config.bus.endpoint = "mem://test".to_string();
        config.webhook.url = "http://127.0.0.1:9/unused".to_string();

        Self {
            config,
            bus: bus.clone(),
            sink: Arc::new(RecordingAlertSink::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_config_modifier<F: FnOnce(&mut Config)>(mut self, modifier: F) -> Self {
        modifier(&mut self.config);
        self
    }

    /// Builds the app without starting it.
    pub async fn build_app(self) -> Result<App> {
        App::builder(self.config)
            .bus_override(Arc::new(self.bus))
            .alert_sink_override(self.sink)
            .build()
            .await
    }

    /// Builds the app and starts it in the background.
    pub async fn start(self) -> Result<TestApp> {
        let app = self.build_app().await?;
        let client_id = app.client_id().to_string();
        let lifecycle = app.lifecycle();
        let (signals_tx, signals_rx) = mpsc::channel(8);
        let app_handle = tokio::spawn(app.run_until(signals_rx));

        Ok(TestApp {
            client_id,
            signals_tx,
            lifecycle,
            app_handle,
        })
    }
}

/// Polls `condition` until it holds or `timeout_duration` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout_duration: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout_duration;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
