//! Interest alerter
//!
//! Sends an alert to Slack when someone registers an interest.

use anyhow::{Context, Result};
use clap::Parser;
use interest_alerter::{app::App, cli::Cli, config::Config, internal_metrics::LoggingRecorder};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = Config::load(&cli).unwrap_or_else(|err| {
        // Manually initialize logging for this specific error
        init_tracing("info");
        error!("Failed to load configuration: {:#}", err);
        std::process::exit(1);
    });

    init_tracing(&config.log_level);

    info!("Slack Alerter started......");

    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!("NATS Endpoint: {}", config.bus.endpoint);
    info!("Cluster ID: {}", config.bus.cluster_id);
    info!("Client ID Prefix: {}", config.bus.client_id);
    info!("Topic: {}", config.bus.topic);
    info!("Queue Group: {}", config.bus.queue_group);
    info!("Durable Name: {}", config.bus.durable_name);
    info!("Deliver All Available: {}", config.bus.deliver_all_available);
    info!("Ack Policy: {:?}", config.bus.ack_policy);
    info!("Ack Wait: {}s", config.bus.ack_wait_seconds);
    info!("Webhook Timeout: {}s", config.webhook.timeout_seconds);
    info!("Log Metrics: {}", config.metrics.log_metrics);
    info!("-------------------------------------------------------");

    let metrics_settings = config.metrics.clone();
    let app = match App::builder(config).build().await {
        Ok(app) => app,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    let mut metrics_task = None;
    if metrics_settings.log_metrics {
        info!(
            "Logging recorder enabled. Metrics will be printed every {} seconds.",
            metrics_settings.log_aggregation_seconds
        );
        let (recorder, handle) = LoggingRecorder::new(
            Duration::from_secs(metrics_settings.log_aggregation_seconds),
            app.lifecycle(),
        );
        metrics::set_global_recorder(recorder).context("Failed to install logging recorder")?;
        metrics_task = Some(handle);
    }

    // Cleanup failures are logged by the coordinator; exit regardless.
    let report = app.run().await;

    if let Some(handle) = metrics_task {
        let _ = handle.await;
    }

    info!(
        "Slack alerter stopped. Processed {} messages, {} alerts failed.",
        report.processed.unwrap_or(0),
        report.failed.unwrap_or(0)
    );
    Ok(())
}
