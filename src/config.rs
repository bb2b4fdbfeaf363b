//! Configuration management for the interest alerter
//!
//! This module defines the main `Config` struct and its sub-structs. It uses
//! the `figment` crate to layer defaults, an optional TOML file, environment
//! variables and command-line arguments.

use crate::cli::Cli;
use anyhow::{bail, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Configuration for the event bus subscription.
    pub bus: BusConfig,
    /// Configuration for the alert webhook.
    pub webhook: WebhookConfig,
    /// Configuration for periodic metrics logging.
    pub metrics: MetricsConfig,
}

/// When a delivered message is acknowledged to the bus.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge once the handler returns, whether or not the alert was sent.
    #[default]
    AfterDispatch,
    /// Acknowledge only when the alert was sent. Failed alerts are left for the
    /// bus to redeliver once the ack wait expires.
    OnSuccess,
}

/// Configuration for the event bus subscription.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// The URL of the NATS server.
    pub endpoint: String,
    /// The cluster identifier. With JetStream this names the stream that stores the topic.
    pub cluster_id: String,
    /// Prefix of the client identifier. A random suffix is appended per process.
    pub client_id: String,
    /// The subject carrying "interest registered" events.
    pub topic: String,
    /// The queue group shared by every instance of the alerter.
    pub queue_group: String,
    /// The durable name under which the delivery position is stored.
    pub durable_name: String,
    /// Deliver every retained message when the durable is first created.
    pub deliver_all_available: bool,
    /// When delivered messages are acknowledged.
    pub ack_policy: AckPolicy,
    /// How long the bus waits for an acknowledgment before redelivering.
    pub ack_wait_seconds: u64,
}

/// Configuration for the alert webhook.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WebhookConfig {
    /// The Slack incoming webhook URL.
    pub url: String,
    /// Timeout for a single webhook request, in seconds.
    pub timeout_seconds: u64,
}

/// Configuration for periodic metrics logging.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Log metrics to the console periodically.
    pub log_metrics: bool,
    /// The interval, in seconds, between two metrics log lines.
    pub log_aggregation_seconds: u64,
}

impl Config {
    /// Loads the configuration by layering defaults, the optional TOML file
    /// named by `--config`, `INTEREST_ALERTER_*` environment variables and
    /// finally the command-line arguments.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = &cli.config {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            // e.g. INTEREST_ALERTER_BUS__TOPIC=interest.registered
            .merge(Env::prefixed("INTEREST_ALERTER_").split("__"))
            .merge(cli.clone())
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the alerter cannot start with.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("bus.endpoint", &self.bus.endpoint),
            ("bus.cluster_id", &self.bus.cluster_id),
            ("bus.client_id", &self.bus.client_id),
            ("bus.topic", &self.bus.topic),
            ("bus.queue_group", &self.bus.queue_group),
            ("bus.durable_name", &self.bus.durable_name),
            ("webhook.url", &self.webhook.url),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                bail!("configuration value `{}` must not be empty", key);
            }
        }
        if self.webhook.timeout_seconds == 0 {
            bail!("configuration value `webhook.timeout_seconds` must be greater than zero");
        }
        if self.metrics.log_metrics && self.metrics.log_aggregation_seconds == 0 {
            bail!("configuration value `metrics.log_aggregation_seconds` must be greater than zero");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            bus: BusConfig::default(),
            webhook: WebhookConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: "nats://0.0.0.0:4222".to_string(),
            cluster_id: "nats-cluster".to_string(),
            client_id: "interest-registered-alerter".to_string(),
            topic: "interest.registered".to_string(),
            queue_group: "slack-alerter".to_string(),
            durable_name: "slack-alerter".to_string(),
            deliver_all_available: true,
            ack_policy: AckPolicy::AfterDispatch,
            ack_wait_seconds: 30,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: "https://slackurl.com".to_string(),
            timeout_seconds: 10,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_metrics: false,
            log_aggregation_seconds: 60,
        }
    }
}
