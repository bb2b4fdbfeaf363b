//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments using the `clap` crate.
//! Each bus and webhook flag also reads the environment variable the alerter
//! has historically been deployed with (`NATS_ENDPOINT`, `SLACK_URL`, ...).
//! The parsed arguments are the last layer merged into [`crate::config::Config`].

use clap::Parser;
use figment::{
    value::{Dict, Map, Tag, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Sends an alert to Slack when someone registers an interest.
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "interest-alerter", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// URL of the NATS server.
    #[arg(long, env = "NATS_ENDPOINT", value_name = "URL")]
    pub nats_endpoint: Option<String>,

    /// Cluster identifier (the JetStream stream holding the topic).
    #[arg(long, env = "NATS_CLUSTER", value_name = "ID")]
    pub nats_cluster: Option<String>,

    /// Prefix of the client identifier used for the subscription.
    #[arg(long, env = "NATS_SUBSCRIPTION_ID", value_name = "ID")]
    pub nats_subscription_id: Option<String>,

    /// Subject carrying "interest registered" events.
    #[arg(long, env = "NATS_TOPIC", value_name = "TOPIC")]
    pub nats_topic: Option<String>,

    /// Slack incoming webhook URL.
    #[arg(long = "slack-url", visible_alias = "su", env = "SLACK_URL", value_name = "URL")]
    pub slack_url: Option<String>,

    /// Logging level (trace, debug, info, warn, error).
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut bus = Dict::new();
        let mut webhook = Dict::new();
        let mut dict = Dict::new();

        let bus_args = [
            ("endpoint", &self.nats_endpoint),
            ("cluster_id", &self.nats_cluster),
            ("client_id", &self.nats_subscription_id),
            ("topic", &self.nats_topic),
        ];
        for (key, value) in bus_args {
            if let Some(value) = value {
                bus.insert(key.into(), Value::from(value.clone()));
            }
        }

        if let Some(url) = &self.slack_url {
            webhook.insert("url".into(), Value::from(url.clone()));
        }

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        // Nested dictionaries merge key-by-key with the lower layers.
        if !bus.is_empty() {
            dict.insert("bus".into(), Value::Dict(Tag::Default, bus));
        }
        if !webhook.is_empty() {
            dict.insert("webhook".into(), Value::Dict(Tag::Default, webhook));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
