//! Interest alerter - bridges "interest registered" events to an operations channel
//!
//! This library consumes a durable, queue-grouped subscription on an event
//! bus and posts a chat notification for every delivered event.

pub mod app;
pub mod bus;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod core;
pub mod formatting;
pub mod internal_metrics;
pub mod notification;
pub mod shutdown;

// Re-export core types for convenience
pub use crate::core::*;
