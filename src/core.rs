//! Core domain types and service traits for the interest alerter
//!
//! This module defines the event carried by the bus and the contract every
//! alert destination implements.

use async_trait::async_trait;
use bytes::Bytes;
use std::borrow::Cow;
use thiserror::Error;

/// An "interest registered" event as published on the bus.
///
/// The payload is opaque: it is expected to be an email address, but no
/// structure is assumed beyond an identifying string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    payload: Bytes,
}

impl Event {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The raw bytes as they were published.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as text. Invalid UTF-8 sequences are replaced rather than rejected.
    pub fn identifier(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn is_empty(&self) -> bool {
        self.payload.iter().all(u8::is_ascii_whitespace)
    }
}

/// Errors returned by an [`AlertSink`].
#[derive(Error, Debug)]
pub enum AlertError {
    /// The endpoint answered with a status outside of `200..300`.
    #[error("alert endpoint responded with status {0}")]
    Status(u16),

    /// The request never produced a response (DNS, connect, timeout, ...).
    #[error("alert request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The HTTP client could not be constructed.
    #[error("failed to build alert client: {0}")]
    Client(String),
}

impl AlertError {
    /// The HTTP status code carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AlertError::Status(code) => Some(*code),
            AlertError::Transport(e) => e.status().map(|s| s.as_u16()),
            AlertError::Client(_) => None,
        }
    }
}

/// The result of dispatching a single event to an [`AlertSink`].
pub type AlertOutcome = Result<(), AlertError>;

// =============================================================================
// Service Traits
// =============================================================================

/// Turns an identifying string into a delivered notification.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// A short name for the destination (e.g., "slack"), used in logs.
    fn name(&self) -> &str {
        "alert"
    }

    /// Sends exactly one notification for `identifier`.
    ///
    /// # Arguments
    /// * `identifier` - The identifying payload, typically an email address
    ///
    /// # Returns
    /// * `Ok(())` if the destination accepted the notification
    /// * `Err` with the status code or transport cause otherwise
    async fn notify(&self, identifier: &str) -> AlertOutcome;
}
