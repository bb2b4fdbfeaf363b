// src/formatting.rs

/// A trait for turning an identifier into the text of a chat message.
pub trait TextFormatter: Send + Sync {
    fn format_interest(&self, identifier: &str) -> String;
}

/// The plain message posted to the operations channel.
pub struct InterestTextFormatter;

impl TextFormatter for InterestTextFormatter {
    fn format_interest(&self, identifier: &str) -> String {
        format!("Interest registered by: {}", identifier)
    }
}
