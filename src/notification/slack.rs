//! An alert sink that posts to a Slack incoming webhook.

use crate::config::WebhookConfig;
use crate::core::{AlertError, AlertOutcome, AlertSink};
use crate::formatting::{InterestTextFormatter, TextFormatter};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, instrument};

/// Sends one webhook message per notified identifier.
pub struct SlackWebhookSink {
    webhook_url: String,
    formatter: Box<dyn TextFormatter>,
    client: reqwest::Client,
}

impl SlackWebhookSink {
    /// Creates a new `SlackWebhookSink`.
    ///
    /// `timeout` bounds the whole request; an expired timeout is reported as a
    /// transport failure.
    pub fn new(
        webhook_url: String,
        formatter: Box<dyn TextFormatter>,
        timeout: Duration,
    ) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Client(e.to_string()))?;
        Ok(Self {
            webhook_url,
            formatter,
            client,
        })
    }

    pub fn from_config(config: &WebhookConfig) -> Result<Self, AlertError> {
        Self::new(
            config.url.clone(),
            Box::new(InterestTextFormatter),
            Duration::from_secs(config.timeout_seconds),
        )
    }
}

#[async_trait]
impl AlertSink for SlackWebhookSink {
    fn name(&self) -> &str {
        "slack"
    }

    #[instrument(skip(self, identifier))]
    async fn notify(&self, identifier: &str) -> AlertOutcome {
        let payload = json!({ "text": self.formatter.format_interest(identifier) });

        // `json` sets `Content-Type: application/json`.
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP request to Slack webhook failed");
                AlertError::Transport(e)
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = %status, "Slack webhook accepted notification");
            Ok(())
        } else {
            error!(status = %status, "Slack webhook rejected notification");
            Err(AlertError::Status(status.as_u16()))
        }
    }
}

#[cfg(test)]
mod slack_sink_tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sink_for(server: &MockServer, timeout: Duration) -> SlackWebhookSink {
        SlackWebhookSink::new(
            format!("{}/webhook", server.uri()),
            Box::new(InterestTextFormatter),
            timeout,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_notify_posts_expected_body_once() {
        // Arrange
        let server = MockServer::start().await;
        let expected_body = json!({ "text": "Interest registered by: user@example.com" });

        Mock::given(method("POST"))
            .and(path("/webhook"))
            .and(header("content-type", "application/json"))
            .and(body_json(&expected_body))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = sink_for(&server, Duration::from_secs(5));

        // Act
        let result = sink.notify("user@example.com").await;

        // Assert
        assert!(result.is_ok(), "expected success, got {:?}", result);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_notify_accepts_any_2xx() {
        for code in [200u16, 201, 202, 204, 299] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(code))
                .expect(1)
                .mount(&server)
                .await;

            let sink = sink_for(&server, Duration::from_secs(5));
            assert!(sink.notify("a@b.c").await.is_ok(), "status {} should succeed", code);
        }
    }

    #[tokio::test]
    async fn test_notify_reports_non_2xx_status_without_retry() {
        for code in [301u16, 400, 404, 500, 503] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/webhook"))
                .respond_with(ResponseTemplate::new(code))
                .expect(1)
                .mount(&server)
                .await;

            let sink = sink_for(&server, Duration::from_secs(5));
            let err = sink.notify("a@b.c").await.unwrap_err();

            assert!(matches!(err, AlertError::Status(c) if c == code), "got {:?}", err);
            assert_eq!(err.status_code(), Some(code));
        }
    }

    #[tokio::test]
    async fn test_notify_reports_connection_refused() {
        // Grab a free port and release it so nothing is listening there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let sink = SlackWebhookSink::new(
            format!("http://127.0.0.1:{}/webhook", port),
            Box::new(InterestTextFormatter),
            Duration::from_secs(2),
        )
        .unwrap();

        let err = sink.notify("a@b.c").await.unwrap_err();

        assert!(matches!(err, AlertError::Transport(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_notify_reports_timeout_as_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let sink = sink_for(&server, Duration::from_millis(200));
        let err = sink.notify("a@b.c").await.unwrap_err();

        match err {
            AlertError::Transport(e) => assert!(e.is_timeout(), "expected timeout, got {}", e),
            other => panic!("expected transport error, got {:?}", other),
        }

        // A timed-out request is not retried.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
    }
}
