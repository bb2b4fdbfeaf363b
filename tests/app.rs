//! Integration tests for application startup and the end-to-end delivery path.

mod helpers;

use helpers::app::{wait_until, TestAppBuilder, DURABLE, TOPIC};
use interest_alerter::bus::test_utils::InMemoryBus;
use interest_alerter::notification::test_utils::RecordingAlertSink;
use interest_alerter::shutdown::{LifecycleState, ShutdownReport, ShutdownTrigger};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_connect_failure_is_fatal() {
    let bus = InMemoryBus::new();
    bus.fail_connect(true);

    let result = TestAppBuilder::new(&bus).build_app().await;

    let err = result.err().expect("build should fail when the bus is unreachable");
    assert!(format!("{:#}", err).contains("Can't connect"), "got: {:#}", err);
}

#[tokio::test]
async fn test_subscribe_failure_is_fatal_and_closes_connection() {
    let bus = InMemoryBus::new();
    bus.fail_subscribe(true);

    let result = TestAppBuilder::new(&bus).build_app().await;

    assert!(result.is_err());
    assert_eq!(bus.close_count(), 1);
    assert!(bus.connected_clients().is_empty());
}

#[tokio::test]
async fn test_instances_register_unique_client_ids() {
    let bus = InMemoryBus::new();

    let first = TestAppBuilder::new(&bus).start().await.unwrap();
    let second = TestAppBuilder::new(&bus).start().await.unwrap();

    assert_ne!(first.client_id, second.client_id);
    assert!(first.client_id.starts_with("interest-registered-alerter-"));
    assert_eq!(bus.connect_count(), 2);

    first.shutdown(Duration::from_secs(1)).await.unwrap();
    second.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_delivered_events_reach_the_sink_and_are_acked() {
    let bus = InMemoryBus::new();
    let sink = RecordingAlertSink::new();
    let app = TestAppBuilder::new(&bus)
        .with_sink(Arc::new(sink.clone()))
        .start()
        .await
        .unwrap();

    bus.publish(TOPIC, "user@example.com");
    bus.publish(TOPIC, "other@example.com");

    assert!(wait_until(Duration::from_secs(1), || sink.call_count() == 2).await);
    let report = app.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(sink.calls(), vec!["user@example.com", "other@example.com"]);
    assert_eq!(bus.acked(TOPIC, DURABLE), vec![1, 2]);
    assert_eq!(report.processed, Some(2));
    assert_eq!(report.failed, Some(0));
}

#[tokio::test]
async fn test_failed_alert_does_not_block_further_deliveries() {
    let bus = InMemoryBus::new();
    let sink = RecordingAlertSink::new();
    sink.push_failure(Some(503));
    let app = TestAppBuilder::new(&bus)
        .with_sink(Arc::new(sink.clone()))
        .start()
        .await
        .unwrap();

    bus.publish(TOPIC, "first@example.com");
    bus.publish(TOPIC, "second@example.com");

    assert!(wait_until(Duration::from_secs(1), || sink.call_count() == 2).await);
    let report = app.shutdown(Duration::from_secs(1)).await.unwrap();

    // The failed alert still counts as processed.
    assert_eq!(report.processed, Some(2));
    assert_eq!(report.failed, Some(1));
    assert_eq!(bus.acked(TOPIC, DURABLE), vec![1, 2]);
    assert_eq!(bus.delivery_attempts(TOPIC, DURABLE, 1), 1);
}

#[tokio::test]
async fn test_app_stops_when_bus_ends_the_stream() {
    let bus = InMemoryBus::new();
    let app = TestAppBuilder::new(&bus).start().await.unwrap();
    let lifecycle = app.lifecycle.clone();

    bus.end_streams();
    let report = app.wait(Duration::from_secs(1)).await.unwrap();

    assert!(matches!(report.trigger, ShutdownTrigger::ConsumerStopped));
    assert_eq!(*lifecycle.borrow(), LifecycleState::Stopped);
    assert_eq!(bus.unsubscribe_count(), 1);
    assert_eq!(bus.close_count(), 1);
}

#[tokio::test]
async fn test_run_returns_report_when_stream_ends() {
    let bus = InMemoryBus::new();
    let app = TestAppBuilder::new(&bus).build_app().await.unwrap();
    let lifecycle = app.lifecycle();

    let handle: tokio::task::JoinHandle<ShutdownReport> = tokio::spawn(app.run());
    bus.end_streams();
    let report = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(report.trigger, ShutdownTrigger::ConsumerStopped));
    assert_eq!(*lifecycle.borrow(), LifecycleState::Stopped);
    assert_eq!(bus.close_count(), 1);
}
