//! A metrics recorder that periodically logs all captured counters.

use crate::shutdown::LifecycleState;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A metrics recorder that logs every counter through `tracing` at a fixed
/// interval, and once more when the lifecycle reaches `Stopped`.
pub struct LoggingRecorder {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl LoggingRecorder {
    /// Creates a new `LoggingRecorder` and starts a background task to log metrics.
    ///
    /// # Arguments
    /// * `aggregation_interval` - The interval at which to log the metrics.
    /// * `lifecycle` - The task logs a final snapshot and exits on `Stopped`.
    pub fn new(
        aggregation_interval: Duration,
        mut lifecycle: watch::Receiver<LifecycleState>,
    ) -> (Self, JoinHandle<()>) {
        let registry = Arc::new(Registry::new(AtomicStorage));
        let recorder = Self {
            registry: registry.clone(),
        };

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregation_interval);
            let mut previous = HashMap::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        log_snapshot(&registry, aggregation_interval, &mut previous);
                    }
                    _ = lifecycle.wait_for(|state| *state == LifecycleState::Stopped) => {
                        log_snapshot(&registry, aggregation_interval, &mut previous);
                        tracing::info!("Metrics logging task stopped.");
                        break;
                    }
                }
            }
        });

        (recorder, handle)
    }

    /// Current value of every registered counter, by name.
    pub fn counter_totals(&self) -> BTreeMap<String, u64> {
        counter_totals(&self.registry)
    }
}

fn counter_totals(registry: &Registry<Key, AtomicStorage>) -> BTreeMap<String, u64> {
    registry
        .get_counter_handles()
        .into_iter()
        .map(|(key, counter)| (key.name().to_string(), counter.load(Ordering::Relaxed)))
        .collect()
}

fn log_snapshot(
    registry: &Registry<Key, AtomicStorage>,
    interval: Duration,
    previous: &mut HashMap<String, u64>,
) {
    tracing::debug!("--- Metrics Snapshot ---");
    let totals = counter_totals(registry);
    let delta = |name: &str, previous: &HashMap<String, u64>| {
        let total = totals.get(name).copied().unwrap_or(0);
        total.saturating_sub(previous.get(name).copied().unwrap_or(0))
    };

    let sent = delta("alerts_sent_total", previous);
    let failed = delta("alerts_failed_total", previous);
    if sent + failed > 0 {
        tracing::info!(
            "Sent {} alerts ({} failed) in the last {}s",
            sent,
            failed,
            interval.as_secs()
        );
    }

    for (name, value) in &totals {
        tracing::info!("[Counter] {}: {}", name, value);
    }
    previous.extend(totals);
}

impl Recorder for LoggingRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.registry
            .get_or_create_counter(key, |c| Counter::from_arc(c.clone()))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.registry
            .get_or_create_gauge(key, |g| Gauge::from_arc(g.clone()))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.registry
            .get_or_create_histogram(key, |h| Histogram::from_arc(h.clone()))
    }
}
