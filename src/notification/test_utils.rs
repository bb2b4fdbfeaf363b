use crate::core::{AlertError, AlertOutcome, AlertSink};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Alert sink that records every call instead of sending anything.
///
/// Responses can be scripted per call with [`RecordingAlertSink::push_failure`];
/// calls without a scripted response succeed.
#[derive(Clone, Default)]
pub struct RecordingAlertSink {
    calls: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<VecDeque<Option<u16>>>>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holds every call for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues the outcome of the next unscripted call: `Some(code)` fails with
    /// that status, `None` succeeds.
    pub fn push_failure(&self, status: Option<u16>) {
        self.failures.lock().unwrap().push_back(status);
    }

    /// Identifiers notified so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of `notify` calls that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, identifier: &str) -> AlertOutcome {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.calls.lock().unwrap().push(identifier.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.failures.lock().unwrap().pop_front().flatten();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match scripted {
            Some(code) => Err(AlertError::Status(code)),
            None => Ok(()),
        }
    }
}
