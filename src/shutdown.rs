//! Orderly shutdown of the subscription and the bus connection.
//!
//! The lifecycle is published on a `watch` channel that is handed to the
//! consumer at construction and doubles as its cancellation token:
//!
//! ```text
//! Running --first signal--> ShuttingDown --unsubscribe + close--> Stopped
//! ```
//!
//! Only the first termination signal moves the state machine; the coordinator
//! stops listening afterwards, so later signals are ignored.

use crate::bus::{BusConnection, BusError};
use crate::consumer::{ConsumerReport, StopReason};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Stopped,
}

/// A process termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGINT / Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

/// What started the shutdown.
#[derive(Debug)]
pub enum ShutdownTrigger {
    Signal(TerminationSignal),
    /// Every signal sender went away.
    SignalsClosed,
    /// The consumer stopped on its own, e.g. because the bus ended the stream.
    ConsumerStopped,
}

/// Outcome of a completed shutdown.
#[derive(Debug)]
pub struct ShutdownReport {
    pub trigger: ShutdownTrigger,
    /// Messages handled by the consumer, if it did not panic.
    pub processed: Option<u64>,
    /// Messages whose alert could not be sent, if the consumer did not panic.
    pub failed: Option<u64>,
    /// Why the consumer loop returned, if it did not panic.
    pub consumer_stop: Option<StopReason>,
    /// Failures while unsubscribing or closing. Cleanup is best effort, so
    /// these never prevent reaching `Stopped`.
    pub cleanup_errors: Vec<BusError>,
}

pub struct ShutdownCoordinator {
    state_tx: watch::Sender<LifecycleState>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Running);
        Self { state_tx }
    }

    /// A receiver observing the lifecycle; give one to every task that must stop.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    /// Moves `Running` to `ShuttingDown`. Returns `false`, and changes nothing,
    /// if shutdown has already begun.
    pub fn begin_shutdown(&self) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::ShuttingDown;
                true
            } else {
                false
            }
        })
    }

    /// Waits for the first termination signal (or for the consumer to stop on
    /// its own), then unsubscribes and closes the connection.
    ///
    /// Returns only once `Stopped` has been reached.
    pub async fn run(
        self,
        mut signals: mpsc::Receiver<TerminationSignal>,
        mut consumer: JoinHandle<ConsumerReport>,
        connection: Box<dyn BusConnection>,
    ) -> ShutdownReport {
        let (trigger, finished) = tokio::select! {
            signal = signals.recv() => match signal {
                Some(signal) => {
                    info!(?signal, "Received an interrupt, unsubscribing and closing connection...");
                    (ShutdownTrigger::Signal(signal), None)
                }
                None => {
                    warn!("Signal channel closed, shutting down");
                    (ShutdownTrigger::SignalsClosed, None)
                }
            },
            joined = &mut consumer => {
                warn!("Subscription consumer stopped before any termination signal, shutting down");
                (ShutdownTrigger::ConsumerStopped, Some(joined))
            }
        };

        if !self.begin_shutdown() {
            debug!("Shutdown already in progress");
        }
        // Signals arriving from here on are dropped by the listener.
        drop(signals);

        // The consumer finishes the message it is handling before returning.
        let joined = match finished {
            Some(joined) => joined,
            None => consumer.await,
        };

        let mut cleanup_errors = Vec::new();
        let (processed, failed, consumer_stop) = match joined {
            Ok(report) => {
                // Unsubscribing keeps the durable on the bus for the next run.
                match report.subscription.unsubscribe().await {
                    Ok(()) => info!("Unsubscribed"),
                    Err(e) => {
                        error!(error = %e, "Failed to unsubscribe");
                        cleanup_errors.push(e);
                    }
                }
                (Some(report.processed), Some(report.failed), Some(report.reason))
            }
            Err(e) => {
                error!(error = %e, "Subscription consumer task panicked");
                (None, None, None)
            }
        };

        match connection.close().await {
            Ok(()) => info!("Connection closed"),
            Err(e) => {
                error!(error = %e, "Failed to close connection");
                cleanup_errors.push(e);
            }
        }

        self.state_tx.send_replace(LifecycleState::Stopped);

        ShutdownReport {
            trigger,
            processed,
            failed,
            consumer_stop,
            cleanup_errors,
        }
    }
}

/// Spawns a task that forwards SIGINT and SIGTERM to `tx`.
///
/// Once the handlers are installed the default "terminate immediately"
/// behaviour is gone for the rest of the process, so signals that arrive after
/// the coordinator stopped listening are dropped here.
pub fn spawn_signal_listener(tx: mpsc::Sender<TerminationSignal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = listen_for_signals(tx).await {
            error!(error = %e, "Failed to listen for termination signals");
        }
    })
}

async fn listen_for_signals(tx: mpsc::Sender<TerminationSignal>) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        let signal = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                TerminationSignal::Interrupt
            }
            _ = terminate.recv() => TerminationSignal::Terminate,
        };
        #[cfg(not(unix))]
        let signal = {
            tokio::signal::ctrl_c().await?;
            TerminationSignal::Interrupt
        };

        if tx.try_send(signal).is_err() {
            debug!(?signal, "Shutdown already in progress, ignoring signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_shutdown_transitions_once() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state(), LifecycleState::Running);

        assert!(coordinator.begin_shutdown());
        assert_eq!(coordinator.state(), LifecycleState::ShuttingDown);

        assert!(!coordinator.begin_shutdown());
        assert_eq!(coordinator.state(), LifecycleState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_receivers_observe_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        coordinator.begin_shutdown();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LifecycleState::ShuttingDown);
    }
}
