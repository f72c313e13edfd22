//! Background stream listeners.
//!
//! Each listener is a spawned task that owns its socket (or decoder) for its
//! whole life, checks a [`CancellationToken`] at every blocking point and
//! reports progress through a `watch` channel exposed on [`ListenerHandle`].

mod telemetry;
mod video;

pub(crate) use telemetry::spawn_telemetry;
pub(crate) use video::spawn_video;

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventHub, StatusEvent, StreamKind};

/// Health of a listener task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    /// Started, nothing stored yet
    Starting,
    /// At least one reading stored
    Running { readings: u64 },
    /// Gave up; the reason is also logged and sent as a status event
    Failed(String),
    /// Exited after a stop request
    Stopped,
}

impl ListenerStatus {
    /// Whether the listener has stored a reading and is still going.
    pub fn is_running(&self) -> bool {
        matches!(self, ListenerStatus::Running { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ListenerStatus::Failed(_) | ListenerStatus::Stopped)
    }

    pub fn readings(&self) -> u64 {
        match self {
            ListenerStatus::Running { readings } => *readings,
            _ => 0,
        }
    }
}

/// Owner's side of a running listener.
#[derive(Debug)]
pub struct ListenerHandle {
    kind: StreamKind,
    status: watch::Receiver<ListenerStatus>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    /// Wait until the first reading is stored or the listener gives up.
    ///
    /// Returns the status at the end of the wait, which is still `Starting`
    /// if `timeout` elapsed first.
    pub async fn wait_ready(&self, timeout: Duration) -> ListenerStatus {
        let mut status = self.status.clone();
        let waited =
            tokio::time::timeout(timeout, status.wait_for(|s| s.is_running() || s.is_finished()))
                .await;
        match waited {
            Ok(Ok(current)) => (*current).clone(),
            // Sender dropped or timed out: report the last value seen.
            Ok(Err(_)) | Err(_) => self.status(),
        }
    }

    /// Request a stop and wait up to `timeout` for the task to exit.
    ///
    /// A task that overruns is aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> ListenerStatus {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => debug!(kind = %self.kind, "Listener exited"),
            Ok(Err(e)) => warn!(kind = %self.kind, error = %e, "Listener task panicked"),
            Err(_) => {
                warn!(kind = %self.kind, ?timeout, "Listener did not stop in time, aborting");
                self.join.abort();
            }
        }
        self.status()
    }
}

/// Task side of the status channel.
pub(crate) struct StatusReporter {
    kind: StreamKind,
    tx: watch::Sender<ListenerStatus>,
    events: std::sync::Arc<EventHub>,
}

impl StatusReporter {
    fn reading_stored(&self, readings: u64) {
        self.tx.send_replace(ListenerStatus::Running { readings });
    }

    fn reading_dropped(&self, reason: String) {
        self.events.status(StatusEvent::ReadingDropped { kind: self.kind, reason });
    }

    fn failed(&self, reason: String) {
        self.events.status(StatusEvent::ListenerFailed { kind: self.kind, reason: reason.clone() });
        self.tx.send_replace(ListenerStatus::Failed(reason));
    }

    fn stopped(&self) {
        self.events.status(StatusEvent::ListenerStopped { kind: self.kind });
        self.tx.send_if_modified(|status| {
            if matches!(status, ListenerStatus::Failed(_)) {
                return false;
            }
            *status = ListenerStatus::Stopped;
            true
        });
    }
}

/// Spawn `task` with a fresh status channel and a child of `cancel`.
pub(crate) fn spawn_listener<F, Fut>(
    kind: StreamKind,
    events: std::sync::Arc<EventHub>,
    cancel: &CancellationToken,
    task: F,
) -> ListenerHandle
where
    F: FnOnce(StatusReporter, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, status) = watch::channel(ListenerStatus::Starting);
    let cancel = cancel.child_token();
    events.status(StatusEvent::ListenerStarted { kind });

    let reporter = StatusReporter { kind, tx, events };
    let join = tokio::spawn(task(reporter, cancel.clone()));
    ListenerHandle { kind, status, cancel, join }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn idle(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Backoff after the `n`th consecutive error: 50ms, 100ms, 200ms, ... up to 1.6s.
pub(crate) fn error_backoff(n: u32) -> Duration {
    Duration::from_millis(50 * (1 << n.saturating_sub(1).min(5)))
}

/// Consecutive-failure budget of a listener.
#[derive(Debug)]
pub(crate) struct ErrorBudget {
    max: u32,
    consecutive: u32,
}

impl ErrorBudget {
    pub(crate) fn new(max: u32) -> Self {
        Self { max, consecutive: 0 }
    }

    /// Count one failure.
    ///
    /// Returns the pause before the next attempt, or `None` once `max`
    /// consecutive failures have been seen.
    pub(crate) fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive = self.consecutive.saturating_add(1);
        (self.consecutive < self.max).then(|| error_backoff(self.consecutive))
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub(crate) fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub(crate) fn max(&self) -> u32 {
        self.max
    }
}
