//! Telemetry listener task

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{ErrorBudget, ListenerHandle, StatusReporter, idle, spawn_listener};
use crate::codec::{self, MAX_DATAGRAM_SIZE};
use crate::config::DroneConfig;
use crate::events::{EventHub, StatusEvent, StreamKind};
use crate::history::HistoryStore;
use crate::session::Lifecycle;
use crate::telemetry::{self, BaselineAccumulator, TelemetryBaseline, TelemetrySnapshot};

struct TelemetryLoop {
    socket: UdpSocket,
    read_timeout: Duration,
    state_delay: Duration,
    errors: ErrorBudget,
    baseline: BaselineAccumulator,
    history: Arc<HistoryStore>,
    events: Arc<EventHub>,
    lifecycle: Lifecycle,
}

/// Start consuming telemetry datagrams from `socket`.
///
/// The first `baseline_samples` snapshots only feed the baseline; every later
/// one is appended to history and published.
pub(crate) fn spawn_telemetry(
    socket: UdpSocket,
    config: &DroneConfig,
    history: Arc<HistoryStore>,
    events: Arc<EventHub>,
    lifecycle: Lifecycle,
    cancel: &CancellationToken,
) -> ListenerHandle {
    let task = TelemetryLoop {
        socket,
        read_timeout: config.state_read_timeout,
        state_delay: config.state_delay,
        errors: ErrorBudget::new(config.listener_max_errors),
        baseline: BaselineAccumulator::new(config.baseline_samples),
        history,
        events: Arc::clone(&events),
        lifecycle,
    };
    spawn_listener(StreamKind::Telemetry, events, cancel, move |reporter, cancel| {
        task.run(reporter, cancel)
    })
}

impl TelemetryLoop {
    async fn run(mut self, reporter: StatusReporter, cancel: CancellationToken) {
        info!(local_addr = ?self.socket.local_addr().ok(), "Telemetry listener started");

        if let Some(baseline) = self.baseline.empty_baseline() {
            self.freeze_baseline(baseline);
        }

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut received = 0u64;
        let mut stored = 0u64;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.read_timeout, self.socket.recv_from(&mut buf)) => result,
            };

            let len = match result {
                // Nothing this interval; loss is silent.
                Err(_) => continue,
                Ok(Err(e)) => {
                    let Some(backoff) = self.errors.record_failure() else {
                        self.give_up(&reporter, &e.to_string());
                        return;
                    };
                    warn!(
                        error = %e,
                        "Telemetry receive failed ({}/{})",
                        self.errors.consecutive(),
                        self.errors.max()
                    );
                    if !idle(&cancel, backoff).await {
                        break;
                    }
                    continue;
                }
                Ok(Ok((len, _from))) => len,
            };
            self.errors.reset();
            received += 1;

            match parse_datagram(&buf[..len]) {
                Ok(fields) => {
                    if !self.baseline.is_complete() {
                        if let Some(baseline) = self.baseline.push(&fields) {
                            self.freeze_baseline(baseline);
                        }
                    } else {
                        let snapshot = Arc::new(TelemetrySnapshot::new(stored, Utc::now(), fields));
                        trace!(sequence = stored, fields = snapshot.fields().len(), "Telemetry stored");
                        self.history.telemetry().append_shared(Arc::clone(&snapshot));
                        self.events.publish_telemetry(snapshot);
                        stored += 1;
                        reporter.reading_stored(stored);
                    }
                }
                Err(reason) => {
                    debug!(%reason, datagram = received, "Dropping telemetry datagram");
                    reporter.reading_dropped(reason);
                }
            }

            if !idle(&cancel, self.state_delay).await {
                break;
            }
        }

        info!(received, stored, "Telemetry listener stopped");
        reporter.stopped();
    }

    /// Error budget spent: the session cannot fly blind, so it is faulted.
    fn give_up(&self, reporter: &StatusReporter, last_error: &str) {
        let reason =
            format!("{} consecutive receive errors, last: {last_error}", self.errors.consecutive());
        error!(%reason, "Telemetry listener giving up");
        reporter.failed(reason.clone());
        self.lifecycle.fault(&format!("telemetry stream lost: {reason}"));
    }

    fn freeze_baseline(&self, baseline: TelemetryBaseline) {
        let samples = baseline.samples;
        if self.history.set_baseline(baseline) {
            info!(samples, "Telemetry baseline ready");
            self.events.status(StatusEvent::BaselineReady { samples });
        }
    }
}

fn parse_datagram(bytes: &[u8]) -> Result<std::collections::BTreeMap<String, f64>, String> {
    let text = codec::decode_text(bytes).map_err(|e| e.to_string())?;
    telemetry::parse_telemetry(text).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenerStatus;
    use crate::session::SessionState;
    use crate::test_utils::{fast_config, telemetry_line};
    use tokio::sync::watch;

    struct Harness {
        handle: ListenerHandle,
        sender: UdpSocket,
        target: std::net::SocketAddr,
        history: Arc<HistoryStore>,
        events: Arc<EventHub>,
    }

    async fn start(baseline_samples: usize) -> Harness {
        let config = fast_config().with_baseline_samples(baseline_samples);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = socket.local_addr().unwrap();
        let history = Arc::new(HistoryStore::new());
        let events = Arc::new(EventHub::new());
        let handle = spawn_telemetry(
            socket,
            &config,
            Arc::clone(&history),
            Arc::clone(&events),
            Lifecycle::new(Arc::clone(&events)),
            &CancellationToken::new(),
        );
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Harness { handle, sender, target, history, events }
    }

    impl Harness {
        async fn send(&self, line: &str) {
            self.sender.send_to(line.as_bytes(), self.target).await.unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    }

    #[tokio::test]
    async fn first_snapshots_feed_baseline_only() {
        let h = start(2).await;
        h.send(&telemetry_line(10.0, 80.0)).await;
        h.send(&telemetry_line(20.0, 78.0)).await;
        h.send(&telemetry_line(35.0, 77.0)).await;

        let status = h.handle.wait_ready(Duration::from_secs(2)).await;
        assert_eq!(status, ListenerStatus::Running { readings: 1 });

        let baseline = h.history.baseline().unwrap();
        assert_eq!(baseline.samples, 2);
        assert_eq!(baseline.get("h"), Some(15.0));
        assert_eq!(baseline.get("bat"), Some(79.0));

        assert_eq!(h.history.telemetry().len(), 1);
        let latest = h.history.telemetry().latest().unwrap();
        assert_eq!(latest.height(), Some(35.0));
        assert_eq!(latest.sequence, 0);
        assert_eq!(
            h.events.watch_telemetry().borrow().as_ref().map(|s| s.sequence),
            Some(0)
        );

        h.handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn malformed_line_is_dropped_and_listener_continues() {
        let h = start(0).await;
        let mut status = h.events.subscribe_status();

        h.send("pitch:0;roll;yaw:0;").await;
        h.send(&telemetry_line(42.0, 90.0)).await;

        let ready = h.handle.wait_ready(Duration::from_secs(2)).await;
        assert!(ready.is_running());
        assert_eq!(h.history.telemetry().len(), 1);
        assert_eq!(h.history.telemetry().latest().unwrap().height(), Some(42.0));

        let mut dropped = 0;
        while let Ok(s) = status.try_recv() {
            if matches!(s.event, StatusEvent::ReadingDropped { kind: StreamKind::Telemetry, .. }) {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 1);

        assert_eq!(h.handle.shutdown(Duration::from_secs(1)).await, ListenerStatus::Stopped);
    }

    #[tokio::test]
    async fn zero_baseline_samples_freezes_empty_baseline() {
        let h = start(0).await;
        h.send(&telemetry_line(1.0, 50.0)).await;
        h.handle.wait_ready(Duration::from_secs(2)).await;
        assert!(h.history.baseline().unwrap().fields().is_empty());
        assert_eq!(h.history.telemetry().len(), 1);
        h.handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stops_promptly_when_idle() {
        let h = start(0).await;
        let status = tokio::time::timeout(
            Duration::from_millis(500),
            h.handle.shutdown(Duration::from_secs(5)),
        )
        .await
        .expect("idle listener observes stop within one read timeout");
        assert_eq!(status, ListenerStatus::Stopped);
        assert!(h.history.telemetry().is_empty());
    }

    #[tokio::test]
    async fn spent_error_budget_faults_a_ready_session() {
        let events = Arc::new(EventHub::new());
        let lifecycle = Lifecycle::new(Arc::clone(&events));
        for state in [
            SessionState::WifiAssociating,
            SessionState::WifiAssociated,
            SessionState::HandshakePending,
            SessionState::Ready,
        ] {
            lifecycle.transition(state).unwrap();
        }

        let (tx, status) = watch::channel(ListenerStatus::Running { readings: 4 });
        let reporter = StatusReporter { kind: StreamKind::Telemetry, tx, events: Arc::clone(&events) };
        let mut task = TelemetryLoop {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            read_timeout: Duration::from_millis(20),
            state_delay: Duration::from_millis(1),
            errors: ErrorBudget::new(2),
            baseline: BaselineAccumulator::new(0),
            history: Arc::new(HistoryStore::new()),
            events: Arc::clone(&events),
            lifecycle: lifecycle.clone(),
        };
        let mut notices = events.subscribe_status();

        assert!(task.errors.record_failure().is_some());
        assert!(task.errors.record_failure().is_none());
        task.give_up(&reporter, "connection reset by peer");

        assert_eq!(lifecycle.current(), SessionState::Faulted);
        assert!(matches!(
            &*status.borrow(),
            ListenerStatus::Failed(reason) if reason.starts_with("2 consecutive receive errors")
        ));
        let mut failed = false;
        while let Ok(notice) = notices.try_recv() {
            failed |= matches!(notice.event, StatusEvent::ListenerFailed { kind: StreamKind::Telemetry, .. });
        }
        assert!(failed);
    }

    #[test]
    fn undecodable_datagrams_are_rejected() {
        assert!(parse_datagram(b"bat").is_err());
        assert!(parse_datagram(&[0xff, 0xfe]).is_err());
        assert!(parse_datagram(b"\r\n").is_err());
        assert_eq!(parse_datagram(b"bat:87;\r\n").unwrap().get("bat"), Some(&87.0));
    }
}
