use super::*;
use crate::test_utils::{FakeDrone, ScriptedDecoder, ScriptedWifi, fast_config, free_udp_port};
use std::time::Duration;

const SSID: &str = "TELLO-5A1B2C";

struct Rig {
    drone: FakeDrone,
    config: DroneConfig,
}

/// A fake drone answering through `policy` and broadcasting telemetry to a
/// free local state port.
async fn rig<F>(policy: F) -> Rig
where
    F: Fn(&str) -> Option<String> + Send + Sync + 'static,
{
    let _ = tracing_subscriber::fmt::try_init();
    let drone = FakeDrone::spawn(policy).await;
    let state_port = free_udp_port();
    let config = fast_config().with_device_addr(drone.addr()).with_ports(0, state_port, 0);
    drone.broadcast_telemetry(SocketAddr::from(([127, 0, 0, 1], state_port)), Duration::from_millis(5));
    Rig { drone, config }
}

fn wifi() -> ScriptedWifi {
    ScriptedWifi::appearing_after(1, SSID)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_success_reaches_ready_with_readings() {
    let rig = rig(|_| Some("ok".to_string())).await;
    let decoder = ScriptedDecoder::frames(50);
    let mut session = Session::new(rig.config.clone().with_video(true), wifi())
        .unwrap()
        .with_video_decoder(decoder.clone());

    session.connect().await.unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.ssid(), Some(SSID));
    assert!(session.telemetry_status().unwrap().is_running());
    assert!(session.video_status().unwrap().is_running());
    assert!(session.latest_telemetry().is_some());
    assert!(session.latest_frame().is_some());
    assert_eq!(session.telemetry_baseline().unwrap().samples, 2);
    assert!(decoder.opened());

    let summary = session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(decoder.closed());
    assert_eq!(summary.ssid.as_deref(), Some(SSID));
    assert!(summary.telemetry_count >= 1);
    assert!(summary.frame_count >= 1);
    assert_eq!(summary.video_status, Some(ListenerStatus::Stopped));

    let received = rig.drone.received();
    assert_eq!(received.first().map(String::as_str), Some("command"));
    assert!(received.iter().any(|c| c == "streamon"));
    assert_eq!(received.last().map(String::as_str), Some("streamoff"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_handshake_faults_session() {
    let rig = rig(|_| Some("error".to_string())).await;
    let mut session = Session::new(rig.config.clone(), wifi()).unwrap();

    let err = session.connect().await.unwrap_err();
    match &err {
        DroneError::Handshake { attempts, last_response } => {
            assert_eq!(*attempts, 3);
            assert_eq!(last_response, "error");
        }
        other => panic!("expected handshake error, got {other:?}"),
    }
    assert!(err.is_session_fatal());
    assert_eq!(session.state(), SessionState::Faulted);
    assert_eq!(rig.drone.received(), vec!["command", "command", "command"]);
    assert!(session.telemetry_status().is_none());
    assert!(session.video_status().is_none());

    // Rejected attempts back off 50ms, then 100ms.
    let issued: Vec<_> = session.history().commands().snapshot().iter().map(|r| r.issued_at).collect();
    let gaps: Vec<i64> = issued.windows(2).map(|w| (w[1] - w[0]).num_milliseconds()).collect();
    assert_eq!(gaps.len(), 2);
    assert!(gaps[0] >= 50, "first gap {}ms", gaps[0]);
    assert!(gaps[1] >= 100, "second gap {}ms", gaps[1]);

    assert!(matches!(session.takeoff().await, Err(DroneError::InvalidState { .. })));

    let summary = session.disconnect().await.unwrap();
    assert_eq!(summary.command_count, 3);
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(matches!(session.connect().await, Err(DroneError::InvalidState { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_timeout_leaves_session_ready() {
    let rig = rig(|cmd| (cmd != "takeoff").then(|| "ok".to_string())).await;
    let mut session = Session::new(rig.config.clone(), wifi()).unwrap();
    session.connect().await.unwrap();

    let response = session.takeoff().await.unwrap();
    assert!(response.is_timeout());
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.history().commands().latest().unwrap().response, Response::Timeout);

    assert_eq!(session.land().await.unwrap(), Response::Ok);
    assert_eq!(session.history().commands().len(), 3);

    // Without a video listener the session turns the stream off itself.
    let summary = session.disconnect().await.unwrap();
    assert_eq!(summary.command_count, 4);
    assert_eq!(rig.drone.received().last().map(String::as_str), Some("streamoff"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_range_arguments_never_reach_device() {
    let rig = rig(|_| Some("ok".to_string())).await;
    let mut session = Session::new(rig.config.clone(), wifi()).unwrap();
    session.connect().await.unwrap();
    let sent_before = rig.drone.received().len();

    assert!(matches!(session.rc(150, 0, 0, 0).await, Err(DroneError::InvalidArgument { .. })));
    assert!(matches!(
        session.move_by(MoveDirection::Forward, 5).await,
        Err(DroneError::InvalidArgument { .. })
    ));
    assert!(session.go(5, 5, 5, 50).await.is_err());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rig.drone.received().len(), sent_before);
    assert_eq!(session.history().commands().len(), 1);

    assert_eq!(session.rc(100, -100, 0, 50).await.unwrap(), Response::Ok);
    assert_eq!(rig.drone.received().last().map(String::as_str), Some("rc 100 -100 0 50"));
    session.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn video_open_failure_is_not_fatal() {
    let rig = rig(|cmd| match cmd {
        "battery?" => Some("76".to_string()),
        _ => Some("ok".to_string()),
    })
    .await;
    let mut session = Session::new(rig.config.clone().with_video(true), wifi())
        .unwrap()
        .with_video_decoder(ScriptedDecoder::failing_open());

    session.connect().await.unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert!(matches!(session.video_status(), Some(ListenerStatus::Failed(_))));
    assert!(session.telemetry_status().unwrap().is_running());
    assert!(session.latest_frame().is_none());

    let battery = session.query(Query::Battery).await.unwrap();
    assert_eq!(battery.value::<u8>(), Some(76));

    let summary = session.disconnect().await.unwrap();
    assert!(matches!(summary.video_status, Some(ListenerStatus::Failed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_archives_history() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(|_| Some("ok".to_string())).await;
    let config = rig.config.clone().with_archive_dir(dir.path());
    let mut session = Session::new(config, wifi()).unwrap();
    session.connect().await.unwrap();
    session.stop().await.unwrap();

    let id = session.id().to_string();
    let summary = session.disconnect().await.unwrap();
    let report = summary.archive.expect("archive directory is configured");

    for path in report.paths() {
        assert!(path.exists());
        assert!(path.to_string_lossy().contains(&id));
    }
    let metadata: SessionMetadata =
        serde_yaml_ng::from_str(&std::fs::read_to_string(&report.metadata).unwrap()).unwrap();
    assert_eq!(metadata.command_count, summary.command_count);
    assert_eq!(metadata.telemetry_count, summary.telemetry_count);
    assert_eq!(metadata.ssid.as_deref(), Some(SSID));
    assert_eq!(metadata.baseline.map(|b| b.samples), Some(2));
}

#[tokio::test]
async fn cancelled_wifi_search_returns_to_disconnected() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut session = Session::new(fast_config(), ScriptedWifi::never()).unwrap();
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), session.connect())
        .await
        .expect("cancellation ends the search");
    assert!(matches!(result, Err(DroneError::Cancelled { .. })));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.ssid().is_none());

    assert!(matches!(session.connect().await, Err(DroneError::InvalidState { .. })));
    assert!(matches!(session.disconnect().await, Err(DroneError::InvalidState { .. })));
}

#[tokio::test]
async fn commands_before_connect_are_refused() {
    let session = Session::new(fast_config(), ScriptedWifi::never()).unwrap();
    let err = session.land().await.unwrap_err();
    assert!(matches!(err, DroneError::InvalidState { state: SessionState::Disconnected, .. }));
    assert!(session.local_command_addr().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_events_trace_the_lifecycle() {
    let rig = rig(|_| Some("ok".to_string())).await;
    let mut session = Session::new(rig.config.clone(), wifi()).unwrap();
    let mut events = Box::pin(session.status_events());

    session.connect().await.unwrap();

    let mut states = Vec::new();
    while states.last() != Some(&SessionState::Ready) {
        let status = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("status event")
            .expect("open stream");
        if let StatusEvent::StateChanged { to, .. } = status.event {
            states.push(to);
        }
    }
    assert_eq!(
        states,
        vec![
            SessionState::WifiAssociating,
            SessionState::WifiAssociated,
            SessionState::HandshakePending,
            SessionState::Ready,
        ]
    );
    session.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn telemetry_updates_follow_the_stream() {
    let rig = rig(|_| Some("ok".to_string())).await;
    let mut session = Session::new(rig.config.clone(), wifi()).unwrap();
    session.connect().await.unwrap();

    let mut updates = session.telemetry_updates(UpdateRate::Native);
    let first = tokio::time::timeout(Duration::from_secs(1), updates.next()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), updates.next()).await.unwrap().unwrap();
    assert!(second.sequence > first.sequence);
    assert!(second.received_at >= first.received_at);

    let mut records = Box::pin(session.command_records());
    session.query(Query::Height).await.unwrap();
    let record = tokio::time::timeout(Duration::from_secs(1), records.next()).await.unwrap().unwrap();
    assert_eq!(record.command, "height?");

    session.disconnect().await.unwrap();
}

#[test]
fn session_id_has_name_time_and_epoch() {
    let session = Session::new(fast_config(), ScriptedWifi::never()).unwrap();
    let parts: Vec<&str> = session.id().split('_').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "Test");
    assert_eq!(parts[1].len(), "2026-10-18-09-30-00".len());
    assert!(parts[2].parse::<i64>().is_ok());
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let config = fast_config().with_handshake_attempts(0);
    assert!(matches!(Session::new(config, ScriptedWifi::never()), Err(DroneError::Config { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_after_connect_keeps_listeners_running() {
    let rig = rig(|_| Some("ok".to_string())).await;
    let mut session = Session::new(rig.config.clone(), wifi()).unwrap();
    session.connect().await.unwrap();

    session.cancel_token().cancel();
    let before = session.history().telemetry().len();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.telemetry_status().unwrap().is_running());
    assert!(session.history().telemetry().len() > before);
    assert_eq!(session.takeoff().await.unwrap(), Response::Ok);

    let summary = session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(summary.telemetry_status, Some(ListenerStatus::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_telemetry_fault_refuses_commands() {
    let rig = rig(|_| Some("ok".to_string())).await;
    let mut session = Session::new(rig.config.clone(), wifi()).unwrap();
    session.connect().await.unwrap();

    // Same transition the telemetry listener makes when its error budget is spent.
    assert!(session.lifecycle.fault("telemetry stream lost: 3 consecutive receive errors"));
    assert_eq!(session.state(), SessionState::Faulted);
    assert!(matches!(session.takeoff().await, Err(DroneError::InvalidState { .. })));
    assert!(!rig.drone.received().iter().any(|c| c == "takeoff"));

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
}
