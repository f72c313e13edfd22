//! Test doubles for the device and its collaborators.
//!
//! Everything here talks over real localhost UDP sockets so the command
//! channel and listeners are exercised exactly as they are against hardware.

#![cfg(any(test, feature = "benchmark"))]

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::codec::MAX_DATAGRAM_SIZE;
use crate::config::DroneConfig;
use crate::video::{Image, VideoDecoder};
use crate::wifi::WifiAdapter;
use crate::{DroneError, Result};

/// Reply policy of a [`FakeDrone`]: `None` leaves the command unanswered.
pub type ReplyPolicy = dyn Fn(&str) -> Option<String> + Send + Sync;

/// A UDP responder standing in for the device's command port.
pub struct FakeDrone {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

impl FakeDrone {
    /// Bind on localhost and answer every command through `policy`.
    pub async fn spawn<F>(policy: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let socket = Arc::new(
            UdpSocket::bind("127.0.0.1:0").await.expect("bind fake drone command socket"),
        );
        let addr = socket.local_addr().expect("fake drone local address");
        let received = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let policy: Arc<ReplyPolicy> = Arc::new(policy);

        let task_socket = Arc::clone(&socket);
        let task_received = Arc::clone(&received);
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, from) = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    result = task_socket.recv_from(&mut buf) => match result {
                        Ok(received) => received,
                        Err(_) => continue,
                    },
                };
                let command = String::from_utf8_lossy(&buf[..len]).into_owned();
                task_received.lock().push(command.clone());
                if let Some(reply) = policy(&command) {
                    let _ = task_socket.send_to(reply.as_bytes(), from).await;
                }
            }
        });

        Self { socket, addr, received, cancel }
    }

    /// A drone that accepts everything.
    pub async fn always_ok() -> Self {
        Self::spawn(|_| Some("ok".to_string())).await
    }

    /// Address of the command port.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Commands received so far, in order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Send an unsolicited datagram from the command port.
    pub async fn reply_to(&self, target: SocketAddr, text: &str) {
        self.socket.send_to(text.as_bytes(), target).await.expect("send fake reply");
    }

    /// Broadcast telemetry lines to `target` every `interval` until dropped.
    ///
    /// Heights count up from 1 so consecutive snapshots are distinguishable.
    pub fn broadcast_telemetry(&self, target: SocketAddr, interval: Duration) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let Ok(socket) = UdpSocket::bind("127.0.0.1:0").await else { return };
            let mut height = 0.0;
            loop {
                height += 1.0;
                let line = telemetry_line(height, 90.0);
                let _ = socket.send_to(line.as_bytes(), target).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }
}

impl Drop for FakeDrone {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One telemetry broadcast line as the device formats it.
pub fn telemetry_line(height: f64, battery: f64) -> String {
    format!(
        "pitch:0;roll:1;yaw:-3;vgx:0;vgy:0;vgz:0;templ:60;temph:63;tof:10;h:{height};\
         bat:{battery};baro:12.45;time:0;agx:-2.00;agy:1.00;agz:-998.00;\r\n"
    )
}

/// Pick a currently unused localhost UDP port.
pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    socket.local_addr().expect("probe socket address").port()
}

/// Localhost configuration with timings short enough for tests.
pub fn fast_config() -> DroneConfig {
    let mut config = DroneConfig::default()
        .with_name("Test")
        .with_bind_host([127, 0, 0, 1].into())
        .with_ports(0, 0, 0)
        .with_send_delay(Duration::from_millis(1))
        .with_receive_timeout(Duration::from_millis(150))
        .with_baseline_samples(2)
        .with_handshake_attempts(3)
        .with_video(false);
    config.network_scan_delay = Duration::from_millis(1);
    config.state_read_timeout = Duration::from_millis(20);
    config.state_delay = Duration::from_millis(1);
    config.frame_delay = Duration::from_millis(1);
    config.frame_read_timeout = Duration::from_millis(20);
    config.first_frame_timeout = Duration::from_millis(200);
    config.startup_timeout = Duration::from_secs(2);
    config.shutdown_timeout = Duration::from_secs(2);
    config.listener_max_errors = 3;
    config
}

#[derive(Debug, Default)]
struct WifiCounters {
    resets: u32,
    scans: u32,
    associations: u32,
}

/// Wi-Fi adapter with a scripted scan and association outcome.
#[derive(Debug, Clone)]
pub struct ScriptedWifi {
    ssid: Option<String>,
    misses: u32,
    refusals: u32,
    counters: Arc<Mutex<WifiCounters>>,
}

impl ScriptedWifi {
    /// `ssid` is invisible for the first `misses` scans.
    pub fn appearing_after(misses: u32, ssid: impl Into<String>) -> Self {
        Self { ssid: Some(ssid.into()), misses, refusals: 0, counters: Arc::default() }
    }

    /// The device network never shows up.
    pub fn never() -> Self {
        Self { ssid: None, misses: 0, refusals: 0, counters: Arc::default() }
    }

    /// Refuse the first `refusals` association requests.
    pub fn refusing(mut self, refusals: u32) -> Self {
        self.refusals = refusals;
        self
    }

    pub fn resets(&self) -> u32 {
        self.counters.lock().resets
    }

    pub fn scans(&self) -> u32 {
        self.counters.lock().scans
    }

    pub fn associations(&self) -> u32 {
        self.counters.lock().associations
    }
}

#[async_trait::async_trait]
impl WifiAdapter for ScriptedWifi {
    async fn discover_networks(&self) -> Result<Vec<String>> {
        let scans = {
            let mut counters = self.counters.lock();
            counters.scans += 1;
            counters.scans
        };
        let mut networks = vec!["HomeNet".to_string()];
        if scans > self.misses {
            networks.extend(self.ssid.clone());
        }
        Ok(networks)
    }

    async fn associate(&self, _name: &str) -> Result<bool> {
        let mut counters = self.counters.lock();
        counters.associations += 1;
        Ok(counters.associations > self.refusals)
    }

    async fn reset(&self) -> Result<()> {
        self.counters.lock().resets += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DecoderState {
    opened: bool,
    closed: bool,
    served: u32,
}

/// Video decoder serving a fixed number of tiny frames.
///
/// Frame `i` carries the single byte `i`. Once the script is exhausted reads
/// wait forever, or fail when built with [`failing_after`](Self::failing_after).
#[derive(Debug, Clone)]
pub struct ScriptedDecoder {
    frames: u32,
    fail_open: bool,
    fail_reads: bool,
    state: Arc<Mutex<DecoderState>>,
}

impl ScriptedDecoder {
    pub fn frames(frames: u32) -> Self {
        Self { frames, fail_open: false, fail_reads: false, state: Arc::default() }
    }

    pub fn failing_open() -> Self {
        Self { frames: 0, fail_open: true, fail_reads: false, state: Arc::default() }
    }

    /// Serve `frames` frames, then fail every read.
    pub fn failing_after(frames: u32) -> Self {
        Self { frames, fail_open: false, fail_reads: true, state: Arc::default() }
    }

    pub fn opened(&self) -> bool {
        self.state.lock().opened
    }

    pub fn closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait::async_trait]
impl VideoDecoder for ScriptedDecoder {
    async fn open(&mut self, _stream_url: &str) -> Result<()> {
        if self.fail_open {
            return Err(DroneError::video_error("no decoder available"));
        }
        self.state.lock().opened = true;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Image> {
        let next = {
            let mut state = self.state.lock();
            (state.served < self.frames).then(|| {
                state.served += 1;
                state.served - 1
            })
        };
        match next {
            Some(index) => Ok(Image::new(4, 3, vec![index as u8])),
            None if self.fail_reads => Err(DroneError::video_error("corrupt access unit")),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.state.lock().closed = true;
    }
}
