//! Driver configuration.
//!
//! [`DroneConfig`] carries the device addresses, local ports and every timing
//! constant the driver relies on. The defaults match the stock device; tests
//! and unusual setups override them with the `with_*` setters or a YAML file.
//!
//! ```rust
//! use hoverlink::DroneConfig;
//! use std::time::Duration;
//!
//! let config = DroneConfig::from_yaml_str("receive_timeout_ms: 2000\nbaseline_samples: 5\n")
//!     .unwrap()
//!     .with_send_delay(Duration::from_millis(50));
//! assert_eq!(config.receive_timeout, Duration::from_secs(2));
//! assert_eq!(config.state_port, 8890);
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::yaml_utils::duration_ms;
use crate::{DroneError, Result};

/// Default device address for the command channel.
pub const DEFAULT_DEVICE_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 10, 1)), 8889);

/// Configuration for a drone session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    /// Display name, also the prefix of the session id
    pub name: String,

    /// Prefix of the network name broadcast by the device
    pub ssid_prefix: String,

    /// Local Wi-Fi adapter used for association
    pub adapter_name: String,

    /// Address commands are sent to
    pub device_addr: SocketAddr,

    /// Local address all three sockets bind to
    pub bind_host: IpAddr,

    /// Local port of the command socket
    pub command_port: u16,

    /// Local port the device broadcasts telemetry to
    pub state_port: u16,

    /// Local port the device streams video to
    pub video_port: u16,

    /// Minimum spacing before each command
    #[serde(rename = "send_delay_ms", with = "duration_ms")]
    pub send_delay: Duration,

    /// How long a command waits for its reply
    #[serde(rename = "receive_timeout_ms", with = "duration_ms")]
    pub receive_timeout: Duration,

    /// Delay between Wi-Fi scan and association attempts
    #[serde(rename = "network_scan_delay_ms", with = "duration_ms")]
    pub network_scan_delay: Duration,

    /// Per-iteration receive timeout of the telemetry listener
    #[serde(rename = "state_read_timeout_ms", with = "duration_ms")]
    pub state_read_timeout: Duration,

    /// Pause after each telemetry datagram
    #[serde(rename = "state_delay_ms", with = "duration_ms")]
    pub state_delay: Duration,

    /// Pause after each video frame
    #[serde(rename = "frame_delay_ms", with = "duration_ms")]
    pub frame_delay: Duration,

    /// Per-iteration frame read timeout of the video listener
    #[serde(rename = "frame_read_timeout_ms", with = "duration_ms")]
    pub frame_read_timeout: Duration,

    /// How long the video listener waits for the discarded first frame
    #[serde(rename = "first_frame_timeout_ms", with = "duration_ms")]
    pub first_frame_timeout: Duration,

    /// Number of telemetry snapshots averaged into the baseline
    pub baseline_samples: usize,

    /// Handshake attempts before the session faults
    pub handshake_attempts: u32,

    /// Bound on the wait for both listeners' first reading
    #[serde(rename = "startup_timeout_ms", with = "duration_ms")]
    pub startup_timeout: Duration,

    /// Bound on the wait for listeners to exit during teardown
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// Consecutive socket errors tolerated by a listener
    pub listener_max_errors: u32,

    /// Whether the video listener is started
    pub video_enabled: bool,

    /// Width reported for frames whose pixels are not decoded locally
    pub frame_width: u32,

    /// Height reported for frames whose pixels are not decoded locally
    pub frame_height: u32,

    /// Directory the session history is written to on teardown
    pub archive_dir: Option<PathBuf>,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            name: "Tello".to_string(),
            ssid_prefix: "TELLO-".to_string(),
            adapter_name: "Wi-Fi".to_string(),
            device_addr: DEFAULT_DEVICE_ADDR,
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            command_port: 8889,
            state_port: 8890,
            video_port: 11111,
            send_delay: Duration::from_millis(100),
            receive_timeout: Duration::from_secs(4),
            network_scan_delay: Duration::from_millis(500),
            state_read_timeout: Duration::from_millis(250),
            state_delay: Duration::from_millis(100),
            frame_delay: Duration::from_millis(1),
            frame_read_timeout: Duration::from_secs(1),
            first_frame_timeout: Duration::from_secs(5),
            baseline_samples: 10,
            handshake_attempts: 5,
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            listener_max_errors: 10,
            video_enabled: true,
            frame_width: 960,
            frame_height: 720,
            archive_dir: None,
        }
    }
}

impl DroneConfig {
    /// Parse a configuration from YAML. Missing keys take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: DroneConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DroneError::io_error(format!("reading config {}", path.display()), e)
        })?;
        Self::from_yaml_str(&text)
    }

    /// Reject values the driver cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ssid_prefix.trim().is_empty() {
            return Err(DroneError::config_error("ssid_prefix must not be empty"));
        }
        if self.handshake_attempts == 0 {
            return Err(DroneError::config_error("handshake_attempts must be at least 1"));
        }
        if self.listener_max_errors == 0 {
            return Err(DroneError::config_error("listener_max_errors must be at least 1"));
        }
        let timeouts = [
            ("receive_timeout_ms", self.receive_timeout),
            ("state_read_timeout_ms", self.state_read_timeout),
            ("frame_read_timeout_ms", self.frame_read_timeout),
            ("first_frame_timeout_ms", self.first_frame_timeout),
            ("startup_timeout_ms", self.startup_timeout),
            ("shutdown_timeout_ms", self.shutdown_timeout),
        ];
        for (key, value) in timeouts {
            if value.is_zero() {
                return Err(DroneError::config_error(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// Local address of the command socket.
    pub fn command_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.command_port)
    }

    /// Local address of the telemetry socket.
    pub fn state_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.state_port)
    }

    /// URL handed to the video decoder.
    pub fn video_stream_url(&self) -> String {
        format!("udp://{}", SocketAddr::new(self.bind_host, self.video_port))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_device_addr(mut self, addr: SocketAddr) -> Self {
        self.device_addr = addr;
        self
    }

    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    pub fn with_ports(mut self, command: u16, state: u16, video: u16) -> Self {
        self.command_port = command;
        self.state_port = state;
        self.video_port = video;
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_baseline_samples(mut self, samples: usize) -> Self {
        self.baseline_samples = samples;
        self
    }

    pub fn with_handshake_attempts(mut self, attempts: u32) -> Self {
        self.handshake_attempts = attempts;
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.video_enabled = enabled;
        self
    }

    pub fn with_archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }
}
