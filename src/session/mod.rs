//! Connection session.
//!
//! A [`Session`] drives one connect-to-disconnect lifecycle with the device:
//!
//! 1. `connect()` joins the device network through the [`WifiAdapter`],
//!    binds the command and telemetry sockets, and sends the `command`
//!    handshake until the device answers `ok` or the attempts run out.
//! 2. Once `Ready`, the telemetry and video listeners run in the background
//!    and fill the [`HistoryStore`] while the caller issues commands.
//! 3. `disconnect()` stops the listeners, archives the history and releases
//!    the sockets.
//!
//! ```rust,no_run
//! use hoverlink::{DroneConfig, MoveDirection, NetshAdapter, Session};
//!
//! # async fn fly() -> hoverlink::Result<()> {
//! let config = DroneConfig::default().with_archive_dir("flights");
//! let wifi = NetshAdapter::from_config(&config);
//! let mut session = Session::new(config, wifi)?;
//!
//! session.connect().await?;
//! session.takeoff().await?;
//! session.move_by(MoveDirection::Up, 50).await?;
//! if let Some(snapshot) = session.latest_telemetry() {
//!     println!("battery: {:?}", snapshot.battery());
//! }
//! session.land().await?;
//!
//! let summary = session.disconnect().await?;
//! println!("{} commands sent", summary.command_count);
//! # Ok(())
//! # }
//! ```

mod state;
#[cfg(test)]
mod tests;

pub(crate) use state::Lifecycle;
pub use state::SessionState;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveReport, SessionArchive, SessionMetadata};
use crate::channel::CommandChannel;
use crate::codec::Response;
use crate::command::{Command, FlipDirection, MoveDirection, Query, RotateDirection};
use crate::config::DroneConfig;
use crate::events::{EventHub, Status, StatusEvent};
use crate::history::{CommandRecord, HistoryStore, VideoFrame};
use crate::listener::{self, ListenerHandle, ListenerStatus};
use crate::stream::{TELEMETRY_SOURCE_HZ, ThrottleExt, UpdateRate, VIDEO_SOURCE_HZ};
use crate::telemetry::{TelemetryBaseline, TelemetrySnapshot};
use crate::video::{DatagramDecoder, VideoDecoder};
use crate::wifi::{self, WifiAdapter};
use crate::{DroneError, Result};

/// What a finished session leaves behind.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub ssid: Option<String>,
    pub command_count: usize,
    pub telemetry_count: usize,
    pub frame_count: usize,
    pub telemetry_status: Option<ListenerStatus>,
    pub video_status: Option<ListenerStatus>,
    /// Written documents, when an archive directory is configured
    pub archive: Option<ArchiveReport>,
}

/// One connect-to-disconnect lifecycle with the device.
pub struct Session {
    config: DroneConfig,
    id: String,
    created_at: DateTime<Utc>,
    wifi: Box<dyn WifiAdapter>,
    decoder: Option<Box<dyn VideoDecoder>>,
    lifecycle: Lifecycle,
    history: Arc<HistoryStore>,
    events: Arc<EventHub>,
    // Session lifetime: listeners run on children of this token.
    cancel: CancellationToken,
    // Child of `cancel` covering Wi-Fi association and the handshake only.
    connecting: CancellationToken,
    ssid: Option<String>,
    channel: Option<Arc<CommandChannel>>,
    telemetry: Option<ListenerHandle>,
    video: Option<ListenerHandle>,
    attempted: bool,
}

impl Session {
    /// Create a session. No I/O happens until [`connect`](Self::connect).
    pub fn new(config: DroneConfig, wifi: impl WifiAdapter + 'static) -> Result<Self> {
        config.validate()?;
        let created_at = Utc::now();
        let id = session_id(&config.name, created_at);
        let events = Arc::new(EventHub::new());
        let cancel = CancellationToken::new();
        debug!(%id, "Session created");

        Ok(Self {
            config,
            id,
            created_at,
            wifi: Box::new(wifi),
            decoder: None,
            lifecycle: Lifecycle::new(Arc::clone(&events)),
            history: Arc::new(HistoryStore::new()),
            events,
            connecting: cancel.child_token(),
            cancel,
            ssid: None,
            channel: None,
            telemetry: None,
            video: None,
            attempted: false,
        })
    }

    /// Use `decoder` for the video stream instead of the built-in
    /// [`DatagramDecoder`].
    pub fn with_video_decoder(mut self, decoder: impl VideoDecoder) -> Self {
        self.decoder = Some(Box::new(decoder));
        self
    }

    /// Establish the session.
    ///
    /// Wi-Fi association retries until it succeeds or the token from
    /// [`cancel_token`](Self::cancel_token) is cancelled. Handshake failure
    /// and socket bind failure leave the session `Faulted`.
    pub async fn connect(&mut self) -> Result<()> {
        let state = self.lifecycle.current();
        if state != SessionState::Disconnected || self.attempted {
            return Err(DroneError::invalid_state("connect", state));
        }
        self.attempted = true;
        info!(id = %self.id, device = %self.config.device_addr, "Connecting");

        self.lifecycle.transition(SessionState::WifiAssociating)?;
        let associated = wifi::associate_device(
            self.wifi.as_ref(),
            &self.config.ssid_prefix,
            self.config.network_scan_delay,
            &self.connecting,
            &self.events,
        )
        .await;
        let ssid = match associated {
            Ok(ssid) => ssid,
            Err(e) => {
                if matches!(e, DroneError::Cancelled { .. }) {
                    self.lifecycle.transition(SessionState::Disconnected)?;
                } else {
                    self.lifecycle.fault(&e.to_string());
                }
                return Err(e);
            }
        };
        self.ssid = Some(ssid);
        self.lifecycle.transition(SessionState::WifiAssociated)?;

        let (channel, state_socket) = match self.bind_sockets().await {
            Ok(bound) => bound,
            Err(e) => {
                self.lifecycle.fault(&e.to_string());
                return Err(e);
            }
        };
        let channel = Arc::new(channel);
        self.channel = Some(Arc::clone(&channel));

        self.lifecycle.transition(SessionState::HandshakePending)?;
        if let Err(e) = self.handshake(&channel).await {
            if matches!(e, DroneError::Cancelled { .. }) {
                self.lifecycle.transition(SessionState::Closing)?;
                self.channel = None;
                self.lifecycle.transition(SessionState::Disconnected)?;
            } else {
                self.lifecycle.fault(&e.to_string());
            }
            return Err(e);
        }

        self.lifecycle.transition(SessionState::Ready)?;
        self.start_listeners(channel, state_socket);
        self.wait_for_first_readings().await;

        info!(id = %self.id, ssid = ?self.ssid, "Session ready");
        Ok(())
    }

    async fn bind_sockets(&self) -> Result<(CommandChannel, UdpSocket)> {
        let channel = CommandChannel::bind(
            &self.config,
            Arc::clone(&self.history),
            Arc::clone(&self.events),
        )
        .await?;

        let state_addr = self.config.state_bind_addr();
        let state_socket = UdpSocket::bind(state_addr)
            .await
            .map_err(|e| DroneError::bind_failed("telemetry", state_addr, e))?;
        debug!(local_addr = ?state_socket.local_addr().ok(), "Telemetry socket bound");

        Ok((channel, state_socket))
    }

    async fn handshake(&self, channel: &CommandChannel) -> Result<()> {
        let attempts = self.config.handshake_attempts;
        let mut last = Response::Timeout;

        for attempt in 1..=attempts {
            let response = tokio::select! {
                _ = self.connecting.cancelled() => return Err(DroneError::cancelled("handshake")),
                response = channel.send(&Command::Command) => response?,
            };
            debug!(attempt, %response, "Handshake attempt");
            self.events.status(StatusEvent::HandshakeAttempt {
                attempt,
                response: response.as_str().to_string(),
            });

            if response.is_ok() {
                info!(attempt, "Device accepted handshake");
                return Ok(());
            }
            warn!(attempt, attempts, %response, "Handshake not acknowledged");
            last = response;

            if attempt < attempts
                && !listener::idle(&self.connecting, listener::error_backoff(attempt)).await
            {
                return Err(DroneError::cancelled("handshake"));
            }
        }

        Err(DroneError::Handshake { attempts, last_response: last.as_str().to_string() })
    }

    fn start_listeners(&mut self, channel: Arc<CommandChannel>, state_socket: UdpSocket) {
        self.telemetry = Some(listener::spawn_telemetry(
            state_socket,
            &self.config,
            Arc::clone(&self.history),
            Arc::clone(&self.events),
            self.lifecycle.clone(),
            &self.cancel,
        ));

        if self.config.video_enabled {
            let decoder: Box<dyn VideoDecoder> = match self.decoder.take() {
                Some(decoder) => decoder,
                None => Box::new(DatagramDecoder::new(
                    self.config.frame_width,
                    self.config.frame_height,
                )),
            };
            self.video = Some(listener::spawn_video(
                channel,
                decoder,
                &self.config,
                Arc::clone(&self.history),
                Arc::clone(&self.events),
                &self.cancel,
            ));
        }
    }

    /// Bounded wait for both listeners to store a first reading.
    ///
    /// Running out of time is not an error; callers then see empty history
    /// until the streams catch up.
    async fn wait_for_first_readings(&self) {
        let timeout = self.config.startup_timeout;
        let telemetry = async {
            match &self.telemetry {
                Some(handle) => Some(handle.wait_ready(timeout).await),
                None => None,
            }
        };
        let video = async {
            match &self.video {
                Some(handle) => Some(handle.wait_ready(timeout).await),
                None => None,
            }
        };
        let (telemetry, video) = futures::join!(telemetry, video);

        for (kind, status) in [("telemetry", telemetry), ("video", video)] {
            match status {
                Some(status) if status.is_running() => debug!(kind, "First reading stored"),
                Some(ListenerStatus::Failed(reason)) => warn!(kind, %reason, "Listener failed to start"),
                Some(status) => warn!(kind, ?status, ?timeout, "No reading within startup wait"),
                None => {}
            }
        }
    }

    /// Tear the session down.
    ///
    /// Allowed from `Ready` and `Faulted`. Listeners get a bounded time to
    /// stop, then the history is archived if an archive directory is
    /// configured. The session ends `Disconnected` even if archiving fails;
    /// that failure is returned.
    pub async fn disconnect(&mut self) -> Result<SessionSummary> {
        let from = self.lifecycle.transition(SessionState::Closing).map_err(|_| {
            DroneError::invalid_state("disconnect", self.lifecycle.current())
        })?;
        info!(id = %self.id, %from, "Disconnecting");

        if from == SessionState::Ready && self.video.is_none() {
            if let Some(channel) = &self.channel {
                match channel.send(&Command::StreamOff).await {
                    Ok(response) => debug!(%response, "Stream off"),
                    Err(e) => warn!(error = %e, "Stream off not sent"),
                }
            }
        }

        self.cancel.cancel();
        let timeout = self.config.shutdown_timeout;
        let telemetry = self.telemetry.take();
        let video = self.video.take();
        let (telemetry_status, video_status) = futures::join!(
            async {
                match telemetry {
                    Some(handle) => Some(handle.shutdown(timeout).await),
                    None => None,
                }
            },
            async {
                match video {
                    Some(handle) => Some(handle.shutdown(timeout).await),
                    None => None,
                }
            }
        );

        let archived = match &self.config.archive_dir {
            Some(dir) => SessionArchive::new(dir).write(&self.metadata(), &self.history).await.map(Some),
            None => Ok(None),
        };

        self.channel = None;
        self.lifecycle.transition(SessionState::Disconnected)?;

        let archive = archived.inspect_err(|e| error!(error = %e, "Failed to archive session"))?;
        let summary = SessionSummary {
            id: self.id.clone(),
            ssid: self.ssid.clone(),
            command_count: self.history.commands().len(),
            telemetry_count: self.history.telemetry().len(),
            frame_count: self.history.frames().len(),
            telemetry_status,
            video_status,
            archive,
        };
        info!(
            id = %summary.id,
            commands = summary.command_count,
            telemetry = summary.telemetry_count,
            frames = summary.frame_count,
            "Session closed"
        );
        Ok(summary)
    }

    fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            id: self.id.clone(),
            name: self.config.name.clone(),
            ssid: self.ssid.clone(),
            created_at: self.created_at,
            closed_at: Utc::now(),
            command_count: self.history.commands().len(),
            telemetry_count: self.history.telemetry().len(),
            frame_count: self.history.frames().len(),
            baseline: self.history.baseline().cloned(),
        }
    }

    /// Token that aborts `connect()` when cancelled.
    ///
    /// It only covers Wi-Fi association and the handshake. Cancelling it
    /// after the session is `Ready` leaves the listeners running; use
    /// [`disconnect`](Self::disconnect) to stop them.
    pub fn cancel_token(&self) -> CancellationToken {
        self.connecting.clone()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.current()
    }

    /// Unique id, `<name>_<YYYY-mm-dd-HH-MM-SS>_<unix seconds>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &DroneConfig {
        &self.config
    }

    /// Network joined during `connect()`.
    pub fn ssid(&self) -> Option<&str> {
        self.ssid.as_deref()
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn latest_telemetry(&self) -> Option<Arc<TelemetrySnapshot>> {
        self.history.telemetry().latest()
    }

    pub fn latest_frame(&self) -> Option<Arc<VideoFrame>> {
        self.history.frames().latest()
    }

    pub fn telemetry_baseline(&self) -> Option<&TelemetryBaseline> {
        self.history.baseline()
    }

    /// Local address of the command socket while connected.
    pub fn local_command_addr(&self) -> Option<SocketAddr> {
        self.channel.as_ref().map(|c| c.local_addr())
    }

    pub fn telemetry_status(&self) -> Option<ListenerStatus> {
        self.telemetry.as_ref().map(ListenerHandle::status)
    }

    pub fn video_status(&self) -> Option<ListenerStatus> {
        self.video.as_ref().map(ListenerHandle::status)
    }

    fn ready_channel(&self, operation: &str) -> Result<Arc<CommandChannel>> {
        let state = self.lifecycle.current();
        match (&self.channel, state) {
            (Some(channel), SessionState::Ready) => Ok(Arc::clone(channel)),
            _ => Err(DroneError::invalid_state(operation, state)),
        }
    }

    /// Send a command and wait for its reply.
    ///
    /// A missing reply is returned as [`Response::Timeout`], not an error.
    pub async fn send(&self, command: &Command) -> Result<Response> {
        command.validate()?;
        self.ready_channel(command.keyword())?.send(command).await
    }

    /// Send raw command text, for SDK commands without a typed builder.
    pub async fn send_text(&self, text: &str) -> Result<Response> {
        self.ready_channel("send")?.send_text(text).await
    }

    pub async fn takeoff(&self) -> Result<Response> {
        self.send(&Command::Takeoff).await
    }

    pub async fn land(&self) -> Result<Response> {
        self.send(&Command::Land).await
    }

    /// Stop all motors immediately.
    pub async fn emergency(&self) -> Result<Response> {
        self.send(&Command::Emergency).await
    }

    /// Hover in place.
    pub async fn stop(&self) -> Result<Response> {
        self.send(&Command::Stop).await
    }

    pub async fn stream_on(&self) -> Result<Response> {
        self.send(&Command::StreamOn).await
    }

    pub async fn stream_off(&self) -> Result<Response> {
        self.send(&Command::StreamOff).await
    }

    pub async fn move_by(&self, direction: MoveDirection, cm: u32) -> Result<Response> {
        self.send(&Command::move_by(direction, cm)?).await
    }

    pub async fn rotate(&self, direction: RotateDirection, degrees: u32) -> Result<Response> {
        self.send(&Command::rotate(direction, degrees)?).await
    }

    pub async fn flip(&self, direction: FlipDirection) -> Result<Response> {
        self.send(&Command::flip(direction)).await
    }

    pub async fn go(&self, x: i32, y: i32, z: i32, speed: u32) -> Result<Response> {
        self.send(&Command::go(x, y, z, speed)?).await
    }

    pub async fn curve(
        &self,
        start: (i32, i32, i32),
        end: (i32, i32, i32),
        speed: u32,
    ) -> Result<Response> {
        self.send(&Command::curve(start, end, speed)?).await
    }

    pub async fn set_speed(&self, cm_per_sec: u32) -> Result<Response> {
        self.send(&Command::set_speed(cm_per_sec)?).await
    }

    /// Remote-control channels, each in -100..=100.
    pub async fn rc(
        &self,
        left_right: i32,
        forward_back: i32,
        up_down: i32,
        yaw: i32,
    ) -> Result<Response> {
        self.send(&Command::rc(left_right, forward_back, up_down, yaw)?).await
    }

    pub async fn query(&self, query: Query) -> Result<Response> {
        self.send(&Command::query(query)).await
    }

    /// Stored telemetry snapshots as they arrive.
    ///
    /// Yields the latest snapshot immediately if there is one. Slow consumers
    /// skip intermediate snapshots.
    pub fn telemetry_updates(
        &self,
        rate: UpdateRate,
    ) -> impl Stream<Item = Arc<TelemetrySnapshot>> + Send + 'static {
        let updates =
            WatchStream::new(self.events.watch_telemetry()).filter_map(|opt| async move { opt });
        match rate.throttle_interval(TELEMETRY_SOURCE_HZ) {
            None => updates.boxed(),
            Some(interval) => updates.throttle(interval).boxed(),
        }
    }

    /// Stored video frames as they arrive.
    pub fn frame_updates(
        &self,
        rate: UpdateRate,
    ) -> impl Stream<Item = Arc<VideoFrame>> + Send + 'static {
        let updates =
            WatchStream::new(self.events.watch_frames()).filter_map(|opt| async move { opt });
        match rate.throttle_interval(VIDEO_SOURCE_HZ) {
            None => updates.boxed(),
            Some(interval) => updates.throttle(interval).boxed(),
        }
    }

    /// Every command exchange from now on. Records missed by a lagging
    /// consumer are skipped.
    pub fn command_records(&self) -> impl Stream<Item = Arc<CommandRecord>> + Send + 'static {
        BroadcastStream::new(self.events.subscribe_commands())
            .filter_map(|record| async move { record.ok() })
    }

    /// Lifecycle, association and listener notices from now on.
    pub fn status_events(&self) -> impl Stream<Item = Status> + Send + 'static {
        BroadcastStream::new(self.events.subscribe_status())
            .filter_map(|status| async move { status.ok() })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.lifecycle.current())
            .field("ssid", &self.ssid)
            .field("device_addr", &self.config.device_addr)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(id = %self.id, "Dropping session");
        // Stops a pending connect and both listeners.
        self.cancel.cancel();
    }
}

fn session_id(name: &str, created_at: DateTime<Utc>) -> String {
    format!("{}_{}_{}", name, created_at.format("%Y-%m-%d-%H-%M-%S"), created_at.timestamp())
}
