//! Typed per-kind event sinks.
//!
//! Each stream publishes through its own channel: command records and status
//! events on `broadcast` channels, telemetry snapshots and video frames on
//! `watch` channels that only keep the latest value. Publishing never waits
//! on a subscriber; a slow subscriber misses values rather than stalling a
//! listener.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::history::{CommandRecord, VideoFrame};
use crate::session::SessionState;
use crate::telemetry::TelemetrySnapshot;

/// Buffered values per broadcast subscriber before it starts lagging.
const BROADCAST_CAPACITY: usize = 256;

/// Which background stream an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Telemetry,
    Video,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Telemetry => "telemetry",
            StreamKind::Video => "video",
        })
    }
}

/// Progress and degradation notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    StateChanged { from: SessionState, to: SessionState },
    NetworkSearch { attempt: u64 },
    NetworkDiscovered { ssid: String },
    NetworkAssociated { ssid: String },
    HandshakeAttempt { attempt: u32, response: String },
    ListenerStarted { kind: StreamKind },
    ListenerFailed { kind: StreamKind, reason: String },
    ListenerStopped { kind: StreamKind },
    BaselineReady { samples: usize },
    ReadingDropped { kind: StreamKind, reason: String },
}

/// A status event with the time it was raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: StatusEvent,
}

/// Per-kind sinks shared by the session, the command channel and the listeners.
#[derive(Debug)]
pub struct EventHub {
    commands: broadcast::Sender<Arc<CommandRecord>>,
    telemetry: watch::Sender<Option<Arc<TelemetrySnapshot>>>,
    frames: watch::Sender<Option<Arc<VideoFrame>>>,
    status: broadcast::Sender<Status>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (commands, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (status, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (telemetry, _) = watch::channel(None);
        let (frames, _) = watch::channel(None);
        Self { commands, telemetry, frames, status }
    }

    pub fn publish_command(&self, record: Arc<CommandRecord>) {
        // No subscribers is not an error.
        let _ = self.commands.send(record);
    }

    pub fn publish_telemetry(&self, snapshot: Arc<TelemetrySnapshot>) {
        self.telemetry.send_replace(Some(snapshot));
    }

    pub fn publish_frame(&self, frame: Arc<VideoFrame>) {
        self.frames.send_replace(Some(frame));
    }

    pub fn status(&self, event: StatusEvent) {
        trace!(?event, "Status event");
        let _ = self.status.send(Status { at: Utc::now(), event });
    }

    pub fn subscribe_commands(&self) -> broadcast::Receiver<Arc<CommandRecord>> {
        self.commands.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn watch_telemetry(&self) -> watch::Receiver<Option<Arc<TelemetrySnapshot>>> {
        self.telemetry.subscribe()
    }

    pub fn watch_frames(&self) -> watch::Receiver<Option<Arc<VideoFrame>>> {
        self.frames.subscribe()
    }
}
