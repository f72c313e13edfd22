//! Async driver for the Tello family of small quadcopters.
//!
//! The device speaks three independent UDP streams: a half-duplex text
//! command channel, a telemetry broadcast and a video stream. Hoverlink
//! owns all three for the lifetime of a [`Session`] and keeps everything the
//! device says in a [`HistoryStore`].
//!
//! # Features
//!
//! - **Session lifecycle**: Wi-Fi association, handshake, teardown, with an
//!   explicit [`SessionState`] machine
//! - **Serialized commands**: one command in flight, every exchange recorded,
//!   timeouts reported as values instead of errors
//! - **Background listeners**: telemetry and video consumed by cancellable
//!   tasks, with a startup baseline for telemetry
//! - **Typed streams**: per-kind subscriptions with optional rate limiting
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hoverlink::{AssumeAssociated, DroneConfig, Session, UpdateRate};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut session = Session::new(DroneConfig::default(), AssumeAssociated::new("TELLO-5A1B2C"))?;
//!     session.connect().await?;
//!
//!     let mut telemetry = session.telemetry_updates(UpdateRate::Max(2));
//!     session.takeoff().await?;
//!     for _ in 0..10 {
//!         if let Some(snapshot) = telemetry.next().await {
//!             println!("height {:?} cm, battery {:?}%", snapshot.height(), snapshot.battery());
//!         }
//!     }
//!     session.land().await?;
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

// Core types and error handling
pub mod codec;
pub mod command;
pub mod config;
mod error;
pub mod telemetry;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
mod yaml_utils;

// Session machinery
pub mod archive;
pub mod channel;
pub mod events;
pub mod history;
pub mod listener;
pub mod session;
pub mod stream;

// External collaborators
pub mod video;
pub mod wifi;

// Core exports
pub use codec::Response;
pub use command::{Command, FlipDirection, MoveDirection, Query, RotateDirection};
pub use config::DroneConfig;
pub use error::*;
pub use telemetry::{TelemetryBaseline, TelemetrySnapshot};

// Session exports
pub use archive::{ArchiveReport, SessionArchive, SessionMetadata};
pub use events::{Status, StatusEvent, StreamKind};
pub use history::{CommandRecord, HistoryKind, HistoryStore, VideoFrame};
pub use listener::{ListenerHandle, ListenerStatus};
pub use session::{Session, SessionState, SessionSummary};
pub use stream::UpdateRate;

// Collaborator exports
pub use video::{DatagramDecoder, Image, VideoDecoder};
pub use wifi::{AssumeAssociated, NetshAdapter, WifiAdapter};
