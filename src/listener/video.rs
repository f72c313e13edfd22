//! Video listener task

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{ErrorBudget, ListenerHandle, StatusReporter, idle, spawn_listener};
use crate::channel::CommandChannel;
use crate::command::Command;
use crate::config::DroneConfig;
use crate::events::{EventHub, StreamKind};
use crate::history::{HistoryStore, VideoFrame};
use crate::video::VideoDecoder;
use crate::{DroneError, Result};

struct VideoLoop {
    channel: Arc<CommandChannel>,
    decoder: Box<dyn VideoDecoder>,
    stream_url: String,
    first_frame_timeout: Duration,
    read_timeout: Duration,
    frame_delay: Duration,
    max_errors: u32,
    history: Arc<HistoryStore>,
    events: Arc<EventHub>,
}

/// Start the video stream and consume frames from `decoder`.
///
/// Failing to open the stream or to get a first frame ends this listener only;
/// the session keeps running without video.
pub(crate) fn spawn_video(
    channel: Arc<CommandChannel>,
    decoder: Box<dyn VideoDecoder>,
    config: &DroneConfig,
    history: Arc<HistoryStore>,
    events: Arc<EventHub>,
    cancel: &CancellationToken,
) -> ListenerHandle {
    let task = VideoLoop {
        channel,
        decoder,
        stream_url: config.video_stream_url(),
        first_frame_timeout: config.first_frame_timeout,
        read_timeout: config.frame_read_timeout,
        frame_delay: config.frame_delay,
        max_errors: config.listener_max_errors,
        history,
        events: Arc::clone(&events),
    };
    spawn_listener(StreamKind::Video, events, cancel, move |reporter, cancel| {
        task.run(reporter, cancel)
    })
}

enum Exit {
    Stopped,
    Failed(String),
}

impl VideoLoop {
    async fn run(mut self, reporter: StatusReporter, cancel: CancellationToken) {
        let response = match self.channel.send(&Command::StreamOn).await {
            Ok(response) => response,
            Err(e) => {
                reporter.failed(format!("streamon rejected: {e}"));
                return;
            }
        };
        if !response.is_ok() {
            // Some firmware answers nothing while already streaming.
            warn!(%response, "streamon not acknowledged, opening stream anyway");
        }

        let exit = match self.start(&cancel).await {
            Ok(true) => self.frames(&reporter, &cancel).await,
            Ok(false) => Exit::Stopped,
            Err(e) => Exit::Failed(e.to_string()),
        };

        self.decoder.close().await;
        match self.channel.send(&Command::StreamOff).await {
            Ok(response) if response.is_ok() => debug!("Video stream turned off"),
            Ok(response) => warn!(%response, "streamoff not acknowledged"),
            Err(e) => warn!(error = %e, "streamoff could not be sent"),
        }

        match exit {
            Exit::Stopped => {
                info!(frames = self.history.frames().len(), "Video listener stopped");
                reporter.stopped();
            }
            Exit::Failed(reason) => {
                error!(%reason, "Video listener failed");
                reporter.failed(reason);
            }
        }
    }

    /// Open the decoder and discard the first frame.
    ///
    /// `Ok(false)` means a stop was requested meanwhile.
    async fn start(&mut self, cancel: &CancellationToken) -> Result<bool> {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            opened = self.decoder.open(&self.stream_url) => opened,
        };
        opened.map_err(|e| DroneError::video_error(format!("decoder failed to open: {e}")))?;
        info!(url = %self.stream_url, "Video stream opened");

        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(false),
            first = tokio::time::timeout(self.first_frame_timeout, self.decoder.read_frame()) => first,
        };
        match first {
            Err(_) => Err(DroneError::video_error(format!(
                "no first frame within {:?}",
                self.first_frame_timeout
            ))),
            Ok(Err(e)) => Err(DroneError::video_error(format!("first frame failed: {e}"))),
            Ok(Ok(image)) => {
                debug!(bytes = image.data.len(), "Discarded first frame");
                Ok(true)
            }
        }
    }

    async fn frames(&mut self, reporter: &StatusReporter, cancel: &CancellationToken) -> Exit {
        let mut stored = 0u64;
        let mut errors = ErrorBudget::new(self.max_errors);

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Exit::Stopped,
                result = tokio::time::timeout(self.read_timeout, self.decoder.read_frame()) => result,
            };

            match result {
                Err(_) => {
                    trace!("No frame this interval");
                    continue;
                }
                Ok(Err(e)) => {
                    reporter.reading_dropped(e.to_string());
                    let Some(backoff) = errors.record_failure() else {
                        return Exit::Failed(format!(
                            "{} consecutive frame failures, last: {e}",
                            errors.consecutive()
                        ));
                    };
                    warn!(error = %e, "Frame decode failed ({}/{})", errors.consecutive(), errors.max());
                    if !idle(cancel, backoff).await {
                        return Exit::Stopped;
                    }
                    continue;
                }
                Ok(Ok(image)) => {
                    errors.reset();
                    let frame = Arc::new(VideoFrame {
                        index: stored,
                        received_at: Utc::now(),
                        image: Arc::new(image),
                    });
                    trace!(index = stored, bytes = frame.image.data.len(), "Frame stored");
                    self.history.frames().append_shared(Arc::clone(&frame));
                    self.events.publish_frame(frame);
                    stored += 1;
                    reporter.reading_stored(stored);
                }
            }

            if !idle(cancel, self.frame_delay).await {
                return Exit::Stopped;
            }
        }
    }
}
