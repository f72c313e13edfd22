//! Video decode collaborator.
//!
//! The driver treats decoded frames as opaque [`Image`]s. Turning the device's
//! H.264 stream into pixels is the job of a [`VideoDecoder`] implementation
//! supplied by the application. [`DatagramDecoder`] is the built-in decoder:
//! it owns the video socket and reassembles the device's fragmented access
//! units without touching the pixels.

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::codec::MAX_DATAGRAM_SIZE;
use crate::{DroneError, Result};

/// Payload size of a full video fragment. A shorter datagram ends a frame.
pub const VIDEO_FRAGMENT_SIZE: usize = 1460;

/// Upper bound on a reassembled frame.
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// A decoded (or reassembled) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Image {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { width, height, data }
    }
}

/// Source of frames for the video listener.
///
/// `read_frame` must be cancel safe: the listener drops a pending read when it
/// is asked to stop or when its per-iteration timeout elapses.
#[async_trait::async_trait]
pub trait VideoDecoder: Send + Sync + 'static {
    /// Open the stream at `stream_url` (for example `udp://0.0.0.0:11111`).
    async fn open(&mut self, stream_url: &str) -> Result<()>;

    /// Wait for the next frame.
    async fn read_frame(&mut self) -> Result<Image>;

    /// Release the stream.
    async fn close(&mut self);
}

/// Parse a `udp://host:port` stream URL.
pub fn parse_stream_url(url: &str) -> Result<SocketAddr> {
    let addr = url
        .strip_prefix("udp://")
        .ok_or_else(|| DroneError::video_error(format!("unsupported stream URL: {url}")))?;
    addr.parse()
        .map_err(|_| DroneError::video_error(format!("invalid stream address: {addr}")))
}

/// Reassembles video fragments received on a UDP socket.
pub struct DatagramDecoder {
    width: u32,
    height: u32,
    socket: Option<UdpSocket>,
    pending: Vec<u8>,
    buf: Vec<u8>,
}

impl DatagramDecoder {
    /// Frames are reported with the given nominal dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, socket: None, pending: Vec::new(), buf: vec![0u8; MAX_DATAGRAM_SIZE] }
    }

    /// Address of the bound video socket, once open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

#[async_trait::async_trait]
impl VideoDecoder for DatagramDecoder {
    async fn open(&mut self, stream_url: &str) -> Result<()> {
        let addr = parse_stream_url(stream_url)?;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| DroneError::bind_failed("video", addr, e))?;
        info!(local_addr = ?socket.local_addr().ok(), "Video socket opened");
        self.socket = Some(socket);
        self.pending.clear();
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Image> {
        let socket =
            self.socket.as_ref().ok_or_else(|| DroneError::video_error("stream is not open"))?;

        loop {
            let len = socket
                .recv(&mut self.buf)
                .await
                .map_err(|e| DroneError::video_error_with_source("receive failed", Box::new(e)))?;

            self.pending.extend_from_slice(&self.buf[..len]);
            trace!(len, pending = self.pending.len(), "Video fragment");

            if self.pending.len() > MAX_FRAME_SIZE {
                self.pending.clear();
                return Err(DroneError::video_error("frame exceeds maximum size, discarded"));
            }

            if len < VIDEO_FRAGMENT_SIZE {
                let data = std::mem::take(&mut self.pending);
                return Ok(Image::new(self.width, self.height, data));
            }
        }
    }

    async fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Video socket closed");
        }
        self.pending.clear();
    }
}
