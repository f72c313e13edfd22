//! Command channel: one outstanding command at a time.
//!
//! The control protocol has no message ids. The next datagram the device
//! sends to the command socket is taken as the reply to the last command, so
//! the channel serializes callers behind a single async lock that covers the
//! whole send-and-wait exchange.

use chrono::Utc;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::codec::{self, MAX_DATAGRAM_SIZE, Response};
use crate::command::Command;
use crate::config::DroneConfig;
use crate::events::EventHub;
use crate::history::{CommandRecord, HistoryStore};
use crate::{DroneError, Result};

/// Serialized request/response channel over the command socket.
#[derive(Debug)]
pub struct CommandChannel {
    socket: Mutex<UdpSocket>,
    local_addr: SocketAddr,
    device_addr: SocketAddr,
    send_delay: Duration,
    receive_timeout: Duration,
    history: Arc<HistoryStore>,
    events: Arc<EventHub>,
}

impl CommandChannel {
    /// Bind the command socket.
    pub async fn bind(
        config: &DroneConfig,
        history: Arc<HistoryStore>,
        events: Arc<EventHub>,
    ) -> Result<Self> {
        let addr = config.command_bind_addr();
        let socket =
            UdpSocket::bind(addr).await.map_err(|e| DroneError::bind_failed("command", addr, e))?;
        let local_addr = socket.local_addr()?;
        debug!(%local_addr, device = %config.device_addr, "Command socket bound");

        Ok(Self {
            socket: Mutex::new(socket),
            local_addr,
            device_addr: config.device_addr,
            send_delay: config.send_delay,
            receive_timeout: config.receive_timeout,
            history,
            events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn device_addr(&self) -> SocketAddr {
        self.device_addr
    }

    /// Validate and send a typed command.
    ///
    /// Invalid arguments are rejected before the socket is touched.
    pub async fn send(&self, command: &Command) -> Result<Response> {
        command.validate()?;
        self.send_text(&command.to_string()).await
    }

    /// Send raw command text and wait for its reply.
    ///
    /// Only invalid input is an `Err`. A timeout, socket error or undecodable
    /// reply is returned as a normal [`Response`] and recorded like any other
    /// exchange.
    pub async fn send_text(&self, text: &str) -> Result<Response> {
        let payload = codec::encode_command(text)?;

        let socket = self.socket.lock().await;
        tokio::time::sleep(self.send_delay).await;

        discard_stale_replies(&socket);

        let issued_at = Utc::now();
        let send_start = Instant::now();
        let sent = socket.send_to(&payload, self.device_addr).await;
        let send_duration = send_start.elapsed();

        let receive_start = Instant::now();
        let response = match sent {
            Ok(_) => self.receive_reply(&socket).await,
            Err(e) => {
                warn!(command = text, error = %e, "Command send failed");
                Response::Timeout
            }
        };
        let receive_duration = receive_start.elapsed();
        drop(socket);

        debug!(
            command = text,
            response = %response,
            send_us = send_duration.as_micros() as u64,
            receive_ms = receive_duration.as_millis() as u64,
            "Command exchange"
        );

        let record = Arc::new(CommandRecord {
            issued_at,
            command: text.to_string(),
            response: response.clone(),
            send_duration,
            receive_duration,
        });
        self.history.commands().append_shared(Arc::clone(&record));
        self.events.publish_command(record);

        Ok(response)
    }

    async fn receive_reply(&self, socket: &UdpSocket) -> Response {
        let deadline = tokio::time::Instant::now() + self.receive_timeout;
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            match received {
                Err(_) => {
                    debug!(timeout_ms = self.receive_timeout.as_millis() as u64, "Reply timed out");
                    return Response::Timeout;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Command receive failed");
                    return Response::Timeout;
                }
                Ok(Ok((_, from))) if from != self.device_addr => {
                    trace!(%from, "Ignoring datagram from unexpected sender");
                }
                Ok(Ok((len, _))) => {
                    return match codec::decode_response(&buf[..len]) {
                        Ok(response) => response,
                        Err(e) => {
                            debug!(error = %e, "Undecodable reply");
                            Response::Error(codec::ERROR.to_string())
                        }
                    };
                }
            }
        }
    }
}

/// Drop replies that arrived after their command had already timed out.
fn discard_stale_replies(socket: &UdpSocket) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.try_recv_from(&mut buf) {
            Ok((len, from)) => {
                debug!(
                    %from,
                    reply = %String::from_utf8_lossy(&buf[..len]),
                    "Discarding stale reply"
                );
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                trace!(error = %e, "Stale reply drain stopped");
                break;
            }
        }
    }
}
