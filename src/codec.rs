//! Wire codec for the text control protocol.
//!
//! Commands go out as bare ASCII text in a single datagram. Replies come back
//! as one line of text: `ok`, `error...`, or a reading such as `87` or
//! `snr:90`. There is no framing beyond the datagram and no message id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{DroneError, Result};

/// Receive buffer size for every socket.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Canonical acknowledgement.
pub const OK: &str = "ok";

/// Sentinel reported to callers for failed or unanswered commands.
pub const ERROR: &str = "error";

/// Reply to a single command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Response {
    /// The device acknowledged the command
    Ok,
    /// The device rejected the command; holds the raw reply text
    Error(String),
    /// A reading returned by a query command
    Value(String),
    /// No usable reply arrived before the receive timeout
    Timeout,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok)
    }

    /// True for device rejections and timeouts alike.
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_) | Response::Timeout)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Response::Timeout)
    }

    /// Reply text as seen on the wire; timeouts report the `error` sentinel.
    pub fn as_str(&self) -> &str {
        match self {
            Response::Ok => OK,
            Response::Error(text) | Response::Value(text) => text,
            Response::Timeout => ERROR,
        }
    }

    /// Parse a query reading.
    ///
    /// Returns `None` for acknowledgements, errors, timeouts and readings that
    /// do not parse as `T`.
    pub fn value<T: FromStr>(&self) -> Option<T> {
        match self {
            Response::Value(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode a command for the wire.
pub fn encode_command(text: &str) -> Result<Vec<u8>> {
    if text.trim().is_empty() {
        return Err(DroneError::invalid_argument(text, "command text is empty"));
    }
    if !text.is_ascii() {
        return Err(DroneError::invalid_argument(text, "command text must be ASCII"));
    }
    Ok(text.as_bytes().to_vec())
}

/// Decode a datagram into trimmed text.
///
/// Trailing NULs and line endings sent by some firmware revisions are removed.
pub fn decode_text(bytes: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| DroneError::parse_error("datagram UTF-8 conversion", e.to_string()))?;
    Ok(text.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
}

/// Decode a reply datagram.
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let text = decode_text(bytes)?;
    if text.is_empty() {
        return Err(DroneError::parse_error("command reply", "reply is empty"));
    }
    if text.eq_ignore_ascii_case(OK) {
        Ok(Response::Ok)
    } else if text.to_ascii_lowercase().starts_with(ERROR) {
        Ok(Response::Error(text.to_string()))
    } else {
        Ok(Response::Value(text.to_string()))
    }
}
