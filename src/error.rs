//! Error types for the drone driver.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context for debugging and recovery guidance.
//!
//! ## Error Categories
//!
//! - **Transient**: command timeouts, a malformed telemetry line, a failed frame
//!   decode. These are normally absorbed by the component that saw them and
//!   only surface as a recorded [`Response::Timeout`](crate::Response) or a
//!   status event.
//! - **Retriable**: Wi-Fi association failures and handshake rejections.
//! - **Fatal to a sub-stream**: the video decoder failing to open.
//! - **Fatal to the session**: handshake retries exhausted or sockets that
//!   cannot bind. The session moves to `Faulted` and must be torn down.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use hoverlink::DroneError;
//!
//! let error = DroneError::wifi_failed("adapter busy");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! ## Helper Constructors
//!
//! ```rust
//! use hoverlink::DroneError;
//!
//! let arg_error = DroneError::invalid_argument("rc", "left_right 150 outside -100..=100");
//! let parse_error = DroneError::parse_error("telemetry", "entry 'bat' has no ':' separator");
//! assert!(!arg_error.is_retryable());
//! assert!(!parse_error.is_retryable());
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionState;

/// Result type alias for driver operations.
pub type Result<T, E = DroneError> = std::result::Result<T, E>;

/// Main error type for driver operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DroneError {
    #[error("Failed to bind {channel} socket on {addr}")]
    Bind {
        channel: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Wi-Fi association failed: {reason}")]
    Wifi {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Handshake failed after {attempts} attempts (last response: {last_response})")]
    Handshake { attempts: u32, last_response: String },

    #[error("Operation cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("Invalid argument for '{command}': {details}")]
    InvalidArgument { command: String, details: String },

    #[error("Cannot {operation} while session is {state}")]
    InvalidState { operation: String, state: SessionState },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Video stream error: {reason}")]
    Video {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to write session archive: {path}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {details}")]
    Serialization { details: String },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("I/O error during {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl DroneError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            DroneError::Wifi { .. } => true,
            DroneError::Timeout { .. } => true,
            DroneError::Io { .. } => true,
            DroneError::Video { .. } => true,
            DroneError::Bind { .. } => false,
            DroneError::Handshake { .. } => false,
            DroneError::Cancelled { .. } => false,
            DroneError::InvalidArgument { .. } => false,
            DroneError::InvalidState { .. } => false,
            DroneError::Parse { .. } => false,
            DroneError::Archive { .. } => false,
            DroneError::Serialization { .. } => false,
            DroneError::Config { .. } => false,
        }
    }

    /// Returns whether this error leaves the session unusable.
    ///
    /// A session that hit a fatal error is `Faulted` and has to be torn down
    /// and replaced by a fresh one.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, DroneError::Bind { .. } | DroneError::Handshake { .. })
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            DroneError::Bind { .. } => vec![
                "Check that no other program is bound to the drone ports",
                "Close any previous session before connecting again",
                "Verify the configured bind host exists on this machine",
            ],
            DroneError::Wifi { .. } => vec![
                "Ensure the drone is powered on and broadcasting its network",
                "Check the configured Wi-Fi adapter name",
                "Move closer to the drone",
            ],
            DroneError::Handshake { .. } => vec![
                "Power cycle the drone and reconnect with a new session",
                "Verify the host is associated with the drone network",
                "Increase the receive timeout",
            ],
            DroneError::Cancelled { .. } => vec![
                "Start a new connection attempt when the drone is available",
            ],
            DroneError::InvalidArgument { .. } => vec![
                "Check the documented range for the command argument",
                "Clamp user input before building the command",
            ],
            DroneError::InvalidState { .. } => vec![
                "Wait for connect() to complete before sending commands",
                "Create a new session after disconnecting",
            ],
            DroneError::Parse { .. } => vec![
                "Check the data format sent by the drone firmware",
                "Verify source data integrity",
            ],
            DroneError::Timeout { .. } => vec![
                "Increase the timeout duration",
                "Check Wi-Fi signal strength",
                "Verify the drone is still powered on",
            ],
            DroneError::Video { .. } => vec![
                "Check that the video port is free",
                "Verify the video decoder is installed and working",
                "Send streamon and retry",
            ],
            DroneError::Archive { .. } => vec![
                "Check the archive directory exists and is writable",
                "Ensure sufficient disk space",
            ],
            DroneError::Serialization { .. } => vec![
                "Check the YAML document structure",
                "Verify field names and value types",
            ],
            DroneError::Config { .. } => vec![
                "Review the configuration values",
                "Fall back to DroneConfig::default()",
            ],
            DroneError::Io { .. } => vec![
                "Check network interface status",
                "Retry the operation",
            ],
        }
    }

    /// Helper constructor for socket bind failures.
    pub fn bind_failed(channel: &'static str, addr: SocketAddr, source: std::io::Error) -> Self {
        DroneError::Bind { channel, addr, source }
    }

    /// Helper constructor for Wi-Fi failures.
    pub fn wifi_failed(reason: impl Into<String>) -> Self {
        DroneError::Wifi { reason: reason.into(), source: None }
    }

    /// Helper constructor for Wi-Fi failures with source.
    pub fn wifi_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        DroneError::Wifi { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for cancelled operations.
    pub fn cancelled(phase: impl Into<String>) -> Self {
        DroneError::Cancelled { phase: phase.into() }
    }

    /// Helper constructor for rejected command arguments.
    pub fn invalid_argument(command: impl Into<String>, details: impl Into<String>) -> Self {
        DroneError::InvalidArgument { command: command.into(), details: details.into() }
    }

    /// Helper constructor for operations attempted in the wrong session state.
    pub fn invalid_state(operation: impl Into<String>, state: SessionState) -> Self {
        DroneError::InvalidState { operation: operation.into(), state }
    }

    /// Helper constructor for parse errors.
    pub fn parse_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        DroneError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for video errors.
    pub fn video_error(reason: impl Into<String>) -> Self {
        DroneError::Video { reason: reason.into(), source: None }
    }

    /// Helper constructor for video errors with source.
    pub fn video_error_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        DroneError::Video { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(reason: impl Into<String>) -> Self {
        DroneError::Config { reason: reason.into() }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io_error(context: impl Into<String>, source: std::io::Error) -> Self {
        DroneError::Io { context: context.into(), source }
    }
}

impl From<std::io::Error> for DroneError {
    fn from(err: std::io::Error) -> Self {
        DroneError::Io { context: "<unknown>".to_string(), source: err }
    }
}

impl From<serde_yaml_ng::Error> for DroneError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        DroneError::Serialization { details: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                reason in ".*",
                command in "[a-z]{1,10}",
                details in ".*",
                attempts in 1u32..20u32,
                duration_ms in 1u64..60000u64
            ) {
                let wifi = DroneError::wifi_failed(reason.clone());
                prop_assert!(wifi.to_string().contains(&reason));

                let arg = DroneError::invalid_argument(command.clone(), details.clone());
                let arg_msg = arg.to_string();
                prop_assert!(arg_msg.contains(&command));
                prop_assert!(arg_msg.contains(&details));

                let handshake = DroneError::Handshake { attempts, last_response: "error".into() };
                prop_assert!(handshake.to_string().contains(&attempts.to_string()));

                let timeout = DroneError::Timeout { duration: Duration::from_millis(duration_ms) };
                prop_assert!(!timeout.to_string().is_empty());
            }

            #[test]
            fn io_conversion_preserves_message(message in ".*") {
                let io_err = std::io::Error::other(message.clone());
                let converted: DroneError = io_err.into();
                match converted {
                    DroneError::Io { source, .. } => {
                        prop_assert_eq!(source.to_string(), message);
                    }
                    _ => prop_assert!(false, "Expected Io error from io::Error conversion"),
                }
            }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<DroneError>();

        let error = DroneError::wifi_failed("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn retry_classification_follows_taxonomy() {
        assert!(DroneError::wifi_failed("no network").is_retryable());
        assert!(DroneError::Timeout { duration: Duration::from_secs(4) }.is_retryable());
        assert!(
            !DroneError::Handshake { attempts: 5, last_response: "error".into() }.is_retryable()
        );
        assert!(!DroneError::invalid_argument("rc", "out of range").is_retryable());

        let bind = DroneError::bind_failed(
            "command",
            "0.0.0.0:8889".parse().unwrap(),
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        );
        assert!(bind.is_session_fatal());
        assert!(!DroneError::video_error("no decoder").is_session_fatal());
    }

    #[test]
    fn recovery_suggestions_are_descriptive() {
        let errors = [
            DroneError::wifi_failed("x"),
            DroneError::cancelled("wifi association"),
            DroneError::parse_error("telemetry", "x"),
            DroneError::invalid_state("send", SessionState::Disconnected),
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty());
            for suggestion in suggestions {
                assert!(suggestion.len() > 5);
            }
        }
    }

    #[test]
    fn source_chain_is_preserved() {
        let inner = std::io::Error::other("netsh exited with status 1");
        let error = DroneError::wifi_failed_with_source("scan failed", Box::new(inner));
        let source = std::error::Error::source(&error).expect("source");
        assert!(source.to_string().contains("netsh"));
    }

    #[test]
    fn yaml_errors_convert_to_serialization() {
        let err = serde_yaml_ng::from_str::<u32>("not: [a number").unwrap_err();
        let converted: DroneError = err.into();
        assert!(matches!(converted, DroneError::Serialization { .. }));
    }
}
