//! Session lifecycle state machine

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

use crate::events::{EventHub, StatusEvent};
use crate::{DroneError, Result};

/// Lifecycle state of a [`Session`](crate::Session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    WifiAssociating,
    WifiAssociated,
    HandshakePending,
    Ready,
    Closing,
    /// Unrecoverable error; only `Closing` is reachable from here.
    Faulted,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, WifiAssociating)
                | (WifiAssociating, WifiAssociated | Disconnected | Faulted | Closing)
                | (WifiAssociated, HandshakePending | Faulted | Closing)
                | (HandshakePending, Ready | Faulted | Closing)
                | (Ready, Closing | Faulted)
                | (Faulted, Closing)
                | (Closing, Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Disconnected => "disconnected",
            SessionState::WifiAssociating => "wifi-associating",
            SessionState::WifiAssociated => "wifi-associated",
            SessionState::HandshakePending => "handshake-pending",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Faulted => "faulted",
        })
    }
}

/// Shared lifecycle state; listeners hold a clone to fault the session.
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    state: Arc<Mutex<SessionState>>,
    events: Arc<EventHub>,
}

impl Lifecycle {
    pub(crate) fn new(events: Arc<EventHub>) -> Self {
        Self { state: Arc::new(Mutex::new(SessionState::Disconnected)), events }
    }

    pub(crate) fn current(&self) -> SessionState {
        *self.state.lock()
    }

    /// Atomically move to `next`, returning the previous state.
    pub(crate) fn transition(&self, next: SessionState) -> Result<SessionState> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !from.can_transition_to(next) {
                return Err(DroneError::invalid_state(format!("move to {next}"), from));
            }
            *state = next;
            from
        };
        info!(%from, to = %next, "Session state changed");
        self.events.status(StatusEvent::StateChanged { from, to: next });
        Ok(from)
    }

    /// Move to `Faulted` if the current state allows it.
    ///
    /// Returns `false` when the session is already closing, faulted or idle.
    pub(crate) fn fault(&self, reason: &str) -> bool {
        match self.transition(SessionState::Faulted) {
            Ok(from) => {
                error!(%from, reason, "Session faulted");
                true
            }
            Err(_) => false,
        }
    }
}
