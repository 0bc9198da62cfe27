//! Accessory connection state machine
//!
//! ```text
//! Disconnected → Connecting → FetchingStructure → Ready
//!                    ↓               ↓              ↓
//!                 Failed         RetryWait      FetchingStructure (refresh)
//!                    ↓               ↓
//!               Connecting   Connecting / FetchingStructure
//!
//! any state → Disconnected (unload)
//! ```

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle of one accessory connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started, or unloaded
    Disconnected,
    /// Opening the pairing session
    Connecting,
    /// Loading the accessory tree from cache or the device
    FetchingStructure,
    /// Polling and event delivery active
    Ready,
    /// Structure fetch failed; a retry is scheduled
    RetryWait,
    /// Authentication failed; never retried automatically
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::FetchingStructure => "fetching_structure",
            ConnectionState::Ready => "ready",
            ConnectionState::RetryWait => "retry_wait",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Error when an invalid state transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid connection state transition from {from} to {to}: {reason}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: &'static str,
}

impl ConnectionState {
    /// Attempt a transition, returning the new state if it is allowed
    pub fn try_transition(self, to: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState::*;

        let valid = match (self, to) {
            // Unload is always allowed
            (_, Disconnected) => true,

            (Disconnected, Connecting) => true,
            (RetryWait, Connecting) => true,
            // Explicit reconnect after the user re-pairs
            (Failed, Connecting) => true,

            (Connecting, FetchingStructure) => true,
            (Connecting, RetryWait) => true,
            (Connecting, Failed) => true,

            (FetchingStructure, Ready) => true,
            (FetchingStructure, RetryWait) => true,
            (FetchingStructure, Failed) => true,

            (RetryWait, FetchingStructure) => true,

            // Refresh after a config number change
            (Ready, FetchingStructure) => true,

            _ => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ConnectionState, to: ConnectionState) -> &'static str {
        use ConnectionState::*;

        match (from, to) {
            (Failed, _) => "authentication failed; reconnect or unload",
            (Disconnected, Ready) => "cannot jump to Ready without fetching structure",
            (Ready, Connecting) => "already connected",
            (Ready, RetryWait) => "a ready connection only retries from a refresh",
            _ => "invalid state transition",
        }
    }

    /// Whether the structure has been loaded and polling may run
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }
}

/// Retry delay with exponential backoff
///
/// `base * 2^min(tries, 4)`, capped at `ceiling`, plus up to 100ms of jitter.
pub fn retry_delay(tries: u32, base: Duration, ceiling: Duration) -> Duration {
    let backoff = base.saturating_mul(2_u32.pow(tries.min(4))).min(ceiling);
    let jitter = Duration::from_secs_f64(rand::random::<f64>() * 0.1);
    backoff + jitter
}
