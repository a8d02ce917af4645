//! Error taxonomy for the execution core.
//!
//! Callers branch on error kind, never on message text. The three families:
//!
//! - [`VenueError`]: a venue interaction failed. `is_retryable()` decides
//!   whether a bounded retry is allowed (protective stop placement only;
//!   entry orders are never blindly retried).
//! - Safety blocks are not errors at all: operations return outcome enums
//!   (`EntryOutcome::Blocked`, `ExitOutcome::Blocked`) carrying the reason.
//! - [`BridgeError`]: startup or runtime failure of the concurrency bridge.
//!   Init failures are fatal and abort startup entirely.

use thiserror::Error;

pub use crate::store::StoreError;

/// Errors returned by venue adapters.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    /// The venue actively rejected the request.
    #[error("venue rejected request: {reason}")]
    Rejected {
        /// Venue-supplied rejection reason.
        reason: String,
    },

    /// The operation did not complete within the allowed time.
    #[error("venue operation timed out after {waited_ms}ms")]
    Timeout {
        /// How long we waited before giving up.
        waited_ms: u64,
    },

    /// Transport-level failure (connection, serialization, venue outage).
    #[error("venue transport error: {0}")]
    Transport(String),

    /// The referenced order or instrument is unknown to the venue.
    #[error("not found at venue: {what}")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },
}

impl VenueError {
    /// Whether a bounded retry of the same request is reasonable.
    ///
    /// Rejections and unknown references are deterministic and retrying them
    /// would repeat the same answer. Timeouts and transport faults are
    /// transient.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) => true,
            Self::Rejected { .. } | Self::NotFound { .. } => false,
        }
    }
}

/// Errors from the concurrency bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A component failed to initialize during ordered startup.
    ///
    /// Nothing after the failing stage is constructed.
    #[error("bridge init failed at stage '{stage}': {message}")]
    Init {
        /// Which startup stage failed.
        stage: &'static str,
        /// The underlying failure.
        message: String,
    },

    /// The bridge thread did not report ready within the startup deadline.
    #[error("bridge startup timed out after {waited_ms}ms")]
    StartTimeout {
        /// How long we waited for the ready signal.
        waited_ms: u64,
    },

    /// A task submitted through the bridge did not complete.
    #[error("bridge task failed: {0}")]
    TaskFailed(String),

    /// The bridge runtime is no longer accepting work.
    #[error("bridge is not running")]
    NotRunning,
}
