//! Error types shared by the provisioning core.
//!
//! Every failure carries one of four kinds. The retry layer only retries
//! [`ErrorKind::Transient`]; everything else reaches the caller unchanged.

use std::time::Duration;

use thiserror::Error;

use crate::types::VolumeState;

/// Coarse classification used for retry and tolerance decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backing store unreachable or throttled, may succeed later.
    Transient,
    /// Invalid input or a permanent backing-store refusal.
    Terminal,
    /// Access-mode violation on attach.
    Conflict,
    /// The named object does not exist.
    NotFound,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("backing store unavailable: {0}")]
    Transient(String),

    #[error("{code}: {message}")]
    Terminal { code: String, message: String },

    #[error("volume '{name}' did not become available within {elapsed:?}")]
    Timeout { name: String, elapsed: Duration },

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: Box<Error>,
    },

    #[error("volume '{volume}' is held by node '{held_by}' ({held_mode}), cannot attach to '{node}' ({requested})")]
    Conflict {
        volume: String,
        node: String,
        requested: String,
        held_by: String,
        held_mode: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("volume '{name}' is {state}, not ready")]
    NotReady { name: String, state: VolumeState },

    #[error("volume '{name}' is already bound to '{existing}', refusing '{requested}'")]
    AlreadyBound {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("volume '{0}' was deleted while waiting")]
    Cancelled(String),
}

impl Error {
    /// Shorthand for a terminal error with a backing-store style code.
    pub fn terminal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Terminal {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) | Error::Timeout { .. } => ErrorKind::Transient,
            Error::Terminal { .. }
            | Error::RetriesExhausted { .. }
            | Error::AlreadyBound { .. }
            | Error::Cancelled(_) => ErrorKind::Terminal,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::NotReady { state, .. } => {
                if *state == VolumeState::Failed {
                    ErrorKind::Terminal
                } else {
                    ErrorKind::Transient
                }
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Short label for metrics.
    pub fn code(&self) -> &str {
        match self {
            Error::Transient(_) => "transient",
            Error::Terminal { code, .. } => code,
            Error::Timeout { .. } => "timeout",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::Conflict { .. } => "conflict",
            Error::NotFound(_) => "not_found",
            Error::NotReady { .. } => "not_ready",
            Error::AlreadyBound { .. } => "already_bound",
            Error::Cancelled(_) => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
