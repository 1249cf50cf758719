use std::time::Duration;
use thiserror::Error;

use crate::host_backend::HostBackendError;

/// Failure to obtain the remote tag list. The poller keeps its previous
/// snapshot when one of these is returned.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("release feed is not configured")]
    NotConfigured,
    #[error("release feed request timed out")]
    Timeout,
    #[error("release feed unreachable: {0}")]
    Transport(String),
    #[error("release feed returned HTTP {0}")]
    BadStatus(u16),
    #[error("release feed payload is not a tag list: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::NotConfigured => "not-configured",
            FetchError::Timeout => "timeout",
            FetchError::Transport(_) => "transport",
            FetchError::BadStatus(_) => "bad-status",
            FetchError::Malformed(_) => "malformed",
        }
    }
}

/// An external operation that did not complete successfully.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{command} failed: {detail}")]
    NonZeroExit {
        command: String,
        exit: Option<i32>,
        detail: String,
    },
    #[error("{command} timed out after {}s", .after.as_secs())]
    TimedOut { command: String, after: Duration },
    #[error("{command} could not be started: {reason}")]
    Spawn { command: String, reason: String },
    #[error("{command} rejected: {reason}")]
    InvalidInput { command: String, reason: String },
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::NonZeroExit { .. } => "non-zero-exit",
            CommandError::TimedOut { .. } => "timeout",
            CommandError::Spawn { .. } => "spawn-failed",
            CommandError::InvalidInput { .. } => "invalid-input",
        }
    }
}

impl From<HostBackendError> for CommandError {
    fn from(err: HostBackendError) -> Self {
        match err {
            HostBackendError::InvalidInput { command, reason } => {
                CommandError::InvalidInput { command, reason }
            }
            HostBackendError::NotFound { command } => CommandError::Spawn {
                command,
                reason: "program not found".to_string(),
            },
            HostBackendError::ExecFailed { command, reason } => {
                CommandError::Spawn { command, reason }
            }
            HostBackendError::Timeout { command, after } => CommandError::TimedOut { command, after },
        }
    }
}

/// Returned when an update is requested while another one holds the lock.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("Update already in progress")]
pub struct ConcurrencyConflict;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("tag is required")]
    Missing,
    #[error("invalid tag: {0}")]
    Invalid(&'static str),
}

impl TagError {
    pub fn code(&self) -> &'static str {
        match self {
            TagError::Missing => "tag-missing",
            TagError::Invalid(reason) => *reason,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{name} is invalid: {reason}")]
    Rejected { name: &'static str, reason: String },
}
