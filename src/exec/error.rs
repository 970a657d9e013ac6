//! Failures raised while running commands on a machine.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::ErrorKind;

/// Errors produced by the execution router.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    /// The request cannot be served with these connection params.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The transport client binary could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        message: String,
    },
    /// The machine could not be dialed or the client lost the connection.
    #[error("machine unreachable: {0}")]
    Unreachable(String),
    /// Key material was rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The request deadline expired; the process was killed.
    #[error("command timed out after {}s", after.as_secs())]
    Timeout {
        /// Deadline that expired.
        after: Duration,
    },
    /// Batch output exceeded the configured bound; the process was killed.
    #[error("command output exceeded {limit} bytes")]
    OutputTooLarge {
        /// Bound in bytes for stdout and stderr combined.
        limit: usize,
    },
    /// Copying between the caller and the process failed.
    #[error("stream error: {0}")]
    Stream(String),
}

impl ExecError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Spawn { .. } => ErrorKind::Configuration,
            Self::Unreachable(_) | Self::Stream(_) => ErrorKind::Unreachable,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::OutputTooLarge { .. } => ErrorKind::OutputTooLarge,
        }
    }
}

impl From<ConfigError> for ExecError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<std::io::Error> for ExecError {
    fn from(value: std::io::Error) -> Self {
        Self::Stream(value.to_string())
    }
}
