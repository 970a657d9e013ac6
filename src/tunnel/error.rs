//! Tunnel failures.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::error::ErrorKind;

/// Errors raised by the tunnel client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// Relay address, TLS material or identity settings are unusable.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The relay could not be dialed.
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    /// Dialing or handshaking did not finish in time.
    #[error("relay handshake timed out after {}s", after.as_secs())]
    Timeout {
        /// Deadline that expired.
        after: Duration,
    },
    /// The relay rejected the session identity.
    #[error("relay rejected the session: {0}")]
    Authentication(String),
    /// The relay broke the session protocol.
    #[error("relay protocol error: {0}")]
    Protocol(String),
    /// The control connection dropped.
    #[error("relay connection closed: {0}")]
    Disconnected(String),
    /// Reconnection attempts ran out.
    #[error("tunnel lost after {attempts} reconnection attempts: {reason}")]
    Lost {
        /// Attempts made.
        attempts: u32,
        /// Last failure seen.
        reason: String,
    },
}

impl TunnelError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Unreachable(_) | Self::Protocol(_) | Self::Disconnected(_) => {
                ErrorKind::Unreachable
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Lost { .. } => ErrorKind::TunnelLost,
        }
    }
}

impl From<ConfigError> for TunnelError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(value: std::io::Error) -> Self {
        Self::Disconnected(value.to_string())
    }
}
