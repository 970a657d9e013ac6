//! Error taxonomy shared by every backend, the driver, the execution router
//! and the tunnel client.
//!
//! Each component keeps its own `thiserror` enum, but every variant maps onto
//! one [`ErrorKind`] so callers can decide whether to retry without knowing
//! which component failed.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a failure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing inputs. Fatal.
    Configuration,
    /// Transient provider failure while provisioning.
    Provision,
    /// Provider limits were hit. Requires user action.
    Quota,
    /// The machine could not be reached. Usually still booting.
    Unreachable,
    /// A bounded wait expired.
    Timeout,
    /// Key material was rejected. Requires key rotation.
    Authentication,
    /// Automatic environment detection found several candidates.
    AmbiguousEnvironment,
    /// Batch output exceeded the configured bound.
    OutputTooLarge,
    /// The tunnel session could not be re-established.
    TunnelLost,
    /// The resource does not exist.
    NotFound,
}

impl ErrorKind {
    /// Returns `true` for failures a caller may retry with backoff.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Provision | Self::Unreachable | Self::Timeout)
    }

    /// Stable snake-case label used in reports and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Provision => "provision",
            Self::Quota => "quota",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::Authentication => "authentication",
            Self::AmbiguousEnvironment => "ambiguous_environment",
            Self::OutputTooLarge => "output_too_large",
            Self::TunnelLost => "tunnel_lost",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors crossing the machine driver boundary.
///
/// Backends translate provider-native failures into these variants; nothing
/// provider specific leaks past the adapter.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// Required provider identity or region inputs are missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A transient provider failure.
    #[error("provisioning failed: {0}")]
    Provision(String),
    /// The provider refused the request because a quota was reached.
    #[error("provider quota exceeded: {0}")]
    Quota(String),
    /// The machine address could not be reached.
    #[error("machine unreachable: {0}")]
    Unreachable(String),
    /// A bounded wait expired.
    #[error("timed out waiting for {action} on {target}")]
    Timeout {
        /// Operation being waited on.
        action: String,
        /// Resource or environment the wait applied to.
        target: String,
    },
    /// Provider or machine rejected the credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Several environments matched and none was selected explicitly.
    #[error(
        "cannot detect the environment automatically; candidates: {}; pass --id to choose one",
        candidates.join(", ")
    )]
    AmbiguousEnvironment {
        /// Environment ids that matched.
        candidates: Vec<String>,
    },
    /// The resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Resource kind label.
        kind: String,
        /// Native identifier.
        id: String,
    },
}

impl DriverError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Provision(_) => ErrorKind::Provision,
            Self::Quota(_) => ErrorKind::Quota,
            Self::Unreachable(_) => ErrorKind::Unreachable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::AmbiguousEnvironment { .. } => ErrorKind::AmbiguousEnvironment,
            Self::NotFound { .. } => ErrorKind::NotFound,
        }
    }

    /// Returns `true` when the failure may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Convenience constructor for [`DriverError::NotFound`].
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Convenience constructor for [`DriverError::Timeout`].
    #[must_use]
    pub fn timeout(action: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Timeout {
            action: action.into(),
            target: target.into(),
        }
    }
}
