//! Normalizes Scaleway failures into the driver error taxonomy.

use scaleway_rs::{ScalewayApiError, ScalewayError};

use crate::error::DriverError;

/// What a failed call was acting on, for `NotFound` reporting.
#[derive(Clone, Copy, Debug)]
pub(super) struct Target<'a> {
    pub(super) kind: &'a str,
    pub(super) id: &'a str,
}

impl<'a> Target<'a> {
    pub(super) const fn new(kind: &'a str, id: &'a str) -> Self {
        Self { kind, id }
    }
}

/// Provider failure details independent of how they were received.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct Failure<'a> {
    pub(super) status: Option<u16>,
    pub(super) etype: &'a str,
    pub(super) message: &'a str,
    pub(super) resource: Option<&'a str>,
}

fn is_instance_type_failure(failure: &Failure<'_>) -> bool {
    matches!(failure.resource, Some("commercial_type"))
        || (failure.etype == "invalid_arguments"
            && failure
                .message
                .to_ascii_lowercase()
                .contains("commercial_type"))
}

pub(super) fn normalize(failure: &Failure<'_>, target: Target<'_>) -> DriverError {
    let lowered = failure.message.to_ascii_lowercase();
    let status = failure.status.unwrap_or_default();

    if status == 404 || failure.etype == "not_found" {
        return DriverError::not_found(target.kind, target.id);
    }
    if failure.etype == "quotas_exceeded" || (status == 403 && lowered.contains("quota")) {
        return DriverError::Quota(failure.message.to_owned());
    }
    if matches!(status, 401 | 403)
        || matches!(
            failure.etype,
            "denied_authentication" | "permissions_denied" | "authentication_failed"
        )
    {
        return DriverError::Configuration(format!(
            "Scaleway rejected the credentials: {}",
            failure.message
        ));
    }
    if is_instance_type_failure(failure) {
        return DriverError::Configuration(format!(
            "instance type unavailable: {}",
            failure.message
        ));
    }
    if failure.etype == "invalid_arguments" {
        return DriverError::Configuration(failure.message.to_owned());
    }
    DriverError::Provision(if failure.message.is_empty() {
        format!("Scaleway returned HTTP {status}")
    } else {
        failure.message.to_owned()
    })
}

/// Maps a raw HTTP error response.
pub(super) fn from_response(status: u16, body: &[u8], target: Target<'_>) -> DriverError {
    let text = String::from_utf8_lossy(body);
    match serde_json::from_slice::<ScalewayApiError>(body) {
        Ok(api_err) => normalize(
            &Failure {
                status: Some(status),
                etype: &api_err.etype,
                message: &api_err.message,
                resource: api_err.resource.as_deref(),
            },
            target,
        ),
        Err(_) => normalize(
            &Failure {
                status: Some(status),
                message: text.trim(),
                ..Failure::default()
            },
            target,
        ),
    }
}

/// Maps an SDK error.
pub(super) fn from_sdk(err: &ScalewayError, target: Target<'_>) -> DriverError {
    match err {
        ScalewayError::Api(api_err) => normalize(
            &Failure {
                status: None,
                etype: &api_err.etype,
                message: &api_err.message,
                resource: api_err.resource.as_deref(),
            },
            target,
        ),
        other => DriverError::Provision(other.to_string()),
    }
}

/// Maps transport and decoding failures, which are always transient.
pub(super) fn transport(err: &impl std::fmt::Display) -> DriverError {
    DriverError::Provision(format!("Scaleway request failed: {err}"))
}
