//! BDD step definitions for relay-backed `up`.

use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{TunnelContext, UpResult, service_port, up_and_down};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a running relay")]
fn running_relay(mut tunnel_context: TunnelContext) -> TunnelContext {
    tunnel_context.relay_running = true;
    tunnel_context
}

#[given("a running relay that rejects clients")]
fn rejecting_relay(mut tunnel_context: TunnelContext) -> TunnelContext {
    tunnel_context.relay_running = true;
    tunnel_context.reject = true;
    tunnel_context
}

#[when("I bring up environment \"{name}\" exposing \"{first}\" and \"{second}\"")]
fn bring_up(
    mut tunnel_context: TunnelContext,
    name: String,
    first: String,
    second: String,
) -> Result<TunnelContext, StepError> {
    if !tunnel_context.relay_running {
        return Err(StepError::Assertion(String::from("no relay configured")));
    }
    let ports = vec![service_port(&first), service_port(&second)];
    let outcome =
        up_and_down(name.trim(), ports, tunnel_context.reject).map_err(StepError::Assertion)?;
    tunnel_context.outcome = Some(outcome);
    Ok(tunnel_context)
}

#[then("the URL for service \"{service}\" on port {port:u32} is \"{url}\"")]
fn url_for(
    tunnel_context: &TunnelContext,
    service: String,
    port: u32,
    url: String,
) -> Result<(), StepError> {
    let port_number = u16::try_from(port).map_err(|err| StepError::Assertion(err.to_string()))?;
    let Some(UpResult::Exposed { urls, .. }) = &tunnel_context.outcome else {
        return Err(StepError::Assertion(format!(
            "expected exposed services, got {:?}",
            tunnel_context.outcome
        )));
    };
    match urls.get(&(service.trim().to_owned(), port_number)) {
        Some(actual) if actual == url.trim() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {url} for {service}:{port}, got {other:?}"
        ))),
    }
}

#[then("tearing the environment down closed the tunnel")]
fn teardown_closed_tunnel(tunnel_context: &TunnelContext) -> Result<(), StepError> {
    match &tunnel_context.outcome {
        Some(UpResult::Exposed {
            affected: 1,
            closes,
            ..
        }) if *closes >= 1 => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected one deleted machine and a closed tunnel, got {other:?}"
        ))),
    }
}

#[then("bringing the environment up fails with kind \"{kind}\"")]
fn up_fails(tunnel_context: &TunnelContext, kind: String) -> Result<(), StepError> {
    match &tunnel_context.outcome {
        Some(UpResult::Failure(actual)) if actual.as_str() == kind.trim() => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a {kind} failure, got {other:?}"
        ))),
    }
}
