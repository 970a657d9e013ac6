//! BDD scenarios for exposing services through the relay.

use rstest_bdd_macros::scenario;

use super::test_helpers::{TunnelContext, tunnel_context};

#[scenario(
    path = "tests/features/tunnel.feature",
    name = "Bringing an environment up publishes one URL per port"
)]
fn scenario_up_publishes_urls(tunnel_context: TunnelContext) {
    let _ = tunnel_context;
}

#[scenario(
    path = "tests/features/tunnel.feature",
    name = "A relay that rejects the identity fails the bring-up"
)]
fn scenario_rejected_identity(tunnel_context: TunnelContext) {
    let _ = tunnel_context;
}
