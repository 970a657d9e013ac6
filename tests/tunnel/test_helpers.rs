//! Shared fixtures for relay-backed `up` scenarios.

use std::collections::BTreeMap;

use prevue::backend::DeleteOptions;
use prevue::config::{ExecConfig, TunnelConfig};
use prevue::driver::{DriverSettings, MachineDriver};
use prevue::environment::{EnvironmentOrchestrator, UpRequest};
use prevue::error::ErrorKind;
use prevue::exec::ExecutionRouter;
use prevue::fake::FakeBackend;
use prevue::resource::EnvironmentId;
use prevue::test_support::MockRelay;
use prevue::tunnel::{RelayAddress, ServicePort, TunnelClient, TunnelIdentity};
use rstest::fixture;
use tokio::runtime::Runtime;

#[derive(Clone, Debug)]
pub enum UpResult {
    Exposed {
        urls: BTreeMap<(String, u16), String>,
        affected: usize,
        closes: usize,
    },
    Failure(ErrorKind),
}

#[derive(Clone, Debug, Default)]
pub struct TunnelContext {
    pub relay_running: bool,
    pub reject: bool,
    pub outcome: Option<UpResult>,
}

#[fixture]
pub fn tunnel_context() -> TunnelContext {
    TunnelContext::default()
}

pub fn service_port(raw: &str) -> ServicePort {
    let (service, port) = raw
        .trim()
        .rsplit_once(':')
        .unwrap_or_else(|| panic!("expected SERVICE:PORT, got {raw}"));
    let number = port
        .parse()
        .unwrap_or_else(|err| panic!("port should be numeric: {err}"));
    ServicePort::new(service, number)
}

/// Starts a relay, brings the environment up through it and tears it down
/// again, all on one runtime so the relay outlives the session.
pub fn up_and_down(name: &str, ports: Vec<ServicePort>, reject: bool) -> Result<UpResult, String> {
    let runtime = Runtime::new().map_err(|err| err.to_string())?;
    runtime.block_on(async move {
        let relay = MockRelay::start(None).await.map_err(|err| err.to_string())?;
        relay.set_reject(reject);

        let config = TunnelConfig {
            relay_url: Some(relay.url()),
            reconnect_base_delay_ms: 10,
            ..TunnelConfig::default()
        };
        let address = relay
            .url()
            .parse::<RelayAddress>()
            .map_err(|err| err.to_string())?;
        let client =
            TunnelClient::with_identity(&config, address, TunnelIdentity::from_seed(&[7; 32]))
                .map_err(|err| err.to_string())?;
        let driver = MachineDriver::new(FakeBackend::new("default"), DriverSettings::default());
        let router = ExecutionRouter::new(ExecConfig::default()).map_err(|err| err.to_string())?;
        let orchestrator = EnvironmentOrchestrator::new(driver, router).with_tunnel(client, None);

        let environment_id = EnvironmentId::normalize(name).map_err(|err| err.to_string())?;
        let request = UpRequest {
            environment_id: Some(environment_id),
            ports,
            ..UpRequest::default()
        };
        let outcome = match orchestrator.up(request).await {
            Ok(outcome) => outcome,
            Err(err) => return Ok(UpResult::Failure(err.kind())),
        };
        let urls = outcome.urls();
        let report = orchestrator
            .down(&outcome.environment_id, outcome.session, DeleteOptions::default())
            .await
            .map_err(|err| err.to_string())?;
        relay
            .wait_for_closes(1)
            .await
            .map_err(|err| err.to_string())?;
        let closes = relay.closes();
        relay.shutdown();
        Ok::<_, String>(UpResult::Exposed {
            urls,
            affected: report.affected(),
            closes,
        })
    })
}
