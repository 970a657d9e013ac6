//! Brings environments up and down.
//!
//! `up` provisions (or reuses) the machine, runs setup commands in batch
//! mode and exposes the declared ports through the relay. `down` closes the
//! tunnel session before any machine is deleted.
//!
//! Visitor traffic is forwarded to the machine itself: its address, or the
//! loopback interface when the machine is the local host. A machine with
//! neither needs an explicit target host; the operator's own loopback is
//! never used as a stand-in.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{DeleteOptions, MachineBackend};
use crate::driver::{DeletionReport, MachineDriver};
use crate::error::{DriverError, ErrorKind};
use crate::exec::{ExecError, ExecutionRequest, ExecutionRouter, ExecutionResult};
use crate::resource::{AuthMethod, ConnectionParams, EnvironmentId, Machine, SizingHints};
use crate::tunnel::{ServicePort, TunnelClient, TunnelError, TunnelSession};

const LOCAL_TARGET_HOST: &str = "127.0.0.1";

/// Errors surfaced by [`EnvironmentOrchestrator`].
#[derive(Debug, Error)]
pub enum UpError {
    /// Provisioning, lookup or deletion failed.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// A setup command could not run.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// The tunnel could not be opened or closed cleanly.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// A setup command exited non-zero.
    #[error("setup command '{command}' exited with status {exit_code}: {stderr}")]
    Setup {
        /// Command as given.
        command: String,
        /// Remote exit code.
        exit_code: i32,
        /// Captured stderr, trimmed.
        stderr: String,
    },
}

impl UpError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Driver(err) => err.kind(),
            Self::Exec(err) => err.kind(),
            Self::Tunnel(err) => err.kind(),
            Self::Setup { .. } => ErrorKind::Provision,
        }
    }
}

/// What `up` should produce.
#[derive(Clone, Debug, Default)]
pub struct UpRequest {
    /// Target environment.
    pub environment_id: Option<EnvironmentId>,
    /// Sizing overrides.
    pub sizing: SizingHints,
    /// Ports to expose.
    pub ports: Vec<ServicePort>,
    /// Commands run once the machine is reachable, in order.
    pub setup_commands: Vec<String>,
}

/// Result of a successful `up`.
#[derive(Debug)]
pub struct UpOutcome {
    /// Environment brought up.
    pub environment_id: EnvironmentId,
    /// Machine serving it.
    pub machine: Machine,
    /// Live tunnel session, when a relay is configured and ports were
    /// declared.
    pub session: Option<TunnelSession>,
}

impl UpOutcome {
    /// `(service, port) -> url` map; empty without a tunnel.
    #[must_use]
    pub fn urls(&self) -> BTreeMap<(String, u16), String> {
        self.session
            .as_ref()
            .map(TunnelSession::urls)
            .unwrap_or_default()
    }
}

/// Combines the machine driver, execution router and tunnel client.
#[derive(Debug)]
pub struct EnvironmentOrchestrator<B: MachineBackend> {
    driver: MachineDriver<B>,
    router: ExecutionRouter,
    tunnel: Option<TunnelClient>,
    target_host: Option<String>,
}

impl<B: MachineBackend> EnvironmentOrchestrator<B> {
    /// Creates an orchestrator without a tunnel.
    #[must_use]
    pub const fn new(driver: MachineDriver<B>, router: ExecutionRouter) -> Self {
        Self {
            driver,
            router,
            tunnel: None,
            target_host: None,
        }
    }

    /// Exposes ports through `tunnel`, forwarding to `target_host` when
    /// given and to the machine otherwise.
    #[must_use]
    pub fn with_tunnel(mut self, tunnel: TunnelClient, target_host: Option<String>) -> Self {
        self.tunnel = Some(tunnel);
        self.target_host = target_host;
        self
    }

    /// The underlying driver.
    #[must_use]
    pub const fn driver(&self) -> &MachineDriver<B> {
        &self.driver
    }

    /// Provisions the environment, runs setup and opens the tunnel.
    ///
    /// Re-running `up` for a live environment reuses its machine and binds
    /// the same hostnames again.
    ///
    /// # Errors
    ///
    /// Returns [`UpError`] when provisioning, setup or the tunnel fail. The
    /// machine stays provisioned in every case.
    pub async fn up(&self, request: UpRequest) -> Result<UpOutcome, UpError> {
        let environment_id = request.environment_id.ok_or_else(|| {
            DriverError::Configuration(String::from("no environment id resolved for up"))
        })?;
        self.driver
            .provision(&environment_id, &request.sizing)
            .await?;
        let (machine, params) = self.driver.connection_params(&environment_id).await?;

        for command in &request.setup_commands {
            let result = self
                .router
                .execute(&params, ExecutionRequest::batch(command.clone()))
                .await?;
            if let ExecutionResult::Batch { exit_code, output } = result
                && exit_code != 0
            {
                return Err(UpError::Setup {
                    command: command.clone(),
                    exit_code,
                    stderr: output.stderr_lossy().trim().to_owned(),
                });
            }
            info!(environment = %environment_id, %command, "setup command finished");
        }

        let session = match (&self.tunnel, request.ports.is_empty()) {
            (Some(tunnel), false) => {
                let target = target_host(self.target_host.as_deref(), &machine, &params)?;
                Some(tunnel.open(&environment_id, &request.ports, &target).await?)
            }
            (None, false) => {
                warn!(
                    environment = %environment_id,
                    "no relay configured; ports are not exposed"
                );
                None
            }
            (_, true) => None,
        };

        Ok(UpOutcome {
            environment_id,
            machine,
            session,
        })
    }

    /// Closes `session` and deletes the environment's machines.
    ///
    /// # Errors
    ///
    /// Returns [`UpError::Driver`] with [`DriverError::NotFound`] when the
    /// environment has no machines and `force` is unset. A failure while
    /// closing the tunnel is logged and does not stop the teardown.
    pub async fn down(
        &self,
        environment_id: &EnvironmentId,
        session: Option<TunnelSession>,
        options: DeleteOptions,
    ) -> Result<DeletionReport, UpError> {
        if let Some(session) = session
            && let Err(err) = session.close().await
        {
            warn!(environment = %environment_id, error = %err, "tunnel ended with an error");
        }
        Ok(self.driver.down(environment_id, options).await?)
    }
}

/// Host the tunnel forwards visitor connections to.
///
/// # Errors
///
/// Returns [`TunnelError::Configuration`] when nothing names a host on the
/// machine.
pub fn target_host(
    configured: Option<&str>,
    machine: &Machine,
    params: &ConnectionParams,
) -> Result<String, TunnelError> {
    if let Some(host) = configured {
        return Ok(host.to_owned());
    }
    if params.auth == AuthMethod::Local {
        return Ok(LOCAL_TARGET_HOST.to_owned());
    }
    machine
        .address
        .as_ref()
        .map(|address| address.host.clone())
        .ok_or_else(|| {
            TunnelError::Configuration(format!(
                "machine {} has no address to forward visitors to; set PREVUE_TUNNEL_TARGET_HOST \
                 or target_host in prevue.toml",
                machine.id
            ))
        })
}
