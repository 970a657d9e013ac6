//! Tunnel client exposing service ports through a public relay.
//!
//! One outbound control session per environment. After the identity
//! handshake the client binds one hostname per declared port; the session
//! task then answers pings and, for each visitor of a declared port, opens
//! a data connection to the relay and splices it with the local target.
//! Connections for any other port are refused. Closing the session also
//! tears down every spliced visitor connection. A dropped control
//! connection is re-established with exponential backoff, re-binding the
//! same hostnames; running out of attempts surfaces
//! [`TunnelError::Lost`] to whoever awaits the session.

mod address;
mod error;
mod identity;
mod protocol;
mod registry;
mod tls;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use address::{RelayAddress, RelayScheme, hostname_label};
pub use error::TunnelError;
pub use identity::{TunnelIdentity, verify_challenge};
pub use protocol::{BoxedStream, Channel, ClientMessage, RelayMessage, RelayStream};
pub use registry::{CloseRequest, SessionListener, SessionRegistry};
pub use tls::Dialer;

use crate::config::TunnelConfig;
use crate::driver::RetryPolicy;
use crate::resource::EnvironmentId;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A port a service publishes.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ServicePort {
    /// Service name.
    pub service: String,
    /// Container or host port.
    pub port: u16,
}

impl ServicePort {
    /// Creates a service port.
    #[must_use]
    pub fn new(service: impl Into<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            port,
        }
    }
}

/// A port exposed through the relay.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TunnelBinding {
    /// Service name.
    pub service: String,
    /// Service port.
    pub port: u16,
    /// Hostname label requested from the relay.
    pub hostname: String,
    /// Public URL reported by the relay.
    pub url: String,
}

/// Opens tunnel sessions against one relay.
#[derive(Debug)]
pub struct TunnelClient {
    dialer: Dialer,
    identity: Arc<TunnelIdentity>,
    reconnect: RetryPolicy,
}

impl TunnelClient {
    /// Builds a client from configuration, creating the identity key on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Configuration`] when no relay is configured
    /// or TLS and identity material is unusable.
    pub fn new(config: &TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let raw = config.relay_url.as_deref().ok_or_else(|| {
            TunnelError::Configuration(String::from(
                "missing relay URL: set PREVUE_TUNNEL_RELAY_URL or relay_url in prevue.toml",
            ))
        })?;
        let identity = TunnelIdentity::load_or_create(&crate::fs::expand_tilde(
            &config.identity_file,
        ))?;
        Self::with_identity(config, raw.parse()?, identity)
    }

    /// Builds a client with an explicit relay address and identity.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Configuration`] when TLS material is
    /// unusable.
    pub fn with_identity(
        config: &TunnelConfig,
        relay: RelayAddress,
        identity: TunnelIdentity,
    ) -> Result<Self, TunnelError> {
        Ok(Self {
            dialer: Dialer::new(relay, config)?,
            identity: Arc::new(identity),
            reconnect: RetryPolicy {
                max_attempts: config.max_reconnect_attempts,
                base_delay: config.reconnect_base_delay(),
                max_delay: MAX_BACKOFF,
            },
        })
    }

    /// Opens a session exposing `ports` for `environment_id`, forwarding
    /// visitor connections to `target_host`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Authentication`] when the relay rejects the
    /// identity; dial and handshake failures are not retried here.
    pub async fn open(
        &self,
        environment_id: &EnvironmentId,
        ports: &[ServicePort],
        target_host: &str,
    ) -> Result<TunnelSession, TunnelError> {
        let context = Arc::new(SessionContext {
            dialer: self.dialer.clone(),
            identity: Arc::clone(&self.identity),
            environment_id: environment_id.clone(),
            requests: ports
                .iter()
                .map(|port| {
                    let hostname = hostname_label(environment_id, &port.service, port.port);
                    (port.clone(), hostname)
                })
                .collect(),
            target_host: target_host.to_owned(),
            reconnect: self.reconnect,
        });
        let established = context.establish().await?;
        let bindings = established.bindings.clone();
        info!(
            environment = %environment_id,
            relay = %self.dialer.relay(),
            bindings = bindings.len(),
            "tunnel session established"
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(context, established, cancel.clone()));
        Ok(TunnelSession {
            bindings,
            cancel,
            task: Some(task),
        })
    }
}

/// A live tunnel session.
#[derive(Debug)]
pub struct TunnelSession {
    bindings: Vec<TunnelBinding>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), TunnelError>>>,
}

impl TunnelSession {
    /// Bindings in declaration order.
    #[must_use]
    pub fn bindings(&self) -> &[TunnelBinding] {
        &self.bindings
    }

    /// `(service, port) -> url` map.
    #[must_use]
    pub fn urls(&self) -> BTreeMap<(String, u16), String> {
        self.bindings
            .iter()
            .map(|binding| ((binding.service.clone(), binding.port), binding.url.clone()))
            .collect()
    }

    /// Token that closes the session when cancelled, for signal handlers.
    #[must_use]
    pub fn close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns `true` once the session task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Sends `close`, stops the session task and waits for it. Visitor
    /// connections still being forwarded are dropped before this returns.
    ///
    /// # Errors
    ///
    /// Returns the session failure if it ended before being closed.
    pub async fn close(mut self) -> Result<(), TunnelError> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Waits until the session ends on its own. Dropping the returned
    /// future leaves the session running, so it can be raced against other
    /// events and closed afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Lost`] when reconnection gives up.
    pub async fn wait(&mut self) -> Result<(), TunnelError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(|err| TunnelError::Disconnected(format!("session task failed: {err}")))?
    }
}

struct SessionContext {
    dialer: Dialer,
    identity: Arc<TunnelIdentity>,
    environment_id: EnvironmentId,
    requests: Vec<(ServicePort, String)>,
    target_host: String,
    reconnect: RetryPolicy,
}

struct Established {
    control: Channel<BoxedStream>,
    client_id: String,
    bindings: Vec<TunnelBinding>,
}

impl SessionContext {
    fn declares(&self, port: u16) -> bool {
        self.requests.iter().any(|(request, _)| request.port == port)
    }

    async fn establish(&self) -> Result<Established, TunnelError> {
        let stream = self.dialer.dial().await?;
        self.dialer.warn_if_insecure();
        let deadline = self.dialer.deadline();
        timeout(deadline, self.handshake(Channel::new(stream)))
            .await
            .map_err(|_elapsed| TunnelError::Timeout { after: deadline })?
    }

    async fn handshake(&self, mut control: Channel<BoxedStream>) -> Result<Established, TunnelError> {
        let nonce = match control.recv().await? {
            RelayMessage::Challenge { nonce } => nonce,
            other => return Err(unexpected("challenge", &other)),
        };
        let environment_id = self.environment_id.as_str();
        control
            .send(&ClientMessage::Hello {
                environment_id: environment_id.to_owned(),
                public_key: self.identity.public_key(),
                signature: self.identity.sign_challenge(&nonce, environment_id),
            })
            .await?;
        let client_id = match control.recv().await? {
            RelayMessage::Welcome { client_id } => client_id,
            RelayMessage::Rejected { reason } => return Err(TunnelError::Authentication(reason)),
            other => return Err(unexpected("welcome", &other)),
        };

        let mut bindings = Vec::with_capacity(self.requests.len());
        for (request, hostname) in &self.requests {
            control
                .send(&ClientMessage::Bind {
                    service: request.service.clone(),
                    port: request.port,
                    hostname: hostname.clone(),
                })
                .await?;
            let url = loop {
                match control.recv().await? {
                    RelayMessage::Bound { service, port, url }
                        if service == request.service && port == request.port =>
                    {
                        break url;
                    }
                    RelayMessage::Ping => control.send(&ClientMessage::Pong).await?,
                    RelayMessage::Rejected { reason } => {
                        return Err(TunnelError::Authentication(reason));
                    }
                    other => return Err(unexpected("bound", &other)),
                }
            };
            debug!(service = %request.service, port = request.port, %url, "port bound");
            bindings.push(TunnelBinding {
                service: request.service.clone(),
                port: request.port,
                hostname: hostname.clone(),
                url,
            });
        }
        Ok(Established {
            control,
            client_id,
            bindings,
        })
    }

    async fn reconnect(
        &self,
        cancel: &CancellationToken,
        cause: TunnelError,
    ) -> Result<Option<Established>, TunnelError> {
        let mut last = cause;
        for attempt in 1..=self.reconnect.max_attempts {
            let delay = self.reconnect.delay_for_attempt(attempt);
            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = sleep(delay) => {}
            }
            match self.establish().await {
                Ok(established) => {
                    info!(attempt, environment = %self.environment_id, "tunnel session re-established");
                    return Ok(Some(established));
                }
                Err(err @ TunnelError::Authentication(_)) => return Err(err),
                Err(err) => {
                    warn!(attempt, error = %err, "tunnel reconnection failed");
                    last = err;
                }
            }
        }
        Err(TunnelError::Lost {
            attempts: self.reconnect.max_attempts,
            reason: last.to_string(),
        })
    }
}

fn unexpected(wanted: &str, got: &RelayMessage) -> TunnelError {
    TunnelError::Protocol(format!("expected {wanted}, got {got:?}"))
}

async fn run_session(
    context: Arc<SessionContext>,
    established: Established,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let Established {
        mut control,
        mut client_id,
        ..
    } = established;
    let mut forwards = JoinSet::new();
    loop {
        let cause = tokio::select! {
            () = cancel.cancelled() => {
                if let Err(err) = control.send(&ClientMessage::Close).await {
                    debug!(error = %err, "relay gone before close");
                }
                forwards.shutdown().await;
                info!(environment = %context.environment_id, "tunnel session closed");
                return Ok(());
            }
            cause = serve(&context, &mut control, &client_id, &mut forwards) => cause,
        };
        warn!(environment = %context.environment_id, error = %cause, "relay connection lost");
        let next = match context.reconnect(&cancel, cause).await {
            Ok(next) => next,
            Err(err) => {
                forwards.shutdown().await;
                return Err(err);
            }
        };
        match next {
            Some(fresh) => {
                control = fresh.control;
                client_id = fresh.client_id;
            }
            None => {
                forwards.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// Serves the control connection until it fails; never returns success.
async fn serve(
    context: &Arc<SessionContext>,
    control: &mut Channel<BoxedStream>,
    client_id: &str,
    forwards: &mut JoinSet<()>,
) -> TunnelError {
    loop {
        let message = match control.recv::<RelayMessage>().await {
            Ok(message) => message,
            Err(err) => return err,
        };
        match message {
            RelayMessage::Ping => {
                if let Err(err) = control.send(&ClientMessage::Pong).await {
                    return err;
                }
            }
            RelayMessage::Connect {
                connection_id,
                port,
            } if !context.declares(port) => {
                warn!(connection = %connection_id, port, "refusing connection to undeclared port");
                let refusal = ClientMessage::Refuse {
                    connection_id,
                    reason: format!("port {port} is not exposed"),
                };
                if let Err(err) = control.send(&refusal).await {
                    return err;
                }
            }
            RelayMessage::Connect {
                connection_id,
                port,
            } => {
                while forwards.try_join_next().is_some() {}
                let shared = Arc::clone(context);
                let owner = client_id.to_owned();
                forwards.spawn(async move {
                    if let Err(err) = forward(&shared, connection_id.clone(), owner, port).await {
                        warn!(connection = %connection_id, port, error = %err, "forwarding failed");
                    }
                });
            }
            other => debug!(message = ?other, "ignoring relay message"),
        }
    }
}

async fn forward(
    context: &SessionContext,
    connection_id: String,
    client_id: String,
    port: u16,
) -> Result<(), TunnelError> {
    let mut data = Channel::new(context.dialer.dial().await?);
    match data.recv().await? {
        RelayMessage::Challenge { .. } => {}
        other => return Err(unexpected("challenge", &other)),
    }
    data.send(&ClientMessage::Attach {
        connection_id,
        client_id,
    })
    .await?;
    let mut relay_side = data.into_inner();
    let mut local = TcpStream::connect((context.target_host.as_str(), port))
        .await
        .map_err(|err| {
            TunnelError::Unreachable(format!("{}:{port}: {err}", context.target_host))
        })?;
    let (sent, received) = tokio::io::copy_bidirectional(&mut relay_side, &mut local).await?;
    debug!(port, sent, received, "visitor connection finished");
    Ok(())
}
