//! In-process relay speaking the tunnel session protocol.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::tunnel::{BoxedStream, Channel, ClientMessage, RelayMessage, verify_challenge};

/// Domain appended to bound hostnames.
pub const RELAY_DOMAIN: &str = "relay.test";

const WAIT_STEP: Duration = Duration::from_millis(10);
const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// An accepted `hello`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HelloRecord {
    /// Environment claimed by the client.
    pub environment_id: String,
    /// Base64 public key presented.
    pub public_key: String,
}

/// A `bind` request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BindRecord {
    /// Service name.
    pub service: String,
    /// Service port.
    pub port: u16,
    /// Requested hostname label.
    pub hostname: String,
}

#[derive(Debug)]
enum ControlCommand {
    Connect { connection_id: String, port: u16 },
    Ping,
    Drop,
}

#[derive(Default)]
struct RelayState {
    reject: bool,
    refuse: bool,
    hellos: Vec<HelloRecord>,
    binds: Vec<BindRecord>,
    pongs: usize,
    closes: usize,
    refusals: Vec<u16>,
    next_id: u64,
    control: Option<mpsc::UnboundedSender<ControlCommand>>,
    pending: HashMap<String, Pending>,
}

struct Pending {
    port: u16,
    attach: oneshot::Sender<BoxedStream>,
}

impl RelayState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

type Shared = Arc<Mutex<RelayState>>;

fn lock(state: &Shared) -> MutexGuard<'_, RelayState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Relay listening on an ephemeral loopback port.
///
/// Every connection starts with a challenge. `hello` signatures are
/// verified, binds are answered with `https://<hostname>.relay.test`, and
/// visitor connections are simulated through [`MockRelay::open_connection`].
pub struct MockRelay {
    addr: SocketAddr,
    tls: bool,
    state: Shared,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for MockRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRelay")
            .field("addr", &self.addr)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl MockRelay {
    /// Starts a relay, terminating TLS with `tls` when given.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind.
    pub async fn start(tls: Option<Arc<rustls::ServerConfig>>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Shared::default();
        let shutdown = CancellationToken::new();
        let acceptor = tls.map(TlsAcceptor::from);
        let is_tls = acceptor.is_some();
        let task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::clone(&state),
            shutdown.clone(),
        ));
        Ok(Self {
            addr,
            tls: is_tls,
            state,
            shutdown,
            task,
        })
    }

    /// Relay URL to configure clients with. TLS relays are addressed as
    /// `localhost` so certificates issued for that name verify.
    #[must_use]
    pub fn url(&self) -> String {
        if self.tls {
            format!("ssh+tls://localhost:{}", self.addr.port())
        } else {
            format!("ssh://127.0.0.1:{}", self.addr.port())
        }
    }

    /// Rejects subsequent `hello` messages.
    pub fn set_reject(&self, reject: bool) {
        lock(&self.state).reject = reject;
    }

    /// Drops subsequent connections before the challenge.
    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    /// Accepted `hello` messages.
    #[must_use]
    pub fn hellos(&self) -> Vec<HelloRecord> {
        lock(&self.state).hellos.clone()
    }

    /// `bind` requests, across reconnections.
    #[must_use]
    pub fn binds(&self) -> Vec<BindRecord> {
        lock(&self.state).binds.clone()
    }

    /// `pong` messages received.
    #[must_use]
    pub fn pongs(&self) -> usize {
        lock(&self.state).pongs
    }

    /// `close` messages received.
    #[must_use]
    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    /// Ports of `connect` requests the client refused.
    #[must_use]
    pub fn refusals(&self) -> Vec<u16> {
        lock(&self.state).refusals.clone()
    }

    /// Pings the current control session. Returns `false` when none is
    /// attached.
    pub fn send_ping(&self) -> bool {
        self.command(ControlCommand::Ping)
    }

    /// Closes the current control connection from the relay side.
    pub fn drop_control(&self) -> bool {
        let sent = self.command(ControlCommand::Drop);
        lock(&self.state).control = None;
        sent
    }

    fn command(&self, command: ControlCommand) -> bool {
        lock(&self.state)
            .control
            .as_ref()
            .is_some_and(|control| control.send(command).is_ok())
    }

    /// Simulates a visitor reaching `port` and returns the visitor side of
    /// the spliced stream once the client attaches.
    ///
    /// # Errors
    ///
    /// Returns an error when no session is attached, the client refuses
    /// the connection, or it never attaches.
    pub async fn open_connection(&self, port: u16) -> io::Result<BoxedStream> {
        let (attach, rx) = oneshot::channel();
        let connection_id = {
            let mut state = lock(&self.state);
            let connection_id = state.next_id("conn");
            state
                .pending
                .insert(connection_id.clone(), Pending { port, attach });
            connection_id
        };
        if !self.command(ControlCommand::Connect {
            connection_id,
            port,
        }) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no control session attached",
            ));
        }
        timeout(WAIT_LIMIT, rx)
            .await
            .map_err(|_elapsed| io::Error::new(io::ErrorKind::TimedOut, "client never attached"))?
            .map_err(|_closed| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "client refused the connection",
                )
            })
    }

    /// Waits until at least `count` hellos were accepted.
    ///
    /// # Errors
    ///
    /// Returns an error after a few seconds without progress.
    pub async fn wait_for_hellos(&self, count: usize) -> io::Result<()> {
        self.wait_until(|state| state.hellos.len() >= count && state.control.is_some())
            .await
    }

    /// Waits until at least `count` binds were received.
    ///
    /// # Errors
    ///
    /// Returns an error after a few seconds without progress.
    pub async fn wait_for_binds(&self, count: usize) -> io::Result<()> {
        self.wait_until(|state| state.binds.len() >= count).await
    }

    /// Waits until at least `count` pongs were received.
    ///
    /// # Errors
    ///
    /// Returns an error after a few seconds without progress.
    pub async fn wait_for_pongs(&self, count: usize) -> io::Result<()> {
        self.wait_until(|state| state.pongs >= count).await
    }

    /// Waits until at least `count` closes were received.
    ///
    /// # Errors
    ///
    /// Returns an error after a few seconds without progress.
    pub async fn wait_for_closes(&self, count: usize) -> io::Result<()> {
        self.wait_until(|state| state.closes >= count).await
    }

    async fn wait_until(&self, ready: impl Fn(&RelayState) -> bool) -> io::Result<()> {
        let poll = async {
            while !ready(&lock(&self.state)) {
                sleep(WAIT_STEP).await;
            }
        };
        timeout(WAIT_LIMIT, poll)
            .await
            .map_err(|_elapsed| io::Error::new(io::ErrorKind::TimedOut, "relay condition not met"))
    }

    /// Stops accepting connections and drops live ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.task.abort();
        lock(&self.state).control = None;
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    state: Shared,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((tcp, _peer)) = accepted else {
            continue;
        };
        if lock(&state).refuse {
            drop(tcp);
            continue;
        }
        let acceptor = acceptor.clone();
        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = handle_connection(tcp, acceptor, state) => {}
            }
        });
    }
}

async fn handle_connection(tcp: TcpStream, acceptor: Option<TlsAcceptor>, state: Shared) {
    let stream: BoxedStream = match acceptor {
        Some(acceptor) => match acceptor.accept(tcp).await {
            Ok(tls) => Box::new(tls),
            Err(_) => return,
        },
        None => Box::new(tcp),
    };
    let mut channel = Channel::new(stream);
    let nonce = uuid::Uuid::new_v4().to_string();
    if channel
        .send(&RelayMessage::Challenge {
            nonce: nonce.clone(),
        })
        .await
        .is_err()
    {
        return;
    }
    match channel.recv::<ClientMessage>().await {
        Ok(ClientMessage::Hello {
            environment_id,
            public_key,
            signature,
        }) => {
            let valid = verify_challenge(&public_key, &signature, &nonce, &environment_id);
            if lock(&state).reject || !valid {
                let reason = if valid {
                    "identity not allowed"
                } else {
                    "bad signature"
                };
                drop(
                    channel
                        .send(&RelayMessage::Rejected {
                            reason: reason.to_owned(),
                        })
                        .await,
                );
                return;
            }
            serve_control(channel, state, HelloRecord {
                environment_id,
                public_key,
            })
            .await;
        }
        Ok(ClientMessage::Attach { connection_id, .. }) => {
            let waiter = lock(&state).pending.remove(&connection_id);
            if let Some(waiter) = waiter {
                drop(waiter.attach.send(channel.into_inner()));
            }
        }
        _ => {}
    }
}

async fn serve_control(mut channel: Channel<BoxedStream>, state: Shared, hello: HelloRecord) {
    let (tx, mut commands) = mpsc::unbounded_channel();
    let client_id = {
        let mut guard = lock(&state);
        guard.hellos.push(hello);
        guard.control = Some(tx);
        guard.next_id("client")
    };
    if channel
        .send(&RelayMessage::Welcome { client_id })
        .await
        .is_err()
    {
        return;
    }
    loop {
        tokio::select! {
            command = commands.recv() => {
                let message = match command {
                    Some(ControlCommand::Connect { connection_id, port }) => {
                        RelayMessage::Connect { connection_id, port }
                    }
                    Some(ControlCommand::Ping) => RelayMessage::Ping,
                    Some(ControlCommand::Drop) | None => return,
                };
                if channel.send(&message).await.is_err() {
                    return;
                }
            }
            received = channel.recv::<ClientMessage>() => {
                match received {
                    Ok(ClientMessage::Bind { service, port, hostname }) => {
                        let url = format!("https://{hostname}.{RELAY_DOMAIN}");
                        lock(&state).binds.push(BindRecord {
                            service: service.clone(),
                            port,
                            hostname,
                        });
                        if channel
                            .send(&RelayMessage::Bound { service, port, url })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(ClientMessage::Pong) => lock(&state).pongs += 1,
                    Ok(ClientMessage::Refuse { connection_id, .. }) => {
                        let mut guard = lock(&state);
                        if let Some(waiter) = guard.pending.remove(&connection_id) {
                            guard.refusals.push(waiter.port);
                        }
                    }
                    Ok(ClientMessage::Close) => {
                        lock(&state).closes += 1;
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        }
    }
}
