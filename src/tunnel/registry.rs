//! Local registry of foreground tunnel sessions.
//!
//! `up` keeps the tunnel session alive in its own process. While it does,
//! it listens on a loopback port and records that port under the session
//! directory as `<environment-id>.port`. `down` run from another shell
//! connects to it, sends `close` and waits for `closed` before any machine
//! is deleted. The entry is removed only after the session has closed, so
//! a vanished entry also means the tunnel is gone.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use super::TunnelError;
use crate::config::TunnelConfig;
use crate::resource::EnvironmentId;

const CLOSE_REQUEST: &str = "close";
const CLOSED_REPLY: &str = "closed";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const RELEASE_POLL: Duration = Duration::from_millis(50);

/// Session entries kept in one directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionRegistry {
    dir: String,
}

impl SessionRegistry {
    /// Registry rooted at `dir`; a leading `~/` is expanded.
    #[must_use]
    pub fn new(dir: &str) -> Self {
        Self {
            dir: crate::fs::expand_tilde(dir.trim_end_matches('/')),
        }
    }

    /// Registry rooted at the configured session directory.
    #[must_use]
    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(&config.session_dir)
    }

    fn entry(&self, environment_id: &EnvironmentId) -> String {
        format!("{}/{environment_id}.port", self.dir)
    }

    /// Returns `true` when an entry exists for `environment_id`.
    #[must_use]
    pub fn is_registered(&self, environment_id: &EnvironmentId) -> bool {
        crate::fs::exists(&self.entry(environment_id))
    }

    /// Starts listening for close requests and records the entry,
    /// replacing one left behind by a process that died.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Configuration`] when the loopback listener
    /// or the entry cannot be created.
    pub async fn register(
        &self,
        environment_id: &EnvironmentId,
    ) -> Result<SessionListener, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| TunnelError::Configuration(format!("session control port: {err}")))?;
        let port = listener
            .local_addr()
            .map_err(|err| TunnelError::Configuration(format!("session control port: {err}")))?
            .port();
        let entry = self.entry(environment_id);
        if crate::fs::remove_file(&entry).map_err(TunnelError::Configuration)? {
            warn!(environment = %environment_id, "replaced a stale tunnel session entry");
        }
        crate::fs::write_private(&entry, &port.to_string()).map_err(TunnelError::Configuration)?;
        debug!(environment = %environment_id, port, "tunnel session registered");
        Ok(SessionListener { listener, entry })
    }

    /// Asks the process holding the session for `environment_id` to close
    /// it and waits until it has. Returns `false` when no live session is
    /// registered; stale entries are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Timeout`] when the session is still
    /// registered after `deadline`, or [`TunnelError::Configuration`] when
    /// the entry cannot be read.
    pub async fn request_close(
        &self,
        environment_id: &EnvironmentId,
        deadline: Duration,
    ) -> Result<bool, TunnelError> {
        let entry = self.entry(environment_id);
        if !crate::fs::exists(&entry) {
            return Ok(false);
        }
        let raw = crate::fs::read_to_string(&entry).map_err(TunnelError::Configuration)?;
        let Ok(port) = raw.trim().parse::<u16>() else {
            warn!(environment = %environment_id, "discarding unreadable tunnel session entry");
            crate::fs::remove_file(&entry).map_err(TunnelError::Configuration)?;
            return Ok(false);
        };
        let stream = match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(environment = %environment_id, error = %err, "tunnel session entry is stale");
                crate::fs::remove_file(&entry).map_err(TunnelError::Configuration)?;
                return Ok(false);
            }
        };
        let started = Instant::now();
        match timeout(deadline, exchange(stream)).await {
            Ok(Ok(true)) => {
                info!(environment = %environment_id, "tunnel session closed by its owner");
                Ok(true)
            }
            Ok(Ok(false) | Err(_)) | Err(_) => {
                let left = deadline.saturating_sub(started.elapsed());
                wait_until_released(&entry, left).await?;
                Ok(true)
            }
        }
    }
}

/// The owner removes its entry only after closing, so its absence is as
/// good as an acknowledgement.
async fn wait_until_released(entry: &str, deadline: Duration) -> Result<(), TunnelError> {
    let released = async {
        while crate::fs::exists(entry) {
            sleep(RELEASE_POLL).await;
        }
    };
    timeout(deadline, released)
        .await
        .map_err(|_elapsed| TunnelError::Timeout { after: deadline })
}

/// Sends `close` and reports whether `closed` came back.
async fn exchange(mut stream: TcpStream) -> Result<bool, TunnelError> {
    stream
        .write_all(format!("{CLOSE_REQUEST}\n").as_bytes())
        .await?;
    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply).await?;
    Ok(reply.trim() == CLOSED_REPLY)
}

/// Loopback listener owned by the process serving a session.
#[derive(Debug)]
pub struct SessionListener {
    listener: TcpListener,
    entry: String,
}

impl SessionListener {
    /// Waits for the next well-formed close request.
    pub async fn next_close(&self) -> CloseRequest {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _peer)) => stream,
                Err(err) => {
                    warn!(error = %err, "session control accept failed");
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            match timeout(REQUEST_TIMEOUT, reader.read_line(&mut line)).await {
                Ok(Ok(_)) if line.trim() == CLOSE_REQUEST => {
                    return CloseRequest {
                        stream: reader.into_inner(),
                    };
                }
                _ => debug!("ignoring malformed session control request"),
            }
        }
    }

    /// Removes the registry entry. Call once the session has closed.
    pub fn unregister(self) {
        if let Err(err) = crate::fs::remove_file(&self.entry) {
            warn!(error = %err, "failed to remove tunnel session entry");
        }
    }
}

/// A pending close request; acknowledge it once the session is closed.
#[derive(Debug)]
pub struct CloseRequest {
    stream: TcpStream,
}

impl CloseRequest {
    /// Tells the requester the session is closed.
    pub async fn acknowledge(mut self) {
        if let Err(err) = self
            .stream
            .write_all(format!("{CLOSED_REPLY}\n").as_bytes())
            .await
        {
            debug!(error = %err, "close requester went away");
        }
    }
}
