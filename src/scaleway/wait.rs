//! Readiness and teardown wait loops.

use std::future::Future;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::error::DriverError;
use crate::resource::Address;

use super::ScalewayBackend;
use super::api::ServerRecord;

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

impl ScalewayBackend {
    pub(super) async fn wait_for_address(
        &self,
        zone: &str,
        id: &str,
    ) -> Result<(ServerRecord, Address), DriverError> {
        self.wait_for_address_with(id, || self.client.get_server(zone, id))
            .await
    }

    /// Polls until the server runs with a public IPv4 address.
    pub(super) async fn wait_for_address_with<F, Fut>(
        &self,
        id: &str,
        mut fetch: F,
    ) -> Result<(ServerRecord, Address), DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<ServerRecord>, DriverError>>,
    {
        let deadline = Instant::now() + self.wait_timeout;
        let mut saw_running = false;

        while Instant::now() <= deadline {
            let Some(server) = fetch().await? else {
                sleep(self.poll_interval).await;
                continue;
            };

            if server.state != "running" {
                sleep(self.poll_interval).await;
                continue;
            }

            saw_running = true;

            if let Some(ip) = server
                .public_address()
                .and_then(|ip| IpAddr::from_str(ip).ok())
            {
                let address = Address::new(ip.to_string(), self.ssh_port);
                return Ok((server, address));
            }

            sleep(self.poll_interval).await;
        }

        if saw_running {
            return Err(DriverError::Unreachable(format!(
                "machine {id} is running without a public IPv4 address"
            )));
        }

        Err(DriverError::timeout("machine start", id))
    }

    /// Polls until the SSH port accepts TCP connections.
    pub(super) async fn wait_for_ssh_ready(
        &self,
        id: &str,
        address: &Address,
    ) -> Result<(), DriverError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            let connect = timeout(
                SSH_CONNECT_TIMEOUT,
                TcpStream::connect((address.host.as_str(), address.port)),
            )
            .await;
            if matches!(connect, Ok(Ok(_))) {
                return Ok(());
            }
            debug!(machine = id, %address, "SSH port not accepting connections yet");
            sleep(self.poll_interval).await;
        }

        Err(DriverError::timeout("SSH readiness", id))
    }

    /// Calls `poll` until it reports the resource absent.
    pub(super) async fn wait_until_gone<F, Fut>(
        &self,
        kind: &str,
        id: &str,
        mut poll: F,
    ) -> Result<(), DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, DriverError>>,
    {
        let deadline = Instant::now() + self.delete_timeout;
        while Instant::now() <= deadline {
            if !poll().await? {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }

        Err(DriverError::timeout(format!("{kind} removal"), id))
    }

    /// Calls `poll` until the snapshot reports `available`.
    pub(super) async fn wait_for_snapshot<F, Fut>(
        &self,
        id: &str,
        mut poll: F,
    ) -> Result<(), DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<String>, DriverError>>,
    {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            match poll().await? {
                Some(state) if state == "available" => return Ok(()),
                Some(state) if state == "error" => {
                    return Err(DriverError::Provision(format!(
                        "snapshot {id} entered the error state"
                    )));
                }
                Some(_) => {}
                None => return Err(DriverError::not_found("snapshot", id)),
            }
            sleep(self.poll_interval).await;
        }

        Err(DriverError::timeout("snapshot completion", id))
    }
}
