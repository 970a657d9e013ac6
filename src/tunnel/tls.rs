//! Relay dialing, with TLS for `ssh+tls` addresses.

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::address::{RelayAddress, RelayScheme};
use super::protocol::BoxedStream;
use super::TunnelError;
use crate::config::TunnelConfig;
use crate::fs;

/// Opens byte streams to the relay.
#[derive(Clone)]
pub struct Dialer {
    relay: RelayAddress,
    tls: Option<TlsConnector>,
    insecure: bool,
    deadline: Duration,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("relay", &self.relay)
            .field("insecure", &self.insecure)
            .finish_non_exhaustive()
    }
}

impl Dialer {
    /// Builds a dialer for `relay`.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Configuration`] when the CA file cannot be
    /// read or holds no certificates.
    pub fn new(relay: RelayAddress, config: &TunnelConfig) -> Result<Self, TunnelError> {
        let tls = match relay.scheme {
            RelayScheme::SshTls => Some(TlsConnector::from(Arc::new(client_config(config)?))),
            RelayScheme::Ssh => None,
        };
        Ok(Self {
            relay,
            tls,
            insecure: config.insecure_skip_verify,
            deadline: config.handshake_timeout(),
        })
    }

    /// The relay this dialer targets.
    pub const fn relay(&self) -> &RelayAddress {
        &self.relay
    }

    /// Deadline applied to each dial and handshake.
    pub const fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Dials the relay and completes the TLS handshake within the
    /// handshake deadline.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Unreachable`] when the connection or TLS
    /// handshake fails and [`TunnelError::Timeout`] when the deadline
    /// expires.
    pub async fn dial(&self) -> Result<BoxedStream, TunnelError> {
        timeout(self.deadline, self.dial_unbounded())
            .await
            .map_err(|_elapsed| TunnelError::Timeout {
                after: self.deadline,
            })?
    }

    async fn dial_unbounded(&self) -> Result<BoxedStream, TunnelError> {
        let tcp = TcpStream::connect((self.relay.host.as_str(), self.relay.port))
            .await
            .map_err(|err| TunnelError::Unreachable(format!("{}: {err}", self.relay)))?;
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(error = %err, "could not disable Nagle");
        }
        let Some(connector) = &self.tls else {
            return Ok(Box::new(tcp));
        };
        let server_name = ServerName::try_from(self.relay.host.clone()).map_err(|err| {
            TunnelError::Configuration(format!("invalid relay host {}: {err}", self.relay.host))
        })?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| TunnelError::Unreachable(format!("TLS handshake with {}: {err}", self.relay)))?;
        Ok(Box::new(stream))
    }

    /// Logs the insecure-TLS warning for a newly established session.
    pub fn warn_if_insecure(&self) {
        if self.insecure && self.tls.is_some() {
            warn!(
                relay = %self.relay,
                "relay certificate verification is disabled (insecure_skip_verify)"
            );
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn client_config(config: &TunnelConfig) -> Result<ClientConfig, TunnelError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|err| TunnelError::Configuration(format!("TLS setup failed: {err}")))?;
    if config.insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider())))
            .with_no_client_auth());
    }
    let roots = match config.ca_file.as_deref() {
        Some(path) => pinned_roots(path)?,
        None => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            roots
        }
    };
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

fn pinned_roots(path: &str) -> Result<RootCertStore, TunnelError> {
    let pem = fs::read_to_string(path).map_err(|err| {
        TunnelError::Configuration(format!("failed to read relay CA file {path}: {err}"))
    })?;
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|err| TunnelError::Configuration(format!("invalid PEM in {path}: {err}")))?;
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(TunnelError::Configuration(format!(
            "relay CA file {path} contains no usable certificates"
        )));
    }
    Ok(roots)
}

/// Accepts any relay certificate; handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ca_file: Option<String>) -> TunnelConfig {
        TunnelConfig {
            relay_url: Some(String::from("ssh+tls://relay.example.com")),
            ca_file,
            ..TunnelConfig::default()
        }
    }

    #[test]
    fn missing_ca_file_is_a_configuration_error() {
        let err = client_config(&config(Some(String::from("/nonexistent/ca.pem"))))
            .expect_err("unreadable CA");
        assert!(matches!(err, TunnelError::Configuration(_)));
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a certificate\n").expect("write");
        let err = client_config(&config(Some(path.to_string_lossy().into_owned())))
            .expect_err("no certificates");
        assert!(err.to_string().contains("no usable certificates"), "{err}");
    }

    #[tokio::test]
    async fn plain_relays_report_unreachable_when_closed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let relay: RelayAddress = format!("ssh://127.0.0.1:{port}").parse().expect("relay");
        let dialer = Dialer::new(relay, &TunnelConfig::default()).expect("dialer");
        let err = dialer.dial().await.err().expect("closed port");
        assert!(matches!(err, TunnelError::Unreachable(_)), "{err}");
    }
}
