//! Relay addresses and deterministic binding hostnames.

use std::fmt;
use std::str::FromStr;

use reqwest::Url;

use super::TunnelError;
use crate::resource::{EnvironmentId, MAX_ENVIRONMENT_ID_LEN, dns_label};

/// How the control stream is secured.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelayScheme {
    /// `ssh+tls://`: TLS on top of TCP, default port 443.
    SshTls,
    /// `ssh://`: plain TCP, default port 22.
    Ssh,
}

impl RelayScheme {
    const fn default_port(self) -> u16 {
        match self {
            Self::SshTls => 443,
            Self::Ssh => 22,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::SshTls => "ssh+tls",
            Self::Ssh => "ssh",
        }
    }
}

/// Parsed relay location.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayAddress {
    /// Transport security.
    pub scheme: RelayScheme,
    /// Relay host name or IP literal.
    pub host: String,
    /// Relay port.
    pub port: u16,
}

impl FromStr for RelayAddress {
    type Err = TunnelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            TunnelError::Configuration(format!(
                "invalid relay URL '{raw}': {reason} (set PREVUE_TUNNEL_RELAY_URL or relay_url)"
            ))
        };
        let url = Url::parse(raw.trim()).map_err(|err| invalid(&err.to_string()))?;
        let scheme = match url.scheme() {
            "ssh+tls" => RelayScheme::SshTls,
            "ssh" => RelayScheme::Ssh,
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        Ok(Self {
            scheme,
            host,
            port: url.port().unwrap_or(scheme.default_port()),
        })
    }
}

impl fmt::Display for RelayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

/// Hostname label the relay publishes for one service port.
///
/// The same inputs always give the same label; distinct inputs give
/// distinct labels, with a hashed suffix once the label gets too long.
#[must_use]
pub fn hostname_label(environment_id: &EnvironmentId, service: &str, port: u16) -> String {
    let raw = format!("{service}-{port}-{environment_id}");
    dns_label(&raw, MAX_ENVIRONMENT_ID_LEN).unwrap_or_else(|| format!("{port}-{environment_id}"))
}
