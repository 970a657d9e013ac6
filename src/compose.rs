//! Reads the project name and published ports from a compose file.
//!
//! Only the parts the environment flow consumes are parsed: the top-level
//! `name:` and each service's `ports:` in short (`"8080:80"`) or long
//! (`{ target, published }`) syntax. Everything else is ignored.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use thiserror::Error;

use crate::error::DriverError;
use crate::fs;
use crate::tunnel::ServicePort;

/// File names tried in order when no compose file is given.
pub const COMPOSE_FILE_NAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Errors raised while reading a compose file.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ComposeError {
    /// The file could not be read.
    #[error("failed to read compose file {path}: {message}")]
    Read {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying failure.
        message: String,
    },
    /// The YAML did not parse.
    #[error("invalid compose file {path}: {message}")]
    Parse {
        /// File path.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },
    /// A port entry is malformed.
    #[error("service '{service}' has an invalid port '{entry}'")]
    InvalidPort {
        /// Service declaring the port.
        service: String,
        /// Offending entry as written.
        entry: String,
    },
}

impl From<ComposeError> for DriverError {
    fn from(err: ComposeError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Services and project name declared by a compose file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ComposeProject {
    /// Top-level `name:`.
    pub name: Option<String>,
    /// Published ports, ordered by service then port, without duplicates.
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
struct RawCompose {
    name: Option<String>,
    #[serde(default)]
    services: BTreeMap<String, RawService>,
}

#[derive(Debug, Default, Deserialize)]
struct RawService {
    #[serde(default)]
    ports: Vec<RawPort>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Short(String),
    Long {
        target: u16,
        published: Option<PublishedPort>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PublishedPort {
    Number(u16),
    Text(String),
}

impl ComposeProject {
    /// Finds the first conventional compose file in `dir`.
    #[must_use]
    pub fn locate(dir: &Utf8Path) -> Option<Utf8PathBuf> {
        COMPOSE_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| fs::exists(candidate.as_str()))
    }

    /// Reads and parses `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError`] when the file is unreadable or malformed.
    pub fn load(path: &Utf8Path) -> Result<Self, ComposeError> {
        let contents = fs::read_to_string(path.as_str()).map_err(|message| ComposeError::Read {
            path: path.to_owned(),
            message,
        })?;
        Self::parse(&contents).map_err(|err| match err {
            ComposeError::Parse { message, .. } => ComposeError::Parse {
                path: path.to_owned(),
                message,
            },
            other => other,
        })
    }

    /// Parses compose YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::Parse`] for invalid YAML and
    /// [`ComposeError::InvalidPort`] for malformed port entries.
    pub fn parse(contents: &str) -> Result<Self, ComposeError> {
        let raw: RawCompose =
            serde_yaml::from_str(contents).map_err(|err| ComposeError::Parse {
                path: Utf8PathBuf::new(),
                message: err.to_string(),
            })?;
        let mut ports = Vec::new();
        for (service, definition) in &raw.services {
            for entry in &definition.ports {
                for port in published_ports(entry)
                    .ok_or_else(|| ComposeError::InvalidPort {
                        service: service.clone(),
                        entry: describe(entry),
                    })?
                {
                    ports.push(ServicePort::new(service.clone(), port));
                }
            }
        }
        ports.sort();
        ports.dedup();
        Ok(Self {
            name: raw.name.filter(|name| !name.trim().is_empty()),
            ports,
        })
    }
}

fn describe(entry: &RawPort) -> String {
    match entry {
        RawPort::Number(port) => port.to_string(),
        RawPort::Short(text) => text.clone(),
        RawPort::Long { target, published } => match published {
            Some(PublishedPort::Number(port)) => format!("{port}:{target}"),
            Some(PublishedPort::Text(text)) => format!("{text}:{target}"),
            None => target.to_string(),
        },
    }
}

/// Host-side ports an entry publishes. An entry without a host port
/// exposes its container port.
fn published_ports(entry: &RawPort) -> Option<Vec<u16>> {
    match entry {
        RawPort::Number(port) => nonzero(*port).map(|port| vec![port]),
        RawPort::Long { target, published } => match published {
            Some(PublishedPort::Number(port)) => nonzero(*port).map(|port| vec![port]),
            Some(PublishedPort::Text(text)) => port_range(text),
            None => nonzero(*target).map(|port| vec![port]),
        },
        RawPort::Short(text) => {
            let without_protocol = text.split_once('/').map_or(text.as_str(), |(ports, _)| ports);
            // `[ip:]host:container`; the IP may be a bracketed IPv6 literal.
            let parts: Vec<&str> = without_protocol.rsplitn(3, ':').collect();
            match parts.as_slice() {
                [container] => port_range(container),
                [_container, host, ..] if host.is_empty() => None,
                [_container, host, ..] => port_range(host),
                [] => None,
            }
        }
    }
}

fn port_range(text: &str) -> Option<Vec<u16>> {
    let text = text.trim();
    let (start, end) = match text.split_once('-') {
        Some((start, end)) => (start.parse::<u16>().ok()?, end.parse::<u16>().ok()?),
        None => {
            let port = text.parse::<u16>().ok()?;
            (port, port)
        }
    };
    if start == 0 || end < start {
        return None;
    }
    Some((start..=end).collect())
}

const fn nonzero(port: u16) -> Option<u16> {
    if port == 0 { None } else { Some(port) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn reads_name_and_published_ports() {
        let project = ComposeProject::parse(
            r#"
name: shop
services:
  web:
    image: nginx
    ports:
      - "8080:80"
  api:
    ports:
      - 3000
      - target: 9000
        published: "9001"
  db:
    image: postgres
"#,
        )
        .expect("parse");
        assert_eq!(project.name.as_deref(), Some("shop"));
        assert_eq!(project.ports, vec![
            ServicePort::new("api", 3000),
            ServicePort::new("api", 9001),
            ServicePort::new("web", 8080),
        ]);
    }

    #[rstest]
    #[case("8080", vec![8080])]
    #[case("127.0.0.1:8080:80", vec![8080])]
    #[case("8080:80/udp", vec![8080])]
    #[case("8000-8002:8000-8002", vec![8000, 8001, 8002])]
    #[case("[::1]:5432:5432", vec![5432])]
    fn short_syntax_yields_host_ports(#[case] entry: &str, #[case] expected: Vec<u16>) {
        assert_eq!(
            published_ports(&RawPort::Short(entry.to_owned())),
            Some(expected)
        );
    }

    #[rstest]
    #[case("abc")]
    #[case("0")]
    #[case("9000-8000")]
    #[case(":80")]
    fn malformed_ports_are_reported(#[case] entry: &str) {
        let yaml = format!("services:\n  web:\n    ports:\n      - \"{entry}\"\n");
        let err = ComposeProject::parse(&yaml).expect_err("invalid port");
        assert_eq!(err, ComposeError::InvalidPort {
            service: String::from("web"),
            entry: entry.to_owned(),
        });
    }

    #[test]
    fn locate_prefers_compose_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8Path::from_path(dir.path()).expect("utf8 tempdir");
        assert_eq!(ComposeProject::locate(root), None);
        std::fs::write(root.join("docker-compose.yml"), "services: {}\n").expect("write");
        std::fs::write(root.join("compose.yaml"), "services: {}\n").expect("write");
        assert_eq!(ComposeProject::locate(root), Some(root.join("compose.yaml")));
    }

    #[test]
    fn load_reports_the_path_of_broken_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8Path::from_path(dir.path()).expect("utf8 tempdir");
        let path = root.join("compose.yaml");
        std::fs::write(&path, "services: [unclosed\n").expect("write");
        let err = ComposeProject::load(&path).expect_err("invalid yaml");
        assert!(matches!(err, ComposeError::Parse { path: ref reported, .. } if *reported == path));
    }
}
