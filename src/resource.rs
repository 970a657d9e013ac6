//! Typed vocabulary shared by every backend: environments, machines,
//! snapshots, key pairs and the tagged union the teardown flows operate on.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::DriverError;

/// Longest identifier accepted by DNS labels and most provider name fields.
pub const MAX_ENVIRONMENT_ID_LEN: usize = 63;

/// Marker shown in listings for machines created without an environment tag.
pub const UNTAGGED_MARKER: &str = "untagged";

const HASH_SUFFIX_LEN: usize = 8;

/// Normalizes `raw` into a lowercase DNS label of at most `max_len` bytes.
///
/// Characters outside `[a-z0-9]` collapse into single dashes and leading or
/// trailing dashes are dropped. Inputs that would exceed `max_len` are cut
/// and suffixed with a short SHA-256 digest of the full label so distinct
/// long inputs stay distinct. Returns `None` when nothing usable remains.
#[must_use]
pub fn dns_label(raw: &str, max_len: usize) -> Option<String> {
    let mut label = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_lowercase() || lower.is_ascii_digit() {
            if pending_dash && !label.is_empty() {
                label.push('-');
            }
            pending_dash = false;
            label.push(lower);
        } else {
            pending_dash = true;
        }
    }

    if label.is_empty() {
        return None;
    }
    if label.len() <= max_len {
        return Some(label);
    }

    let digest = hex::encode(Sha256::digest(label.as_bytes()));
    let suffix = digest.get(..HASH_SUFFIX_LEN).unwrap_or(digest.as_str());
    let keep = max_len.saturating_sub(HASH_SUFFIX_LEN + 1);
    let mut head: String = label.chars().take(keep).collect();
    while head.ends_with('-') {
        head.pop();
    }
    Some(format!("{head}-{suffix}"))
}

/// Stable identifier tagging every resource of one preview environment.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Normalizes a raw project name or explicit id.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Configuration`] when the input contains no
    /// usable characters.
    pub fn normalize(raw: &str) -> Result<Self, DriverError> {
        dns_label(raw, MAX_ENVIRONMENT_ID_LEN)
            .map(Self)
            .ok_or_else(|| {
                DriverError::Configuration(format!(
                    "'{raw}' cannot be used as an environment id: it must contain letters or digits"
                ))
            })
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EnvironmentId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Host and port a machine can be reached on.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct Address {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Creates an address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One provisioned compute unit.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Machine {
    /// Provider native identifier.
    pub id: String,
    /// Environment the machine belongs to; `None` for untagged machines.
    pub environment_id: Option<EnvironmentId>,
    /// Creation timestamp reported by the provider.
    pub created_at: DateTime<Utc>,
    /// Reachable address, when the backend exposes one.
    pub address: Option<Address>,
    /// Region, zone or namespace.
    pub region: String,
    /// Provider instance type or workload image.
    pub instance_type: Option<String>,
    /// Human readable status.
    pub status: String,
    /// Key pair the machine was provisioned with.
    pub key_pair_id: Option<String>,
}

impl Machine {
    /// Returns `true` when the machine carries no environment tag.
    #[must_use]
    pub const fn is_untagged(&self) -> bool {
        self.environment_id.is_none()
    }

    /// Returns `true` when the machine belongs to `environment_id`.
    #[must_use]
    pub fn belongs_to(&self, environment_id: &EnvironmentId) -> bool {
        self.environment_id.as_ref() == Some(environment_id)
    }
}

/// Provider-side image of a machine's disk.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Snapshot {
    /// Provider native identifier.
    pub id: String,
    /// Environment whose machine was captured.
    pub environment_id: Option<EnvironmentId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Size in bytes, when reported.
    pub size_bytes: Option<u64>,
    /// Region or zone holding the snapshot.
    pub region: String,
}

/// Credential artifact used to reach machines.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct KeyPair {
    /// Provider handle.
    pub id: String,
    /// Display name (`prevue-<profile>`).
    pub name: String,
    /// Fingerprint or public key summary.
    pub fingerprint: Option<String>,
    /// Creation timestamp, when reported.
    pub created_at: Option<DateTime<Utc>>,
}

/// Discriminant of [`DeletableResource`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// A [`Machine`].
    Machine,
    /// A [`Snapshot`].
    Snapshot,
    /// A [`KeyPair`].
    KeyPair,
}

impl ResourceKind {
    /// Stable label used in listings and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Machine => "machine",
            Self::Snapshot => "snapshot",
            Self::KeyPair => "key-pair",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection of resource kinds for listing and purging.
///
/// The empty selection is valid and selects nothing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResourceKinds {
    /// Include machines.
    pub machines: bool,
    /// Include snapshots.
    pub snapshots: bool,
    /// Include key pairs.
    pub key_pairs: bool,
}

impl ResourceKinds {
    /// Selects every kind.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            machines: true,
            snapshots: true,
            key_pairs: true,
        }
    }

    /// Selects nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            machines: false,
            snapshots: false,
            key_pairs: false,
        }
    }

    /// Selects a single kind.
    #[must_use]
    pub const fn only(kind: ResourceKind) -> Self {
        Self {
            machines: matches!(kind, ResourceKind::Machine),
            snapshots: matches!(kind, ResourceKind::Snapshot),
            key_pairs: matches!(kind, ResourceKind::KeyPair),
        }
    }

    /// Returns `true` when no kind is selected.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.machines && !self.snapshots && !self.key_pairs
    }

    /// Returns `true` when `kind` is selected.
    #[must_use]
    pub const fn contains(self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Machine => self.machines,
            ResourceKind::Snapshot => self.snapshots,
            ResourceKind::KeyPair => self.key_pairs,
        }
    }

    /// Selected kinds in teardown order: machines, snapshots, key pairs.
    #[must_use]
    pub fn kinds(self) -> Vec<ResourceKind> {
        [
            ResourceKind::Machine,
            ResourceKind::Snapshot,
            ResourceKind::KeyPair,
        ]
        .into_iter()
        .filter(|kind| self.contains(*kind))
        .collect()
    }
}

/// Kind plus native id; enough to name a resource in reports.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ResourceRef {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Native identifier.
    pub id: String,
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Heterogeneous resource the purge and down flows delete.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeletableResource {
    /// A machine.
    Machine(Machine),
    /// A snapshot.
    Snapshot(Snapshot),
    /// A key pair.
    KeyPair(KeyPair),
}

impl DeletableResource {
    /// Returns the discriminant.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::Machine(_) => ResourceKind::Machine,
            Self::Snapshot(_) => ResourceKind::Snapshot,
            Self::KeyPair(_) => ResourceKind::KeyPair,
        }
    }

    /// Returns the native identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Machine(machine) => &machine.id,
            Self::Snapshot(snapshot) => &snapshot.id,
            Self::KeyPair(key_pair) => &key_pair.id,
        }
    }

    /// Returns the environment tag, if the kind carries one.
    #[must_use]
    pub const fn environment_id(&self) -> Option<&EnvironmentId> {
        match self {
            Self::Machine(machine) => machine.environment_id.as_ref(),
            Self::Snapshot(snapshot) => snapshot.environment_id.as_ref(),
            Self::KeyPair(_) => None,
        }
    }

    /// Returns a kind/id reference for reports.
    #[must_use]
    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            kind: self.kind(),
            id: self.id().to_owned(),
        }
    }

    /// Projects the resource onto the listing columns.
    #[must_use]
    pub fn row(&self) -> ResourceRow {
        match self {
            Self::Machine(machine) => ResourceRow::from(machine),
            Self::Snapshot(snapshot) => ResourceRow {
                kind: ResourceKind::Snapshot,
                id: snapshot.id.clone(),
                environment_id: environment_label(snapshot.environment_id.as_ref()),
                created_at: Some(timestamp(snapshot.created_at)),
                region: snapshot.region.clone(),
                status: String::from("available"),
            },
            Self::KeyPair(key_pair) => ResourceRow {
                kind: ResourceKind::KeyPair,
                id: key_pair.id.clone(),
                environment_id: String::from("-"),
                created_at: key_pair.created_at.map(timestamp),
                region: String::from("global"),
                status: String::from("active"),
            },
        }
    }
}

/// One listing row with a stable set of named columns.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ResourceRow {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Native identifier.
    pub id: String,
    /// Environment id, `untagged`, or `-` for unscoped kinds.
    pub environment_id: String,
    /// RFC 3339 creation timestamp.
    pub created_at: Option<String>,
    /// Region, zone or namespace.
    pub region: String,
    /// Human readable status.
    pub status: String,
}

impl From<&Machine> for ResourceRow {
    fn from(machine: &Machine) -> Self {
        Self {
            kind: ResourceKind::Machine,
            id: machine.id.clone(),
            environment_id: environment_label(machine.environment_id.as_ref()),
            created_at: Some(timestamp(machine.created_at)),
            region: machine.region.clone(),
            status: machine.status.clone(),
        }
    }
}

fn environment_label(environment_id: Option<&EnvironmentId>) -> String {
    environment_id.map_or_else(
        || String::from(UNTAGGED_MARKER),
        |id| id.as_str().to_owned(),
    )
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Optional sizing overrides passed to provisioning.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SizingHints {
    /// Instance type or pod resource class override.
    pub instance_type: Option<String>,
    /// Image label override.
    pub image: Option<String>,
}

/// How the execution router and tunnel client authenticate to a machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthMethod {
    /// OpenSSH with a private key file.
    Ssh {
        /// Remote user.
        user: String,
        /// Private key path; `None` lets the client pick its defaults.
        identity_file: Option<String>,
    },
    /// `kubectl exec` into the first pod of a deployment.
    KubeExec {
        /// Namespace holding the deployment.
        namespace: String,
        /// Deployment name.
        deployment: String,
        /// Container to exec into.
        container: String,
        /// Optional kubeconfig context.
        context: Option<String>,
    },
    /// Commands run on the local host through `sh -c`.
    Local,
}

/// Everything needed to reach a machine. Building it never opens a
/// connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionParams {
    /// Native id of the target machine.
    pub machine_id: String,
    /// Network address, when the transport dials one directly.
    pub address: Option<Address>,
    /// Authentication and transport selection.
    pub auth: AuthMethod,
    /// Whether the transport accepts an attached input stream.
    pub interactive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("My Project", "my-project")]
    #[case("  --proj__abc123--  ", "proj-abc123")]
    #[case("Émile's App", "mile-s-app")]
    #[case("already-ok", "already-ok")]
    fn normalize_produces_dns_labels(#[case] raw: &str, #[case] expected: &str) {
        let id = EnvironmentId::normalize(raw).expect("normalizes");
        assert_eq!(id.as_str(), expected);
    }

    #[test]
    fn normalize_rejects_inputs_without_usable_characters() {
        let err = EnvironmentId::normalize("__--__").expect_err("should fail");
        assert!(matches!(err, DriverError::Configuration(_)));
    }

    #[test]
    fn long_inputs_are_bounded_and_stay_distinct() {
        let base = "a".repeat(80);
        let first = EnvironmentId::normalize(&format!("{base}-one")).expect("first");
        let second = EnvironmentId::normalize(&format!("{base}-two")).expect("second");
        assert!(first.as_str().len() <= MAX_ENVIRONMENT_ID_LEN);
        assert!(second.as_str().len() <= MAX_ENVIRONMENT_ID_LEN);
        assert_ne!(first, second);
    }

    #[test]
    fn resource_kinds_order_machines_first() {
        assert_eq!(
            ResourceKinds::all().kinds(),
            vec![
                ResourceKind::Machine,
                ResourceKind::Snapshot,
                ResourceKind::KeyPair
            ]
        );
        assert!(ResourceKinds::none().is_empty());
        assert!(ResourceKinds::only(ResourceKind::Snapshot).contains(ResourceKind::Snapshot));
    }

    #[test]
    fn untagged_machines_render_marker() {
        let machine = Machine {
            id: String::from("srv-1"),
            environment_id: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            address: None,
            region: String::from("fr-par-1"),
            instance_type: None,
            status: String::from("running"),
            key_pair_id: None,
        };
        let row = DeletableResource::Machine(machine).row();
        assert_eq!(row.environment_id, UNTAGGED_MARKER);
        assert_eq!(row.created_at.as_deref(), Some("1970-01-01T00:00:00Z"));
    }

    #[test]
    fn address_brackets_ipv6_hosts() {
        assert_eq!(Address::new("::1", 22).to_string(), "[::1]:22");
        assert_eq!(Address::new("10.0.0.1", 22).to_string(), "10.0.0.1:22");
    }
}
