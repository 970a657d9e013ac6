//! Object manifests and label conventions for the pod backend.

use serde_json::{Value, json};

use crate::resource::{EnvironmentId, MAX_ENVIRONMENT_ID_LEN, dns_label};

pub(super) const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub(super) const MANAGED_BY: &str = "prevue";
pub(super) const ENVIRONMENT_LABEL: &str = "prevue.dev/environment-id";
pub(super) const KEY_PAIR_LABEL: &str = "prevue.dev/key-pair";
pub(super) const KEY_PAIR_NAME_LABEL: &str = "prevue.dev/key-pair-name";
pub(super) const INSTANCE_TYPE_ANNOTATION: &str = "prevue.dev/instance-type";
pub(super) const CONTAINER_NAME: &str = "workspace";
const KEY_PAIR_MOUNT: &str = "/var/run/prevue";
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Selector matching every managed deployment.
pub(super) fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY}")
}

/// Selector matching one environment.
pub(super) fn environment_selector(environment_id: &EnvironmentId) -> String {
    format!("{},{ENVIRONMENT_LABEL}={environment_id}", managed_selector())
}

/// Selector matching key pair secrets.
pub(super) fn key_pair_selector() -> String {
    format!("{},{KEY_PAIR_LABEL}=true", managed_selector())
}

/// Deployment name for an environment.
pub(super) fn deployment_name(environment_id: &EnvironmentId) -> String {
    let raw = format!("prevue-{environment_id}");
    dns_label(&raw, MAX_ENVIRONMENT_ID_LEN).unwrap_or(raw)
}

/// Secret name for the profile key pair. It doubles as a label value, so
/// arbitrary profile names are folded into a DNS label.
pub(super) fn key_pair_name(profile: &str) -> String {
    dns_label(&format!("{MANAGED_BY}-{profile}"), MAX_LABEL_VALUE_LEN)
        .unwrap_or_else(|| MANAGED_BY.to_owned())
}

/// Inputs for [`deployment`].
pub(super) struct DeploymentSpec<'a> {
    pub(super) name: &'a str,
    pub(super) environment_id: &'a EnvironmentId,
    pub(super) image: &'a str,
    pub(super) key_pair: &'a str,
    pub(super) instance_type: Option<&'a str>,
}

/// Single-replica deployment that keeps a shell container alive.
pub(super) fn deployment(spec: &DeploymentSpec<'_>) -> Value {
    let labels = json!({
        MANAGED_BY_LABEL: MANAGED_BY,
        ENVIRONMENT_LABEL: spec.environment_id.as_str(),
        KEY_PAIR_NAME_LABEL: spec.key_pair,
    });
    let mut annotations = serde_json::Map::new();
    if let Some(instance_type) = spec.instance_type {
        annotations.insert(
            INSTANCE_TYPE_ANNOTATION.to_owned(),
            Value::String(instance_type.to_owned()),
        );
    }
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": spec.name,
            "labels": labels,
            "annotations": annotations,
        },
        "spec": {
            "replicas": 1,
            "selector": {
                "matchLabels": {
                    MANAGED_BY_LABEL: MANAGED_BY,
                    ENVIRONMENT_LABEL: spec.environment_id.as_str(),
                }
            },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": CONTAINER_NAME,
                        "image": spec.image,
                        "command": ["sleep", "infinity"],
                        "volumeMounts": [{
                            "name": "key-pair",
                            "mountPath": KEY_PAIR_MOUNT,
                            "readOnly": true,
                        }],
                    }],
                    "volumes": [{
                        "name": "key-pair",
                        "secret": { "secretName": spec.key_pair },
                    }],
                }
            }
        }
    })
}

/// Opaque secret standing in for the profile key pair.
pub(super) fn key_pair_secret(name: &str, profile: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": name,
            "labels": {
                MANAGED_BY_LABEL: MANAGED_BY,
                KEY_PAIR_LABEL: "true",
            },
        },
        "stringData": { "profile": profile },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_selector_matches_pod_labels() {
        let environment_id = EnvironmentId::normalize("proj-abc123").expect("id");
        let manifest = deployment(&DeploymentSpec {
            name: "prevue-proj-abc123",
            environment_id: &environment_id,
            image: "ubuntu:24.04",
            key_pair: "prevue-default",
            instance_type: Some("small"),
        });
        let selector = &manifest["spec"]["selector"]["matchLabels"];
        let pod_labels = &manifest["spec"]["template"]["metadata"]["labels"];
        assert_eq!(selector[ENVIRONMENT_LABEL], pod_labels[ENVIRONMENT_LABEL]);
        assert_eq!(selector[MANAGED_BY_LABEL], "prevue");
        assert_eq!(
            manifest["spec"]["template"]["spec"]["volumes"][0]["secret"]["secretName"],
            "prevue-default"
        );
        assert_eq!(
            manifest["metadata"]["annotations"][INSTANCE_TYPE_ANNOTATION],
            "small"
        );
    }

    #[test]
    fn long_deployment_names_stay_valid_labels() {
        let environment_id = EnvironmentId::normalize(&"x".repeat(63)).expect("id");
        let name = deployment_name(&environment_id);
        assert!(name.len() <= MAX_ENVIRONMENT_ID_LEN);
        assert!(name.starts_with("prevue-"));
    }

    #[test]
    fn key_pair_names_are_valid_label_values() {
        assert_eq!(key_pair_name("default"), "prevue-default");
        assert_eq!(key_pair_name("Team A/staging"), "prevue-team-a-staging");
        let long = key_pair_name(&"p".repeat(120));
        assert!(long.len() <= MAX_LABEL_VALUE_LEN);
        assert_ne!(long, key_pair_name(&"p".repeat(121)));
        assert_eq!(key_pair_name("///"), "prevue");
    }

    #[test]
    fn selectors_scope_to_managed_objects() {
        let environment_id = EnvironmentId::normalize("demo").expect("id");
        assert_eq!(
            environment_selector(&environment_id),
            "app.kubernetes.io/managed-by=prevue,prevue.dev/environment-id=demo"
        );
        assert!(key_pair_selector().ends_with("prevue.dev/key-pair=true"));
    }
}
