use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default tick period of the listener when `pollInterval` is unset.
pub const DEFAULT_POLL_INTERVAL: &str = "10s";

fn default_token_key() -> String {
    "token".to_string()
}

/// Reference to the secret holding the long-lived Forgejo API token.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenSecretRef {
    /// Name of the secret, in the ActDeployment's namespace.
    pub name: String,
    /// Key within the secret; defaults to `token`.
    #[serde(default = "default_token_key")]
    pub key: String,
}

/// Desired state of a fleet of ephemeral Forgejo Actions runners.
///
/// One ActDeployment materializes a listener workload that polls the
/// configured Forgejo organization and admits waiting jobs as ActRunners.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forgejo.actions.io",
    version = "v1alpha1",
    kind = "ActDeployment",
    namespaced,
    status = "ActDeploymentStatus",
    shortname = "actdep",
    printcolumn = r#"{"name":"Organization","type":"string","jsonPath":".spec.organization"}"#,
    printcolumn = r#"{"name":"Active","type":"integer","jsonPath":".status.activeActRunners"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ActDeploymentSpec {
    /// Absolute base URL of the Forgejo server; must start with `http://`
    /// or `https://`.
    pub forgejo_server: String,

    /// Organization whose Actions job queue is polled.
    pub organization: String,

    /// Comma-joined label filter, passed verbatim to Forgejo.
    pub labels: String,

    /// Secret holding the long-lived Forgejo API token.
    pub token_secret_ref: TokenSecretRef,

    /// Listener tick period, e.g. `10s` or `1m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,

    /// Reserved lower bound; runners are single-use so no warm pool is kept.
    #[serde(default)]
    pub min_runners: u32,

    /// Concurrency cap for non-terminal runners; `0` admits without bound.
    #[serde(default)]
    pub max_runners: u32,

    /// Template for listener pods; only labels, env, the service account
    /// and an injected default container are touched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_template: Option<PodTemplateSpec>,

    /// Template for execution pods, snapshotted into every admitted runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_template: Option<PodTemplateSpec>,

    /// Override for the runner container image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_image: Option<String>,

    /// Override for the Docker-in-Docker sidecar image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_in_docker_image: Option<String>,

    /// Config map holding a registry credential `config.json`, mounted into
    /// every runner container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_config_map_ref: Option<String>,
}

/// Observed state of an ActDeployment.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActDeploymentStatus {
    /// Name of the currently running listener pod, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listener_pod_name: Option<String>,

    /// Last time the listener completed a poll against Forgejo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_time: Option<Time>,

    /// Count of owned runners that have not reached a terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_act_runners: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ActDeployment {
    /// Poll interval string, defaulted.
    pub fn poll_interval(&self) -> &str {
        self.spec.poll_interval.as_deref().unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    /// Name shared by the listener workload, service account, role and
    /// role binding.
    pub fn listener_name(&self) -> String {
        format!("{}-listener", self.metadata.name.as_deref().unwrap_or_default())
    }

    /// Whether `forgejoServer` carries a usable scheme.
    pub fn has_valid_server_url(&self) -> bool {
        let url = &self.spec.forgejo_server;
        url.starts_with("http://") || url.starts_with("https://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::CustomResourceExt;

    fn minimal_spec() -> ActDeploymentSpec {
        serde_json::from_value(serde_json::json!({
            "forgejoServer": "https://forgejo.example.com",
            "organization": "acme",
            "labels": "docker,amd64",
            "tokenSecretRef": {"name": "forgejo-token"}
        }))
        .unwrap()
    }

    #[test]
    fn crd_name_and_subresource() {
        let crd = ActDeployment::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("actdeployments.forgejo.actions.io"));
        let version = &crd.spec.versions[0];
        assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }

    #[test]
    fn spec_defaults_apply() {
        let spec = minimal_spec();
        assert_eq!(spec.token_secret_ref.key, "token");
        assert_eq!(spec.max_runners, 0);
        assert!(spec.poll_interval.is_none());
    }

    #[test]
    fn poll_interval_defaults_to_ten_seconds() {
        let dep = ActDeployment::new("fleet", minimal_spec());
        assert_eq!(dep.poll_interval(), "10s");
        assert_eq!(dep.listener_name(), "fleet-listener");
    }

    #[test]
    fn server_url_scheme_is_validated() {
        let mut dep = ActDeployment::new("fleet", minimal_spec());
        assert!(dep.has_valid_server_url());
        dep.spec.forgejo_server = "forgejo.example.com".into();
        assert!(!dep.has_valid_server_url());
    }

    #[test]
    fn spec_round_trips_with_camel_case_keys() {
        let dep = ActDeployment::new("fleet", minimal_spec());
        let value = serde_json::to_value(&dep.spec).unwrap();
        assert!(value.get("forgejoServer").is_some());
        assert!(value.get("tokenSecretRef").is_some());
        assert_eq!(value.get("minRunners"), Some(&serde_json::json!(0)));
    }
}
