use std::fmt;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::deployment::TokenSecretRef;

/// Lifecycle phase of an ActRunner.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RunnerPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunnerPhase {
    /// Terminal phases require no further work besides cleanup.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerPhase::Succeeded | RunnerPhase::Failed)
    }
}

impl fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerPhase::Pending => "Pending",
            RunnerPhase::Running => "Running",
            RunnerPhase::Succeeded => "Succeeded",
            RunnerPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of the Forgejo job payload taken at admission.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub id: i64,
    #[serde(default)]
    pub repo_id: i64,
    #[serde(default)]
    pub owner_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs_on: Vec<String>,
    #[serde(default)]
    pub task_id: i64,
    #[serde(default)]
    pub status: String,
}

/// A single admitted Forgejo job and the pod that will execute it.
///
/// ActRunners are created by the listener, owned by their ActDeployment and
/// single-use: once the execution pod reaches a terminal phase the runner
/// stays behind as a record and is garbage-collected with its owner.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forgejo.actions.io",
    version = "v1alpha1",
    kind = "ActRunner",
    namespaced,
    status = "ActRunnerStatus",
    shortname = "actr",
    printcolumn = r#"{"name":"Job","type":"integer","jsonPath":".spec.forgejoJobID"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".status.kubernetesJobName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ActRunnerSpec {
    /// Forgejo job id; unique among the runners of one ActDeployment.
    #[serde(rename = "forgejoJobID")]
    pub forgejo_job_id: i64,

    /// Base URL of the Forgejo server, copied from the owning deployment.
    pub forgejo_server: String,

    /// Organization the job belongs to.
    pub organization: String,

    /// Secret holding the long-lived Forgejo API token.
    pub token_secret_ref: TokenSecretRef,

    /// Name of the short-lived secret holding the registration token.
    pub registration_token_secret_ref: String,

    /// Override for the runner container image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_image: Option<String>,

    /// Override for the Docker-in-Docker sidecar image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_in_docker_image: Option<String>,

    /// Config map with a registry credential `config.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_config_map_ref: Option<String>,

    /// Snapshot of the admitted job.
    pub job_data: JobData,

    /// Pod template copied from the owning deployment at admission time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_template: Option<PodTemplateSpec>,
}

/// Observed state of an ActRunner.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActRunnerStatus {
    #[serde(default)]
    pub phase: RunnerPhase,

    /// Name of the execution pod, set when one has been created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_job_name: Option<String>,

    /// Stamped once, on the first transition to Running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,

    /// Stamped once, on the first transition to a terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Time>,

    /// Repository full name, when metadata enrichment succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_user: Option<String>,

    /// Human-readable ref of the triggering run, e.g. a branch name.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ActRunner {
    /// Current phase; an absent status means Pending.
    pub fn phase(&self) -> RunnerPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether this runner has reached a terminal phase.
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Deterministic runner name for a job id.
    pub fn name_for_job(job_id: i64) -> String {
        crate::truncate_name(&format!("actrunner-{job_id}-{job_id:04}"))
    }
}
