//! Custom resource kinds and the labels used to tie their children together.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

mod deployment;
mod runner;

pub use deployment::{ActDeployment, ActDeploymentSpec, ActDeploymentStatus, TokenSecretRef};
pub use runner::{ActRunner, ActRunnerSpec, ActRunnerStatus, JobData, RunnerPhase};

/// API group of both custom kinds.
pub const GROUP: &str = "forgejo.actions.io";

/// Label carrying the Forgejo job id on runners, registration secrets and
/// execution pods.
pub const LABEL_JOB_ID: &str = "forgejo.actions.io/job-id";

/// Label tying an execution pod back to its ActRunner.
pub const LABEL_RUNNER: &str = "forgejo.actions.io/actrunner";

/// Label tying listener workloads and their pods to an ActDeployment.
pub const LABEL_DEPLOYMENT: &str = "forgejo.actions.io/actdeployment";

/// `app` label value shared by every listener pod.
pub const LISTENER_APP: &str = "forgejo-listener";

/// Condition type published on both kinds.
pub const CONDITION_READY: &str = "Ready";

/// Build a `Ready` condition.
pub fn ready_condition(
    ready: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: CONDITION_READY.to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: Time(chrono::Utc::now()),
    }
}

/// Upsert `condition` into `conditions` by type, keeping the previous
/// transition time when the status did not flip.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_replaces_by_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, ready_condition(false, "Creating", "", None));
        set_condition(&mut conditions, ready_condition(true, "Reconciled", "", Some(2)));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, ready_condition(true, "Reconciled", "", None));
        let first = conditions[0].last_transition_time.clone();
        set_condition(&mut conditions, ready_condition(true, "Reconciled", "again", None));
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "again");
    }
}
