//! Operator internals for ephemeral Forgejo Actions runners.
//!
//! Three cooperating pieces live here:
//!
//! - [`deployment`]: reconciles an [`crd::ActDeployment`] into the
//!   per-fleet infrastructure (service account, RBAC, listener workload),
//! - [`listener`]: the long-running per-deployment poller that admits
//!   waiting Forgejo jobs and emits [`crd::ActRunner`] objects,
//! - [`runner`]: reconciles each `ActRunner` into a one-shot execution pod
//!   with a Docker-in-Docker sidecar and retires it when the job finishes.

use kube::api::{PatchParams, PostParams};

pub mod crd;
pub mod deployment;
pub mod listener;
pub mod runner;
pub mod secrets;
pub mod telemetry;

mod error;

pub use error::{Error, Result};

/// Field manager recorded on every write issued by the reconcilers and the
/// listener; also used as the `app.kubernetes.io/managed-by` label value.
pub const MANAGER: &str = "act-runner-controller";

/// Patch parameters attributing the write to [`MANAGER`].
pub fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(MANAGER.to_string()),
        ..PatchParams::default()
    }
}

/// Post parameters attributing the write to [`MANAGER`].
pub fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(MANAGER.to_string()),
        ..PostParams::default()
    }
}

/// Fallback image for the listener container when a Deployment's
/// `listenerTemplate` declares no containers and no override is configured.
pub const DEFAULT_OPERATOR_IMAGE: &str =
    "codeberg.org/forgejo-contrib/act-runner-operator:latest";

/// Fallback image for the runner container of execution pods.
pub const DEFAULT_RUNNER_IMAGE: &str = "code.forgejo.org/forgejo/runner:4.0.1";

/// Fallback image for the Docker-in-Docker sidecar.
pub const DEFAULT_DIND_IMAGE: &str = "docker:27-dind";

/// Truncate an object name to the 63-character DNS label limit, making sure
/// the result still ends in an alphanumeric character.
pub fn truncate_name(name: &str) -> String {
    let mut out: String = name.chars().take(63).collect();
    while out.ends_with('-') || out.ends_with('.') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::truncate_name;

    #[test]
    fn truncate_name_keeps_short_names() {
        assert_eq!(truncate_name("runner-42-actrunner-42-0042"), "runner-42-actrunner-42-0042");
    }

    #[test]
    fn truncate_name_cuts_to_63_chars() {
        let long = "a".repeat(80);
        assert_eq!(truncate_name(&long).len(), 63);
    }

    #[test]
    fn truncate_name_never_ends_in_separator() {
        let name = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let out = truncate_name(&name);
        assert!(out.len() <= 63);
        assert!(out.ends_with('a'));
    }
}
