//! The ActRunner phase machine.
//!
//! ```text
//! Pending ──(pod created / observed running)──▶ Running ──▶ Succeeded
//!    ▲                                            │
//!    └────────────(pod vanished)──────────────────┤──▶ Failed
//! ```
//!
//! Terminal runners only get their registration secret cleaned up; the
//! object itself stays behind until its ActDeployment is deleted.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, ResourceExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, error, info, warn};

use crate::crd::{
    ready_condition, set_condition, ActRunner, ActRunnerStatus, RunnerPhase, LABEL_RUNNER,
};
use crate::runner::pod::build_execution_pod;
use crate::{secrets, Error, Result};

/// Shared state handed to every reconciliation.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
}

/// Map an observed pod phase onto the runner phase machine.
fn phase_from_pod(pod: &Pod) -> RunnerPhase {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => RunnerPhase::Succeeded,
        Some("Failed") => RunnerPhase::Failed,
        // Pending pods count as Running: the execution pod exists and the
        // kubelet owns it from here.
        _ => RunnerPhase::Running,
    }
}

/// Compute the status to persist for a phase/pod-name observation.
///
/// `startedAt` is stamped on the first departure from Pending and
/// `completedAt` on the first terminal transition; both survive later
/// resets so they are only ever written once.
fn next_status(
    previous: Option<&ActRunnerStatus>,
    phase: RunnerPhase,
    pod_name: Option<String>,
    now: Time,
) -> ActRunnerStatus {
    let mut status = previous.cloned().unwrap_or_default();
    status.phase = phase;
    status.kubernetes_job_name = pod_name;
    if phase != RunnerPhase::Pending && status.started_at.is_none() {
        status.started_at = Some(now.clone());
    }
    if phase.is_terminal() && status.completed_at.is_none() {
        status.completed_at = Some(now);
    }
    let condition = match phase {
        RunnerPhase::Pending => ready_condition(false, "Pending", "waiting for execution pod", None),
        RunnerPhase::Running => ready_condition(true, "Running", "execution pod is running", None),
        RunnerPhase::Succeeded => ready_condition(false, "Succeeded", "job finished", None),
        RunnerPhase::Failed => ready_condition(false, "Failed", "job failed", None),
    };
    set_condition(&mut status.conditions, condition);
    status
}

async fn patch_status(
    api: &Api<ActRunner>,
    name: &str,
    status: &ActRunnerStatus,
) -> Result<()> {
    let mut value = serde_json::to_value(status)?;
    // A cleared pod name must reach the server as an explicit null or the
    // merge patch keeps the stale reference around.
    if status.kubernetes_job_name.is_none() {
        value["kubernetesJobName"] = serde_json::Value::Null;
    }
    api.patch_status(
        name,
        &crate::patch_params(),
        &Patch::Merge(serde_json::json!({ "status": value })),
    )
    .await?;
    Ok(())
}

/// Reconcile one ActRunner.
pub async fn reconcile(runner: Arc<ActRunner>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = runner
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = runner.name_any();

    let runners: Api<ActRunner> = Api::namespaced(ctx.client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let secrets_api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let registration_secret = runner.spec.registration_token_secret_ref.clone();

    if runner.metadata.deletion_timestamp.is_some() {
        if let Err(e) = secrets::delete(&secrets_api, &registration_secret).await {
            warn!(runner = %name, secret = %registration_secret, error = %e,
                "failed to delete registration secret for deleted runner");
        }
        return Ok(Action::await_change());
    }

    let stored_phase = runner.phase();
    let stored_pod = runner
        .status
        .as_ref()
        .and_then(|s| s.kubernetes_job_name.clone());

    let mut phase = stored_phase;
    let mut pod_ref = stored_pod.clone();
    if let Some(pod_name) = &stored_pod {
        match pods.get_opt(pod_name).await? {
            Some(pod) => phase = phase_from_pod(&pod),
            None if !stored_phase.is_terminal() => {
                info!(runner = %name, pod = %pod_name,
                    "execution pod vanished, resetting runner to Pending");
                phase = RunnerPhase::Pending;
                pod_ref = None;
            }
            // A finished pod may be garbage-collected at any point; the
            // runner stays terminal and the job is never re-run.
            None => {}
        }
    }

    if phase != stored_phase || pod_ref != stored_pod {
        let status = next_status(runner.status.as_ref(), phase, pod_ref.clone(), now());
        patch_status(&runners, &name, &status).await?;
        if phase != stored_phase {
            info!(runner = %name, from = %stored_phase, to = %phase, "runner phase changed");
        }
    }

    match phase {
        RunnerPhase::Pending => {
            create_execution_pod(&runner, &runners, &pods, &name).await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        RunnerPhase::Running => Ok(Action::requeue(Duration::from_secs(10))),
        RunnerPhase::Succeeded | RunnerPhase::Failed => {
            secrets::delete(&secrets_api, &registration_secret).await?;
            Ok(Action::await_change())
        }
    }
}

/// Create the execution pod, aligning to a pre-existing one instead of
/// failing when a previous attempt already went through.
async fn create_execution_pod(
    runner: &ActRunner,
    runners: &Api<ActRunner>,
    pods: &Api<Pod>,
    name: &str,
) -> Result<()> {
    let pod = build_execution_pod(runner)?;
    let pod_name = pod
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let (observed, created) = match pods.create(&crate::post_params(), &pod).await {
        Ok(created) => (created, true),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(runner = %name, pod = %pod_name, "execution pod already exists, aligning status");
            (pods.get(&pod_name).await?, false)
        }
        Err(e) => return Err(e.into()),
    };

    let phase = if created {
        RunnerPhase::Running
    } else {
        phase_from_pod(&observed)
    };
    let status = next_status(runner.status.as_ref(), phase, Some(pod_name.clone()), now());
    patch_status(runners, name, &status).await?;
    if created {
        info!(runner = %name, pod = %pod_name, "created execution pod");
    }
    Ok(())
}

fn now() -> Time {
    Time(chrono::Utc::now())
}

/// Requeue on errors; the apiserver-side causes are all transient.
pub fn error_policy(runner: Arc<ActRunner>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(runner = %runner.name_any(), %error, "runner reconciliation failed");
    Action::requeue(Duration::from_secs(5))
}

/// Run the runner controller until shutdown.
pub async fn run(client: Client) {
    let runners = Api::<ActRunner>::all(client.clone());
    if let Err(e) = runners.list(&ListParams::default().limit(1)).await {
        error!(error = %e, "ActRunner CRD is not queryable; is it installed?");
        std::process::exit(1);
    }

    let pods = Api::<Pod>::all(client.clone());
    let ctx = Arc::new(Context { client });

    Controller::new(runners, watcher::Config::default())
        .owns(pods, watcher::Config::default().labels(LABEL_RUNNER))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "reconciled runner"),
                Err(e) => warn!(error = %e, "runner reconcile failed"),
            }
        })
        .await;
}
