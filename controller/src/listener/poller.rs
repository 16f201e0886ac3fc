//! The poll loop: one tick reloads the deployment, propagates spec drift to
//! Pending runners, and admits waiting Forgejo jobs under the concurrency
//! cap.
//!
//! A tick is strictly sequential; the cap is enforced against the in-memory
//! owned count and the server's name uniqueness (runner names derive from
//! the job id) makes cross-tick races collapse into `already exists`.

use std::collections::BTreeMap;

use forgejo_client::{ActionJob, ActionRun, Repository};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, ResourceExt};
use kube::Resource;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{
    ActDeployment, ActRunner, ActRunnerSpec, JobData, RunnerPhase, LABEL_DEPLOYMENT, LABEL_JOB_ID,
};
use crate::listener::config::ListenerConfig;
use crate::secrets;
use crate::{Error, Result};

/// Long-running poller for one ActDeployment.
pub struct Poller {
    kube: kube::Client,
    forgejo: forgejo_client::Client,
    config: ListenerConfig,
}

/// Does `meta` carry an owner reference to the given uid?
fn owned_by(meta: &kube::api::ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|owner| owner.uid == owner_uid)
}

/// Decide which of `jobs` to admit this tick.
///
/// Jobs that already have a runner are skipped; the rest are admitted in
/// Forgejo's order until the non-terminal owned count reaches the cap.
/// `max_runners == 0` admits without bound.
fn plan_admissions<'j>(
    jobs: &'j [ActionJob],
    owned: &[ActRunner],
    max_runners: u32,
) -> Vec<&'j ActionJob> {
    let mut active = owned.iter().filter(|r| !r.is_terminal()).count();
    let mut admitted = Vec::new();
    for job in jobs {
        if owned.iter().any(|r| r.spec.forgejo_job_id == job.id) {
            continue;
        }
        if max_runners > 0 && active >= max_runners as usize {
            break;
        }
        admitted.push(job);
        active += 1;
    }
    admitted
}

/// Compute the updated spec for a runner whose deployment drifted.
///
/// Only Pending runners are ever rewritten: a Running pod already embeds
/// the old configuration and must be allowed to finish with it. Pending
/// runners additionally get their template snapshot refreshed.
fn drifted_spec(deployment: &ActDeployment, runner: &ActRunner) -> Option<ActRunnerSpec> {
    if runner.phase() != RunnerPhase::Pending {
        return None;
    }
    let mut spec = runner.spec.clone();
    let mut changed = false;
    if spec.runner_image != deployment.spec.runner_image {
        spec.runner_image = deployment.spec.runner_image.clone();
        changed = true;
    }
    if spec.docker_in_docker_image != deployment.spec.docker_in_docker_image {
        spec.docker_in_docker_image = deployment.spec.docker_in_docker_image.clone();
        changed = true;
    }
    if spec.docker_config_map_ref != deployment.spec.docker_config_map_ref {
        spec.docker_config_map_ref = deployment.spec.docker_config_map_ref.clone();
        changed = true;
    }
    if spec.job_template != deployment.spec.runner_template {
        spec.job_template = deployment.spec.runner_template.clone();
        changed = true;
    }
    changed.then_some(spec)
}

fn job_data_from(job: &ActionJob) -> JobData {
    JobData {
        id: job.id,
        repo_id: job.repo_id,
        owner_id: job.owner_id,
        name: job.name.clone(),
        needs: job.needs.clone(),
        runs_on: job.runs_on.clone(),
        task_id: job.task_id,
        status: job.status.clone(),
    }
}

/// Build the ActRunner for an admitted job.
///
/// The template is copied verbatim from the deployment; the runner
/// controller injects a default container at pod construction, which keeps
/// re-running a tick write-free when nothing changed.
fn build_runner(
    deployment: &ActDeployment,
    job: &ActionJob,
    registration_secret: &str,
) -> Result<ActRunner> {
    let deployment_name = deployment
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let owner_ref = deployment
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    let mut runner = ActRunner::new(
        &ActRunner::name_for_job(job.id),
        ActRunnerSpec {
            forgejo_job_id: job.id,
            forgejo_server: deployment.spec.forgejo_server.clone(),
            organization: deployment.spec.organization.clone(),
            token_secret_ref: deployment.spec.token_secret_ref.clone(),
            registration_token_secret_ref: registration_secret.to_string(),
            runner_image: deployment.spec.runner_image.clone(),
            docker_in_docker_image: deployment.spec.docker_in_docker_image.clone(),
            docker_config_map_ref: deployment.spec.docker_config_map_ref.clone(),
            job_data: job_data_from(job),
            job_template: deployment.spec.runner_template.clone(),
        },
    );
    runner.metadata.namespace = deployment.metadata.namespace.clone();
    runner.metadata.labels = Some(BTreeMap::from([
        (LABEL_JOB_ID.to_string(), job.id.to_string()),
        (LABEL_DEPLOYMENT.to_string(), deployment_name),
    ]));
    runner.metadata.owner_references = Some(vec![owner_ref]);
    Ok(runner)
}

/// Merge-patch body carrying repository/run metadata, when any was found.
fn enrichment_status(
    repository: Option<&Repository>,
    run: Option<&ActionRun>,
) -> Option<serde_json::Value> {
    let mut status = serde_json::Map::new();
    if let Some(repo) = repository {
        status.insert("repository".to_string(), repo.full_name.clone().into());
    }
    if let Some(run) = run {
        if !run.pretty_ref.is_empty() {
            status.insert("ref".to_string(), run.pretty_ref.clone().into());
        }
        if !run.event.is_empty() {
            status.insert("triggerEvent".to_string(), run.event.clone().into());
        }
        if let Some(user) = &run.trigger_user {
            status.insert("triggerUser".to_string(), user.login.clone().into());
        }
    }
    if status.is_empty() {
        return None;
    }
    Some(serde_json::json!({ "status": status }))
}

impl Poller {
    pub fn new(kube: kube::Client, forgejo: forgejo_client::Client, config: ListenerConfig) -> Self {
        Self { kube, forgejo, config }
    }

    /// Tick until cancelled. Single-tick errors are logged and retried on
    /// the next tick; the loop itself never aborts.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("listener shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(error) = self.tick().await {
                warn!(%error, "poll tick failed");
            }
        }
    }

    /// One poll tick.
    async fn tick(&self) -> Result<()> {
        let deployments: Api<ActDeployment> =
            Api::namespaced(self.kube.clone(), &self.config.namespace);
        // Reload every tick to pick up in-flight spec edits.
        let deployment = deployments.get(&self.config.act_deployment_name).await?;
        let owner_uid = deployment
            .metadata
            .uid
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

        let runners: Api<ActRunner> = Api::namespaced(self.kube.clone(), &self.config.namespace);
        let owned: Vec<ActRunner> = runners
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|runner| owned_by(runner.meta(), &owner_uid))
            .collect();

        self.propagate_drift(&runners, &deployment, &owned).await;

        let stamp = serde_json::json!({ "status": { "lastPollTime": Time(chrono::Utc::now()) } });
        if let Err(error) = deployments
            .patch_status(
                &self.config.act_deployment_name,
                &crate::patch_params(),
                &Patch::Merge(&stamp),
            )
            .await
        {
            debug!(%error, "failed to stamp lastPollTime");
        }

        let jobs = self
            .forgejo
            .pending_jobs(&self.config.organization, &self.config.labels)
            .await?;
        debug!(jobs = jobs.len(), "fetched waiting jobs");

        for job in plan_admissions(&jobs, &owned, deployment.spec.max_runners) {
            if let Err(error) = self.admit(&deployment, &runners, job).await {
                warn!(job = job.id, %error, "failed to admit job");
            }
        }
        Ok(())
    }

    /// Push deployment spec changes down to Pending runners.
    async fn propagate_drift(
        &self,
        runners: &Api<ActRunner>,
        deployment: &ActDeployment,
        owned: &[ActRunner],
    ) {
        for runner in owned {
            let Some(spec) = drifted_spec(deployment, runner) else {
                continue;
            };
            let name = runner.name_any();
            let mut updated = runner.clone();
            updated.spec = spec;
            updated.metadata.managed_fields = None;
            match runners.replace(&name, &crate::post_params(), &updated).await {
                Ok(_) => info!(runner = %name, "propagated deployment spec changes"),
                Err(error) => warn!(runner = %name, %error, "failed to propagate spec changes"),
            }
        }
    }

    /// Admit one waiting job: enrich, provision the registration secret,
    /// create the runner, and best-effort stamp run metadata.
    async fn admit(
        &self,
        deployment: &ActDeployment,
        runners: &Api<ActRunner>,
        job: &ActionJob,
    ) -> Result<()> {
        let (repository, run) = self.enrich(job).await;

        let token = self
            .forgejo
            .registration_token(&self.config.organization)
            .await?;

        let secret_name = secrets::new_registration_secret_name(job.id);
        let secret = secrets::build_registration_secret(
            &self.config.namespace,
            &secret_name,
            job.id,
            &token,
        );
        let secrets_api: Api<Secret> = Api::namespaced(self.kube.clone(), &self.config.namespace);
        secrets::create_or_update(&secrets_api, secret).await?;

        let runner = build_runner(deployment, job, &secret_name)?;
        let name = runner.name_any();
        match runners.create(&crate::post_params(), &runner).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(runner = %name, "runner appeared concurrently, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(status) = enrichment_status(repository.as_ref(), run.as_ref()) {
            if let Err(error) = runners
                .patch_status(&name, &crate::patch_params(), &Patch::Merge(&status))
                .await
            {
                debug!(runner = %name, %error, "failed to stamp run metadata");
            }
        }

        info!(job = job.id, runner = %name, "admitted job");
        Ok(())
    }

    /// Fetch repository and run metadata; failures only cost the metadata.
    async fn enrich(&self, job: &ActionJob) -> (Option<Repository>, Option<ActionRun>) {
        let repository = match self
            .forgejo
            .org_repo_by_id(&self.config.organization, job.repo_id)
            .await
        {
            Ok(repo) => Some(repo),
            Err(error) => {
                debug!(job = job.id, %error, "failed to resolve repository");
                None
            }
        };

        let run = match &repository {
            Some(repo) if job.run_id > 0 => {
                let owner = repo
                    .owner
                    .as_ref()
                    .map(|o| o.login.clone())
                    .or_else(|| repo.full_name.split_once('/').map(|(o, _)| o.to_string()));
                match owner {
                    Some(owner) => match self.forgejo.run(&owner, &repo.name, job.run_id).await {
                        Ok(run) => Some(run),
                        Err(error) => {
                            debug!(job = job.id, %error, "failed to fetch run metadata");
                            None
                        }
                    },
                    None => None,
                }
            }
            _ => None,
        };
        (repository, run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ActDeploymentSpec, ActRunnerStatus, TokenSecretRef};
    use forgejo_client::ActionUser;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    fn deployment_fixture() -> ActDeployment {
        let mut dep = ActDeployment::new(
            "fleet",
            ActDeploymentSpec {
                forgejo_server: "https://forgejo.example.com".into(),
                organization: "acme".into(),
                labels: "docker,amd64".into(),
                token_secret_ref: TokenSecretRef {
                    name: "forgejo-token".into(),
                    key: "token".into(),
                },
                poll_interval: None,
                min_runners: 0,
                max_runners: 0,
                listener_template: None,
                runner_template: None,
                runner_image: Some("runner:a".into()),
                docker_in_docker_image: None,
                docker_config_map_ref: None,
            },
        );
        dep.metadata.namespace = Some("ci".into());
        dep.metadata.uid = Some("uid-fleet".into());
        dep
    }

    fn waiting_job(id: i64) -> ActionJob {
        ActionJob {
            id,
            repo_id: 7,
            status: "waiting".into(),
            runs_on: vec!["docker".into()],
            ..ActionJob::default()
        }
    }

    fn owned_runner(job_id: i64, phase: RunnerPhase) -> ActRunner {
        let dep = deployment_fixture();
        let mut runner = build_runner(&dep, &waiting_job(job_id), "reg").unwrap();
        runner.status = Some(ActRunnerStatus {
            phase,
            ..ActRunnerStatus::default()
        });
        runner
    }

    #[test]
    fn admits_in_order_under_the_cap() {
        let jobs = vec![waiting_job(1), waiting_job(2), waiting_job(3)];
        let admitted = plan_admissions(&jobs, &[], 1);
        assert_eq!(admitted.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1]);

        let admitted = plan_admissions(&jobs, &[], 2);
        assert_eq!(admitted.iter().map(|j| j.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn zero_cap_admits_without_bound() {
        let jobs: Vec<ActionJob> = (1..=20).map(waiting_job).collect();
        assert_eq!(plan_admissions(&jobs, &[], 0).len(), 20);
    }

    #[test]
    fn existing_runners_are_not_duplicated() {
        let jobs = vec![waiting_job(5), waiting_job(6)];
        let owned = vec![owned_runner(5, RunnerPhase::Pending)];
        let admitted = plan_admissions(&jobs, &owned, 0);
        assert_eq!(admitted.iter().map(|j| j.id).collect::<Vec<_>>(), vec![6]);
    }

    #[test]
    fn terminal_runners_free_their_cap_slot() {
        let jobs = vec![waiting_job(2)];
        let owned = vec![owned_runner(1, RunnerPhase::Succeeded)];
        // Cap 1 with one terminal runner: job 2 still gets admitted.
        let admitted = plan_admissions(&jobs, &owned, 1);
        assert_eq!(admitted.len(), 1);

        let owned = vec![owned_runner(1, RunnerPhase::Running)];
        assert!(plan_admissions(&jobs, &owned, 1).is_empty());
    }

    #[test]
    fn rerunning_a_quiet_tick_plans_nothing() {
        let jobs = vec![waiting_job(5)];
        let owned = vec![owned_runner(5, RunnerPhase::Running)];
        assert!(plan_admissions(&jobs, &owned, 2).is_empty());
    }

    #[test]
    fn drift_updates_pending_runners_only() {
        let mut dep = deployment_fixture();
        let runner = owned_runner(5, RunnerPhase::Pending);
        assert!(drifted_spec(&dep, &runner).is_none());

        dep.spec.runner_image = Some("runner:b".into());
        let updated = drifted_spec(&dep, &runner).expect("pending runner drifts");
        assert_eq!(updated.runner_image.as_deref(), Some("runner:b"));

        let running = owned_runner(5, RunnerPhase::Running);
        assert!(drifted_spec(&dep, &running).is_none());
        let done = owned_runner(5, RunnerPhase::Succeeded);
        assert!(drifted_spec(&dep, &done).is_none());
    }

    #[test]
    fn drift_refreshes_template_snapshot_for_pending_runners() {
        let mut dep = deployment_fixture();
        let runner = owned_runner(5, RunnerPhase::Pending);
        dep.spec.runner_template = Some(PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "runner".into(),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
        });
        let updated = drifted_spec(&dep, &runner).expect("template refresh");
        assert_eq!(updated.job_template, dep.spec.runner_template);
    }

    #[test]
    fn built_runner_is_owned_and_labelled() {
        let dep = deployment_fixture();
        let runner = build_runner(&dep, &waiting_job(42), "actrunner-reg-42-deadbeef").unwrap();

        assert_eq!(runner.metadata.name.as_deref(), Some("actrunner-42-0042"));
        assert_eq!(runner.metadata.namespace.as_deref(), Some("ci"));
        assert_eq!(runner.spec.forgejo_job_id, 42);
        assert_eq!(runner.spec.registration_token_secret_ref, "actrunner-reg-42-deadbeef");
        assert_eq!(runner.spec.runner_image.as_deref(), Some("runner:a"));
        assert_eq!(runner.spec.job_data.runs_on, vec!["docker"]);

        let labels = runner.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_JOB_ID).map(String::as_str), Some("42"));
        let owner = &runner.metadata.owner_references.as_deref().unwrap()[0];
        assert_eq!(owner.kind, "ActDeployment");
        assert_eq!(owner.uid, "uid-fleet");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn job_template_is_copied_verbatim() {
        let mut dep = deployment_fixture();
        dep.spec.runner_template = Some(PodTemplateSpec::default());
        let runner = build_runner(&dep, &waiting_job(1), "reg").unwrap();
        assert_eq!(runner.spec.job_template, dep.spec.runner_template);

        dep.spec.runner_template = None;
        let runner = build_runner(&dep, &waiting_job(1), "reg").unwrap();
        assert!(runner.spec.job_template.is_none());
    }

    #[test]
    fn enrichment_status_is_none_without_metadata() {
        assert!(enrichment_status(None, None).is_none());
    }

    #[test]
    fn enrichment_status_carries_what_was_found() {
        let repo = Repository {
            id: 7,
            name: "app".into(),
            full_name: "acme/app".into(),
            owner: Some(ActionUser { id: 1, login: "acme".into() }),
        };
        let run = ActionRun {
            id: 12,
            event: "push".into(),
            pretty_ref: "main".into(),
            trigger_user: Some(ActionUser { id: 5, login: "alice".into() }),
        };
        let status = enrichment_status(Some(&repo), Some(&run)).unwrap();
        assert_eq!(status["status"]["repository"], "acme/app");
        assert_eq!(status["status"]["ref"], "main");
        assert_eq!(status["status"]["triggerEvent"], "push");
        assert_eq!(status["status"]["triggerUser"], "alice");

        let repo_only = enrichment_status(Some(&repo), None).unwrap();
        assert_eq!(repo_only["status"]["repository"], "acme/app");
        assert!(repo_only["status"].get("ref").is_none());
    }

    #[test]
    fn owned_by_matches_on_uid() {
        let dep = deployment_fixture();
        let runner = build_runner(&dep, &waiting_job(1), "reg").unwrap();
        assert!(owned_by(runner.meta(), "uid-fleet"));
        assert!(!owned_by(runner.meta(), "uid-other"));
    }
}
