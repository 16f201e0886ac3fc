//! Execution pod construction.
//!
//! Deterministic: building the same ActRunner twice yields the same pod, so
//! a reconcile that races an earlier create can fall back to `already
//! exists` handling without diffing.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath,
    Pod, SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;

use crate::crd::{ActRunner, LABEL_JOB_ID, LABEL_RUNNER};
use crate::secrets::REGISTRATION_TOKEN_KEY;
use crate::{Error, Result, DEFAULT_DIND_IMAGE, DEFAULT_RUNNER_IMAGE};

/// Environment surfaced to the in-container runner startup script.
pub const ENV_TOKEN: &str = "TOKEN";
pub const ENV_FORGEJO_SERVER: &str = "FORGEJO_SERVER";
pub const ENV_FORGEJO_ORG: &str = "FORGEJO_ORG";
pub const ENV_FORGEJO_LABELS: &str = "FORGEJO_LABELS";
pub const ENV_FORGEJO_REPOSITORY: &str = "FORGEJO_REPOSITORY";
pub const ENV_FORGEJO_TRIGGER_USER: &str = "FORGEJO_TRIGGER_USER";
pub const ENV_FORGEJO_REF: &str = "FORGEJO_REF";
pub const ENV_FORGEJO_TRIGGER_EVENT: &str = "FORGEJO_TRIGGER_EVENT";
pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";

/// Where the DinD sidecar publishes its socket, shared over an emptyDir.
pub const DOCKER_HOST_VALUE: &str = "unix:///var/docker/docker.sock";
const DOCKER_SOCKET_DIR: &str = "/var/docker";
const DOCKER_SOCKET_VOLUME: &str = "docker-socket";
const DOCKER_CONFIG_VOLUME: &str = "docker-config";
const DOCKER_CONFIG_DIR: &str = "/root/.docker";
const DOCKER_CONFIG_KEY: &str = "config.json";

const RUNNER_CONTAINER: &str = "runner";
const DIND_CONTAINER: &str = "dind";

/// Deterministic execution pod name for a runner.
pub fn pod_name(job_id: i64, runner_name: &str) -> String {
    crate::truncate_name(&format!("runner-{job_id}-{runner_name}"))
}

fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// Build the execution pod for `runner` from its job template snapshot.
pub fn build_execution_pod(runner: &ActRunner) -> Result<Pod> {
    let runner_name = runner
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let owner_ref = runner
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    let job_id = runner.spec.forgejo_job_id;
    let template = runner.spec.job_template.clone().unwrap_or_default();
    let mut pod_spec = template.spec.unwrap_or_default();

    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(Container {
            name: RUNNER_CONTAINER.to_string(),
            ..Container::default()
        });
    }

    // The first container is the runner; the template may rename it.
    {
        let main = &mut pod_spec.containers[0];
        if main.image.is_none() {
            main.image = Some(
                runner
                    .spec
                    .runner_image
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RUNNER_IMAGE.to_string()),
            );
        }

        let mut env = main.env.take().unwrap_or_default();
        env.retain(|e| e.name != ENV_DOCKER_HOST);
        env.push(EnvVar {
            name: ENV_TOKEN.to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: runner.spec.registration_token_secret_ref.clone(),
                    key: REGISTRATION_TOKEN_KEY.to_string(),
                    optional: None,
                }),
                ..EnvVarSource::default()
            }),
        });
        env.push(env_value(ENV_FORGEJO_SERVER, runner.spec.forgejo_server.clone()));
        env.push(env_value(ENV_FORGEJO_ORG, runner.spec.organization.clone()));
        env.push(env_value(ENV_FORGEJO_LABELS, runner.spec.job_data.runs_on.join(",")));
        if let Some(status) = &runner.status {
            if let Some(repository) = &status.repository {
                env.push(env_value(ENV_FORGEJO_REPOSITORY, repository.clone()));
            }
            if let Some(user) = &status.trigger_user {
                env.push(env_value(ENV_FORGEJO_TRIGGER_USER, user.clone()));
            }
            if let Some(r) = &status.ref_ {
                env.push(env_value(ENV_FORGEJO_REF, r.clone()));
            }
            if let Some(event) = &status.trigger_event {
                env.push(env_value(ENV_FORGEJO_TRIGGER_EVENT, event.clone()));
            }
        }
        env.push(env_value(ENV_DOCKER_HOST, DOCKER_HOST_VALUE));
        main.env = Some(env);

        let mut mounts = main.volume_mounts.take().unwrap_or_default();
        // The controller's socket mount is authoritative.
        mounts.retain(|m| m.name != DOCKER_SOCKET_VOLUME && m.mount_path != DOCKER_SOCKET_DIR);
        mounts.push(VolumeMount {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            mount_path: DOCKER_SOCKET_DIR.to_string(),
            ..VolumeMount::default()
        });
        if runner.spec.docker_config_map_ref.is_some() {
            mounts.retain(|m| m.name != DOCKER_CONFIG_VOLUME);
            mounts.push(VolumeMount {
                name: DOCKER_CONFIG_VOLUME.to_string(),
                mount_path: DOCKER_CONFIG_DIR.to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            });
        }
        main.volume_mounts = Some(mounts);
    }

    pod_spec.containers.retain(|c| c.name != DIND_CONTAINER);
    pod_spec.containers.push(Container {
        name: DIND_CONTAINER.to_string(),
        image: Some(
            runner
                .spec
                .docker_in_docker_image
                .clone()
                .unwrap_or_else(|| DEFAULT_DIND_IMAGE.to_string()),
        ),
        args: Some(vec![
            format!("--host={DOCKER_HOST_VALUE}"),
            "--storage-driver=vfs".to_string(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            mount_path: DOCKER_SOCKET_DIR.to_string(),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    });

    let mut volumes = pod_spec.volumes.take().unwrap_or_default();
    volumes.retain(|v| v.name != DOCKER_SOCKET_VOLUME && v.name != DOCKER_CONFIG_VOLUME);
    volumes.push(Volume {
        name: DOCKER_SOCKET_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Volume::default()
    });
    if let Some(config_map) = &runner.spec.docker_config_map_ref {
        volumes.push(Volume {
            name: DOCKER_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.clone(),
                items: Some(vec![KeyToPath {
                    key: DOCKER_CONFIG_KEY.to_string(),
                    path: DOCKER_CONFIG_KEY.to_string(),
                    mode: None,
                }]),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        });
    }
    pod_spec.volumes = Some(volumes);

    if pod_spec.restart_policy.is_none() {
        pod_spec.restart_policy = Some("Never".to_string());
    }

    let mut labels = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(LABEL_JOB_ID.to_string(), job_id.to_string());
    labels.insert(LABEL_RUNNER.to_string(), runner_name.clone());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(job_id, &runner_name)),
            namespace: runner.metadata.namespace.clone(),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..ObjectMeta::default()
        },
        spec: Some(pod_spec),
        status: None,
    })
}
