//! Desired-state builders for the per-deployment listener infrastructure.
//!
//! All builders are pure so reconciliation stays a read-compare-write of
//! their output against the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodTemplateSpec, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Resource;

use crate::crd::{ActDeployment, GROUP, LABEL_DEPLOYMENT, LISTENER_APP};
use crate::listener::config::{
    ENV_ACT_DEPLOYMENT_NAME, ENV_FORGEJO_SERVER, ENV_LABELS, ENV_NAMESPACE, ENV_ORGANIZATION,
    ENV_POLL_INTERVAL, ENV_TOKEN_SECRET_KEY, ENV_TOKEN_SECRET_NAME,
};
use crate::{Error, Result};

/// Name of the container injected when `listenerTemplate` has none.
const LISTENER_CONTAINER: &str = "listener";

/// Entry command of the listener binary inside the operator image.
const LISTENER_COMMAND: &str = "listener";

/// Labels shared by the listener workload, its selector and its pods.
pub fn listener_labels(deployment_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), LISTENER_APP.to_string()),
        (LABEL_DEPLOYMENT.to_string(), deployment_name.to_string()),
    ])
}

/// Label selector string for finding listener pods of one deployment.
pub fn listener_pod_selector(deployment_name: &str) -> String {
    format!("app={LISTENER_APP},{LABEL_DEPLOYMENT}={deployment_name}")
}

fn owned_metadata(deployment: &ActDeployment, name: &str) -> Result<ObjectMeta> {
    let owner_ref = deployment
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let deployment_name = deployment
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    Ok(ObjectMeta {
        name: Some(name.to_string()),
        namespace: deployment.metadata.namespace.clone(),
        labels: Some(listener_labels(&deployment_name)),
        owner_references: Some(vec![owner_ref]),
        ..ObjectMeta::default()
    })
}

/// Service identity the listener runs under.
pub fn build_service_account(deployment: &ActDeployment) -> Result<ServiceAccount> {
    Ok(ServiceAccount {
        metadata: owned_metadata(deployment, &deployment.listener_name())?,
        ..ServiceAccount::default()
    })
}

/// Rules the listener needs: read plus provisioning of secrets, read of its
/// own deployment (and status for the poll stamp), and full management of
/// runners.
pub fn listener_policy_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec!["secrets".to_string()]),
            verbs: ["get", "list", "watch", "create", "update", "patch"]
                .map(String::from)
                .to_vec(),
            ..PolicyRule::default()
        },
        PolicyRule {
            api_groups: Some(vec![GROUP.to_string()]),
            resources: Some(vec!["actdeployments".to_string()]),
            verbs: ["get", "list", "watch"].map(String::from).to_vec(),
            ..PolicyRule::default()
        },
        PolicyRule {
            api_groups: Some(vec![GROUP.to_string()]),
            resources: Some(vec!["actdeployments/status".to_string()]),
            verbs: ["get", "patch", "update"].map(String::from).to_vec(),
            ..PolicyRule::default()
        },
        PolicyRule {
            api_groups: Some(vec![GROUP.to_string()]),
            resources: Some(vec!["actrunners".to_string()]),
            verbs: ["create", "get", "list", "watch", "update", "patch"]
                .map(String::from)
                .to_vec(),
            ..PolicyRule::default()
        },
        PolicyRule {
            api_groups: Some(vec![GROUP.to_string()]),
            resources: Some(vec!["actrunners/status".to_string()]),
            verbs: ["get", "patch", "update"].map(String::from).to_vec(),
            ..PolicyRule::default()
        },
    ]
}

/// Authorization rules for the listener identity.
pub fn build_role(deployment: &ActDeployment) -> Result<Role> {
    Ok(Role {
        metadata: owned_metadata(deployment, &deployment.listener_name())?,
        rules: Some(listener_policy_rules()),
    })
}

/// Binding of [`build_role`] to [`build_service_account`].
pub fn build_role_binding(deployment: &ActDeployment) -> Result<RoleBinding> {
    let name = deployment.listener_name();
    Ok(RoleBinding {
        metadata: owned_metadata(deployment, &name)?,
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: deployment.metadata.namespace.clone(),
            ..Subject::default()
        }]),
    })
}

/// Single-replica listener workload hosting the poller.
///
/// The pod spec starts from `listenerTemplate` and is augmented
/// deterministically: listener labels, a default container when the
/// template has none, appended configuration env, and the service identity.
pub fn build_listener_deployment(
    deployment: &ActDeployment,
    operator_image: &str,
) -> Result<Deployment> {
    let deployment_name = deployment
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = deployment
        .metadata
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let listener_name = deployment.listener_name();
    let labels = listener_labels(&deployment_name);

    let mut template: PodTemplateSpec = deployment.spec.listener_template.clone().unwrap_or_default();
    let mut template_meta = template.metadata.take().unwrap_or_default();
    template_meta
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.clone());
    template.metadata = Some(template_meta);

    let mut pod_spec = template.spec.take().unwrap_or_default();
    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(Container {
            name: LISTENER_CONTAINER.to_string(),
            image: Some(operator_image.to_string()),
            command: Some(vec![LISTENER_COMMAND.to_string()]),
            ..Container::default()
        });
    }

    let env = [
        (ENV_FORGEJO_SERVER, deployment.spec.forgejo_server.clone()),
        (ENV_ORGANIZATION, deployment.spec.organization.clone()),
        (ENV_LABELS, deployment.spec.labels.clone()),
        (ENV_TOKEN_SECRET_NAME, deployment.spec.token_secret_ref.name.clone()),
        (ENV_TOKEN_SECRET_KEY, deployment.spec.token_secret_ref.key.clone()),
        (ENV_NAMESPACE, namespace),
        (ENV_ACT_DEPLOYMENT_NAME, deployment_name),
        (ENV_POLL_INTERVAL, deployment.poll_interval().to_string()),
    ];
    let container_env = pod_spec.containers[0].env.get_or_insert_with(Vec::new);
    for (name, value) in env {
        container_env.push(EnvVar {
            name: name.to_string(),
            value: Some(value),
            value_from: None,
        });
    }
    pod_spec.service_account_name = Some(listener_name.clone());
    template.spec = Some(pod_spec);

    Ok(Deployment {
        metadata: owned_metadata(deployment, &listener_name)?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels),
                match_expressions: None,
            },
            // Singleton poller: never run two ticks from overlapping pods.
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template,
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}

/// Whether the deployed listener workload drifted from the desired one.
///
/// Compares only operator-managed fields; server-side defaulting of the
/// rest must not trigger spurious updates.
pub fn listener_deployment_needs_update(existing: &Deployment, desired: &Deployment) -> bool {
    let (Some(existing_spec), Some(desired_spec)) = (&existing.spec, &desired.spec) else {
        return true;
    };
    if existing_spec.replicas != desired_spec.replicas {
        return true;
    }
    if existing_spec.selector != desired_spec.selector {
        return true;
    }

    let existing_template = &existing_spec.template;
    let desired_template = &desired_spec.template;
    let labels = |t: &PodTemplateSpec| {
        t.metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default()
    };
    let desired_labels = labels(desired_template);
    let existing_labels = labels(existing_template);
    if desired_labels
        .iter()
        .any(|(k, v)| existing_labels.get(k) != Some(v))
    {
        return true;
    }

    let (Some(existing_pod), Some(desired_pod)) =
        (&existing_template.spec, &desired_template.spec)
    else {
        return true;
    };
    if existing_pod.service_account_name != desired_pod.service_account_name {
        return true;
    }
    if existing_pod.containers.len() != desired_pod.containers.len() {
        return true;
    }
    existing_pod
        .containers
        .iter()
        .zip(&desired_pod.containers)
        .any(|(existing, desired)| {
            existing.name != desired.name
                || existing.image != desired.image
                || existing.command != desired.command
                || existing.env != desired.env
        })
}
