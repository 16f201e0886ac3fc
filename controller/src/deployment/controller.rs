//! The ActDeployment reconciler.
//!
//! Materializes the per-deployment infrastructure (service account, role,
//! role binding, listener workload) and publishes observed state. Children
//! are owner-referenced, so deletion needs no work here beyond returning.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ListParams, Patch, ResourceExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Client;
use tracing::{debug, error, info, warn};

use crate::crd::{
    ready_condition, set_condition, ActDeployment, ActDeploymentStatus, ActRunner, LISTENER_APP,
};
use crate::deployment::resources::{
    build_listener_deployment, build_role, build_role_binding, build_service_account,
    listener_deployment_needs_update, listener_pod_selector,
};
use crate::{Error, Result};

/// Steady-state requeue: a slow safety net under the event triggers.
const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state handed to every reconciliation.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    /// Image used for injected listener containers, typically the
    /// operator's own.
    pub operator_image: String,
}

/// Find an owner-reference match against the deployment's uid.
fn owned_by(meta: &kube::api::ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|owner| owner.uid == owner_uid)
}

async fn patch_status(
    api: &Api<ActDeployment>,
    name: &str,
    status: &ActDeploymentStatus,
) -> Result<()> {
    let mut value = serde_json::to_value(status)?;
    if status.listener_pod_name.is_none() {
        value["listenerPodName"] = serde_json::Value::Null;
    }
    api.patch_status(
        name,
        &crate::patch_params(),
        &Patch::Merge(serde_json::json!({ "status": value })),
    )
    .await?;
    Ok(())
}

/// Reconcile one ActDeployment.
pub async fn reconcile(deployment: Arc<ActDeployment>, ctx: Arc<Context>) -> Result<Action> {
    if deployment.metadata.deletion_timestamp.is_some() {
        // Owner references cascade to every child.
        return Ok(Action::await_change());
    }

    let namespace = deployment
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = deployment.name_any();
    let deployments: Api<ActDeployment> = Api::namespaced(ctx.client.clone(), &namespace);

    if !deployment.has_valid_server_url() {
        warn!(deployment = %name, server = %deployment.spec.forgejo_server,
            "forgejoServer must start with http:// or https://");
        let mut status = deployment.status.clone().unwrap_or_default();
        status.observed_generation = deployment.metadata.generation;
        set_condition(
            &mut status.conditions,
            ready_condition(
                false,
                "InvalidSpec",
                "forgejoServer must start with http:// or https://",
                deployment.metadata.generation,
            ),
        );
        patch_status(&deployments, &name, &status).await?;
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    ensure_service_account(&ctx, &deployment, &namespace).await?;
    ensure_role(&ctx, &deployment, &namespace).await?;
    ensure_role_binding(&ctx, &deployment, &namespace).await?;
    ensure_listener_workload(&ctx, &deployment, &namespace).await?;

    let status = observe(&ctx, &deployment, &namespace).await?;
    patch_status(&deployments, &name, &status).await?;

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

async fn ensure_service_account(
    ctx: &Context,
    deployment: &ActDeployment,
    namespace: &str,
) -> Result<()> {
    let api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), namespace);
    let desired = build_service_account(deployment)?;
    let name = deployment.listener_name();
    if api.get_opt(&name).await?.is_none() {
        api.create(&crate::post_params(), &desired).await?;
        info!(deployment = %deployment.name_any(), service_account = %name, "created listener service account");
    }
    Ok(())
}

async fn ensure_role(ctx: &Context, deployment: &ActDeployment, namespace: &str) -> Result<()> {
    let api: Api<Role> = Api::namespaced(ctx.client.clone(), namespace);
    let desired = build_role(deployment)?;
    let name = deployment.listener_name();
    match api.get_opt(&name).await? {
        None => {
            api.create(&crate::post_params(), &desired).await?;
            info!(deployment = %deployment.name_any(), role = %name, "created listener role");
        }
        Some(existing) if existing.rules != desired.rules => {
            let mut replacement = desired;
            replacement.metadata.resource_version = existing.metadata.resource_version;
            api.replace(&name, &crate::post_params(), &replacement).await?;
            info!(deployment = %deployment.name_any(), role = %name, "updated listener role rules");
        }
        Some(_) => {}
    }
    Ok(())
}

async fn ensure_role_binding(
    ctx: &Context,
    deployment: &ActDeployment,
    namespace: &str,
) -> Result<()> {
    let api: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), namespace);
    let desired = build_role_binding(deployment)?;
    let name = deployment.listener_name();
    if api.get_opt(&name).await?.is_none() {
        api.create(&crate::post_params(), &desired).await?;
        info!(deployment = %deployment.name_any(), role_binding = %name, "created listener role binding");
    }
    Ok(())
}

async fn ensure_listener_workload(
    ctx: &Context,
    deployment: &ActDeployment,
    namespace: &str,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let desired = build_listener_deployment(deployment, &ctx.operator_image)?;
    let name = deployment.listener_name();
    match api.get_opt(&name).await? {
        None => {
            api.create(&crate::post_params(), &desired).await?;
            info!(deployment = %deployment.name_any(), workload = %name, "created listener workload");
        }
        Some(existing) if listener_deployment_needs_update(&existing, &desired) => {
            let mut replacement = desired;
            replacement.metadata.resource_version = existing.metadata.resource_version;
            api.replace(&name, &crate::post_params(), &replacement).await?;
            info!(deployment = %deployment.name_any(), workload = %name, "replaced drifted listener workload");
        }
        Some(_) => {}
    }
    Ok(())
}

/// Collect observed state: active runner count and the listener pod.
async fn observe(
    ctx: &Context,
    deployment: &ActDeployment,
    namespace: &str,
) -> Result<ActDeploymentStatus> {
    let owner_uid = deployment
        .metadata
        .uid
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    let runners: Api<ActRunner> = Api::namespaced(ctx.client.clone(), namespace);
    let active = runners
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .filter(|runner| owned_by(&runner.metadata, &owner_uid))
        .filter(|runner| !runner.is_terminal())
        .count();

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let selector = listener_pod_selector(&deployment.name_any());
    let mut listener_pods = pods
        .list(&ListParams::default().labels(&selector))
        .await?
        .items;
    listener_pods.sort_by_key(|pod| pod.metadata.creation_timestamp.as_ref().map(|t| t.0));
    let listener_pod_name = listener_pods
        .pop()
        .and_then(|pod| pod.metadata.name);

    let mut status = deployment.status.clone().unwrap_or_default();
    status.listener_pod_name = listener_pod_name;
    status.active_act_runners = Some(active as i32);
    status.observed_generation = deployment.metadata.generation;
    set_condition(
        &mut status.conditions,
        ready_condition(
            true,
            "Reconciled",
            "listener infrastructure is in place",
            deployment.metadata.generation,
        ),
    );
    Ok(status)
}

/// Requeue on errors; all sub-steps are retryable.
pub fn error_policy(deployment: Arc<ActDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(deployment = %deployment.name_any(), %error, "deployment reconciliation failed");
    Action::requeue(Duration::from_secs(10))
}

/// Run the deployment controller until shutdown.
pub async fn run(client: Client, operator_image: String) {
    let deployments = Api::<ActDeployment>::all(client.clone());
    if let Err(e) = deployments.list(&ListParams::default().limit(1)).await {
        error!(error = %e, "ActDeployment CRD is not queryable; is it installed?");
        std::process::exit(1);
    }

    let runners = Api::<ActRunner>::all(client.clone());
    let workloads = Api::<Deployment>::all(client.clone());
    let ctx = Arc::new(Context {
        client,
        operator_image,
    });

    Controller::new(deployments, watcher::Config::default())
        .owns(runners, watcher::Config::default())
        .owns(
            workloads,
            watcher::Config::default().labels(&format!("app={LISTENER_APP}")),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "reconciled deployment"),
                Err(e) => warn!(error = %e, "deployment reconcile failed"),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ActDeploymentSpec, TokenSecretRef};
    use http::{Request, Response};
    use kube::client::Body;

    fn deployment_fixture() -> ActDeployment {
        let mut dep = ActDeployment::new(
            "fleet",
            ActDeploymentSpec {
                forgejo_server: "https://forgejo.example.com".into(),
                organization: "acme".into(),
                labels: "docker".into(),
                token_secret_ref: TokenSecretRef {
                    name: "forgejo-token".into(),
                    key: "token".into(),
                },
                poll_interval: None,
                min_runners: 0,
                max_runners: 2,
                listener_template: None,
                runner_template: None,
                runner_image: None,
                docker_in_docker_image: None,
                docker_config_map_ref: None,
            },
        );
        dep.metadata.namespace = Some("default".into());
        dep.metadata.uid = Some("uid-fleet".into());
        dep.metadata.generation = Some(1);
        dep
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    struct ApiServerVerifier(ApiServerHandle);

    enum Scenario {
        /// Nothing exists: every child is created, then status is patched.
        FreshDeployment,
        /// Everything already matches: only reads plus the status patch.
        SteadyState,
    }

    fn testcontext() -> (Arc<Context>, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        (
            Arc::new(Context {
                client,
                operator_image: "operator:test".to_string(),
            }),
            ApiServerVerifier(handle),
        )
    }

    async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    fn not_found() -> Response<Body> {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "reason": "NotFound",
            "code": 404
        });
        Response::builder()
            .status(404)
            .body(Body::from(serde_json::to_vec(&status).unwrap()))
            .unwrap()
    }

    fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
        Response::builder()
            .body(Body::from(serde_json::to_vec(value).unwrap()))
            .unwrap()
    }

    fn empty_list(kind: &str, api_version: &str) -> Response<Body> {
        json_response(&serde_json::json!({
            "kind": kind,
            "apiVersion": api_version,
            "metadata": {"resourceVersion": "1"},
            "items": []
        }))
    }

    impl ApiServerVerifier {
        fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::FreshDeployment => self.handle_fresh().await,
                    Scenario::SteadyState => self.handle_steady_state().await,
                }
                .expect("scenario completed without errors");
            })
        }

        async fn expect(
            &mut self,
            method: http::Method,
            path: &str,
        ) -> (Request<Body>, tower_test::mock::SendResponse<Response<Body>>) {
            let (request, send) = self
                .0
                .next_request()
                .await
                .unwrap_or_else(|| panic!("expected {method} {path}"));
            assert_eq!(request.method(), method, "unexpected method for {path}");
            assert_eq!(request.uri().path(), path);
            (request, send)
        }

        async fn handle_fresh(mut self) -> anyhow::Result<Self> {
            let (_, send) = self
                .expect(http::Method::GET, "/api/v1/namespaces/default/serviceaccounts/fleet-listener")
                .await;
            send.send_response(not_found());

            let (request, send) = self
                .expect(http::Method::POST, "/api/v1/namespaces/default/serviceaccounts")
                .await;
            let body = request.into_body().collect_bytes().await?;
            let sa: ServiceAccount = serde_json::from_slice(&body)?;
            assert_eq!(sa.metadata.name.as_deref(), Some("fleet-listener"));
            send.send_response(json_response(&sa));

            let (_, send) = self
                .expect(
                    http::Method::GET,
                    "/apis/rbac.authorization.k8s.io/v1/namespaces/default/roles/fleet-listener",
                )
                .await;
            send.send_response(not_found());

            let (request, send) = self
                .expect(
                    http::Method::POST,
                    "/apis/rbac.authorization.k8s.io/v1/namespaces/default/roles",
                )
                .await;
            let body = request.into_body().collect_bytes().await?;
            let role: Role = serde_json::from_slice(&body)?;
            assert!(role.rules.as_deref().is_some_and(|r| !r.is_empty()));
            send.send_response(json_response(&role));

            let (_, send) = self
                .expect(
                    http::Method::GET,
                    "/apis/rbac.authorization.k8s.io/v1/namespaces/default/rolebindings/fleet-listener",
                )
                .await;
            send.send_response(not_found());

            let (request, send) = self
                .expect(
                    http::Method::POST,
                    "/apis/rbac.authorization.k8s.io/v1/namespaces/default/rolebindings",
                )
                .await;
            let body = request.into_body().collect_bytes().await?;
            let binding: RoleBinding = serde_json::from_slice(&body)?;
            assert_eq!(binding.role_ref.name, "fleet-listener");
            send.send_response(json_response(&binding));

            let (_, send) = self
                .expect(
                    http::Method::GET,
                    "/apis/apps/v1/namespaces/default/deployments/fleet-listener",
                )
                .await;
            send.send_response(not_found());

            let (request, send) = self
                .expect(http::Method::POST, "/apis/apps/v1/namespaces/default/deployments")
                .await;
            let body = request.into_body().collect_bytes().await?;
            let workload: Deployment = serde_json::from_slice(&body)?;
            assert_eq!(workload.spec.as_ref().and_then(|s| s.replicas), Some(1));
            send.send_response(json_response(&workload));

            let (_, send) = self
                .expect(
                    http::Method::GET,
                    "/apis/forgejo.actions.io/v1alpha1/namespaces/default/actrunners",
                )
                .await;
            send.send_response(empty_list("ActRunnerList", "forgejo.actions.io/v1alpha1"));

            let (_, send) = self.expect(http::Method::GET, "/api/v1/namespaces/default/pods").await;
            send.send_response(empty_list("PodList", "v1"));

            let (request, send) = self
                .expect(
                    http::Method::PATCH,
                    "/apis/forgejo.actions.io/v1alpha1/namespaces/default/actdeployments/fleet/status",
                )
                .await;
            let body = request.into_body().collect_bytes().await?;
            let patch: serde_json::Value = serde_json::from_slice(&body)?;
            assert_eq!(patch["status"]["activeActRunners"], 0);
            assert_eq!(patch["status"]["observedGeneration"], 1);
            send.send_response(json_response(&deployment_fixture()));

            Ok(self)
        }

        async fn handle_steady_state(mut self) -> anyhow::Result<Self> {
            let deployment = deployment_fixture();

            let (_, send) = self
                .expect(http::Method::GET, "/api/v1/namespaces/default/serviceaccounts/fleet-listener")
                .await;
            send.send_response(json_response(&build_service_account(&deployment)?));

            let (_, send) = self
                .expect(
                    http::Method::GET,
                    "/apis/rbac.authorization.k8s.io/v1/namespaces/default/roles/fleet-listener",
                )
                .await;
            send.send_response(json_response(&build_role(&deployment)?));

            let (_, send) = self
                .expect(
                    http::Method::GET,
                    "/apis/rbac.authorization.k8s.io/v1/namespaces/default/rolebindings/fleet-listener",
                )
                .await;
            send.send_response(json_response(&build_role_binding(&deployment)?));

            let (_, send) = self
                .expect(
                    http::Method::GET,
                    "/apis/apps/v1/namespaces/default/deployments/fleet-listener",
                )
                .await;
            send.send_response(json_response(&build_listener_deployment(
                &deployment,
                "operator:test",
            )?));

            let (_, send) = self
                .expect(
                    http::Method::GET,
                    "/apis/forgejo.actions.io/v1alpha1/namespaces/default/actrunners",
                )
                .await;
            send.send_response(empty_list("ActRunnerList", "forgejo.actions.io/v1alpha1"));

            let (_, send) = self.expect(http::Method::GET, "/api/v1/namespaces/default/pods").await;
            send.send_response(empty_list("PodList", "v1"));

            let (_, send) = self
                .expect(
                    http::Method::PATCH,
                    "/apis/forgejo.actions.io/v1alpha1/namespaces/default/actdeployments/fleet/status",
                )
                .await;
            send.send_response(json_response(&deployment));

            Ok(self)
        }
    }

    #[tokio::test]
    async fn fresh_deployment_materializes_all_children() {
        let (ctx, fakeserver) = testcontext();
        let mocksrv = fakeserver.run(Scenario::FreshDeployment);

        let action = reconcile(Arc::new(deployment_fixture()), ctx)
            .await
            .expect("reconcile succeeds");
        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn steady_state_makes_no_spec_writes() {
        let (ctx, fakeserver) = testcontext();
        let mocksrv = fakeserver.run(Scenario::SteadyState);

        let action = reconcile(Arc::new(deployment_fixture()), ctx)
            .await
            .expect("reconcile succeeds");
        assert_eq!(action, Action::requeue(REQUEUE_INTERVAL));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn deleted_deployment_is_left_to_cascade() {
        let (ctx, _fakeserver) = testcontext();
        let mut deployment = deployment_fixture();
        deployment.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));

        let action = reconcile(Arc::new(deployment), ctx)
            .await
            .expect("reconcile succeeds");
        assert_eq!(action, Action::await_change());
    }
}
