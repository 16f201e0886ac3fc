//! Listener entrypoint: one process per ActDeployment, configured through
//! the environment by the deployment controller.

use act_runner_controller::listener::{wait_for_api_token, ListenerConfig, Poller};
use act_runner_controller::{telemetry, Error};
use clap::Parser;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();
    let config = ListenerConfig::parse();
    config.validate()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let client = Client::try_default().await?;
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);
    let token = match wait_for_api_token(
        &secrets,
        &config.token_secret_name,
        &config.token_secret_key,
        &cancel,
    )
    .await
    {
        Ok(token) => token,
        Err(Error::Shutdown) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let forgejo =
        forgejo_client::Client::new(&config.forgejo_server, &token, config.skip_tls_verify)?;
    info!(
        deployment = %config.act_deployment_name,
        server = %config.forgejo_server,
        organization = %config.organization,
        "listener starting"
    );

    Poller::new(client, forgejo, config).run(cancel).await;
    Ok(())
}
