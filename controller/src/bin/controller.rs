//! Operator entrypoint: runs the ActDeployment and ActRunner reconcilers
//! side by side until a shutdown signal arrives.

use act_runner_controller::{deployment, runner, telemetry, DEFAULT_OPERATOR_IMAGE};
use kube::Client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let client = Client::try_default().await?;
    let operator_image =
        std::env::var("OPERATOR_IMAGE").unwrap_or_else(|_| DEFAULT_OPERATOR_IMAGE.to_string());

    tracing::info!(%operator_image, "starting act-runner controllers");
    tokio::join!(
        deployment::run(client.clone(), operator_image.clone()),
        runner::run(client),
    );
    tracing::info!("controllers terminated");
    Ok(())
}
