//! Startup resolution of the long-lived Forgejo API token.
//!
//! The token secret is usually created alongside the ActDeployment, so the
//! listener may come up before it exists. Not-found is therefore waited
//! out with exponential backoff; a present secret with a missing key or an
//! empty value is a configuration error and fatal.

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::secrets::secret_value;
use crate::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Fetch the API token from `name`/`key`, waiting for the secret to appear.
pub async fn wait_for_api_token(
    secrets: &Api<Secret>,
    name: &str,
    key: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut delay = INITIAL_BACKOFF;
    loop {
        match secrets.get_opt(name).await? {
            Some(secret) => {
                let value = secret_value(&secret, key)?;
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(Error::EmptyApiToken { name: name.to_string() });
                }
                return Ok(trimmed.to_string());
            }
            None => {
                info!(secret = %name, delay = ?delay, "api token secret not found yet, waiting");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Shutdown),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next_backoff(delay);
            }
        }
    }
}
