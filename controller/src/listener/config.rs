//! Listener configuration.
//!
//! Every setting is a flag with an environment fallback; the deployment
//! controller wires the environment variables into the listener workload,
//! so env is the path taken in-cluster.

use std::time::Duration;

use clap::Parser;

use crate::{Error, Result};

pub const ENV_FORGEJO_SERVER: &str = "FORGEJO_SERVER";
pub const ENV_ORGANIZATION: &str = "ORGANIZATION";
pub const ENV_LABELS: &str = "LABELS";
pub const ENV_TOKEN_SECRET_NAME: &str = "TOKEN_SECRET_NAME";
pub const ENV_TOKEN_SECRET_KEY: &str = "TOKEN_SECRET_KEY";
pub const ENV_NAMESPACE: &str = "NAMESPACE";
pub const ENV_ACT_DEPLOYMENT_NAME: &str = "ACT_DEPLOYMENT_NAME";
pub const ENV_POLL_INTERVAL: &str = "POLL_INTERVAL";
pub const ENV_SKIP_TLS_VERIFY: &str = "SKIP_TLS_VERIFY";

fn parse_poll_interval(value: &str) -> std::result::Result<Duration, String> {
    duration_str::parse(value).map_err(|e| e.to_string())
}

/// Configuration of one listener process, scoped to a single ActDeployment.
#[derive(Parser, Clone, Debug)]
#[command(name = "listener", about = "Forgejo Actions job poller for one ActDeployment")]
pub struct ListenerConfig {
    /// Base URL of the Forgejo server.
    #[arg(long, env = ENV_FORGEJO_SERVER)]
    pub forgejo_server: String,

    /// Organization whose job queue is polled.
    #[arg(long, env = ENV_ORGANIZATION)]
    pub organization: String,

    /// Comma-joined label filter, passed verbatim to Forgejo.
    #[arg(long, env = ENV_LABELS)]
    pub labels: String,

    /// Secret holding the long-lived Forgejo API token.
    #[arg(long, env = ENV_TOKEN_SECRET_NAME)]
    pub token_secret_name: String,

    /// Key within the token secret.
    #[arg(long, env = ENV_TOKEN_SECRET_KEY, default_value = "token")]
    pub token_secret_key: String,

    /// Namespace this listener and its deployment live in.
    #[arg(long, env = ENV_NAMESPACE)]
    pub namespace: String,

    /// Name of the owning ActDeployment.
    #[arg(long, env = ENV_ACT_DEPLOYMENT_NAME)]
    pub act_deployment_name: String,

    /// Tick period of the poll loop.
    #[arg(long, env = ENV_POLL_INTERVAL, default_value = "10s", value_parser = parse_poll_interval)]
    pub poll_interval: Duration,

    /// Disable TLS certificate verification towards Forgejo.
    #[arg(
        long,
        env = ENV_SKIP_TLS_VERIFY,
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    pub skip_tls_verify: bool,
}

impl ListenerConfig {
    /// Reject servers without an explicit http(s) scheme before any request
    /// is made.
    pub fn validate(&self) -> Result<()> {
        if self.forgejo_server.starts_with("http://") || self.forgejo_server.starts_with("https://")
        {
            Ok(())
        } else {
            Err(Error::InvalidServerUrl(self.forgejo_server.clone()))
        }
    }
}
