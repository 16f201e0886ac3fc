use thiserror::Error;

/// Errors shared by the reconcilers and the listener.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("forgejo api error: {0}")]
    Forgejo(#[from] forgejo_client::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("secret {name} has no {key:?} key")]
    MissingSecretKey { name: String, key: String },

    #[error("secret {name} key {key:?} is not valid utf-8")]
    MalformedSecretValue { name: String, key: String },

    #[error("secret {name} holds an empty api token")]
    EmptyApiToken { name: String },

    #[error("invalid forgejo server url {0:?}: must start with http:// or https://")]
    InvalidServerUrl(String),

    #[error("shutdown requested")]
    Shutdown,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
