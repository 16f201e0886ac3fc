//! Registration-token secrets.
//!
//! The listener provisions one short-lived secret per admitted job; the
//! runner reconciler deletes it when the runner reaches a terminal phase.
//! The secret is deliberately not owner-referenced by the runner so that
//! eager deletion and the deletion-timestamp branch stay the only owners of
//! its lifecycle.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch};
use rand::Rng;
use tracing::debug;

use crate::crd::LABEL_JOB_ID;
use crate::{Error, Result};

/// Key under which the registration token is stored.
pub const REGISTRATION_TOKEN_KEY: &str = "token";

/// Derive a registration secret name from a job id and a fixed suffix.
pub fn registration_secret_name(job_id: i64, suffix: [u8; 4]) -> String {
    let hex: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
    crate::truncate_name(&format!("actrunner-reg-{job_id}-{hex}"))
}

/// Derive a registration secret name with 4 bytes of fresh randomness.
///
/// The random suffix keeps re-observed job ids from colliding with secrets
/// that have not been garbage-collected yet.
pub fn new_registration_secret_name(job_id: i64) -> String {
    registration_secret_name(job_id, rand::rng().random())
}

/// Build the secret object holding `token` for `job_id`.
pub fn build_registration_secret(
    namespace: &str,
    name: &str,
    job_id: i64,
    token: &str,
) -> Secret {
    let labels = BTreeMap::from([
        (LABEL_JOB_ID.to_string(), job_id.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            crate::MANAGER.to_string(),
        ),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        string_data: Some(BTreeMap::from([(
            REGISTRATION_TOKEN_KEY.to_string(),
            token.to_string(),
        )])),
        ..Secret::default()
    }
}

/// Create the secret, updating the token in place when the name is already
/// taken.
pub async fn create_or_update(api: &Api<Secret>, secret: Secret) -> Result<()> {
    let name = secret
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    match api.create(&crate::post_params(), &secret).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(secret = %name, "registration secret exists, updating token in place");
            let patch = serde_json::json!({ "stringData": secret.string_data });
            api.patch(&name, &crate::patch_params(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete the secret, treating not-found as success.
pub async fn delete(api: &Api<Secret>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read a string value out of a secret, consulting both `data` and
/// `stringData`.
pub fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone()).map_err(|_| Error::MalformedSecretValue {
            name,
            key: key.to_string(),
        });
    }
    if let Some(value) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
        return Ok(value.clone());
    }
    Err(Error::MissingSecretKey {
        name,
        key: key.to_string(),
    })
}
