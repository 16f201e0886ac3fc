//! A thin typed client for the Forgejo Actions endpoints the operator needs.
//!
//! Only four calls are made against a Forgejo server: listing pending jobs
//! for an organization, fetching a one-shot runner registration token,
//! resolving an organization repository by id, and fetching run metadata.
//! Everything else in the Forgejo API surface is out of scope.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

mod types;

pub use types::{ActionJob, ActionRun, ActionUser, Repository, JOB_STATUS_WAITING};

/// All requests share one deadline; a poller tick must never hang on a
/// wedged server.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by [`Client`].
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("forgejo request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered outside the 2xx range; the body is kept verbatim
    /// for diagnosis.
    #[error("forgejo api returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    /// A response body that should have been JSON was not.
    #[error("failed to decode forgejo response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The registration-token endpoint answered 2xx with an empty token.
    #[error("forgejo returned an empty registration token")]
    EmptyRegistrationToken,

    /// No repository with the given id exists in the organization.
    #[error("no repository with id {id} in organization {org}")]
    RepositoryNotFound { org: String, id: i64 },

    /// The configured server URL is unusable.
    #[error("invalid forgejo server url {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Typed Forgejo API client scoped to a single server and API token.
#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    /// Base URL with any trailing slash removed, e.g. `https://forgejo.example.com`.
    base: String,
}

impl Client {
    /// Build a client for `server` authenticating with `token`.
    ///
    /// `server` must be an absolute `http://` or `https://` URL. With
    /// `skip_tls_verify` the server certificate is not validated; this is
    /// only intended for test clusters with self-signed certificates.
    pub fn new(server: &str, token: &str, skip_tls_verify: bool) -> Result<Self> {
        let url = Url::parse(server).map_err(|e| Error::InvalidServerUrl {
            url: server.to_string(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::InvalidServerUrl {
                url: server.to_string(),
                reason: "scheme must be http or https".to_string(),
            });
        }

        let mut auth = HeaderValue::from_str(&format!("token {token}")).map_err(|e| {
            Error::InvalidServerUrl {
                url: server.to_string(),
                reason: format!("api token is not a valid header value: {e}"),
            }
        })?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .danger_accept_invalid_certs(skip_tls_verify)
            .build()?;

        Ok(Self {
            http,
            base: server.trim_end_matches('/').to_string(),
        })
    }

    /// List jobs queued for `org` whose requested labels match `labels`,
    /// filtered client-side to those still in `waiting` state.
    ///
    /// The label filter is passed through verbatim; Forgejo interprets the
    /// comma-joined string itself. A `null` or empty response body is
    /// treated as "no jobs".
    pub async fn pending_jobs(&self, org: &str, labels: &str) -> Result<Vec<ActionJob>> {
        let url = format!("{}/api/v1/orgs/{org}/actions/runners/jobs", self.base);
        let resp = self
            .http
            .get(url)
            .query(&[("labels", labels)])
            .send()
            .await?;
        let body = Self::check(resp).await?.text().await?;
        let mut jobs = types::parse_jobs(&body)?;
        jobs.retain(|j| j.status == JOB_STATUS_WAITING);
        Ok(jobs)
    }

    /// Fetch a fresh one-shot registration token for `org`.
    pub async fn registration_token(&self, org: &str) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct RegistrationToken {
            token: String,
        }

        let url = format!(
            "{}/api/v1/orgs/{org}/actions/runners/registration-token",
            self.base
        );
        let resp = self.http.get(url).send().await?;
        let reg: RegistrationToken = Self::check(resp).await?.json().await?;
        if reg.token.trim().is_empty() {
            return Err(Error::EmptyRegistrationToken);
        }
        Ok(reg.token)
    }

    /// Resolve one of `org`'s repositories by its numeric id, paging
    /// through the repository list until it is found or exhausted.
    pub async fn org_repo_by_id(&self, org: &str, id: i64) -> Result<Repository> {
        const PAGE_SIZE: usize = 50;

        let url = format!("{}/api/v1/orgs/{org}/repos", self.base);
        let mut page = 1usize;
        loop {
            let resp = self
                .http
                .get(&url)
                .query(&[("limit", PAGE_SIZE.to_string()), ("page", page.to_string())])
                .send()
                .await?;
            let repos: Vec<Repository> = Self::check(resp).await?.json().await?;
            let exhausted = repos.len() < PAGE_SIZE;
            if let Some(repo) = repos.into_iter().find(|r| r.id == id) {
                return Ok(repo);
            }
            if exhausted {
                return Err(Error::RepositoryNotFound {
                    org: org.to_string(),
                    id,
                });
            }
            page += 1;
        }
    }

    /// Fetch metadata for a single Actions run.
    pub async fn run(&self, owner: &str, repo: &str, run_id: i64) -> Result<ActionRun> {
        let url = format!(
            "{}/api/v1/repos/{owner}/{repo}/actions/runs/{run_id}",
            self.base
        );
        let resp = self.http.get(url).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Map non-2xx responses to [`Error::Api`], carrying the body.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::Api { status, body })
    }
}
