//! Wire types for the Forgejo Actions API.
//!
//! Forgejo evolves its payloads between releases, so every field outside the
//! job id is defaulted and unknown fields are ignored.

use serde::{Deserialize, Serialize};

/// Job status value for jobs that have not been picked up by any runner.
pub const JOB_STATUS_WAITING: &str = "waiting";

/// One entry from `GET /api/v1/orgs/{org}/actions/runners/jobs`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ActionJob {
    pub id: i64,
    #[serde(default)]
    pub repo_id: i64,
    #[serde(default)]
    pub owner_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub runs_on: Vec<String>,
    #[serde(default)]
    pub task_id: i64,
    #[serde(default)]
    pub run_id: i64,
    #[serde(default)]
    pub status: String,
}

/// Subset of a Forgejo repository we care about.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Repository {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub owner: Option<ActionUser>,
}

/// Subset of a Forgejo user.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ActionUser {
    #[serde(default)]
    pub id: i64,
    #[serde(default, alias = "username")]
    pub login: String,
}

/// Subset of `GET /api/v1/repos/{owner}/{repo}/actions/runs/{run}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ActionRun {
    pub id: i64,
    #[serde(default)]
    pub event: String,
    #[serde(default, rename = "prettyref")]
    pub pretty_ref: String,
    #[serde(default)]
    pub trigger_user: Option<ActionUser>,
}

/// Decode a job-list body, tolerating `null` and empty responses.
pub(crate) fn parse_jobs(body: &str) -> Result<Vec<ActionJob>, serde_json::Error> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let jobs: Option<Vec<ActionJob>> = serde_json::from_str(trimmed)?;
    Ok(jobs.unwrap_or_default())
}
