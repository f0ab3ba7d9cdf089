use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;

use super::models::{ActionRun, RunPatch};
use crate::{Error, Result};

/// Remote authority over pending action runs.
///
/// Claiming applies a visibility timeout on the source side, so runs held by
/// a crashed worker become claimable again without local bookkeeping.
#[async_trait]
pub trait ActionRunSource: Send + Sync {
    /// Fetch up to `limit` pending runs and hide them for
    /// `visibility_timeout_secs`.
    async fn claim_pending_runs(
        &self,
        limit: usize,
        visibility_timeout_secs: u64,
    ) -> Result<Vec<ActionRun>>;

    /// Take exclusive execution rights. Returns [`Error::Conflict`] when
    /// another worker already acknowledged the run.
    async fn acknowledge_run(&self, run_id: &str) -> Result<()>;

    async fn patch_run(&self, run_id: &str, patch: &RunPatch) -> Result<()>;

    /// Append a line to the run's audit log.
    async fn post_run_log(&self, run_id: &str, message: &str) -> Result<()>;
}

/// HTTP implementation of [`ActionRunSource`].
#[derive(Debug, Clone)]
pub struct HttpActionRunSource {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct ClaimResponse {
    runs: Vec<ActionRun>,
}

impl HttpActionRunSource {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("meridian_core/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn check(resp: &reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.as_u16() == 409 {
            return Err(Error::Conflict(format!("run source returned {status}")));
        }
        if !status.is_success() {
            return Err(Error::CatalogNonSuccess {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ActionRunSource for HttpActionRunSource {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn claim_pending_runs(
        &self,
        limit: usize,
        visibility_timeout_secs: u64,
    ) -> Result<Vec<ActionRun>> {
        let url = format!("{}/v1/actions/runs/claim", self.base_url);
        let resp = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&serde_json::json!({
                "limit": limit,
                "visibility_timeout_seconds": visibility_timeout_secs,
            }))
            .send()
            .await?;
        Self::check(&resp)?;
        let body: ClaimResponse = resp.json().await?;
        Ok(body.runs)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn acknowledge_run(&self, run_id: &str) -> Result<()> {
        let url = format!("{}/v1/actions/runs/{run_id}/ack", self.base_url);
        let resp = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await?;
        Self::check(&resp)
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn patch_run(&self, run_id: &str, patch: &RunPatch) -> Result<()> {
        let url = format!("{}/v1/actions/runs/{run_id}", self.base_url);
        let resp = self
            .client
            .patch(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(patch)
            .send()
            .await?;
        Self::check(&resp)
    }

    #[tracing::instrument(level = "debug", skip(self, message))]
    async fn post_run_log(&self, run_id: &str, message: &str) -> Result<()> {
        let url = format!("{}/v1/actions/runs/{run_id}/logs", self.base_url);
        let resp = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await?;
        Self::check(&resp)
    }
}
