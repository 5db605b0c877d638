//! Downstream pipeline capability.

use crate::allocation::{AllocationInputs, DecisionId, JobId};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Status of one phase as reported by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not started.
    Idle,
    /// Running.
    InProgress,
    /// Finished successfully.
    Complete,
    /// Finished with an error.
    Failed,
}

/// A phase status poll result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    /// Phase status.
    pub status: PhaseStatus,
    /// Failure detail, when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseReport {
    /// A report with no error.
    #[must_use]
    pub fn new(status: PhaseStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    /// A failed report.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::Failed,
            error: Some(message.into()),
        }
    }
}

/// The multi-phase allocation pipeline.
///
/// Implementations report transport failures as `UpstreamUnavailable`.
#[async_trait]
pub trait PipelineClient: Send + Sync {
    /// Register a job for an admitted decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline refuses or cannot be reached.
    async fn create_job(&self, decision_id: &DecisionId, inputs: &AllocationInputs)
        -> Result<JobId>;

    /// Start phase `phase` of `job`. Idempotent per job and phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline refuses or cannot be reached.
    async fn start_phase(&self, job: &JobId, phase: u32, phase_inputs: &Value) -> Result<()>;

    /// Poll phase `phase` of `job`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline cannot be reached.
    async fn phase_status(&self, job: &JobId, phase: u32) -> Result<PhaseReport>;
}

/// Inputs sent with every phase start.
#[must_use]
pub fn phase_inputs(
    job: &JobId,
    decision_id: &DecisionId,
    inputs: &AllocationInputs,
    phase: u32,
) -> Value {
    json!({
        "jobId": job,
        "decisionId": decision_id,
        "phase": phase,
        "inputs": inputs,
    })
}

/// HTTP client for the pipeline service.
///
/// ```text
/// POST {base}/jobs                    {decisionId, inputs} -> {jobId}
/// POST {base}/jobs/{jobId}/phases/{n} phase inputs
/// GET  {base}/jobs/{jobId}/phases/{n} -> {status, error?}
/// ```
#[derive(Debug, Clone)]
pub struct HttpPipeline {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedJob {
    job_id: JobId,
}

impl HttpPipeline {
    /// Create a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build pipeline client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn phase_url(&self, job: &JobId, phase: u32) -> String {
        format!("{}/jobs/{job}/phases/{phase}", self.base_url)
    }
}

/// Map a non-success HTTP status: 5xx is retryable, 4xx is not.
fn status_error(what: &str, status: reqwest::StatusCode, phase: Option<u32>) -> Error {
    if status.is_server_error() {
        return Error::UpstreamUnavailable(format!("{what}: HTTP {status}"));
    }
    match phase {
        Some(phase) => Error::PipelinePhaseFailed {
            phase,
            message: format!("{what}: HTTP {status}"),
        },
        None => Error::InvalidState(format!("{what}: HTTP {status}")),
    }
}

#[async_trait]
impl PipelineClient for HttpPipeline {
    async fn create_job(
        &self,
        decision_id: &DecisionId,
        inputs: &AllocationInputs,
    ) -> Result<JobId> {
        let response = self
            .http
            .post(format!("{}/jobs", self.base_url))
            .json(&json!({ "decisionId": decision_id, "inputs": inputs }))
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("create job: {e}")))?;
        if !response.status().is_success() {
            return Err(status_error("create job", response.status(), None));
        }
        let created: CreatedJob = response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("create job: bad response: {e}")))?;
        debug!("Pipeline created job {} for {}", created.job_id, decision_id);
        Ok(created.job_id)
    }

    async fn start_phase(&self, job: &JobId, phase: u32, phase_inputs: &Value) -> Result<()> {
        let response = self
            .http
            .post(self.phase_url(job, phase))
            .json(phase_inputs)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("start phase {phase}: {e}")))?;
        if !response.status().is_success() {
            return Err(status_error("start phase", response.status(), Some(phase)));
        }
        Ok(())
    }

    async fn phase_status(&self, job: &JobId, phase: u32) -> Result<PhaseReport> {
        let response = self
            .http
            .get(self.phase_url(job, phase))
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("phase {phase} status: {e}")))?;
        if !response.status().is_success() {
            return Err(status_error("phase status", response.status(), Some(phase)));
        }
        response
            .json()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("phase {phase} status: {e}")))
    }
}
