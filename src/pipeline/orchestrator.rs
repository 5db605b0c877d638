//! Job orchestration: drive a job's phases in order.
//!
//! Each job runs in its own supervised task. The supervisor owns the job's
//! [`RunningSlot`], so the slot is released however the run ends: success,
//! phase failure, timeout, or panic.

use crate::allocation::{AllocationInputs, DecisionId, JobId};
use crate::clock::Clock;
use crate::config::{LimitsConfig, PipelineConfig};
use crate::error::{Error, Result};
use crate::limits::{RateLimitReason, RunningJobSet, RunningSlot, SlotRefusal};
use crate::payment::metrics::AdmissionMetrics;
use crate::pipeline::client::{phase_inputs, PhaseStatus, PipelineClient};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Job status board
// =============================================================================

/// Lifecycle of an orchestrated job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Phases are being driven.
    Running,
    /// Every phase completed.
    Complete,
    /// A phase failed or a deadline passed.
    Failed,
}

/// Progress of one job, served at its status path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    /// The job.
    pub job_id: JobId,
    /// Decision that paid for the job.
    pub decision_id: DecisionId,
    /// Lifecycle state.
    pub state: JobState,
    /// Phase being driven, or the last one attempted.
    pub current_phase: u32,
    /// Phases finished successfully.
    pub phases_completed: u32,
    /// Total phases.
    pub phase_count: u32,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stable code of the failure, e.g. `job_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// When orchestration started.
    pub started_at: DateTime<Utc>,
    /// When orchestration ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Concurrent map of job progress.
#[derive(Debug, Default)]
pub struct JobBoard {
    jobs: DashMap<JobId, JobProgress>,
}

impl JobBoard {
    /// Create an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress of `job`.
    #[must_use]
    pub fn get(&self, job: &JobId) -> Option<JobProgress> {
        self.jobs.get(job).map(|p| p.value().clone())
    }

    /// Whether `job` finished every phase.
    #[must_use]
    pub fn is_complete(&self, job: &JobId) -> bool {
        self.jobs
            .get(job)
            .is_some_and(|p| p.state == JobState::Complete)
    }

    /// Number of tracked jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the board is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Insert a fresh `Running` entry unless the job is already known.
    fn register(&self, progress: JobProgress) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.jobs.entry(progress.job_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(progress);
                true
            }
        }
    }

    fn update(&self, job: &JobId, f: impl FnOnce(&mut JobProgress)) {
        if let Some(mut progress) = self.jobs.get_mut(job) {
            f(&mut progress);
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Orchestration timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Phases per job.
    pub phase_count: u32,
    /// Sleep between status polls.
    pub poll_interval: Duration,
    /// Deadline per phase.
    pub phase_timeout: Duration,
    /// Deadline for the whole job.
    pub overall_timeout: Duration,
    /// Retry policy for pipeline calls.
    pub retry: RetryPolicy,
    /// Retry hint when the running set is full.
    pub busy_retry_after: Duration,
}

impl OrchestratorSettings {
    /// Settings from configuration.
    #[must_use]
    pub fn from_config(pipeline: &PipelineConfig, limits: &LimitsConfig) -> Self {
        Self {
            phase_count: pipeline.phase_count,
            poll_interval: Duration::from_millis(pipeline.poll_interval_ms),
            phase_timeout: Duration::from_secs(pipeline.phase_timeout_secs),
            overall_timeout: Duration::from_secs(pipeline.overall_timeout_secs),
            retry: RetryPolicy::for_pipeline(pipeline),
            busy_retry_after: Duration::from_secs(limits.concurrency_retry_after_secs),
        }
    }
}

/// What a job runs on.
struct JobContext {
    job_id: JobId,
    decision_id: DecisionId,
    inputs: AllocationInputs,
}

/// Drives pipeline phases for admitted jobs.
#[derive(Clone)]
pub struct JobOrchestrator {
    pipeline: Arc<dyn PipelineClient>,
    board: Arc<JobBoard>,
    running: RunningJobSet,
    metrics: Arc<AdmissionMetrics>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    /// Create an orchestrator. `running` is the set shared with the rate
    /// limiter.
    #[must_use]
    pub fn new(
        pipeline: Arc<dyn PipelineClient>,
        running: RunningJobSet,
        metrics: Arc<AdmissionMetrics>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pipeline,
            board: Arc::new(JobBoard::new()),
            running,
            metrics,
            clock,
            settings,
        }
    }

    /// The job status board.
    #[must_use]
    pub fn board(&self) -> &Arc<JobBoard> {
        &self.board
    }

    /// Ask the pipeline for a new job id.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's error after retries.
    pub async fn create_job(
        &self,
        decision_id: &DecisionId,
        inputs: &AllocationInputs,
    ) -> Result<JobId> {
        self.settings
            .retry
            .run("create_job", || self.pipeline.create_job(decision_id, inputs))
            .await
    }

    /// Start orchestrating `job_id`, claiming its own running slot.
    ///
    /// Returns `Ok(None)` when the job is already running or known to the
    /// board; duplicate starts are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited { GlobalConcurrency }` when the running set is
    /// full.
    pub fn start(
        &self,
        job_id: JobId,
        decision_id: DecisionId,
        inputs: AllocationInputs,
    ) -> Result<Option<JoinHandle<()>>> {
        if self.board.get(&job_id).is_some() {
            debug!("Job {} already orchestrated; ignoring start", job_id);
            return Ok(None);
        }
        let slot = match self.running.try_acquire(job_id.as_str()) {
            Ok(slot) => slot,
            Err(SlotRefusal::AlreadyRunning) => {
                debug!("Job {} already running; ignoring start", job_id);
                return Ok(None);
            }
            Err(SlotRefusal::Full) => {
                return Err(Error::RateLimited {
                    reason: RateLimitReason::GlobalConcurrency,
                    retry_after: self.settings.busy_retry_after,
                });
            }
        };
        Ok(self.start_with_slot(slot, job_id, decision_id, inputs))
    }

    /// Start orchestrating `job_id` under an already claimed slot.
    ///
    /// The slot should be keyed by `job_id`. Returns `None` (and releases the
    /// slot) when the board already knows the job.
    #[must_use = "the handle can be awaited to observe completion"]
    pub fn start_with_slot(
        &self,
        slot: RunningSlot,
        job_id: JobId,
        decision_id: DecisionId,
        inputs: AllocationInputs,
    ) -> Option<JoinHandle<()>> {
        let registered = self.board.register(JobProgress {
            job_id: job_id.clone(),
            decision_id: decision_id.clone(),
            state: JobState::Running,
            current_phase: 0,
            phases_completed: 0,
            phase_count: self.settings.phase_count,
            error: None,
            error_code: None,
            started_at: self.clock.now(),
            finished_at: None,
        });
        if !registered {
            debug!("Job {} already on the board; releasing slot", job_id);
            return None;
        }

        info!(
            "Orchestrating job {} for decision {} ({} phases)",
            job_id, decision_id, self.settings.phase_count
        );
        let orchestrator = self.clone();
        let ctx = JobContext {
            job_id,
            decision_id,
            inputs,
        };
        Some(tokio::spawn(orchestrator.supervise(slot, ctx)))
    }

    /// Runs the phases in a child task so panics and the overall deadline
    /// are both observed here, where the slot lives.
    async fn supervise(self, slot: RunningSlot, ctx: JobContext) {
        let job_id = ctx.job_id.clone();
        let worker = self.clone();
        let mut child = tokio::spawn(async move { worker.run_phases(&ctx).await });

        let outcome = match tokio::time::timeout(self.settings.overall_timeout, &mut child).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Error::InvalidState(format!(
                "orchestration task ended abnormally: {join_error}"
            ))),
            Err(_) => {
                child.abort();
                Err(Error::JobTimeout {
                    after: self.settings.overall_timeout,
                })
            }
        };

        // Capacity is free before anyone can observe the terminal state.
        drop(slot);

        let now = self.clock.now();
        match outcome {
            Ok(()) => {
                self.board.update(&job_id, |p| {
                    p.state = JobState::Complete;
                    p.finished_at = Some(now);
                });
                self.metrics.record_job_completed();
                info!("Job {} complete", job_id);
            }
            Err(e) => {
                let message = match &e {
                    Error::PipelinePhaseFailed { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                self.board.update(&job_id, |p| {
                    p.state = JobState::Failed;
                    p.error = Some(message);
                    p.error_code = Some(e.code().to_string());
                    p.finished_at = Some(now);
                });
                self.metrics.record_job_failed();
                error!("Job {} failed: {}", job_id, e);
            }
        }
    }

    async fn run_phases(&self, ctx: &JobContext) -> Result<()> {
        for phase in 1..=self.settings.phase_count {
            self.board.update(&ctx.job_id, |p| p.current_phase = phase);
            self.run_phase(ctx, phase).await?;
            self.board
                .update(&ctx.job_id, |p| p.phases_completed = phase);
            debug!("Job {} phase {} complete", ctx.job_id, phase);
        }
        Ok(())
    }

    async fn run_phase(&self, ctx: &JobContext, phase: u32) -> Result<()> {
        let payload = phase_inputs(&ctx.job_id, &ctx.decision_id, &ctx.inputs, phase);
        self.settings
            .retry
            .run("start_phase", || {
                self.pipeline.start_phase(&ctx.job_id, phase, &payload)
            })
            .await?;

        let deadline = Instant::now() + self.settings.phase_timeout;
        loop {
            let report = self
                .settings
                .retry
                .run("phase_status", || self.pipeline.phase_status(&ctx.job_id, phase))
                .await?;

            match report.status {
                PhaseStatus::Complete => return Ok(()),
                PhaseStatus::Failed => {
                    let message = report
                        .error
                        .unwrap_or_else(|| format!("phase {phase} failed"));
                    warn!("Job {} phase {} failed: {}", ctx.job_id, phase, message);
                    return Err(Error::PipelinePhaseFailed { phase, message });
                }
                PhaseStatus::Idle | PhaseStatus::InProgress => {}
            }

            if Instant::now() + self.settings.poll_interval > deadline {
                return Err(Error::PhaseTimeout { phase });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}
