//! The downstream allocation pipeline and the orchestration that drives it.
//!
//! ```text
//! admitted decision ──► create_job ──► JobOrchestrator
//!                                          │
//!                     phase 1 ─► phase 2 ─► ... ─► phase N
//!                     start, then poll until complete / failed / timeout
//! ```

pub mod client;
pub mod orchestrator;

pub use client::{HttpPipeline, PhaseReport, PhaseStatus, PipelineClient};
pub use orchestrator::{JobBoard, JobOrchestrator, JobProgress, JobState, OrchestratorSettings};
