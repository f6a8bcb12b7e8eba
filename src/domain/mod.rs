//! Domain types for the codeport orchestrator.
//!
//! This module contains the core data structures:
//! - Project: identity and status lifecycle of a translation project
//! - Stage: the fixed pipeline order and stage checkpoints
//! - Run: run outcomes and the shared pipeline state

pub mod project;
pub mod run;
pub mod stage;

// Re-export commonly used types
pub use project::{project_identifier, project_name, Project, ProjectFailure, ProjectStatus};
pub use run::{PipelineState, ProjectContext, RunResult, RunStatus, StageFailure};
pub use stage::{StageCheckpoint, StageName, StagePhase, PIPELINE_ORDER};
