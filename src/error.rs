//! Error taxonomy for pipeline runs.
//!
//! Every failure a run can hit maps onto one [`ErrorClass`], which is what
//! gets recorded on a failed project and reported in a run result.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::db::StoreError;
use crate::core::safety::LimitViolation;
use crate::domain::{ProjectStatus, StageName};

/// Coarse classification of a pipeline error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientProvider,
    PermanentProvider,
    RetriesExhausted,
    Persistence,
    StateTransition,
    Configuration,
    StageTimeout,
    Cancelled,
    ReviewRejected,
    LimitExceeded,
    Output,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientProvider => "transient_provider",
            Self::PermanentProvider => "permanent_provider",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Persistence => "persistence",
            Self::StateTransition => "state_transition",
            Self::Configuration => "configuration",
            Self::StageTimeout => "stage_timeout",
            Self::Cancelled => "cancelled",
            Self::ReviewRejected => "review_rejected",
            Self::LimitExceeded => "limit_exceeded",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let class = match s {
            "transient_provider" => Self::TransientProvider,
            "permanent_provider" => Self::PermanentProvider,
            "retries_exhausted" => Self::RetriesExhausted,
            "persistence" => Self::Persistence,
            "state_transition" => Self::StateTransition,
            "configuration" => Self::Configuration,
            "stage_timeout" => Self::StageTimeout,
            "cancelled" => Self::Cancelled,
            "review_rejected" => Self::ReviewRejected,
            "limit_exceeded" => Self::LimitExceeded,
            "output" => Self::Output,
            other => return Err(format!("unknown error class: {}", other)),
        };
        Ok(class)
    }
}

/// Errors raised while driving a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' hit a transient provider failure: {message}")]
    TransientProvider { stage: StageName, message: String },

    #[error("stage '{stage}' failed permanently: {message}")]
    PermanentProvider { stage: StageName, message: String },

    #[error("stage '{stage}' exhausted {attempts} attempts, last error: {last_error}")]
    RetriesExhausted {
        stage: StageName,
        attempts: u32,
        last_error: String,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("project '{project_id}' cannot move from {from} to {to}")]
    StateTransition {
        project_id: String,
        from: ProjectStatus,
        to: ProjectStatus,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no project registered with id '{0}'")]
    UnknownProject(String),

    #[error("review gate not reached: stage '{missing}' has no checkpoint")]
    GateNotReached { missing: StageName },

    #[error("stage '{stage}' exceeded its timeout of {limit:?}")]
    StageTimeout { stage: StageName, limit: Duration },

    #[error("run cancelled")]
    Cancelled,

    #[error("review rejected: {0}")]
    ReviewRejected(String),

    #[error("stage '{stage}' violated a limit: {violation}")]
    LimitExceeded {
        stage: StageName,
        violation: LimitViolation,
    },

    #[error("failed to write output '{path}': {message}")]
    Output { path: PathBuf, message: String },
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientProvider { .. } => ErrorClass::TransientProvider,
            Self::PermanentProvider { .. } => ErrorClass::PermanentProvider,
            Self::RetriesExhausted { .. } => ErrorClass::RetriesExhausted,
            Self::Persistence(_) => ErrorClass::Persistence,
            Self::StateTransition { .. } => ErrorClass::StateTransition,
            Self::Configuration(_) | Self::UnknownProject(_) | Self::GateNotReached { .. } => {
                ErrorClass::Configuration
            }
            Self::StageTimeout { .. } => ErrorClass::StageTimeout,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::ReviewRejected(_) => ErrorClass::ReviewRejected,
            Self::LimitExceeded { .. } => ErrorClass::LimitExceeded,
            Self::Output { .. } => ErrorClass::Output,
        }
    }

    /// Stage the error originated in, when it is tied to one
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::TransientProvider { stage, .. }
            | Self::PermanentProvider { stage, .. }
            | Self::RetriesExhausted { stage, .. }
            | Self::StageTimeout { stage, .. }
            | Self::LimitExceeded { stage, .. } => Some(*stage),
            Self::Output { .. } => Some(StageName::EmitOutput),
            Self::ReviewRejected(_) => Some(StageName::HumanReview),
            _ => None,
        }
    }

    /// Errors that end the run without marking the project failed
    ///
    /// Persistence errors abort because the store cannot be trusted to record
    /// the failure; state transition errors are surfaced to the caller.
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_)
                | Self::StateTransition { .. }
                | Self::Configuration(_)
                | Self::UnknownProject(_)
                | Self::GateNotReached { .. }
        )
    }
}
