//! Run outcomes and the shared pipeline state a run accumulates.
//!
//! A run is a single invocation of the orchestrator against one project.
//! Its state is rebuilt from checkpoints on every invocation, so nothing in
//! here is persisted directly.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::project::Project;
use super::stage::StageName;
use crate::error::ErrorClass;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every stage completed, output written
    Completed,

    /// A stage failed; the project is marked failed
    Failed,

    /// Suspended at the human review gate
    AwaitingReview,

    /// Stopped by a cancellation signal; the project keeps its status
    Cancelled,

    /// Dry run finished the analysis stages
    AnalysisComplete,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingReview => "awaiting_review",
            Self::Cancelled => "cancelled",
            Self::AnalysisComplete => "analysis_complete",
        }
    }

    /// Whether the CLI should exit successfully for this outcome
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::AwaitingReview | Self::AnalysisComplete
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stage and error that ended a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageName,
    pub class: ErrorClass,
    pub message: String,
}

/// Outcome of one orchestrator run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Identifier of this invocation (not persisted)
    pub run_id: Uuid,

    /// Project the run drove
    pub project_id: String,

    /// How the run ended
    pub status: RunStatus,

    /// Every checkpointed stage, in pipeline order
    pub completed_stages: Vec<StageName>,

    /// Stages executed (not restored) during this run
    pub executed_stages: Vec<StageName>,

    /// Provider attempts per executed stage
    pub attempts: BTreeMap<StageName, u32>,

    /// Set when `status` is `failed`
    pub failure: Option<StageFailure>,

    /// Where output is (or will be) written
    pub output_path: PathBuf,
}

impl RunResult {
    pub fn new(run_id: Uuid, project: &Project, status: RunStatus) -> Self {
        Self {
            run_id,
            project_id: project.id.clone(),
            status,
            completed_stages: Vec::new(),
            executed_stages: Vec::new(),
            attempts: BTreeMap::new(),
            failure: None,
            output_path: project.output_path.clone(),
        }
    }

    /// Last checkpointed stage, if any
    pub fn last_completed(&self) -> Option<StageName> {
        self.completed_stages.last().copied()
    }
}

/// Static project context visible to every stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: String,
    pub name: String,
    pub root_path: PathBuf,
    pub target_language: String,
    pub source_language: Option<String>,
    pub output_path: PathBuf,
}

impl ProjectContext {
    pub fn new(project: &Project) -> Self {
        Self {
            project_id: project.id.clone(),
            name: project.name.clone(),
            root_path: project.root_path.clone(),
            target_language: project.target_language.clone(),
            source_language: project.source_language.clone(),
            output_path: project.output_path.clone(),
        }
    }
}

/// State shared along the pipeline: project context plus every completed
/// stage's payload.
///
/// Stage inputs are derived only from this value, so restoring payloads from
/// checkpoints reproduces exactly the input an uninterrupted run would see.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineState {
    project: ProjectContext,
    outputs: BTreeMap<StageName, Value>,
}

impl PipelineState {
    pub fn new(project: ProjectContext) -> Self {
        Self {
            project,
            outputs: BTreeMap::new(),
        }
    }

    pub fn project(&self) -> &ProjectContext {
        &self.project
    }

    /// Record a completed stage's payload
    pub fn fold(&mut self, stage: StageName, payload: Value) {
        self.outputs.insert(stage, payload);
    }

    pub fn output(&self, stage: StageName) -> Option<&Value> {
        self.outputs.get(&stage)
    }

    /// Input document for `stage`
    ///
    /// Keys serialize in a fixed order, so the same state always yields the
    /// same bytes.
    pub fn stage_input(&self, stage: StageName) -> Value {
        json!({
            "stage": stage,
            "project": self.project,
            "stages": self.outputs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::project::ProjectStatus;
    use chrono::Utc;

    fn project() -> Project {
        Project {
            id: "order-service-go".to_string(),
            name: "order-service".to_string(),
            root_path: PathBuf::from("/src/order-service"),
            target_language: "go".to_string(),
            output_path: PathBuf::from("translated/order-service-go"),
            source_language: Some("python".to_string()),
            status: ProjectStatus::Started,
            created_at: Utc::now(),
            completed_at: None,
            failure: None,
        }
    }

    #[test]
    fn test_stage_input_contains_prior_outputs() {
        let mut state = PipelineState::new(ProjectContext::new(&project()));
        state.fold(StageName::Traverse, json!({"files": 3}));
        state.fold(StageName::AnalyzeProject, json!({"language": "python"}));

        let input = state.stage_input(StageName::ClassifyFiles);
        assert_eq!(input["stage"], "classify_files");
        assert_eq!(input["project"]["target_language"], "go");
        assert_eq!(input["stages"]["traverse"]["files"], 3);

        assert_eq!(input["stages"]["analyze_project"]["language"], "python");
    }

    #[test]
    fn test_stage_input_is_deterministic() {
        let mut a = PipelineState::new(ProjectContext::new(&project()));
        let mut b = a.clone();
        a.fold(StageName::AnalyzeProject, json!({"x": 1, "a": 2}));
        a.fold(StageName::Traverse, json!([]));
        b.fold(StageName::Traverse, json!([]));
        b.fold(StageName::AnalyzeProject, json!({"a": 2, "x": 1}));

        let left = serde_json::to_string(&a.stage_input(StageName::Document)).unwrap();
        let right = serde_json::to_string(&b.stage_input(StageName::Document)).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn test_success_statuses() {
        assert!(RunStatus::Completed.is_success());
        assert!(RunStatus::AwaitingReview.is_success());
        assert!(RunStatus::AnalysisComplete.is_success());
        assert!(!RunStatus::Failed.is_success());
        assert!(!RunStatus::Cancelled.is_success());
    }
}
