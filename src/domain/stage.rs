//! Pipeline stages and their checkpoints.
//!
//! The pipeline is a fixed, ordered list of stages. Declaration order of
//! [`StageName`] is pipeline order, so ordered collections keyed by stage
//! iterate in execution order.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::project::ProjectStatus;

/// A stage of the translation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Survey the source project (languages, layout, entry points)
    AnalyzeProject,

    /// Map the source architecture onto the target language (optional)
    TranslateArchitecture,

    /// Walk the source tree
    Traverse,

    /// Classify files by role
    ClassifyFiles,

    /// Extract function-level units
    ExtractFunctions,

    /// Document extracted units
    Document,

    /// Human approval gate (optional)
    HumanReview,

    /// Translate documented units into the target language
    Translate,

    /// Fill gaps left by translation
    FillGaps,

    /// Write the translated project to the output path
    EmitOutput,
}

/// Every stage in pipeline order, optional ones included
pub const PIPELINE_ORDER: [StageName; 10] = [
    StageName::AnalyzeProject,
    StageName::TranslateArchitecture,
    StageName::Traverse,
    StageName::ClassifyFiles,
    StageName::ExtractFunctions,
    StageName::Document,
    StageName::HumanReview,
    StageName::Translate,
    StageName::FillGaps,
    StageName::EmitOutput,
];

/// Which half of the pipeline a stage belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    /// Everything up to and including the review gate
    Analysis,

    /// Translation and output
    Translation,
}

impl StagePhase {
    /// Project status a run moves to while executing a stage of this phase
    pub fn project_status(&self) -> ProjectStatus {
        match self {
            Self::Analysis => ProjectStatus::Analyzing,
            Self::Translation => ProjectStatus::Translating,
        }
    }
}

impl StageName {
    /// Stable identifier used in storage, logs and the provider protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalyzeProject => "analyze_project",
            Self::TranslateArchitecture => "translate_architecture",
            Self::Traverse => "traverse",
            Self::ClassifyFiles => "classify_files",
            Self::ExtractFunctions => "extract_functions",
            Self::Document => "document",
            Self::HumanReview => "human_review",
            Self::Translate => "translate",
            Self::FillGaps => "fill_gaps",
            Self::EmitOutput => "emit_output",
        }
    }

    pub fn phase(&self) -> StagePhase {
        if *self <= Self::HumanReview {
            StagePhase::Analysis
        } else {
            StagePhase::Translation
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PIPELINE_ORDER
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {}", s))
    }
}

/// A durable record of one completed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    /// Project the stage belongs to
    pub project_id: String,

    /// The completed stage
    pub stage: StageName,

    /// Stage output
    pub payload: serde_json::Value,

    /// SHA-256 of the canonical payload serialization
    pub payload_digest: String,

    /// Provider attempts the stage took
    pub attempts: u32,

    /// When the checkpoint was written
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_matches_declaration() {
        for pair in PIPELINE_ORDER.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_name_roundtrip() {
        for stage in PIPELINE_ORDER {
            assert_eq!(stage.as_str().parse::<StageName>().unwrap(), stage);
        }
        assert!("summarize".parse::<StageName>().is_err());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&StageName::ExtractFunctions).unwrap();
        assert_eq!(json, "\"extract_functions\"");
    }

    #[test]
    fn test_phases() {
        assert_eq!(StageName::Document.phase(), StagePhase::Analysis);
        assert_eq!(StageName::HumanReview.phase(), StagePhase::Analysis);
        assert_eq!(StageName::Translate.phase(), StagePhase::Translation);
        assert_eq!(StageName::EmitOutput.phase(), StagePhase::Translation);
    }
}
