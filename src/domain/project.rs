//! Translation projects and their status lifecycle.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::StageName;
use crate::error::ErrorClass;

/// Lifecycle status of a translation project
///
/// Status only moves forward. `Failed` is reachable from any non-terminal
/// status; leaving a terminal status requires an explicit reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Started,
    Analyzing,
    Translating,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Analyzing => "analyzing",
            Self::Translating => "translating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Started => 0,
            Self::Analyzing => 1,
            Self::Translating => 2,
            Self::Completed => 3,
            Self::Failed => 4,
        }
    }

    /// Whether this status ends the lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal forward move from this status
    ///
    /// A same-status update is not a transition; callers treat it as a no-op.
    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "analyzing" => Ok(Self::Analyzing),
            "translating" => Ok(Self::Translating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown project status: {}", other)),
        }
    }
}

/// Why a project was marked failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectFailure {
    /// Stage the error originated in, if any
    pub stage: Option<StageName>,

    /// Error class
    pub class: ErrorClass,

    /// Human-readable error message
    pub message: String,
}

/// A codebase being translated into one target language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Deterministic identifier, see [`project_identifier`]
    pub id: String,

    /// Basename of the project root
    pub name: String,

    /// Source project root
    pub root_path: PathBuf,

    /// Target language identifier
    pub target_language: String,

    /// Where translated output is written
    pub output_path: PathBuf,

    /// Source language hint given when the project was registered
    pub source_language: Option<String>,

    /// Current lifecycle status
    pub status: ProjectStatus,

    /// When the project was first registered
    pub created_at: DateTime<Utc>,

    /// When the project reached `completed`
    pub completed_at: Option<DateTime<Utc>>,

    /// Originating error when `failed`
    pub failure: Option<ProjectFailure>,
}

/// Project identifier for a `(name, target_language)` pair
///
/// Target languages never contain `-`, so the last hyphen always separates
/// the two parts and distinct pairs never collide.
pub fn project_identifier(name: &str, target_language: &str) -> String {
    format!("{}-{}", name, target_language)
}

/// Project name derived from a project root (its final path component)
pub fn project_name(root: &Path) -> Option<String> {
    root.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
}
