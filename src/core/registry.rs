//! Project registry: deterministic identity and status lifecycle.
//!
//! Every status change is a read-check-write inside one transaction, so
//! concurrent runs sharing the database never interleave a transition.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use super::db::{column_error, format_timestamp, parse_timestamp, Database};
use crate::domain::{project_identifier, Project, ProjectFailure, ProjectStatus, StageName};
use crate::error::{ErrorClass, PipelineError};

const PROJECT_COLUMNS: &str = "id, project_name, project_root, target_language, output_path, \
     status, created_at, completed_at, failed_stage, error_class, error_message, source_language";

fn read_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let root: String = row.get(2)?;
    let output: String = row.get(4)?;
    let status_raw: String = row.get(5)?;
    let status = status_raw
        .parse::<ProjectStatus>()
        .map_err(|e| column_error(5, e))?;
    let created_raw: String = row.get(6)?;
    let completed_raw: Option<String> = row.get(7)?;
    let completed_at = completed_raw
        .map(|raw| parse_timestamp(7, &raw))
        .transpose()?;

    let failed_stage: Option<String> = row.get(8)?;
    let error_class: Option<String> = row.get(9)?;
    let error_message: Option<String> = row.get(10)?;
    let failure = match error_class {
        Some(class) => Some(ProjectFailure {
            stage: failed_stage
                .map(|s| s.parse::<StageName>().map_err(|e| column_error(8, e)))
                .transpose()?,
            class: class.parse::<ErrorClass>().map_err(|e| column_error(9, e))?,
            message: error_message.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        root_path: PathBuf::from(root),
        target_language: row.get(3)?,
        output_path: PathBuf::from(output),
        source_language: row.get(11)?,
        status,
        created_at: parse_timestamp(6, &created_raw)?,
        completed_at,
        failure,
    })
}

fn load_project(tx: &Transaction<'_>, project_id: &str) -> rusqlite::Result<Option<Project>> {
    tx.query_row(
        &format!("SELECT {} FROM translation_projects WHERE id = ?1", PROJECT_COLUMNS),
        params![project_id],
        read_project,
    )
    .optional()
}

/// Outcome of a guarded status change, computed inside the transaction
enum Transition {
    Applied(Project),
    Rejected { from: ProjectStatus, to: ProjectStatus },
    Missing,
}

impl Transition {
    fn into_result(self, project_id: &str) -> Result<Project, PipelineError> {
        match self {
            Self::Applied(project) => Ok(project),
            Self::Rejected { from, to } => Err(PipelineError::StateTransition {
                project_id: project_id.to_string(),
                from,
                to,
            }),
            Self::Missing => Err(PipelineError::UnknownProject(project_id.to_string())),
        }
    }
}

/// Registry of translation projects backed by `translation_projects`
#[derive(Clone)]
pub struct ProjectRegistry {
    db: Database,
}

impl ProjectRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Return the project for `(name, target_language)`, creating it as
    /// `started` when absent
    ///
    /// An existing project is returned unchanged; its paths and source
    /// language hint are immutable.
    pub async fn resolve_or_create(
        &self,
        name: &str,
        target_language: &str,
        root_path: &Path,
        output_path: &Path,
        source_language: Option<&str>,
    ) -> Result<Project, PipelineError> {
        let id = project_identifier(name, target_language);
        let name = name.to_string();
        let target_language = target_language.to_string();
        let root = root_path.to_string_lossy().to_string();
        let output = output_path.to_string_lossy().to_string();
        let source_language = source_language.map(str::to_string);
        let lookup_id = id.clone();

        let (project, created) = self
            .db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO translation_projects
                        (id, project_name, project_root, target_language, output_path,
                         source_language, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        lookup_id,
                        name,
                        root,
                        target_language,
                        output,
                        source_language,
                        ProjectStatus::Started.as_str(),
                        format_timestamp(&Utc::now()),
                    ],
                )?;
                let project = load_project(&tx, &lookup_id)?;
                tx.commit()?;
                Ok((project, inserted > 0))
            })
            .await?;

        let project = project.ok_or_else(|| PipelineError::UnknownProject(id.clone()))?;
        if created {
            info!(project_id = %project.id, "Registered project");
        } else {
            debug!(project_id = %project.id, status = %project.status, "Resolved existing project");
        }
        Ok(project)
    }

    pub async fn get(&self, project_id: &str) -> Result<Option<Project>, PipelineError> {
        let project_id = project_id.to_string();
        let project = self
            .db
            .call(move |conn| {
                let project = conn
                    .query_row(
                        &format!("SELECT {} FROM translation_projects WHERE id = ?1", PROJECT_COLUMNS),
                        params![project_id],
                        read_project,
                    )
                    .optional()?;
                Ok(project)
            })
            .await?;
        Ok(project)
    }

    /// All projects, newest first, optionally filtered by status
    pub async fn list(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>, PipelineError> {
        let projects = self
            .db
            .call(move |conn| {
                let mut projects = Vec::new();
                match status {
                    Some(status) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM translation_projects WHERE status = ?1
                             ORDER BY created_at DESC, id",
                            PROJECT_COLUMNS
                        ))?;
                        for project in stmt.query_map(params![status.as_str()], read_project)? {
                            projects.push(project?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM translation_projects ORDER BY created_at DESC, id",
                            PROJECT_COLUMNS
                        ))?;
                        for project in stmt.query_map([], read_project)? {
                            projects.push(project?);
                        }
                    }
                }
                Ok(projects)
            })
            .await?;
        Ok(projects)
    }

    /// Move a project forward to `status`
    ///
    /// Backward moves and moves out of a terminal status are rejected with
    /// [`PipelineError::StateTransition`]. Updating to the current status is a
    /// no-op.
    pub async fn update_status(
        &self,
        project_id: &str,
        status: ProjectStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Project, PipelineError> {
        let id = project_id.to_string();
        let outcome = self
            .db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut project) = load_project(&tx, &id)? else {
                    return Ok(Transition::Missing);
                };
                if project.status == status {
                    return Ok(Transition::Applied(project));
                }
                if !project.status.can_transition_to(status) {
                    return Ok(Transition::Rejected {
                        from: project.status,
                        to: status,
                    });
                }

                tx.execute(
                    "UPDATE translation_projects SET status = ?2, completed_at = COALESCE(?3, completed_at)
                     WHERE id = ?1",
                    params![id, status.as_str(), completed_at.as_ref().map(format_timestamp)],
                )?;
                tx.commit()?;

                project.status = status;
                if completed_at.is_some() {
                    project.completed_at = completed_at;
                }
                Ok(Transition::Applied(project))
            })
            .await?;

        let project = outcome.into_result(project_id)?;
        debug!(project_id, status = %project.status, "Project status updated");
        Ok(project)
    }

    /// Mark a non-terminal project failed, recording the originating error
    pub async fn mark_failed(
        &self,
        project_id: &str,
        stage: Option<StageName>,
        class: ErrorClass,
        message: &str,
    ) -> Result<Project, PipelineError> {
        let id = project_id.to_string();
        let message = message.to_string();
        let outcome = self
            .db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut project) = load_project(&tx, &id)? else {
                    return Ok(Transition::Missing);
                };
                if !project.status.can_transition_to(ProjectStatus::Failed) {
                    return Ok(Transition::Rejected {
                        from: project.status,
                        to: ProjectStatus::Failed,
                    });
                }

                tx.execute(
                    "UPDATE translation_projects
                     SET status = ?2, failed_stage = ?3, error_class = ?4, error_message = ?5
                     WHERE id = ?1",
                    params![
                        id,
                        ProjectStatus::Failed.as_str(),
                        stage.map(|s| s.as_str()),
                        class.as_str(),
                        message,
                    ],
                )?;
                tx.commit()?;

                project.status = ProjectStatus::Failed;
                project.failure = Some(ProjectFailure {
                    stage,
                    class,
                    message,
                });
                Ok(Transition::Applied(project))
            })
            .await?;

        let project = outcome.into_result(project_id)?;
        info!(project_id, stage = ?stage, class = %class, "Project marked failed");
        Ok(project)
    }

    /// Return a project to `started` for a fresh run
    ///
    /// Clears the recorded error and completion time. A project already at
    /// `started` is returned unchanged.
    pub async fn reopen(&self, project_id: &str) -> Result<Project, PipelineError> {
        let id = project_id.to_string();
        let outcome = self
            .db
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut project) = load_project(&tx, &id)? else {
                    return Ok(Transition::Missing);
                };
                if project.status == ProjectStatus::Started {
                    return Ok(Transition::Applied(project));
                }

                tx.execute(
                    "UPDATE translation_projects
                     SET status = ?2, completed_at = NULL, failed_stage = NULL,
                         error_class = NULL, error_message = NULL
                     WHERE id = ?1",
                    params![id, ProjectStatus::Started.as_str()],
                )?;
                tx.commit()?;

                project.status = ProjectStatus::Started;
                project.completed_at = None;
                project.failure = None;
                Ok(Transition::Applied(project))
            })
            .await?;

        let project = outcome.into_result(project_id)?;
        info!(project_id, "Project reopened");
        Ok(project)
    }
}
