//! Main orchestrator for translation runs.
//!
//! Sequences the stages of a project, restoring completed stages from
//! checkpoints and executing the rest through the stage handlers. Every
//! executed stage is checkpointed before the run advances, so a run can be
//! interrupted at any point and resumed without repeating finished work.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cancel::CancellationSignal;
use super::checkpoint_store::{CheckpointStore, PutOutcome, SqliteCheckpointStore};
use super::db::Database;
use super::executor::{AttemptLedger, Executor, RetryPolicy, RetryScope};
use super::lock::RunLock;
use super::pipeline::{
    HandlerRegistry, Pipeline, StageContext, StageDescriptor, StageHandler, StageSettings,
};
use super::registry::ProjectRegistry;
use super::safety::RunTracker;
use crate::adapters::{CapabilityProvider, CommandProvider};
use crate::config::Settings;
use crate::domain::{
    project_identifier, project_name, PipelineState, Project, ProjectContext, ProjectStatus,
    RunResult, RunStatus, StageCheckpoint, StageFailure, StageName,
};
use crate::error::{ErrorClass, PipelineError};

/// A request to drive one project through the pipeline
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Root of the source project
    pub project_root: PathBuf,

    /// Target language identifier
    pub target_language: String,

    /// Honor existing checkpoints instead of starting fresh
    pub resume: bool,

    /// Source language hint passed to stages
    pub source_language: Option<String>,

    /// Literal output directory, overriding `{output_root}/{id}`
    pub output: Option<PathBuf>,

    /// Enable or disable the review gate, overriding configuration
    pub review: Option<bool>,

    /// Stop after the analysis stages
    pub dry_run: bool,

    /// Cancels the run cooperatively
    pub cancel: CancellationSignal,
}

impl RunRequest {
    pub fn new(project_root: impl Into<PathBuf>, target_language: impl Into<String>) -> Self {
        Self {
            project_root: project_root.into(),
            target_language: target_language.into(),
            resume: false,
            source_language: None,
            output: None,
            review: None,
            dry_run: false,
            cancel: CancellationSignal::new(),
        }
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_review(mut self, review: bool) -> Self {
        self.review = Some(review);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_source_language(mut self, language: impl Into<String>) -> Self {
        self.source_language = Some(language.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Snapshot of a project and its checkpoints
#[derive(Debug, Clone)]
pub struct ProjectReport {
    pub project: Project,

    /// Checkpoints in pipeline order
    pub checkpoints: Vec<StageCheckpoint>,

    /// Every stage before the review gate is checkpointed and the gate is
    /// not yet approved, so `approve` would succeed
    pub review_pending: bool,
}

/// Main pipeline orchestrator
pub struct Orchestrator {
    settings: Settings,
    store: Arc<dyn CheckpointStore>,
    registry: ProjectRegistry,
    executor: Arc<Executor>,
    provider: Arc<dyn CapabilityProvider>,
    handlers: HandlerRegistry,
}

impl Orchestrator {
    /// Create an orchestrator over an open database
    pub fn new(settings: Settings, db: Database, provider: Arc<dyn CapabilityProvider>) -> Self {
        let executor = Arc::new(Executor::from_settings(
            &settings.executor,
            settings.limits.call_timeout(),
        ));
        Self {
            store: Arc::new(SqliteCheckpointStore::new(db.clone())),
            registry: ProjectRegistry::new(db),
            executor,
            provider,
            handlers: HandlerRegistry::with_defaults(),
            settings,
        }
    }

    /// Open the configured database and provider
    pub fn from_settings(settings: Settings) -> Result<Self, PipelineError> {
        settings.validate()?;
        let db = Database::open(&settings.database_path())?;
        let provider = Arc::new(CommandProvider::from_settings(&settings.provider));
        Ok(Self::new(settings, db, provider))
    }

    /// Replace the checkpoint store
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    /// Share an executor (and its limits) with other orchestrators
    pub fn with_executor(mut self, executor: Arc<Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Override the handler for one stage
    pub fn with_handler(mut self, stage: StageName, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.register(stage, handler);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn CheckpointStore {
        self.store.as_ref()
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn provider(&self) -> &Arc<dyn CapabilityProvider> {
        &self.provider
    }

    /// Drive a project through the pipeline
    ///
    /// Stage failures end in a `failed` result with the project marked
    /// failed. Configuration, persistence and state transition errors are
    /// returned as `Err` and leave the project as it was.
    #[instrument(
        skip(self, request),
        fields(
            root = %request.project_root.display(),
            target = %request.target_language,
            run_id = tracing::field::Empty,
        )
    )]
    pub async fn run(&self, request: RunRequest) -> Result<RunResult, PipelineError> {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        self.settings.validate()?;
        let (root, name, language) = self.identify(&request.project_root, &request.target_language)?;
        let _lock = RunLock::acquire(&self.settings.lock_dir(), &project_identifier(&name, &language))?;

        let output_path = self
            .settings
            .output_path(request.output.as_deref(), &name, &language);
        let mut project = self
            .registry
            .resolve_or_create(
                &name,
                &language,
                &root,
                &output_path,
                request.source_language.as_deref(),
            )
            .await?;
        if request.output.is_some() && project.output_path != output_path {
            warn!(
                project_id = %project.id,
                stored = %project.output_path.display(),
                "Output path is fixed at project creation, ignoring override"
            );
        }
        if request.source_language.is_some() && project.source_language != request.source_language {
            warn!(
                project_id = %project.id,
                stored = ?project.source_language,
                "Source language is fixed at project creation, ignoring override"
            );
        }

        let mut pipeline = Pipeline::build(&StageSettings {
            human_review: request.review.unwrap_or(self.settings.stages.human_review),
            ..self.settings.stages.clone()
        });

        if request.resume {
            // An approved gate keeps its place so the feedback reaches later stages
            if !pipeline.contains(StageName::HumanReview)
                && self.store.get(&project.id, StageName::HumanReview).await?.is_some()
            {
                pipeline = pipeline.with_review();
            }
        } else {
            let cleared = self.store.clear(&project.id).await?;
            if cleared > 0 {
                info!(project_id = %project.id, cleared, "Cleared checkpoints for fresh run");
            }
        }
        if request.dry_run {
            pipeline = pipeline.analysis_only();
        }

        info!(
            %run_id,
            project_id = %project.id,
            resume = request.resume,
            dry_run = request.dry_run,
            stages = pipeline.stages().len(),
            "Starting run"
        );

        if project.status == ProjectStatus::Completed
            && request.resume
            && self.all_checkpointed(&project.id, &pipeline).await?
        {
            info!(project_id = %project.id, "Project already completed, nothing to do");
            let mut result = RunResult::new(run_id, &project, RunStatus::Completed);
            result.completed_stages = pipeline.names();
            return Ok(result);
        }
        // A fresh run restarts the lifecycle along with the checkpoints
        if !request.resume || project.status.is_terminal() {
            project = self.registry.reopen(&project.id).await?;
        }

        let mut state = PipelineState::new(ProjectContext::new(&project));
        let ledger = AttemptLedger::new();
        let mut tracker = RunTracker::new();
        let mut result = RunResult::new(run_id, &project, RunStatus::Completed);
        let mut restoring = true;

        for descriptor in pipeline.stages() {
            let stage = descriptor.name;

            if restoring {
                if let Some(checkpoint) = self.store.get(&project.id, stage).await? {
                    debug!(%stage, "Restored stage from checkpoint");
                    state.fold(stage, checkpoint.payload);
                    result.completed_stages.push(stage);
                    continue;
                }
                restoring = false;
                self.discard_after(&project.id, &pipeline, stage).await?;
            }

            if request.cancel.is_cancelled() {
                return Ok(self.cancelled(result, &ledger, stage));
            }

            if stage == StageName::HumanReview {
                info!(project_id = %project.id, "Awaiting human review");
                result.status = RunStatus::AwaitingReview;
                result.attempts = ledger.snapshot();
                return Ok(result);
            }

            project = self.advance(project, stage.phase().project_status()).await?;

            let input = state.stage_input(stage);
            info!(%stage, "Executing stage");
            let outcome = match self.settings.limits.validate_input(&input) {
                Ok(()) => {
                    self.execute_stage(*descriptor, &state, input.clone(), &ledger, &request.cancel)
                        .await
                }
                Err(violation) => Err(PipelineError::LimitExceeded { stage, violation }),
            };
            let outcome = outcome.and_then(|payload| {
                self.settings
                    .limits
                    .validate_payload(&payload)
                    .map(|()| payload)
                    .map_err(|violation| PipelineError::LimitExceeded { stage, violation })
            });

            match outcome {
                Ok(_) if request.cancel.is_cancelled() => {
                    return Ok(self.cancelled(result, &ledger, stage));
                }
                Ok(payload) => {
                    let attempts = ledger.get(stage).max(1);
                    if let Err(e) = self.store.put(&project.id, stage, &payload, attempts).await {
                        error!(%stage, error = %e, "Failed to persist checkpoint, aborting run");
                        return Err(e.into());
                    }
                    tracker.record_stage(&input, &payload);
                    state.fold(stage, payload);
                    result.completed_stages.push(stage);
                    result.executed_stages.push(stage);
                    info!(%stage, attempts, "Stage completed");
                }
                Err(PipelineError::Cancelled) => {
                    return Ok(self.cancelled(result, &ledger, stage));
                }
                Err(e) if e.aborts_run() => {
                    error!(%stage, error = %e, "Run aborted");
                    return Err(e);
                }
                Err(e) => {
                    let failure = StageFailure {
                        stage: e.stage().unwrap_or(stage),
                        class: e.class(),
                        message: e.to_string(),
                    };
                    error!(%stage, class = %failure.class, error = %e, "Stage failed");
                    self.registry
                        .mark_failed(&project.id, Some(failure.stage), failure.class, &failure.message)
                        .await?;
                    result.status = RunStatus::Failed;
                    result.failure = Some(failure);
                    result.attempts = ledger.snapshot();
                    return Ok(result);
                }
            }
        }

        result.attempts = ledger.snapshot();

        if request.dry_run {
            info!(
                project_id = %project.id,
                stages_executed = tracker.stages_executed,
                "Analysis complete"
            );
            result.status = RunStatus::AnalysisComplete;
            return Ok(result);
        }

        self.registry
            .update_status(&project.id, ProjectStatus::Completed, Some(Utc::now()))
            .await?;
        info!(
            project_id = %project.id,
            stages_executed = tracker.stages_executed,
            input_bytes = tracker.input_bytes,
            output_bytes = tracker.output_bytes,
            elapsed_ms = tracker.elapsed_ms(),
            "Run completed"
        );
        result.status = RunStatus::Completed;
        Ok(result)
    }

    /// Execute one stage under the stage timeout and retry scope
    async fn execute_stage(
        &self,
        descriptor: StageDescriptor,
        state: &PipelineState,
        input: Value,
        ledger: &AttemptLedger,
        cancel: &CancellationSignal,
    ) -> Result<Value, PipelineError> {
        let stage = descriptor.name;
        let handler = self.handlers.get(stage).ok_or_else(|| {
            PipelineError::Configuration(format!("no handler registered for stage '{}'", stage))
        })?;

        let scope = self.settings.executor.retry_scope;
        let stage_policy = &self.settings.executor.retry;
        let call_policy = match scope {
            RetryScope::PerCall => stage_policy.clone(),
            RetryScope::PerStage => RetryPolicy::single_attempt(),
        };

        let ctx = StageContext {
            descriptor,
            state,
            input,
            provider: self.provider.as_ref(),
            executor: &self.executor,
            policy: &call_policy,
            ledger,
            cancel,
        };

        let work = async {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match handler.execute(&ctx).await {
                    Err(PipelineError::RetriesExhausted { last_error, .. })
                        if scope == RetryScope::PerStage =>
                    {
                        if !stage_policy.should_retry(attempt) {
                            return Err(PipelineError::RetriesExhausted {
                                stage,
                                attempts: attempt,
                                last_error,
                            });
                        }
                        let delay = stage_policy.backoff(attempt);
                        warn!(
                            %stage,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "Stage failed, retrying"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                            _ = sleep(delay) => {}
                        }
                    }
                    other => return other,
                }
            }
        };

        let limit = self.settings.limits.stage_timeout();
        match timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineError::StageTimeout { stage, limit }),
        }
    }

    /// Move the project forward to `status` unless it is already there or past it
    async fn advance(&self, project: Project, status: ProjectStatus) -> Result<Project, PipelineError> {
        if project.status == status || !project.status.can_transition_to(status) {
            return Ok(project);
        }
        self.registry.update_status(&project.id, status, None).await
    }

    /// Remove checkpoints after the first missing stage so the checkpointed
    /// stages always form a prefix of the pipeline
    async fn discard_after(
        &self,
        project_id: &str,
        pipeline: &Pipeline,
        missing: StageName,
    ) -> Result<(), PipelineError> {
        for later in pipeline.names().into_iter().filter(|s| *s > missing) {
            if self.store.remove(project_id, later).await? {
                warn!(stage = %later, %missing, "Discarded checkpoint after a missing stage");
            }
        }
        Ok(())
    }

    async fn all_checkpointed(&self, project_id: &str, pipeline: &Pipeline) -> Result<bool, PipelineError> {
        let stored: Vec<StageName> = self
            .store
            .list(project_id)
            .await?
            .into_iter()
            .map(|c| c.stage)
            .collect();
        Ok(pipeline.names().iter().all(|stage| stored.contains(stage)))
    }

    fn cancelled(&self, mut result: RunResult, ledger: &AttemptLedger, stage: StageName) -> RunResult {
        warn!(project_id = %result.project_id, %stage, "Run cancelled");
        result.status = RunStatus::Cancelled;
        result.attempts = ledger.snapshot();
        result
    }

    /// Canonical root, project name and normalized language for a run
    fn identify(&self, root: &Path, target_language: &str) -> Result<(PathBuf, String, String), PipelineError> {
        let language = self.settings.check_language(target_language)?;
        if !root.is_dir() {
            return Err(PipelineError::Configuration(format!(
                "project root {} is not a directory",
                root.display()
            )));
        }
        let root = root.canonicalize().map_err(|e| {
            PipelineError::Configuration(format!("cannot resolve {}: {}", root.display(), e))
        })?;
        let name = project_name(&root).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "cannot derive a project name from {}",
                root.display()
            ))
        })?;
        Ok((root, name, language))
    }

    /// Find an existing project without creating one
    async fn locate(&self, root: &Path, target_language: &str) -> Result<Project, PipelineError> {
        let language = self.settings.check_language(target_language)?;
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let name = project_name(&root).ok_or_else(|| {
            PipelineError::Configuration(format!(
                "cannot derive a project name from {}",
                root.display()
            ))
        })?;
        let id = project_identifier(&name, &language);
        self.registry
            .get(&id)
            .await?
            .ok_or(PipelineError::UnknownProject(id))
    }

    /// Pipeline used to judge the review gate
    fn review_pipeline(&self) -> Pipeline {
        Pipeline::build(&self.settings.stages).with_review()
    }

    async fn ensure_gate_reached(&self, project: &Project, pipeline: &Pipeline) -> Result<(), PipelineError> {
        for stage in pipeline.stages_before(StageName::HumanReview) {
            if self.store.get(&project.id, stage).await?.is_none() {
                return Err(PipelineError::GateNotReached { missing: stage });
            }
        }
        Ok(())
    }

    /// Approve the review gate, recording the reviewer's feedback
    ///
    /// Writes the `human_review` checkpoint; a later resumed run continues
    /// with the first stage after the gate.
    #[instrument(skip(self, feedback), fields(root = %project_root.display(), target = %target_language))]
    pub async fn approve_review(
        &self,
        project_root: &Path,
        target_language: &str,
        feedback: Option<String>,
    ) -> Result<PutOutcome, PipelineError> {
        let project = self.locate(project_root, target_language).await?;
        let _lock = RunLock::acquire(&self.settings.lock_dir(), &project.id)?;

        if project.status.is_terminal() {
            return Err(PipelineError::Configuration(format!(
                "project '{}' is {}, there is no review to approve",
                project.id, project.status
            )));
        }
        self.ensure_gate_reached(&project, &self.review_pipeline()).await?;

        let payload = json!({
            "approved": true,
            "feedback": feedback,
        });
        let outcome = self
            .store
            .put(&project.id, StageName::HumanReview, &payload, 1)
            .await?;
        info!(project_id = %project.id, ?outcome, "Review approved");
        Ok(outcome)
    }

    /// Approve the review gate and resume the run
    pub async fn resume_after_approval(
        &self,
        request: RunRequest,
        feedback: Option<String>,
    ) -> Result<RunResult, PipelineError> {
        self.approve_review(&request.project_root, &request.target_language, feedback)
            .await?;
        self.run(request.with_resume(true).with_review(true)).await
    }

    /// Reject the review gate, failing the project
    ///
    /// Checkpoints are kept; a fresh run starts over.
    #[instrument(skip(self, reason), fields(root = %project_root.display(), target = %target_language))]
    pub async fn reject_review(
        &self,
        project_root: &Path,
        target_language: &str,
        reason: &str,
    ) -> Result<Project, PipelineError> {
        let project = self.locate(project_root, target_language).await?;
        let _lock = RunLock::acquire(&self.settings.lock_dir(), &project.id)?;

        self.ensure_gate_reached(&project, &self.review_pipeline()).await?;
        if self.store.get(&project.id, StageName::HumanReview).await?.is_some() {
            return Err(PipelineError::Configuration(format!(
                "review for project '{}' was already approved",
                project.id
            )));
        }

        let rejection = PipelineError::ReviewRejected(reason.to_string());
        let project = self
            .registry
            .mark_failed(
                &project.id,
                Some(StageName::HumanReview),
                ErrorClass::ReviewRejected,
                &rejection.to_string(),
            )
            .await?;
        info!(project_id = %project.id, "Review rejected");
        Ok(project)
    }

    /// Status and checkpoints of one project
    pub async fn report(&self, project_root: &Path, target_language: &str) -> Result<ProjectReport, PipelineError> {
        let project = self.locate(project_root, target_language).await?;
        let checkpoints = self.store.list(&project.id).await?;

        let review_pending = !project.status.is_terminal()
            && !checkpoints.iter().any(|c| c.stage == StageName::HumanReview)
            && self
                .review_pipeline()
                .stages_before(StageName::HumanReview)
                .all(|stage| checkpoints.iter().any(|c| c.stage == stage));

        Ok(ProjectReport {
            project,
            checkpoints,
            review_pending,
        })
    }

    /// Registered projects, newest first
    pub async fn projects(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>, PipelineError> {
        self.registry.list(status).await
    }
}
