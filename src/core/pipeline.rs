//! Pipeline definitions and stage handlers.
//!
//! The pipeline is the fixed stage order with optional stages switched on or
//! off by configuration. Each stage is executed by a [`StageHandler`] looked
//! up in a [`HandlerRegistry`]; the default handlers delegate to the
//! capability provider, except `emit_output` which writes files locally.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::cancel::CancellationSignal;
use super::executor::{AttemptLedger, CallError, Executor, RetryPolicy};
use crate::adapters::CapabilityProvider;
use crate::domain::{PipelineState, StageName, StagePhase, PIPELINE_ORDER};
use crate::error::PipelineError;

/// Which optional stages are enabled
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Run `translate_architecture` after `analyze_project`
    #[serde(default)]
    pub translate_architecture: bool,

    /// Suspend for human review after `document`
    #[serde(default)]
    pub human_review: bool,
}

/// A stage whose work is split into one provider call per item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    /// Stage whose payload carries the items
    pub source: StageName,

    /// Field of that payload holding the item array
    pub field: &'static str,
}

/// Static description of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: StageName,
    pub fan_out: Option<FanOut>,
}

impl StageDescriptor {
    pub fn for_stage(name: StageName) -> Self {
        let fan_out = match name {
            StageName::Document => Some(FanOut {
                source: StageName::ExtractFunctions,
                field: "functions",
            }),
            StageName::Translate => Some(FanOut {
                source: StageName::Document,
                field: "modules",
            }),
            StageName::FillGaps => Some(FanOut {
                source: StageName::Translate,
                field: "modules",
            }),
            _ => None,
        };
        Self { name, fan_out }
    }

    /// Items this stage fans out over, if the source payload carries them
    pub fn items<'a>(&self, state: &'a PipelineState) -> Option<&'a Vec<Value>> {
        let fan_out = self.fan_out?;
        state.output(fan_out.source)?.get(fan_out.field)?.as_array()
    }
}

/// The ordered stages a run executes
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
}

impl Pipeline {
    /// Build the pipeline for the given optional-stage settings
    pub fn build(settings: &StageSettings) -> Self {
        let stages = PIPELINE_ORDER
            .iter()
            .copied()
            .filter(|stage| match stage {
                StageName::TranslateArchitecture => settings.translate_architecture,
                StageName::HumanReview => settings.human_review,
                _ => true,
            })
            .map(StageDescriptor::for_stage)
            .collect();
        Self { stages }
    }

    /// Same pipeline with the review gate enabled
    pub fn with_review(mut self) -> Self {
        if !self.contains(StageName::HumanReview) {
            self.stages.push(StageDescriptor::for_stage(StageName::HumanReview));
            self.stages.sort_by_key(|d| d.name);
        }
        self
    }

    /// Only the analysis stages (used for dry runs)
    pub fn analysis_only(mut self) -> Self {
        self.stages
            .retain(|d| d.name.phase() == StagePhase::Analysis);
        self
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn names(&self) -> Vec<StageName> {
        self.stages.iter().map(|d| d.name).collect()
    }

    pub fn contains(&self, stage: StageName) -> bool {
        self.stages.iter().any(|d| d.name == stage)
    }

    /// Enabled stages strictly before `stage`
    pub fn stages_before(&self, stage: StageName) -> impl Iterator<Item = StageName> + '_ {
        self.stages
            .iter()
            .map(|d| d.name)
            .take_while(move |name| *name < stage)
    }
}

/// Everything a handler needs to execute one stage
pub struct StageContext<'a> {
    pub descriptor: StageDescriptor,
    pub state: &'a PipelineState,
    pub input: Value,
    pub provider: &'a dyn CapabilityProvider,
    pub executor: &'a Executor,
    pub policy: &'a RetryPolicy,
    pub ledger: &'a AttemptLedger,
    pub cancel: &'a CancellationSignal,
}

impl StageContext<'_> {
    pub fn stage(&self) -> StageName {
        self.descriptor.name
    }

    /// One provider call through the executor
    pub async fn invoke(&self, input: &Value) -> Result<Value, PipelineError> {
        let stage = self.stage();
        let provider = self.provider;
        self.executor
            .call(
                provider.name(),
                stage,
                self.policy,
                self.ledger,
                self.cancel,
                || provider.invoke(stage, input),
            )
            .await
            .map_err(|err| match err {
                CallError::Permanent(message) => PipelineError::PermanentProvider { stage, message },
                CallError::Exhausted {
                    attempts,
                    last_error,
                } => PipelineError::RetriesExhausted {
                    stage,
                    attempts,
                    last_error,
                },
                CallError::Cancelled => PipelineError::Cancelled,
            })
    }
}

/// Executes one stage and returns its payload
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Value, PipelineError>;
}

/// Default handler: delegate to the provider, fanning out when the stage's
/// item array is present
pub struct ProviderStage;

#[async_trait]
impl StageHandler for ProviderStage {
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Value, PipelineError> {
        let Some(items) = ctx.descriptor.items(ctx.state) else {
            return ctx.invoke(&ctx.input).await;
        };

        debug!(stage = %ctx.stage(), items = items.len(), "Fanning out stage");
        let inputs: Vec<Value> = items
            .iter()
            .enumerate()
            .map(|(index, item)| item_input(&ctx.input, index, item))
            .collect();
        let results = join_all(inputs.iter().map(|input| ctx.invoke(input))).await;

        let outputs = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "items": outputs }))
    }
}

fn item_input(base: &Value, index: usize, item: &Value) -> Value {
    let mut input = base.clone();
    if let Value::Object(map) = &mut input {
        map.insert("item".to_string(), item.clone());
        map.insert("item_index".to_string(), json!(index));
    }
    input
}

/// Writes the translated files under the project's output path
///
/// Files come from the `files` maps (`relative path -> content`) of the
/// `translate` and `fill_gaps` payloads, including per-item maps of fanned
/// out stages. `fill_gaps` wins when both name the same path.
pub struct EmitOutputStage;

#[async_trait]
impl StageHandler for EmitOutputStage {
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Value, PipelineError> {
        let files = collect_files(ctx.state)?;
        let root = ctx.state.project().output_path.clone();
        let count = files.len();

        let task_root = root.clone();
        let written = tokio::task::spawn_blocking(move || write_files(&task_root, &files))
            .await
            .map_err(|e| PipelineError::Output {
                path: root.clone(),
                message: format!("writer task failed: {}", e),
            })??;

        info!(output = %root.display(), files = count, "Wrote translated project");
        Ok(json!({
            "output_path": root,
            "files_written": written,
        }))
    }
}

fn collect_files(state: &PipelineState) -> Result<BTreeMap<String, String>, PipelineError> {
    let mut files = BTreeMap::new();
    for stage in [StageName::Translate, StageName::FillGaps] {
        let Some(payload) = state.output(stage) else {
            continue;
        };
        merge_files(&mut files, payload.get("files"))?;
        if let Some(items) = payload.get("items").and_then(Value::as_array) {
            for item in items {
                merge_files(&mut files, item.get("files"))?;
            }
        }
    }
    Ok(files)
}

fn merge_files(
    files: &mut BTreeMap<String, String>,
    source: Option<&Value>,
) -> Result<(), PipelineError> {
    let Some(map) = source.and_then(Value::as_object) else {
        return Ok(());
    };
    for (path, content) in map {
        let content = content.as_str().ok_or_else(|| PipelineError::Output {
            path: PathBuf::from(path),
            message: "file content must be a string".to_string(),
        })?;
        files.insert(path.clone(), content.to_string());
    }
    Ok(())
}

/// Resolve `relative` under `root`, rejecting absolute and escaping paths
pub fn output_file_path(root: &Path, relative: &str) -> Result<PathBuf, PipelineError> {
    let path = Path::new(relative);
    let escapes = relative.is_empty()
        || path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
    if escapes {
        return Err(PipelineError::Output {
            path: path.to_path_buf(),
            message: "output paths must be relative and stay inside the output directory"
                .to_string(),
        });
    }
    Ok(root.join(path))
}

fn write_files(root: &Path, files: &BTreeMap<String, String>) -> Result<Vec<String>, PipelineError> {
    let output_error = |path: &Path, e: &dyn std::fmt::Display| PipelineError::Output {
        path: path.to_path_buf(),
        message: e.to_string(),
    };

    // Validate everything before writing anything
    let targets = files
        .iter()
        .map(|(relative, content)| Ok((relative, output_file_path(root, relative)?, content)))
        .collect::<Result<Vec<_>, PipelineError>>()?;

    std::fs::create_dir_all(root).map_err(|e| output_error(root, &e))?;

    let mut written = Vec::with_capacity(targets.len());
    for (relative, target, content) in targets {
        let parent = target.parent().unwrap_or(root);
        std::fs::create_dir_all(parent).map_err(|e| output_error(parent, &e))?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| output_error(&target, &e))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| output_error(&target, &e))?;
        temp.persist(&target)
            .map_err(|e| output_error(&target, &e.error))?;
        written.push(relative.clone());
    }
    Ok(written)
}

/// Maps stages to their handlers
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<StageName, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    /// Registry without any handlers
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Provider-backed handlers for every stage plus the local output writer
    ///
    /// `human_review` has no handler: the orchestrator treats it as a gate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let provider: Arc<dyn StageHandler> = Arc::new(ProviderStage);
        for stage in PIPELINE_ORDER {
            match stage {
                StageName::HumanReview => {}
                StageName::EmitOutput => registry.register(stage, Arc::new(EmitOutputStage)),
                _ => registry.register(stage, Arc::clone(&provider)),
            }
        }
        registry
    }

    pub fn register(&mut self, stage: StageName, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage, handler);
    }

    pub fn get(&self, stage: StageName) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
