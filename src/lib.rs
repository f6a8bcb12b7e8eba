//! codeport - Checkpointed orchestration for codebase translation
//!
//! Drives a source project through a fixed sequence of stages (analysis,
//! documentation, translation, gap filling, output) delegating the actual
//! work to an external capability provider.
//!
//! # Architecture
//!
//! The system is built around checkpoints:
//! - Every completed stage's output is persisted before the run advances
//! - A resumed run restores completed stages instead of re-executing them
//! - Provider calls share one rate limit and concurrency bound, with retry
//!   for transient failures
//! - An optional human review gate suspends the run after the analysis phase
//!
//! # Modules
//!
//! - `adapters`: Capability providers (external command)
//! - `core`: Orchestration logic (Executor, CheckpointStore, Registry, Orchestrator)
//! - `domain`: Data structures (Project, StageName, RunResult)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Translate a project to Go
//! codeport run ./order-service go
//!
//! # Approve the review gate and continue
//! codeport approve ./order-service go --feedback "keep package layout"
//!
//! # Check project status
//! codeport status ./order-service go
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use adapters::{CapabilityProvider, CommandProvider, ProviderError};
pub use config::Settings;
pub use core::{CancellationSignal, Orchestrator, RunRequest};
pub use domain::{Project, ProjectStatus, RunResult, RunStatus, StageName};
pub use error::{ErrorClass, PipelineError};
