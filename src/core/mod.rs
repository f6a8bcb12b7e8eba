//! Core orchestration logic.
//!
//! This module contains:
//! - Executor: Rate-limited, concurrency-bounded provider calls with retry
//! - CheckpointStore: Durable per-stage outputs
//! - ProjectRegistry: Translation projects and their lifecycle
//! - Pipeline: Stage order and stage handlers
//! - Orchestrator: Main execution engine

pub mod cancel;
pub mod checkpoint_store;
pub mod db;
pub mod executor;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod rate_limiter;
pub mod registry;
pub mod safety;

// Re-export commonly used types
pub use cancel::CancellationSignal;
pub use checkpoint_store::{payload_digest, CheckpointStore, PutOutcome, SqliteCheckpointStore};
pub use db::{Database, StoreError};
pub use executor::{
    AttemptLedger, CallError, Executor, ExecutorSettings, RateLimitSettings, RetryPolicy, RetryScope,
};
pub use lock::RunLock;
pub use orchestrator::{Orchestrator, ProjectReport, RunRequest};
pub use pipeline::{
    HandlerRegistry, Pipeline, StageContext, StageDescriptor, StageHandler, StageSettings,
};
pub use rate_limiter::{RateLimit, RateWindow};
pub use registry::ProjectRegistry;
pub use safety::{LimitViolation, RunTracker, StageLimits};
