//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use codeport::adapters::{CapabilityProvider, ProviderError};
use codeport::config::Settings;
use codeport::core::{CancellationSignal, Database, Orchestrator, RetryPolicy, RunRequest};
use codeport::domain::StageName;

/// Provider that answers from per-stage scripts and records every call
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<HashMap<StageName, Value>>,
    scripts: Mutex<HashMap<StageName, VecDeque<Result<Value, ProviderError>>>>,
    failures: Mutex<HashMap<StageName, ProviderError>>,
    delays: Mutex<HashMap<StageName, Duration>>,
    cancel_on: Mutex<Option<(StageName, CancellationSignal)>>,
    calls: Mutex<Vec<(StageName, Value)>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload returned for `stage` once its script is used up
    pub fn respond(&self, stage: StageName, payload: Value) {
        self.responses.lock().unwrap().insert(stage, payload);
    }

    /// Results returned, in order, by the next calls for `stage`
    pub fn script(&self, stage: StageName, results: Vec<Result<Value, ProviderError>>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(stage, results.into_iter().collect());
    }

    /// Every call for `stage` fails with `error`
    pub fn fail(&self, stage: StageName, error: ProviderError) {
        self.failures.lock().unwrap().insert(stage, error);
    }

    pub fn recover(&self, stage: StageName) {
        self.failures.lock().unwrap().remove(&stage);
    }

    pub fn delay(&self, stage: StageName, delay: Duration) {
        self.delays.lock().unwrap().insert(stage, delay);
    }

    /// Fire `signal` while a call for `stage` is in flight
    pub fn cancel_during(&self, stage: StageName, signal: CancellationSignal) {
        *self.cancel_on.lock().unwrap() = Some((stage, signal));
    }

    pub fn calls_for(&self, stage: StageName) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .count()
    }

    pub fn inputs_for(&self, stage: StageName) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, input)| input.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CapabilityProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, stage: StageName, input: &Value) -> Result<Value, ProviderError> {
        self.calls.lock().unwrap().push((stage, input.clone()));

        let delay = self.delays.lock().unwrap().get(&stage).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let cancel = self.cancel_on.lock().unwrap().clone();
        if let Some((target, signal)) = cancel {
            if target == stage {
                signal.cancel();
            }
        }

        let failure = self.failures.lock().unwrap().get(&stage).cloned();
        if let Some(error) = failure {
            return Err(error);
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);
        if let Some(result) = scripted {
            return result;
        }

        let response = self.responses.lock().unwrap().get(&stage).cloned();
        Ok(response.unwrap_or_else(|| json!({ "stage": stage.as_str() })))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// A temporary engine home plus an `order-service` source project
pub struct Fixture {
    pub temp: TempDir,
    pub root: PathBuf,
    pub settings: Settings,
    pub provider: Arc<ScriptedProvider>,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("order-service");
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/orders.py"), "def create_order(): pass\n").unwrap();

        let mut settings = Settings::for_home(temp.path().join("home"));
        settings.output_root = temp.path().join("translated");
        settings.executor.retry = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        settings.executor.rate_limit.calls = 1000;
        settings.executor.rate_limit.window_seconds = 1;
        settings.provider.command = "scripted".to_string();

        let provider = Arc::new(ScriptedProvider::new());
        provider.respond(
            StageName::ExtractFunctions,
            json!({"functions": ["create_order", "cancel_order", "list_orders"]}),
        );
        provider.respond(
            StageName::Translate,
            json!({"files": {
                "go.mod": "module order-service\n",
                "internal/orders/orders.go": "package orders\n",
            }}),
        );
        provider.respond(
            StageName::FillGaps,
            json!({"files": {"internal/orders/orders_test.go": "package orders\n"}}),
        );

        Self {
            temp,
            root,
            settings,
            provider,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(self.settings.clone())
    }

    pub fn orchestrator_with(&self, settings: Settings) -> Orchestrator {
        let db = Database::open(&settings.database_path()).unwrap();
        Orchestrator::new(settings, db, self.provider.clone())
    }

    pub fn request(&self, target_language: &str) -> RunRequest {
        RunRequest::new(&self.root, target_language)
    }

    /// Where `{output_root}/order-service-{language}` lands
    pub fn output_dir(&self, target_language: &str) -> PathBuf {
        self.settings
            .output_root
            .join(format!("order-service-{}", target_language))
    }
}
