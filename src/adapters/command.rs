//! Subprocess capability provider.
//!
//! Spawns the configured command once per call as
//! `<command> [args...] --stage <stage>`, writes the stage input JSON to
//! stdin and parses stdout as the stage payload. The exit code decides how a
//! failure is classified.

use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CapabilityProvider, ProviderError};
use crate::domain::StageName;

/// `EX_TEMPFAIL`: temporary failure, try again later
pub const EXIT_TEMPFAIL: i32 = 75;

/// `EX_UNAVAILABLE`: upstream service unavailable (rate limited, 5xx)
pub const EXIT_UNAVAILABLE: i32 = 69;

/// Provider section of the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider name used in logs and for rate limiting (default: "default")
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Executable to spawn (default: "codeport-provider")
    #[serde(default = "default_provider_command")]
    pub command: String,

    /// Arguments placed before `--stage <stage>`
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_provider_name() -> String {
    "default".to_string()
}
fn default_provider_command() -> String {
    "codeport-provider".to_string()
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            command: default_provider_command(),
            args: Vec::new(),
        }
    }
}

/// Provider that delegates every stage to an external command
pub struct CommandProvider {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self::new(
            settings.name.clone(),
            settings.command.clone(),
            settings.args.clone(),
        )
    }

    /// Run the command once for `stage`
    ///
    /// The child is killed if this future is dropped, so a call timeout in
    /// the executor never leaks a process.
    async fn execute_subprocess(&self, stage: StageName, input: &str) -> Result<String, ProviderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(["--stage", stage.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::Permanent(format!(
                    "failed to spawn provider '{}' for stage '{}': {}",
                    self.program, stage, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading still reports through its exit code
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ProviderError::Permanent(format!(
                        "failed to write provider stdin: {}",
                        e
                    )));
                }
            }
            // Drop stdin to signal EOF
        }

        let output = child.wait_with_output().await.map_err(|e| {
            ProviderError::Transient(format!("failed to wait for provider process: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_exit(stage, output.status.code(), stderr.trim()));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| ProviderError::Permanent("provider output is not valid UTF-8".to_string()))
    }
}

/// Map a non-zero exit to a provider error
///
/// A process killed by a signal has no exit code and is treated as
/// transient.
pub fn classify_exit(stage: StageName, code: Option<i32>, stderr: &str) -> ProviderError {
    match code {
        Some(EXIT_TEMPFAIL) | Some(EXIT_UNAVAILABLE) => ProviderError::Transient(format!(
            "stage '{}' exited with {}: {}",
            stage,
            code.unwrap_or_default(),
            stderr
        )),
        Some(code) => ProviderError::Permanent(format!(
            "stage '{}' exited with {}: {}",
            stage, code, stderr
        )),
        None => ProviderError::Transient(format!(
            "stage '{}' provider was terminated by a signal: {}",
            stage, stderr
        )),
    }
}

#[async_trait]
impl CapabilityProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, stage: StageName, input: &Value) -> Result<Value, ProviderError> {
        let stdout = self.execute_subprocess(stage, &input.to_string()).await?;
        serde_json::from_str(stdout.trim()).map_err(|e| {
            ProviderError::Permanent(format!(
                "stage '{}' returned invalid JSON: {}",
                stage, e
            ))
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--health")
            .output()
            .await
            .map_err(|e| {
                ProviderError::Permanent(format!(
                    "failed to run provider '{}' health check: {}",
                    self.program, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Permanent(format!(
                "provider health check failed: {}",
                stderr.trim()
            )));
        }

        Ok(())
    }
}
