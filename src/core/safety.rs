//! Limits and enforcement for stage execution.
//!
//! Bounds how long a provider call or a whole stage may run and how large
//! stage inputs and payloads may grow before they are checkpointed.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Limits applied to every stage of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLimits {
    /// Timeout for a single provider attempt in seconds (default: 300 = 5 min)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Timeout for a whole stage, retries included (default: 3600 = 1 hour)
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,

    /// Maximum serialized stage input in bytes (default: 10MB)
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,

    /// Maximum serialized stage payload in bytes (default: 10MB)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
}

fn default_call_timeout() -> u64 {
    300
} // 5 min
fn default_stage_timeout() -> u64 {
    3600
} // 1 hour
fn default_max_input_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB
fn default_max_payload_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB

impl Default for StageLimits {
    fn default() -> Self {
        Self {
            call_timeout_seconds: default_call_timeout(),
            stage_timeout_seconds: default_stage_timeout(),
            max_input_bytes: default_max_input_bytes(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl StageLimits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }

    /// Validate a stage input against the size limit
    pub fn validate_input(&self, input: &Value) -> Result<(), LimitViolation> {
        let size = serialized_len(input);
        if size > self.max_input_bytes {
            return Err(LimitViolation::MaxInputBytes {
                actual: size,
                limit: self.max_input_bytes,
            });
        }
        Ok(())
    }

    /// Validate a stage payload before it is checkpointed
    pub fn validate_payload(&self, payload: &Value) -> Result<(), LimitViolation> {
        let size = serialized_len(payload);
        if size > self.max_payload_bytes {
            return Err(LimitViolation::MaxPayloadBytes {
                actual: size,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }
}

fn serialized_len(value: &Value) -> u64 {
    value.to_string().len() as u64
}

/// A limit that a stage exceeded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitViolation {
    #[error("stage input is {actual} bytes, limit is {limit}")]
    MaxInputBytes { actual: u64, limit: u64 },

    #[error("stage payload is {actual} bytes, limit is {limit}")]
    MaxPayloadBytes { actual: u64, limit: u64 },
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct RunTracker {
    /// Number of stages executed (not restored)
    pub stages_executed: u32,

    /// Total input bytes sent to stages
    pub input_bytes: u64,

    /// Total payload bytes produced
    pub output_bytes: u64,

    /// When the run started
    pub started_at: Instant,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            stages_executed: 0,
            input_bytes: 0,
            output_bytes: 0,
            started_at: Instant::now(),
        }
    }

    /// Record a stage execution
    pub fn record_stage(&mut self, input: &Value, payload: &Value) {
        self.stages_executed += 1;
        self.input_bytes += serialized_len(input);
        self.output_bytes += serialized_len(payload);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
