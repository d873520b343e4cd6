//! Configuration module for scriptbox.
//!
//! This module provides the configuration structures for the execution
//! engine: deadlines, size caps and worker-process settings. It supports
//! loading from JSON files and strings with validation.
//!
//! # Examples
//!
//! ```ignore
//! use scriptbox::config::EngineConfig;
//!
//! // Load from JSON file
//! let config = EngineConfig::from_file("scriptbox.json")?;
//!
//! // Create from JSON string
//! let json = r#"{"limits": {"default_deadline_ms": 2000}, "workers": {"max_concurrent": 4}}"#;
//! let config = EngineConfig::from_json_string(json)?;
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::realm::RealmLimits;

/// Execution limits applied to every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct LimitsConfig {
    /// Deadline used when a request does not ask for one.
    pub default_deadline_ms: u64,

    /// Hard ceiling on any request's deadline, regardless of what it asks for.
    pub max_deadline_ms: u64,

    /// Budget for starting the worker and parsing the program.
    ///
    /// Parsing is not billed against the execution deadline, but it still
    /// must finish; a worker that has not acknowledged compilation within
    /// this budget is killed and the request reports a timeout.
    pub compile_timeout_ms: u64,

    /// Maximum accepted program size in bytes.
    pub max_source_bytes: usize,

    /// Cap on buffered diagnostic output per execution, in bytes.
    pub max_output_bytes: usize,

    /// Address-space limit for each worker process (Unix only).
    ///
    /// `None` leaves the worker unbounded.
    pub memory_limit_bytes: Option<u64>,

    /// Maximum JavaScript call depth inside a realm.
    pub recursion_limit: usize,
}

/// How requests beyond `max_concurrent` are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Wait for a worker slot to free up.
    Queue,
    /// Refuse the request immediately.
    Reject,
}

/// Worker process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct WorkerConfig {
    /// Maximum number of worker processes alive at once.
    pub max_concurrent: usize,

    /// What to do with requests beyond `max_concurrent`.
    pub admission: AdmissionPolicy,

    /// Executable that implements the `worker` subcommand.
    ///
    /// Defaults to the current executable, which is right for the
    /// `scriptbox` binary; embedders and tests point it at the binary
    /// explicitly.
    pub program: Option<PathBuf>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Deadlines and size caps.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub workers: WorkerConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 5_000,
            max_deadline_ms: 30_000,
            compile_timeout_ms: 5_000,
            max_source_bytes: 64 * 1024,
            max_output_bytes: 1024 * 1024,
            memory_limit_bytes: Some(512 * 1024 * 1024),
            recursion_limit: 400,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            admission: AdmissionPolicy::Queue,
            program: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl LimitsConfig {
    /// Validates the limits.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Any deadline or byte cap is zero
    /// - The default deadline exceeds the maximum deadline
    pub fn validate(&self) -> Result<()> {
        if self.default_deadline_ms == 0 {
            return Err(anyhow!("default_deadline_ms must be greater than zero"));
        }
        if self.max_deadline_ms == 0 {
            return Err(anyhow!("max_deadline_ms must be greater than zero"));
        }
        if self.default_deadline_ms > self.max_deadline_ms {
            return Err(anyhow!(
                "default_deadline_ms ({}) exceeds max_deadline_ms ({})",
                self.default_deadline_ms,
                self.max_deadline_ms
            ));
        }
        if self.compile_timeout_ms == 0 {
            return Err(anyhow!("compile_timeout_ms must be greater than zero"));
        }
        if self.max_source_bytes == 0 {
            return Err(anyhow!("max_source_bytes must be greater than zero"));
        }
        if self.max_output_bytes == 0 {
            return Err(anyhow!("max_output_bytes must be greater than zero"));
        }
        if self.memory_limit_bytes == Some(0) {
            return Err(anyhow!("memory_limit_bytes must be greater than zero when set"));
        }
        if self.recursion_limit == 0 {
            return Err(anyhow!("recursion_limit must be greater than zero"));
        }
        Ok(())
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn max_deadline(&self) -> Duration {
        Duration::from_millis(self.max_deadline_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    /// Picks the deadline for one request.
    ///
    /// A missing or zero request falls back to the default; anything above
    /// the maximum is clamped to it.
    pub fn resolve_deadline(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(d) if !d.is_zero() => d.min(self.max_deadline()),
            _ => self.default_deadline(),
        }
    }

    /// Limits handed to the realm inside each worker.
    pub fn realm_limits(&self) -> RealmLimits {
        RealmLimits {
            max_output_bytes: self.max_output_bytes,
            recursion_limit: self.recursion_limit,
        }
    }
}

impl WorkerConfig {
    /// Validates the worker settings.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_concurrent` is zero or `program` is an empty
    /// path.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(anyhow!("max_concurrent must be greater than zero"));
        }
        if let Some(program) = &self.program {
            if program.as_os_str().is_empty() {
                return Err(anyhow!("program cannot be an empty path"));
            }
        }
        Ok(())
    }

    /// Resolves the worker executable.
    ///
    /// # Errors
    ///
    /// Returns an error if no program is configured and the current
    /// executable cannot be determined.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe().context("Failed to locate the worker executable"),
        }
    }
}

impl EngineConfig {
    /// Creates a new engine configuration.
    pub fn new(limits: LimitsConfig, workers: WorkerConfig) -> Self {
        Self { limits, workers }
    }

    /// Loads an engine configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read
    /// - The file content is not valid JSON
    /// - The JSON does not match the expected schema
    /// - The configuration validation fails
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_json_string(&content)
    }

    /// Loads an engine configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON, does not match the
    /// schema, or fails validation.
    pub fn from_json_string(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).context("Failed to parse JSON configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Converts the configuration to a pretty-printed JSON string.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize configuration to JSON")
    }

    /// Validates the entire engine configuration.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate().context("Invalid limits configuration")?;
        self.workers.validate().context("Invalid workers configuration")?;
        Ok(())
    }

    /// Merges another configuration into this one.
    ///
    /// Every field of `other` that differs from the built-in default
    /// overrides the corresponding field here; default-valued fields leave
    /// this configuration untouched. The result is re-validated.
    pub fn merge(&mut self, other: EngineConfig) -> Result<()> {
        let limits = LimitsConfig::default();
        let workers = WorkerConfig::default();

        overlay(&mut self.limits.default_deadline_ms, other.limits.default_deadline_ms, limits.default_deadline_ms);
        overlay(&mut self.limits.max_deadline_ms, other.limits.max_deadline_ms, limits.max_deadline_ms);
        overlay(&mut self.limits.compile_timeout_ms, other.limits.compile_timeout_ms, limits.compile_timeout_ms);
        overlay(&mut self.limits.max_source_bytes, other.limits.max_source_bytes, limits.max_source_bytes);
        overlay(&mut self.limits.max_output_bytes, other.limits.max_output_bytes, limits.max_output_bytes);
        overlay(&mut self.limits.memory_limit_bytes, other.limits.memory_limit_bytes, limits.memory_limit_bytes);
        overlay(&mut self.limits.recursion_limit, other.limits.recursion_limit, limits.recursion_limit);

        overlay(&mut self.workers.max_concurrent, other.workers.max_concurrent, workers.max_concurrent);
        overlay(&mut self.workers.admission, other.workers.admission, workers.admission);
        overlay(&mut self.workers.program, other.workers.program, workers.program);

        self.validate()
    }
}

/// Replaces `target` with `value` unless `value` is the built-in default.
fn overlay<T: PartialEq>(target: &mut T, value: T, default: T) {
    if value != default {
        *target = value;
    }
}
