//! Client configuration
//!
//! Defaults reproduce the demo's fixed parameters. A JSON settings file and
//! `ENGINE_*` environment variables can override them, and the command line
//! overrides both.

use crate::engine::error::{EngineError, Result};
use crate::engine::factory::SessionSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name requested for the transient worker
    pub worker_name: String,

    /// Worker heap size in MB
    pub heap_mb: u32,

    /// How long to wait for a transient worker to come up
    pub start_timeout_ms: u64,

    /// Per-call deadline on transient worker sessions
    pub operation_timeout_ms: u64,

    /// Rows in the generated example table
    pub example_rows: u64,

    /// Rows kept from the end of a persistent query's table
    pub tail_rows: u64,

    pub poll_interval_ms: u64,

    pub connect_timeout_ms: u64,

    /// Deadline for attaching to a persistent query (none by default)
    pub attach_timeout_ms: Option<u64>,

    /// Per-call deadline on persistent query sessions (none by default)
    pub snapshot_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            worker_name: "ExampleTestWorker".to_string(),
            heap_mb: 2,
            start_timeout_ms: 600_000,
            operation_timeout_ms: 10_000,
            example_rows: 100,
            tail_rows: 100,
            poll_interval_ms: 500,
            connect_timeout_ms: 10_000,
            attach_timeout_ms: None,
            snapshot_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// Load a JSON settings file; absent keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            EngineError::Configuration(format!("Invalid settings in '{}': {}", path.display(), e))
        })
    }

    /// Apply `ENGINE_*` environment variables
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(name) = var("ENGINE_WORKER_NAME") {
            self.worker_name = name;
        }
        override_parsed(&var, "ENGINE_HEAP_MB", &mut self.heap_mb)?;
        override_parsed(&var, "ENGINE_START_TIMEOUT_MS", &mut self.start_timeout_ms)?;
        override_parsed(&var, "ENGINE_OPERATION_TIMEOUT_MS", &mut self.operation_timeout_ms)?;
        override_parsed(&var, "ENGINE_TAIL_ROWS", &mut self.tail_rows)?;
        override_parsed(&var, "ENGINE_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        override_parsed(&var, "ENGINE_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms)?;
        if let Some(value) = var("ENGINE_ATTACH_TIMEOUT_MS") {
            self.attach_timeout_ms = Some(parse_var("ENGINE_ATTACH_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = var("ENGINE_SNAPSHOT_TIMEOUT_MS") {
            self.snapshot_timeout_ms = Some(parse_var("ENGINE_SNAPSHOT_TIMEOUT_MS", &value)?);
        }
        Ok(self)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            connect_timeout: self.connect_timeout(),
            attach_timeout: self.attach_timeout_ms.map(Duration::from_millis),
            snapshot_timeout: self.snapshot_timeout_ms.map(Duration::from_millis),
        }
    }
}

fn override_parsed<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<()> {
    if let Some(value) = var(key) {
        *target = parse_var(key, &value)?;
    }
    Ok(())
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        EngineError::Configuration(format!("{} has invalid value '{}'", key, value))
    })
}
