//! Engine Configuration
//!
//! Tunables for the dispatcher and worker pool, loaded from YAML.
//! The default location comes from `STATERUNNER_CONFIG` or falls back
//! to `staterunner.yaml` in the working directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "STATERUNNER_CONFIG";

/// Default config file, resolved once per process.
pub static DEFAULT_CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("staterunner.yaml"))
});

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_POLL_INTERVAL_MS: u64 = 20;
const DEFAULT_TIMELINE_RETENTION: usize = 256;

/// Runtime settings for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads started by `start_workers`
    pub worker_threads: usize,
    /// Maximum externally submitted items waiting in the work queue
    pub queue_capacity: usize,
    /// How long an idle worker blocks before re-checking for shutdown
    pub poll_interval_ms: u64,
    /// Finished runs whose timelines are kept in memory
    pub timeline_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            timeline_retention: DEFAULT_TIMELINE_RETENTION,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Reading engine config: {}", path.display());
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        Ok(config.normalized())
    }

    /// Loads the default config file if it exists, otherwise defaults.
    pub fn load_or_default() -> Result<Self> {
        let path = DEFAULT_CONFIG_PATH.as_path();
        if path.exists() {
            info!("Using engine config: {}", path.display());
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_timeline_retention(mut self, runs: usize) -> Self {
        self.timeline_retention = runs.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn normalized(mut self) -> Self {
        self.worker_threads = self.worker_threads.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self.timeline_retention = self.timeline_retention.max(1);
        self
    }
}
