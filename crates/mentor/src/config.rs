//! Mentor configuration
//!
//! Every timeout and threshold in the layer lives here so the embedding
//! application can tune them without touching the components.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Timeout for availability probes (`engram --help`, `npx engram --help`).
pub const PROBE_TIMEOUT_SECS: u64 = 10;

/// Timeout for standard bridge operations.
pub const OP_TIMEOUT_SECS: u64 = 30;

/// Timeout for a global install attempt.
pub const INSTALL_TIMEOUT_SECS: u64 = 300;

/// Timeout for the post-install runner smoke test.
pub const SMOKE_TIMEOUT_SECS: u64 = 60;

/// Consecutive failures after which the bridge disables itself.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Configuration for the whole layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentorConfig {
    /// Path handed to the tool via `ENGRAM_PATH` on every invocation
    pub store_path: PathBuf,

    /// Per-user config file written once on first successful detection.
    /// `None` resolves to `~/.engram/config.json`.
    pub tool_config_path: Option<PathBuf>,

    /// Whether the prober may attempt a best-effort npm install
    pub auto_install: bool,

    /// Probe timeout in seconds
    pub probe_timeout_secs: u64,

    /// Standard operation timeout in seconds
    pub op_timeout_secs: u64,

    /// Install timeout in seconds
    pub install_timeout_secs: u64,

    /// Post-install smoke-test timeout in seconds
    pub smoke_timeout_secs: u64,

    /// Consecutive failures before the bridge disables itself
    pub max_consecutive_errors: u32,

    /// Write-buffer capacity. `None` means unbounded (observed behavior of
    /// the layer this replaces); set a bound to cap memory.
    pub write_buffer_capacity: Option<usize>,

    /// Maximum concurrent replay tasks during recovery
    pub replay_concurrency: usize,
}

impl Default for MentorConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./engram.db"),
            tool_config_path: None,
            auto_install: true,
            probe_timeout_secs: PROBE_TIMEOUT_SECS,
            op_timeout_secs: OP_TIMEOUT_SECS,
            install_timeout_secs: INSTALL_TIMEOUT_SECS,
            smoke_timeout_secs: SMOKE_TIMEOUT_SECS,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            write_buffer_capacity: None,
            replay_concurrency: 4,
        }
    }
}

impl MentorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store path handed to the tool
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    /// Override the tool config file location (tests use a temp dir)
    pub fn with_tool_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_config_path = Some(path.into());
        self
    }

    /// Enable or disable the automatic install attempt
    pub fn with_auto_install(mut self, enabled: bool) -> Self {
        self.auto_install = enabled;
        self
    }

    /// Bound the write buffer
    pub fn with_write_buffer_capacity(mut self, capacity: usize) -> Self {
        self.write_buffer_capacity = Some(capacity);
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn smoke_timeout(&self) -> Duration {
        Duration::from_secs(self.smoke_timeout_secs)
    }
}
