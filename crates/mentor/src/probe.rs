//! Availability detection for the engram CLI
//!
//! Probes whether the tool can be reached, in preference order: the `engram`
//! binary directly, then through the `npx` runner. With auto-install enabled
//! a failed probe may attempt one best-effort global npm install before
//! re-checking. Every failure anywhere in the ladder reduces to "unavailable";
//! the prober never returns an error.

use crate::bridge::InvocationStrategy;
use crate::config::MentorConfig;
use crate::invoke::{InvokeRequest, Invoker};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Detects whether the engram CLI is reachable and by which strategy
pub struct AvailabilityProber {
    invoker: Arc<dyn Invoker>,
    config: MentorConfig,
}

impl AvailabilityProber {
    pub fn new(invoker: Arc<dyn Invoker>, config: MentorConfig) -> Self {
        Self { invoker, config }
    }

    /// Run the detection ladder. Returns the strategy to use, or `None` when
    /// the tool cannot be reached at all.
    pub async fn probe(&self) -> Option<InvocationStrategy> {
        if let Some(strategy) = self.check_both().await {
            self.ensure_tool_config().await;
            return Some(strategy);
        }

        if self.config.auto_install {
            if self.try_install().await {
                if let Some(strategy) = self.check_both().await {
                    info!("engram available after install ({:?})", strategy);
                    self.ensure_tool_config().await;
                    return Some(strategy);
                }
            }
        }

        debug!("engram unavailable");
        None
    }

    /// Direct binary first, runner second
    async fn check_both(&self) -> Option<InvocationStrategy> {
        if self.check(["engram", "--help"]).await {
            return Some(InvocationStrategy::Direct);
        }
        if self.check(["npx", "engram", "--help"]).await {
            return Some(InvocationStrategy::Runner);
        }
        None
    }

    /// One probe invocation; anything but a clean zero exit counts as absent
    async fn check<const N: usize>(&self, argv: [&str; N]) -> bool {
        let request = InvokeRequest::new(argv, self.config.probe_timeout());
        match self.invoker.run(request).await {
            Ok(invocation) => invocation.success(),
            Err(e) => {
                debug!("probe failed: {}", e);
                false
            }
        }
    }

    /// Best-effort global install. Requires a working npm, then installs and
    /// smoke-tests through the runner. Failures are logged and absorbed.
    async fn try_install(&self) -> bool {
        let npm_check = InvokeRequest::new(["npm", "--version"], self.config.probe_timeout());
        match self.invoker.run(npm_check).await {
            Ok(invocation) if invocation.success() => {}
            _ => {
                debug!("npm not available, skipping install attempt");
                return false;
            }
        }

        info!("attempting global engram install");
        let install = InvokeRequest::new(
            ["npm", "install", "-g", "engram"],
            self.config.install_timeout(),
        );
        match self.invoker.run(install).await {
            Ok(invocation) if invocation.success() => {}
            Ok(invocation) => {
                warn!("engram install exited {}", invocation.exit_code);
                return false;
            }
            Err(e) => {
                warn!("engram install failed: {}", e);
                return false;
            }
        }

        let smoke = InvokeRequest::new(["npx", "engram", "--version"], self.config.smoke_timeout());
        match self.invoker.run(smoke).await {
            Ok(invocation) if invocation.success() => true,
            _ => {
                warn!("engram installed but smoke test failed");
                false
            }
        }
    }

    /// Write the per-user tool config once. Existing files are left alone;
    /// write failures are logged and ignored.
    async fn ensure_tool_config(&self) {
        let Some(path) = self.tool_config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        match write_tool_config(&path).await {
            Ok(()) => info!("wrote tool config to {}", path.display()),
            Err(e) => warn!("tool config not written: {:#}", e),
        }
    }

    fn tool_config_path(&self) -> Option<PathBuf> {
        match &self.config.tool_config_path {
            Some(path) => Some(path.clone()),
            None => dirs::home_dir().map(|home| home.join(".engram").join("config.json")),
        }
    }
}

async fn write_tool_config(path: &std::path::Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&default_tool_config())?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Feature toggles handed to the tool on first detection
fn default_tool_config() -> serde_json::Value {
    serde_json::json!({
        "reflexion": {
            "auto_save": true,
            "compression": true,
        },
        "causal": {
            "auto_track": true,
            "utility_model": true,
        },
        "skills": {
            "auto_extract": true,
            "success_threshold": 0.8,
        },
        "nightly_learner": {
            "enabled": true,
            "schedule": "2:00 AM",
        },
    })
}
