//! Workspace configuration.
//!
//! Read from `<workspace>/.kiln/config.toml`. Every section and key is
//! optional; a missing file yields the defaults.
//!
//! ```toml
//! [sandbox]
//! manifest_file = "package.json"
//! install = { program = "npm", args = ["install"] }
//! dev = { program = "npm", args = ["run", "dev"] }
//!
//! [monitor]
//! debounce_ms = 1000
//! max_auto_recoveries = 3
//!
//! [generation]
//! first_chunk_timeout_secs = 60
//! fallback_provider = "relay"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreResult;
use crate::monitor::{FailureMonitor, DEFAULT_ERROR_KEYWORDS, DEFAULT_MAX_AUTO_RECOVERIES};

pub const CONFIG_FILE: &str = ".kiln/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub sandbox: SandboxConfig,
    pub monitor: MonitorConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Quiet period between a detected runtime error and the regeneration
    pub debounce_ms: u64,
    pub max_auto_recoveries: u32,
    pub error_keywords: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            max_auto_recoveries: DEFAULT_MAX_AUTO_RECOVERIES,
            error_keywords: DEFAULT_ERROR_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl MonitorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn build_monitor(&self) -> FailureMonitor {
        FailureMonitor::new(self.error_keywords.clone(), self.max_auto_recoveries)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub first_chunk_timeout_secs: u64,
    /// Model override for the primary source
    pub model: Option<String>,
    /// Provider tried when the primary fails before sending data
    pub fallback_provider: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            first_chunk_timeout_secs: 60,
            model: None,
            fallback_provider: None,
        }
    }
}

impl GenerationConfig {
    pub fn first_chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.first_chunk_timeout_secs)
    }
}

impl KilnConfig {
    pub fn path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(CONFIG_FILE)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the workspace config, or defaults when the file does not exist.
    pub fn load(workspace_root: &Path) -> CoreResult<Self> {
        let path = Self::path(workspace_root);
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, workspace_root: &Path) -> CoreResult<()> {
        let path = Self::path(workspace_root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
