//! Engine configuration
//!
//! Settings shared by the execution context, the host bridge and the batch
//! scheduler. Configurations are stored as RON files.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Per-class request timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Evaluate requests (milliseconds)
    pub evaluate_ms: u64,
    /// Combine-and-render requests (milliseconds)
    pub combine_ms: u64,
    /// Import requests (milliseconds)
    pub import_ms: u64,
    /// One batch export item (milliseconds)
    pub export_item_ms: u64,
    /// Cache resets and parameter queries (milliseconds)
    pub control_ms: u64,
    /// Waiting for the context to become ready (milliseconds)
    pub ready_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            evaluate_ms: EVALUATE_TIMEOUT_MS,
            combine_ms: COMBINE_TIMEOUT_MS,
            import_ms: IMPORT_TIMEOUT_MS,
            export_item_ms: EXPORT_ITEM_TIMEOUT_MS,
            control_ms: CONTROL_TIMEOUT_MS,
            ready_ms: READY_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    pub fn evaluate(&self) -> Duration {
        Duration::from_millis(self.evaluate_ms)
    }

    pub fn combine(&self) -> Duration {
        Duration::from_millis(self.combine_ms)
    }

    pub fn import(&self) -> Duration {
        Duration::from_millis(self.import_ms)
    }

    pub fn export_item(&self) -> Duration {
        Duration::from_millis(self.export_item_ms)
    }

    pub fn control(&self) -> Duration {
        Duration::from_millis(self.control_ms)
    }

    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready_ms)
    }
}

/// Script sandbox limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScriptConfig {
    /// Maximum number of operations per evaluation (0 = unlimited)
    pub max_operations: u64,
    /// Maximum expression nesting depth (0 = unlimited)
    pub max_expr_depth: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_operations: SCRIPT_MAX_OPERATIONS,
            max_expr_depth: SCRIPT_MAX_EXPR_DEPTH,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Chordal deviation for preview meshes
    pub default_deviation: f64,
    /// Chordal deviation for exports at quality 1.0
    pub export_deviation: f64,
    /// Whether preview results carry wireframe edges
    pub extract_edges: bool,
    /// Pause between batch items (milliseconds)
    pub batch_pause_ms: u64,
    pub timeouts: TimeoutConfig,
    pub script: ScriptConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_deviation: DEFAULT_DEVIATION,
            export_deviation: EXPORT_DEVIATION,
            extract_edges: true,
            batch_pause_ms: BATCH_PAUSE_MS,
            timeouts: TimeoutConfig::default(),
            script: ScriptConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Pause between batch items
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    /// Check values that would make the engine misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("default_deviation", self.default_deviation),
            ("export_deviation", self.export_deviation),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Load configuration from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_ron(&content)
    }

    /// Parse configuration from RON text
    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            ron::from_str(content).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a RON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
