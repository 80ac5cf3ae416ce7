use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{BridgeError, ChannelBounds, Result};

/// Top-level configuration structure for the bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub frame: FrameConfig,
    pub buffer: BufferConfig,
    pub channels: ChannelBounds,
    pub script: ScriptConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl BridgeConfig {
    /// Parses a JSON document and validates the result.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.min > self.channels.max {
            return Err(BridgeError::InvalidConfig(format!(
                "channel bounds are inverted: min {} > max {}",
                self.channels.min, self.channels.max
            )));
        }
        if self.frame.budget_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "frame budget must be at least one millisecond".to_string(),
            ));
        }
        if self.script.entry_point.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "script entry point must not be empty".to_string(),
            ));
        }
        if self.script.progress_interval == 0 {
            return Err(BridgeError::InvalidConfig(
                "script progress interval must be non-zero".to_string(),
            ));
        }
        let script = &self.script;
        if script.max_array_size == 0 || script.max_map_size == 0 || script.max_string_size == 0 {
            return Err(BridgeError::InvalidConfig(
                "script size limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Timing limits applied to every frame invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub budget_ms: u64,
    pub grace_ms: u64,
}

impl FrameConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            budget_ms: 8,
            grace_ms: 2,
        }
    }
}

/// Whether entries appended by a script survive the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizePolicy {
    /// The committed buffer keeps its pre-call length.
    Fixed,
    /// Appended entries are propagated to the rendering pipeline.
    #[default]
    GrowOnAppend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub size_policy: SizePolicy,
    pub led_count: usize,
}

/// Settings for loading and driving a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub entry_point: String,
    /// Script operations between two deadline checks.
    pub progress_interval: u64,
    /// Largest array or blob a script may build.
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_string_size: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            entry_point: "update".to_string(),
            progress_interval: 256,
            max_array_size: 10_000,
            max_map_size: 500,
            max_string_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub history: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self { history: 32 }
    }
}
