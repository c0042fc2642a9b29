//! Configuration system for ctxkeeper.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::backend::SequenceId;
use crate::error::Error;
use crate::template::ChatTemplate;

/// Main configuration struct for ctxkeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Context window settings
    pub window: WindowConfig,
    /// Sampler settings handed to the backend
    pub sampling: SamplingConfig,
    /// Model settings
    pub model: ModelConfig,
    /// Snapshot storage settings
    pub snapshot: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Context window size in tokens
    pub capacity: usize,
    /// Headroom kept free before a prompt triggers pruning
    pub reserve_margin: usize,
    /// Headroom that must remain after pruning for a prompt to be accepted
    pub overflow_margin: usize,
    /// Sequence id of the conversation inside backend memory
    pub sequence_id: SequenceId,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: 2048,
            reserve_margin: 128,
            overflow_margin: 4,
            sequence_id: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature; 0 selects greedy sampling
    pub temperature: f32,
    /// Top-k cutoff; 0 disables it
    pub top_k: u32,
    /// Nucleus cutoff; 1.0 disables it
    pub top_p: f32,
    /// Repetition penalty over the whole window
    pub repeat_penalty: f32,
    /// Seed for the distribution sampler
    pub seed: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 50,
            top_p: 0.95,
            repeat_penalty: 1.15,
            seed: 0xFFFF_FFFF,
        }
    }
}

/// One stage of a sampler chain, in application order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    Penalties { last_n: usize, repeat: f32 },
    TopK(u32),
    TopP(f32),
    Temperature(f32),
    Distribution { seed: u32 },
    Greedy,
}

impl SamplingConfig {
    /// Build the sampler chain plan for a window of `window` tokens.
    pub fn stages(&self, window: usize) -> Vec<SamplerStage> {
        let mut stages = vec![SamplerStage::Penalties {
            last_n: window,
            repeat: self.repeat_penalty,
        }];
        if self.top_k > 0 {
            stages.push(SamplerStage::TopK(self.top_k));
        }
        if self.top_p < 1.0 {
            stages.push(SamplerStage::TopP(self.top_p));
        }
        if self.temperature > 0.0 {
            stages.push(SamplerStage::Temperature(self.temperature));
            stages.push(SamplerStage::Distribution { seed: self.seed });
        } else {
            stages.push(SamplerStage::Greedy);
        }
        stages
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model name, used in snapshot file names
    pub name: String,
    /// Prompt template
    pub template: ChatTemplate,
    /// System prompt primed into the window on load
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "reference".to_string(),
            template: ChatTemplate::default(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory for snapshot files (defaults to the user cache dir)
    pub directory: Option<PathBuf>,
}

impl SnapshotConfig {
    /// Resolve the snapshot directory.
    pub fn resolve_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| Config::cache_dir().join("snapshots"))
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    /// Field path (e.g., "window.reserve_margin")
    pub field: String,
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// The layered provider stack, lowest priority first.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            .merge(Toml::file(".ctxkeeper/config.toml"))
            .merge(Toml::file(".ctxkeeper/config.local.toml"))
            .merge(Env::prefixed("CTXKEEPER_").split("__"))
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        config.into_validated()
    }

    /// Validate an already-built configuration, logging warnings.
    pub fn into_validated(self) -> Result<Self, Error> {
        let result = self.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        let window = &self.window;

        if window.capacity == 0 {
            result.add_error("window.capacity", "capacity must be greater than 0");
        }

        if window.reserve_margin >= window.capacity {
            result.add_error(
                "window.reserve_margin",
                format!(
                    "reserve_margin ({}) must be smaller than capacity ({})",
                    window.reserve_margin, window.capacity
                ),
            );
        }

        if window.overflow_margin > window.reserve_margin {
            result.add_error(
                "window.overflow_margin",
                "overflow_margin cannot exceed reserve_margin",
            );
        }

        if window.capacity > 0 && window.reserve_margin * 2 > window.capacity {
            result.add_warning(
                "window.reserve_margin",
                "reserve_margin is more than half the window, pruning will run on every turn",
            );
        }

        if window.sequence_id < 0 {
            result.add_error("window.sequence_id", "sequence_id cannot be negative");
        }

        let sampling = &self.sampling;
        if sampling.temperature < 0.0 {
            result.add_error("sampling.temperature", "temperature cannot be negative");
        }

        if !(sampling.top_p > 0.0 && sampling.top_p <= 1.0) {
            result.add_error("sampling.top_p", "top_p must be in (0, 1]");
        }

        if sampling.repeat_penalty <= 0.0 {
            result.add_error("sampling.repeat_penalty", "repeat_penalty must be positive");
        }

        if sampling.temperature > 2.0 {
            result.add_warning("sampling.temperature", "temperature above 2.0 produces mostly noise");
        }

        if self.model.name.is_empty() {
            result.add_error("model.name", "model name cannot be empty");
        }

        if let Some(ref prompt) = self.model.system_prompt {
            if prompt.trim().is_empty() {
                result.add_warning("model.system_prompt", "system prompt is blank and will be skipped");
            }
        }

        result
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("ctxkeeper"))
            .unwrap_or_else(|| PathBuf::from("~/.config/ctxkeeper"))
    }

    /// Get the cache directory (for snapshots).
    pub fn cache_dir() -> PathBuf {
        dirs::cache_dir()
            .map(|p| p.join("ctxkeeper"))
            .unwrap_or_else(|| PathBuf::from("~/.cache/ctxkeeper"))
    }
}
