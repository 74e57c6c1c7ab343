//! Configuration file for the harness.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration apart from the script path, which [`HarnessConfig::validate`]
//! requires before a run.

use std::{
    path::{Component, Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{governor::TokenBucket, probe::ProbeMode, supervisor::Framework};

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub run: RunSection,
    pub governor: GovernorSection,
    pub gpu: GpuSection,
    pub store: StoreSection,
}

/// The job to run and its timebox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Path to the training script.
    pub script: String,
    /// Stable run id. Defaults to `run-<epoch millis>`.
    pub run_id: Option<String>,
    /// Human label stored with the record.
    pub name: Option<String>,
    pub framework: Framework,
    /// Hard wall-clock limit.
    pub max_run_minutes: f64,
    /// Passed to the script as `--checkpoint-every-seconds`.
    pub checkpoint_every_minutes: Option<f64>,
    /// Explicit resume point. Without it the latest stored checkpoint is used.
    pub resume_from: Option<String>,
    pub interpreter: String,
    /// Time between the interrupt and the kill.
    pub grace_secs: u64,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            script: String::new(),
            run_id: None,
            name: None,
            framework: Framework::Auto,
            max_run_minutes: 10.0,
            checkpoint_every_minutes: None,
            resume_from: None,
            interpreter: "python".to_string(),
            grace_secs: 30,
        }
    }
}

/// Admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    pub max_parallel: u32,
    pub min_free_ram_gb: f64,
    pub bucket_capacity: u32,
    /// Tokens added per refill interval.
    pub refill_tokens: u32,
    pub refill_interval_secs: u64,
    pub temp_warn_margin_c: u32,
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            min_free_ram_gb: 4.0,
            bucket_capacity: 4,
            refill_tokens: 1,
            refill_interval_secs: 60,
            temp_warn_margin_c: 3,
        }
    }
}

impl GovernorSection {
    /// A full bucket with these settings.
    #[must_use]
    pub fn token_bucket(&self) -> TokenBucket {
        TokenBucket::new(
            self.bucket_capacity,
            self.refill_tokens,
            Duration::from_secs(self.refill_interval_secs),
        )
    }
}

/// GPU probing and thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSection {
    pub probe: ProbeMode,
    pub min_free_vram_mb: u64,
    pub max_temp_c: u32,
}

impl Default for GpuSection {
    fn default() -> Self {
        Self {
            probe: ProbeMode::Auto,
            min_free_vram_mb: 2500,
            max_temp_c: 85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Directory holding `experiments.json`.
    pub dir: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.backprop"),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the settings needed to start a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let run = &self.run;
        if run.script.trim().is_empty() {
            return Err(ConfigError::Invalid("script path is empty".into()));
        }
        if has_parent_traversal(&run.script) {
            return Err(ConfigError::Invalid(format!(
                "script path '{}' must not contain '..'",
                run.script
            )));
        }
        if let Some(resume) = &run.resume_from
            && has_parent_traversal(resume)
        {
            return Err(ConfigError::Invalid(format!(
                "resume path '{resume}' must not contain '..'"
            )));
        }
        if !is_positive(run.max_run_minutes) {
            return Err(ConfigError::Invalid(format!(
                "max_run_minutes must be positive, got {}",
                run.max_run_minutes
            )));
        }
        if let Some(every) = run.checkpoint_every_minutes
            && !is_positive(every)
        {
            return Err(ConfigError::Invalid(format!(
                "checkpoint_every_minutes must be positive, got {every}"
            )));
        }
        if run.grace_secs == 0 {
            return Err(ConfigError::Invalid("grace_secs must be positive".into()));
        }
        if run.interpreter.trim().is_empty() {
            return Err(ConfigError::Invalid("interpreter is empty".into()));
        }

        let gov = &self.governor;
        if gov.max_parallel == 0 {
            return Err(ConfigError::Invalid("max_parallel must be at least 1".into()));
        }
        if gov.refill_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "refill_interval_secs must be positive".into(),
            ));
        }
        if !gov.min_free_ram_gb.is_finite() || gov.min_free_ram_gb < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "min_free_ram_gb must be non-negative, got {}",
                gov.min_free_ram_gb
            )));
        }
        Ok(())
    }
}

fn has_parent_traversal(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
