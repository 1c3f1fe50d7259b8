//! Settings storage
//!
//! Runtime configuration persisted as JSON next to the downloaded models.

use crate::inference::params::{
    DEFAULT_CONTEXT_LENGTH, DEFAULT_MAX_TOKENS, DEFAULT_REPEAT_PENALTY, DEFAULT_TEMPERATURE,
    DEFAULT_THREAD_COUNT, DEFAULT_TOP_K, DEFAULT_TOP_P,
};
use crate::inference::StreamConfig;
use crate::storage::{default_models_dir, get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime settings
///
/// The load and generation fields are the defaults used when a request leaves
/// an argument out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Directory where downloaded model files are stored
    pub models_directory: PathBuf,
    /// Token events buffered per stream before the producer waits
    pub stream_queue_depth: usize,
    /// How long a full stream queue is tolerated before the consumer is dropped
    pub delivery_timeout_ms: u64,
    pub context_size: u32,
    pub threads: u32,
    pub use_accelerator: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            models_directory: default_models_dir().unwrap_or_else(|_| PathBuf::from("./models")),
            stream_queue_depth: 64,
            delivery_timeout_ms: 5_000,
            context_size: DEFAULT_CONTEXT_LENGTH,
            threads: DEFAULT_THREAD_COUNT,
            use_accelerator: false,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            repeat_penalty: DEFAULT_REPEAT_PENALTY,
        }
    }
}

impl RuntimeSettings {
    /// Validate settings values
    ///
    /// Pulls every value back into a range the engine accepts.
    pub fn validate(&mut self) {
        self.stream_queue_depth = self.stream_queue_depth.clamp(1, 65_536);
        if self.delivery_timeout_ms == 0 {
            self.delivery_timeout_ms = 5_000;
        }
        if self.context_size == 0 {
            self.context_size = DEFAULT_CONTEXT_LENGTH;
        }
        if self.threads == 0 {
            self.threads = DEFAULT_THREAD_COUNT;
        }
        if self.max_tokens == 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS;
        }
        if !self.temperature.is_finite() {
            self.temperature = DEFAULT_TEMPERATURE;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            self.top_p = DEFAULT_TOP_P;
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty < 0.0 {
            self.repeat_penalty = DEFAULT_REPEAT_PENALTY;
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            queue_depth: self.stream_queue_depth,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
        }
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the default location
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> RuntimeSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            RuntimeSettings::default()
        }
    }
}

/// Loads and validates settings from `path`; a missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<RuntimeSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(RuntimeSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: RuntimeSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the default location
pub fn save_settings(settings: &RuntimeSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &RuntimeSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
