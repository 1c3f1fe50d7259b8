//! Load and generation parameters
//!
//! Both types are checked before anything reaches the worker thread, so a bad
//! value never costs a native call.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::inference::engine::EngineError;

pub const DEFAULT_CONTEXT_LENGTH: u32 = 2048;
pub const DEFAULT_THREAD_COUNT: u32 = 4;
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_REPEAT_PENALTY: f32 = 1.1;

/// How a model is loaded. Fixed for the lifetime of the loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Path to the model file, already present on disk
    pub path: PathBuf,
    /// Context window in tokens
    pub context_length: u32,
    /// CPU threads used for decoding
    pub thread_count: u32,
    /// Offload layers to the GPU / Metal / Vulkan device
    pub use_accelerator: bool,
}

impl ModelConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            context_length: DEFAULT_CONTEXT_LENGTH,
            thread_count: DEFAULT_THREAD_COUNT,
            use_accelerator: false,
        }
    }

    pub fn with_context_length(mut self, context_length: u32) -> Self {
        self.context_length = context_length;
        self
    }

    pub fn with_thread_count(mut self, thread_count: u32) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_accelerator(mut self, use_accelerator: bool) -> Self {
        self.use_accelerator = use_accelerator;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.path.as_os_str().is_empty() {
            return Err(EngineError::InvalidArgument("path must not be empty".into()));
        }
        if self.context_length == 0 {
            return Err(EngineError::InvalidArgument(
                "contextLength must be greater than 0".into(),
            ));
        }
        if self.thread_count == 0 {
            return Err(EngineError::InvalidArgument(
                "threadCount must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// A single generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    /// Upper bound on emitted tokens
    pub max_tokens: u32,
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Nucleus sampling mass, in (0, 1]
    pub top_p: f32,
    /// Top-k cutoff (0 = disabled)
    pub top_k: u32,
    /// Repetition penalty (1.0 = off)
    pub repeat_penalty: f32,
    /// Sampler seed (0 = random)
    pub seed: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.prompt.is_empty() {
            return Err(EngineError::InvalidArgument("prompt must not be empty".into()));
        }
        if self.max_tokens == 0 {
            return Err(EngineError::InvalidArgument(
                "maxTokens must be greater than 0".into(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(EngineError::InvalidArgument(format!(
                "topP must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty < 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "repeatPenalty must be >= 0, got {}",
                self.repeat_penalty
            )));
        }
        Ok(())
    }
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            repeat_penalty: DEFAULT_REPEAT_PENALTY,
            seed: 0,
        }
    }
}
