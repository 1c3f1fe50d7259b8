//! Persistent storage
//!
//! Downloaded model files and runtime settings. Nothing else is persisted.

use std::path::PathBuf;
use thiserror::Error;

pub mod download;
pub mod models;
pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid model filename: {0:?}")]
    InvalidFilename(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Download failed: {0}")]
    Download(String),
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Download(e.to_string())
    }
}

/// Get the application data directory
///
/// Returns the platform-specific, application-private data directory:
/// - Linux / Android: `~/.local/share/offline-llm`
/// - macOS / iOS: `~/Library/Application Support/com.OfflineLLM.offline-llm`
/// - Windows: `C:\Users\{user}\AppData\Roaming\OfflineLLM\offline-llm\data`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "OfflineLLM", "offline-llm")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Default location of downloaded model files
pub fn default_models_dir() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("models"))
}

/// Creates the models directory if needed and returns it.
pub fn init_storage(models_dir: &std::path::Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(models_dir)?;
    tracing::info!("Model storage at: {}", models_dir.display());
    Ok(())
}
