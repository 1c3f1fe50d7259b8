//! Caller-facing errors
//!
//! Every failure that crosses the runtime boundary carries a stable code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::EngineError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RuntimeError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::MissingArgument(_) => "MissingArgument",
            RuntimeError::InvalidArgument(_) => "InvalidArgument",
            RuntimeError::Engine(e) => match e {
                EngineError::InvalidArgument(_) => "InvalidArgument",
                EngineError::InvalidState { .. } => "InvalidState",
                EngineError::AlreadyLoading => "AlreadyLoading",
                EngineError::NoModelLoaded => "NoModelLoaded",
                EngineError::ModelLoadFailed(_) => "ModelLoadFailed",
                EngineError::OutOfMemory(_) => "OutOfMemory",
                EngineError::UnsupportedFormat(_) => "UnsupportedFormat",
                EngineError::Inference(_) => "InferenceFailed",
                EngineError::WorkerError(_) => "InternalError",
            },
            RuntimeError::Storage(e) => match e {
                StorageError::InvalidFilename(_) => "InvalidArgument",
                StorageError::ModelNotFound(_) => "ModelNotFound",
                StorageError::Download(_) | StorageError::ChecksumMismatch { .. } => {
                    "DownloadFailed"
                }
                StorageError::DataDirError(_)
                | StorageError::Io(_)
                | StorageError::JsonError(_) => "StorageError",
            },
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Wire form of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&RuntimeError> for ErrorPayload {
    fn from(e: &RuntimeError) -> Self {
        e.payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::EngineState;

    #[test]
    fn test_codes() {
        let cases: Vec<(RuntimeError, &str)> = vec![
            (RuntimeError::MissingArgument("url"), "MissingArgument"),
            (
                EngineError::InvalidState {
                    operation: "generate",
                    state: EngineState::Unloaded,
                }
                .into(),
                "InvalidState",
            ),
            (EngineError::AlreadyLoading.into(), "AlreadyLoading"),
            (EngineError::OutOfMemory("kv".into()).into(), "OutOfMemory"),
            (EngineError::Inference("decode".into()).into(), "InferenceFailed"),
            (
                StorageError::InvalidFilename("../x".into()).into(),
                "InvalidArgument",
            ),
            (
                StorageError::ChecksumMismatch {
                    expected: "a".into(),
                    actual: "b".into(),
                }
                .into(),
                "DownloadFailed",
            ),
            (StorageError::ModelNotFound("m".into()).into(), "ModelNotFound"),
        ];
        for (error, code) in cases {
            assert_eq!(error.code(), code, "{error}");
        }
    }

    #[test]
    fn test_payload_serialization() {
        let error = RuntimeError::from(EngineError::InvalidState {
            operation: "generate",
            state: EngineState::Loading,
        });
        let json = serde_json::to_value(error.payload()).unwrap();
        assert_eq!(json["code"], "InvalidState");
        assert_eq!(json["message"], "Cannot generate while the engine is loading");
    }
}
