//! LLM inference engine
//!
//! Model lifecycle, single-flight generation and token streaming. Native
//! inference sits behind the [`Backend`]/[`ModelHandle`] traits; the llama.cpp
//! implementation is behind the `llama` feature.

pub mod engine;
pub mod handle;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod params;
pub mod streaming;

// Re-export main types for convenience
pub use engine::{EngineError, EngineState, InferenceEngine, LoadedModelInfo};
pub use handle::{Backend, ModelHandle, TokenSink};
#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use model::{has_gguf_extension, read_gguf_header, GgufHeader, ModelError, GGUF_MAGIC};
pub use params::{GenerationRequest, ModelConfig};
pub use streaming::{CompletionStats, StreamConfig, StreamEvent, TokenEvent, TokenStream};
