//! Offline LLM runtime
//!
//! Local, single-session inference over GGUF models: one loaded model, one
//! generation at a time, tokens streamed back as they are produced.

pub mod bridge;
pub mod inference;
pub mod runtime;
pub mod storage;
