//! Native model capability
//!
//! The engine never touches native inference types directly. A [`Backend`]
//! turns a [`ModelConfig`] into a [`ModelHandle`], and the handle is the only
//! thing that talks to the native context. Both live on the inference worker
//! thread, so a handle does not need to be `Send`.

use std::ops::ControlFlow;

use crate::inference::engine::EngineError;
use crate::inference::params::{GenerationRequest, ModelConfig};

/// Receives each decoded piece of text. Returning `Break` halts generation
/// before the next token is computed.
pub type TokenSink<'a> = dyn FnMut(String) -> ControlFlow<()> + 'a;

/// Factory for native model handles
pub trait Backend: Send + 'static {
    /// Allocates a native context for `config`.
    ///
    /// Fails with `OutOfMemory`, `UnsupportedFormat` or `ModelLoadFailed`.
    fn create(&mut self, config: &ModelConfig) -> Result<Box<dyn ModelHandle>, EngineError>;
}

/// A loaded model. Not reentrant: the engine runs one `generate` at a time.
pub trait ModelHandle {
    /// Runs the native token loop, offering every decoded piece to `sink`.
    ///
    /// Returns once the model hits end-of-generation, `max_tokens`, a full
    /// context, or the sink asks to stop. Errors other than `InvalidArgument`
    /// mean the native context can no longer be trusted.
    fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut TokenSink<'_>,
    ) -> Result<(), EngineError>;

    /// Drops conversation state (KV cache, sampler history) but keeps weights.
    fn clear_context(&mut self) -> Result<(), EngineError>;

    /// Bytes of model weights held by the native library
    fn size_bytes(&self) -> u64;

    /// Frees native resources. Consuming the box makes a second release
    /// impossible.
    fn release(self: Box<Self>) -> Result<(), EngineError>;
}
