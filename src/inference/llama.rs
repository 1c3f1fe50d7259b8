//! llama.cpp backend
//!
//! `LlamaContext` borrows its `LlamaModel`, so a context cannot be stored next
//! to the model it came from. Each generation creates a fresh context instead,
//! which also means every generation starts from an empty KV cache.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use crate::inference::engine::EngineError;
use crate::inference::handle::{Backend, ModelHandle, TokenSink};
use crate::inference::model::read_gguf_header;
use crate::inference::params::{GenerationRequest, ModelConfig};
use crate::inference::streaming::Utf8Assembler;

/// Layers offloaded when an accelerator is requested (llama.cpp caps it)
const ALL_LAYERS: u32 = 999;
const BATCH_SIZE: usize = 512;
/// Tokens the repeat penalty looks back over
const PENALTY_LAST_N: i32 = 64;

/// Backend over the llama.cpp native library
///
/// The native backend is initialised lazily on the worker thread, on the first
/// load.
#[derive(Default)]
pub struct LlamaCppBackend {
    backend: Option<Arc<LlamaBackend>>,
}

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn native(&mut self) -> Result<Arc<LlamaBackend>, EngineError> {
        if let Some(backend) = &self.backend {
            return Ok(backend.clone());
        }
        let backend = LlamaBackend::init()
            .map_err(|e| EngineError::ModelLoadFailed(format!("backend init: {e}")))?;
        tracing::info!("llama.cpp backend initialized");
        let backend = Arc::new(backend);
        self.backend = Some(backend.clone());
        Ok(backend)
    }
}

impl Backend for LlamaCppBackend {
    fn create(&mut self, config: &ModelConfig) -> Result<Box<dyn ModelHandle>, EngineError> {
        let header = read_gguf_header(&config.path)?;
        tracing::debug!(
            "GGUF v{} with {} tensors: {}",
            header.version,
            header.tensor_count,
            config.path.display()
        );

        let backend = self.native()?;
        let gpu_layers = if config.use_accelerator { ALL_LAYERS } else { 0 };
        let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &config.path, &model_params)
            .map_err(|e| EngineError::ModelLoadFailed(e.to_string()))?;

        // Allocate one context up front so an oversized nCtx fails the load
        // rather than the first generation.
        drop(
            model
                .new_context(&backend, context_params(config, 0))
                .map_err(|e| EngineError::OutOfMemory(e.to_string()))?,
        );

        tracing::info!(
            "Model ready: {} params, {} vocab, trained ctx {}",
            model.n_params(),
            model.n_vocab(),
            model.n_ctx_train()
        );

        Ok(Box::new(LlamaHandle {
            size_bytes: model.size() as u64,
            backend,
            model,
            config: config.clone(),
        }))
    }
}

fn context_params(config: &ModelConfig, prompt_len: usize) -> LlamaContextParams {
    let threads = i32::try_from(config.thread_count).unwrap_or(i32::MAX);
    let batch = BATCH_SIZE.max(prompt_len) as u32;
    LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(config.context_length))
        .with_n_batch(batch)
        .with_n_threads(threads)
        .with_n_threads_batch(threads)
}

/// A loaded llama.cpp model
pub struct LlamaHandle {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    config: ModelConfig,
    size_bytes: u64,
}

impl ModelHandle for LlamaHandle {
    fn generate(
        &mut self,
        request: &GenerationRequest,
        sink: &mut TokenSink<'_>,
    ) -> Result<(), EngineError> {
        let prompt = match build_chat_prompt(&self.model, &request.prompt) {
            Ok(chat_prompt) => chat_prompt,
            Err(error) => {
                tracing::warn!("Chat template not applied: {error}");
                request.prompt.clone()
            }
        };

        let tokens = self
            .model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| EngineError::InvalidArgument(format!("tokenization failed: {e}")))?;
        if tokens.len() >= self.config.context_length as usize {
            return Err(EngineError::InvalidArgument(format!(
                "prompt is {} tokens, context holds {}",
                tokens.len(),
                self.config.context_length
            )));
        }
        tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

        let mut ctx = self
            .model
            .new_context(&self.backend, context_params(&self.config, tokens.len()))
            .map_err(|e| EngineError::OutOfMemory(e.to_string()))?;

        run_inference(&mut ctx, &self.model, &self.config, tokens, request, sink)
    }

    fn clear_context(&mut self) -> Result<(), EngineError> {
        // Contexts are per generation, there is nothing to reset between them.
        tracing::debug!("clear_context: no persistent context for {}", self.config.path.display());
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn release(self: Box<Self>) -> Result<(), EngineError> {
        tracing::debug!("Freeing llama.cpp model {}", self.config.path.display());
        drop(self);
        Ok(())
    }
}

fn build_chat_prompt(model: &LlamaModel, prompt: &str) -> Result<String, String> {
    let template = model
        .chat_template(None)
        .map_err(|e| format!("Failed to load chat template: {e}"))?;
    let user_message = LlamaChatMessage::new("user".to_string(), prompt.to_string())
        .map_err(|e| format!("Failed to build chat message: {e}"))?;
    model
        .apply_chat_template(&template, &[user_message], true)
        .map_err(|e| format!("Failed to apply chat template: {e}"))
}

fn build_sampler(request: &GenerationRequest) -> LlamaSampler {
    if request.temperature < 0.01 {
        return LlamaSampler::greedy();
    }
    let seed = if request.seed == 0 {
        rand_seed()
    } else {
        request.seed
    };
    LlamaSampler::chain_simple([
        LlamaSampler::penalties(PENALTY_LAST_N, request.repeat_penalty, 0.0, 0.0),
        LlamaSampler::top_k(request.top_k as i32),
        LlamaSampler::top_p(request.top_p, 1),
        LlamaSampler::temp(request.temperature),
        LlamaSampler::dist(seed),
    ])
}

/// Decodes the prompt, then samples one token at a time until the sink,
/// the model or the context says stop.
fn run_inference(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    config: &ModelConfig,
    prompt_tokens: Vec<LlamaToken>,
    request: &GenerationRequest,
    sink: &mut TokenSink<'_>,
) -> Result<(), EngineError> {
    let mut batch = LlamaBatch::new(BATCH_SIZE.max(prompt_tokens.len()), 1);
    let last = prompt_tokens.len().saturating_sub(1);
    for (i, token) in prompt_tokens.iter().enumerate() {
        batch
            .add(*token, i as i32, &[0], i == last)
            .map_err(|e| EngineError::Inference(format!("batch add: {e}")))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Inference(format!("prompt decode: {e}")))?;

    let mut sampler = build_sampler(request);
    let mut position = prompt_tokens.len() as i32;
    let mut text = Utf8Assembler::default();

    for _ in 0..request.max_tokens {
        if position >= config.context_length as i32 {
            tracing::debug!("Context window full at {} tokens", position);
            break;
        }

        let token = sampler.sample(ctx, batch.n_tokens() - 1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            tracing::debug!("End of generation token encountered");
            break;
        }

        let bytes = model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| EngineError::Inference(format!("detokenize: {e}")))?;
        if let Some(piece) = text.push(&bytes) {
            if sink(piece).is_break() {
                return Ok(());
            }
        }

        batch.clear();
        batch
            .add(token, position, &[0], true)
            .map_err(|e| EngineError::Inference(format!("batch add: {e}")))?;
        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Inference(format!("decode: {e}")))?;
        position += 1;
    }

    if let Some(rest) = text.flush() {
        if let ControlFlow::Break(()) = sink(rest) {
            tracing::debug!("Trailing bytes refused by sink");
        }
    }
    Ok(())
}

/// Generates a random seed using system entropy
fn rand_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
