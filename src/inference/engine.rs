//! Inference engine implementation
//!
//! State machine around a single loaded model.
//!
//! # Architecture
//!
//! Native inference contexts are neither `Send` nor reentrant, so every native
//! call runs on one dedicated worker thread that owns the [`ModelHandle`]. The
//! engine talks to it over a command channel.
//!
//! Whether a request is accepted is decided on the caller's side with an
//! atomic compare-and-swap on the engine state. That keeps `status()` and
//! `stop()` answerable while the worker is busy inside a generation, and makes
//! a second `generate()` fail immediately instead of queueing behind the first.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::inference::handle::{Backend, ModelHandle};
use crate::inference::model::ModelError;
use crate::inference::params::{GenerationRequest, ModelConfig};
use crate::inference::streaming::{GenerationSession, SessionControl, StreamConfig, TokenStream};

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cannot {operation} while the engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    #[error("A model is already loading")]
    AlreadyLoading,

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to load model: {0}")]
    ModelLoadFailed(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl EngineError {
    /// Whether the native context must be considered corrupt after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Inference(_)
                | EngineError::OutOfMemory(_)
                | EngineError::NoModelLoaded
                | EngineError::WorkerError(_)
        )
    }
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::Io(io) => EngineError::ModelLoadFailed(io.to_string()),
            other => EngineError::UnsupportedFormat(other.to_string()),
        }
    }
}

/// Lifecycle of the engine
///
/// `Unloaded -> Loading -> Loaded <-> Generating`, then `Unloading -> Unloaded`.
/// Native failures move `Loading`/`Generating` to `Error`, which only
/// `unload()` leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EngineState {
    Unloaded = 0,
    Loading = 1,
    Loaded = 2,
    Generating = 3,
    Unloading = 4,
    Error = 5,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Unloaded,
            1 => EngineState::Loading,
            2 => EngineState::Loaded,
            3 => EngineState::Generating,
            4 => EngineState::Unloading,
            _ => EngineState::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Unloaded => "unloaded",
            EngineState::Loading => "loading",
            EngineState::Loaded => "loaded",
            EngineState::Generating => "generating",
            EngineState::Unloading => "unloading",
            EngineState::Error => "error",
        }
    }

    /// True while a native model handle exists
    pub fn has_model(&self) -> bool {
        matches!(self, EngineState::Loaded | EngineState::Generating)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model information after loading
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedModelInfo {
    #[serde(flatten)]
    pub config: ModelConfig,
    /// Bytes of weights held by the native library
    pub size_bytes: u64,
    pub loaded_at: DateTime<Utc>,
}

/// State visible to callers without going through the worker
struct Shared {
    state: AtomicU8,
    /// Cancellation handle of the live session. Only set while `Generating`.
    session: Mutex<Option<SessionControl>>,
    loaded: RwLock<Option<LoadedModelInfo>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Unloaded as u8),
            session: Mutex::new(None),
            loaded: RwLock::new(None),
        }
    }

    fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn swap_state(&self, state: EngineState) -> EngineState {
        EngineState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// Moves `from -> to`, or returns the state that was found instead.
    fn transition(&self, from: EngineState, to: EngineState) -> Result<(), EngineState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(EngineState::from_u8)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<SessionControl>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loaded(&self) -> Option<LoadedModelInfo> {
        self.loaded
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_loaded(&self, info: Option<LoadedModelInfo>) {
        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    /// Drops the session and leaves `Generating`. A concurrent `unload()` has
    /// already moved the state on, in which case it is left alone.
    fn end_session(&self, id: Uuid, next: EngineState) {
        let mut slot = self.lock_session();
        if slot.as_ref().map(|control| control.id) == Some(id) {
            *slot = None;
        }
        let _ = self.transition(EngineState::Generating, next);
    }
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Load {
        config: ModelConfig,
        reply: oneshot::Sender<Result<LoadedModelInfo, EngineError>>,
    },
    Generate {
        request: GenerationRequest,
        session: GenerationSession,
    },
    ClearContext {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Unload {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

enum LoadTicket {
    Ready(LoadedModelInfo),
    Pending(oneshot::Receiver<Result<LoadedModelInfo, EngineError>>),
}

/// Single-model, single-flight inference engine
///
/// One instance per process; see [`crate::runtime::RuntimeFacade::global`].
pub struct InferenceEngine {
    command_tx: Sender<WorkerCommand>,
    worker_handle: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    stream_config: StreamConfig,
}

impl InferenceEngine {
    /// Starts the worker thread. The backend is moved onto it and never
    /// touched from any other thread.
    pub fn spawn<B: Backend>(backend: B, stream_config: StreamConfig) -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let shared = Arc::new(Shared::new());

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("inference-worker".to_string())
            .spawn(move || worker_thread_main(backend, worker_shared, command_rx))
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        tracing::info!(
            "Inference worker started (queue depth {}, delivery timeout {:?})",
            stream_config.queue_depth,
            stream_config.delivery_timeout
        );

        Ok(Self {
            command_tx,
            worker_handle: Some(handle),
            shared,
            stream_config,
        })
    }

    /// Current state. Never blocks.
    pub fn status(&self) -> EngineState {
        self.shared.state()
    }

    /// Information about the loaded model, if any
    pub fn model_info(&self) -> Option<LoadedModelInfo> {
        self.shared.loaded()
    }

    /// Id of the generation in progress
    pub fn current_session(&self) -> Option<Uuid> {
        self.shared.lock_session().as_ref().map(|control| control.id)
    }

    /// Loads a model.
    ///
    /// The state check happens when this is called, not when the returned
    /// future is first polled. Loading the same config again while `Loaded`
    /// is a no-op; a different config has to be preceded by `unload()`.
    pub fn load(
        &self,
        config: ModelConfig,
    ) -> impl Future<Output = Result<LoadedModelInfo, EngineError>> + Send + 'static {
        let ticket = self.begin_load(config);
        async move {
            match ticket? {
                LoadTicket::Ready(info) => Ok(info),
                LoadTicket::Pending(reply) => reply.await.map_err(|_| {
                    EngineError::WorkerError("worker exited before the load finished".into())
                })?,
            }
        }
    }

    fn begin_load(&self, config: ModelConfig) -> Result<LoadTicket, EngineError> {
        config.validate()?;

        match self.shared.transition(EngineState::Unloaded, EngineState::Loading) {
            Ok(()) => {}
            Err(EngineState::Loading) => return Err(EngineError::AlreadyLoading),
            Err(EngineState::Loaded) => {
                return match self.shared.loaded() {
                    Some(info) if info.config == config => {
                        tracing::debug!("Model already loaded: {}", config.path.display());
                        Ok(LoadTicket::Ready(info))
                    }
                    _ => Err(EngineError::InvalidState {
                        operation: "load a different model",
                        state: EngineState::Loaded,
                    }),
                };
            }
            Err(state) => {
                return Err(EngineError::InvalidState {
                    operation: "load",
                    state,
                })
            }
        }

        let (reply, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(WorkerCommand::Load { config, reply })
            .is_err()
        {
            self.shared.set_state(EngineState::Error);
            return Err(EngineError::WorkerError("inference worker is not running".into()));
        }
        Ok(LoadTicket::Pending(reply_rx))
    }

    /// Starts a generation and returns its stream right away.
    ///
    /// Fails with `InvalidArgument` for a bad request and `InvalidState`
    /// unless the engine is `Loaded`; in both cases no session is created.
    pub fn generate(&self, request: GenerationRequest) -> Result<TokenStream, EngineError> {
        request.validate()?;

        let (session, stream) = GenerationSession::open(&self.stream_config, request.max_tokens);
        let session_id = session.id();
        {
            let mut slot = self.shared.lock_session();
            self.shared
                .transition(EngineState::Loaded, EngineState::Generating)
                .map_err(|state| EngineError::InvalidState {
                    operation: "generate",
                    state,
                })?;
            *slot = Some(session.control());
        }

        tracing::debug!(
            "Generation {} queued (max_tokens={}, temperature={})",
            session_id,
            request.max_tokens,
            request.temperature
        );

        if self
            .command_tx
            .send(WorkerCommand::Generate { request, session })
            .is_err()
        {
            self.shared.end_session(session_id, EngineState::Error);
            return Err(EngineError::WorkerError("inference worker is not running".into()));
        }
        Ok(stream)
    }

    /// Asks the running generation to halt at the next token boundary.
    ///
    /// Returns immediately. A no-op when nothing is generating.
    pub fn stop(&self) {
        if let Some(control) = self.shared.lock_session().as_ref() {
            if control.request_stop() {
                tracing::info!("Stop requested for generation {}", control.id);
            }
        }
    }

    /// Resets the native conversation state of the loaded model.
    pub fn clear_context(&self) -> impl Future<Output = Result<(), EngineError>> + Send + 'static {
        let pending = match self.shared.state() {
            EngineState::Loaded => {
                let (reply, reply_rx) = oneshot::channel();
                self.command_tx
                    .send(WorkerCommand::ClearContext { reply })
                    .map(|_| reply_rx)
                    .map_err(|_| EngineError::WorkerError("inference worker is not running".into()))
            }
            state => Err(EngineError::InvalidState {
                operation: "clear the context",
                state,
            }),
        };
        async move {
            pending?.await.map_err(|_| {
                EngineError::WorkerError("worker exited before clearing the context".into())
            })?
        }
    }

    /// Releases the model from any state and ends in `Unloaded`.
    ///
    /// A running generation is stopped first and its stream still gets its
    /// terminal event. Native cleanup failures are logged, never returned.
    pub fn unload(&self) -> impl Future<Output = ()> + Send + 'static {
        let previous = {
            let slot = self.shared.lock_session();
            if let Some(control) = slot.as_ref() {
                control.request_stop();
            }
            self.shared.swap_state(EngineState::Unloading)
        };

        let pending = if previous == EngineState::Unloaded {
            let _ = self
                .shared
                .transition(EngineState::Unloading, EngineState::Unloaded);
            None
        } else {
            tracing::info!("Unloading model (engine was {})", previous);
            let (reply, reply_rx) = oneshot::channel();
            match self.command_tx.send(WorkerCommand::Unload { reply }) {
                Ok(()) => Some(reply_rx),
                Err(_) => {
                    self.shared.set_loaded(None);
                    self.shared.set_state(EngineState::Unloaded);
                    None
                }
            }
        };

        async move {
            if let Some(reply) = pending {
                let _ = reply.await;
            }
        }
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.stop();
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        // A native call that never returns blocks here; there is no way to
        // preempt it.
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the backend and the model handle; processes commands in order.
fn worker_thread_main<B: Backend>(
    mut backend: B,
    shared: Arc<Shared>,
    command_rx: Receiver<WorkerCommand>,
) {
    let mut handle: Option<Box<dyn ModelHandle>> = None;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Load { config, reply }) => {
                let result = load_model(&mut backend, &shared, &mut handle, config);
                let _ = reply.send(result);
            }
            Ok(WorkerCommand::Generate { request, session }) => {
                run_generation(&shared, &mut handle, &request, session);
            }
            Ok(WorkerCommand::ClearContext { reply }) => {
                let result = match handle.as_mut() {
                    Some(model) => model.clear_context(),
                    None => Err(EngineError::NoModelLoaded),
                };
                if let Err(e) = &result {
                    tracing::error!("Failed to clear context: {}", e);
                    if e.is_fatal() {
                        release_model(&shared, &mut handle);
                        let _ = shared.transition(EngineState::Loaded, EngineState::Error);
                    }
                } else {
                    tracing::debug!("Context cleared");
                }
                let _ = reply.send(result);
            }
            Ok(WorkerCommand::Unload { reply }) => {
                release_model(&shared, &mut handle);
                let _ = shared.transition(EngineState::Unloading, EngineState::Unloaded);
                let _ = reply.send(());
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Inference worker shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }

    release_model(&shared, &mut handle);
    shared.set_state(EngineState::Unloaded);
}

fn load_model<B: Backend>(
    backend: &mut B,
    shared: &Shared,
    handle: &mut Option<Box<dyn ModelHandle>>,
    config: ModelConfig,
) -> Result<LoadedModelInfo, EngineError> {
    // At most one live handle, even if the state machine was bypassed.
    release_model(shared, handle);

    tracing::info!(
        "Loading model {} (ctx={}, threads={}, accelerator={})",
        config.path.display(),
        config.context_length,
        config.thread_count,
        config.use_accelerator
    );

    match backend.create(&config) {
        Ok(model) => {
            let info = LoadedModelInfo {
                size_bytes: model.size_bytes(),
                loaded_at: Utc::now(),
                config,
            };
            *handle = Some(model);
            shared.set_loaded(Some(info.clone()));
            if let Err(state) = shared.transition(EngineState::Loading, EngineState::Loaded) {
                tracing::debug!("Load finished while engine is {}", state);
            }
            tracing::info!("Model loaded: {} ({} bytes)", info.config.path.display(), info.size_bytes);
            Ok(info)
        }
        Err(e) => {
            tracing::error!("Failed to load {}: {}", config.path.display(), e);
            let _ = shared.transition(EngineState::Loading, EngineState::Error);
            Err(e)
        }
    }
}

fn run_generation(
    shared: &Shared,
    handle: &mut Option<Box<dyn ModelHandle>>,
    request: &GenerationRequest,
    mut session: GenerationSession,
) {
    let session_id = session.id();

    let outcome = match handle.as_mut() {
        None => Err(EngineError::NoModelLoaded),
        // Stopped before the worker got to it.
        Some(_) if session.observe_cancel() => Ok(()),
        Some(model) => model.generate(request, &mut |piece| session.offer(piece)),
    };

    match outcome {
        Ok(()) => {
            shared.end_session(session_id, EngineState::Loaded);
            let stats = session.complete();
            tracing::info!(
                "Generation {} finished: {} tokens in {} ms ({:.1} tok/s, cancelled={}, incomplete={})",
                session_id,
                stats.token_count,
                stats.elapsed_ms,
                stats.tokens_per_second,
                stats.cancelled,
                stats.incomplete
            );
        }
        Err(e) if !e.is_fatal() => {
            tracing::warn!("Generation {} rejected: {}", session_id, e);
            shared.end_session(session_id, EngineState::Loaded);
            session.fail(e);
        }
        Err(e) => {
            tracing::error!("Generation {} failed: {}", session_id, e);
            release_model(shared, handle);
            shared.end_session(session_id, EngineState::Error);
            session.fail(e);
        }
    }
}

/// The only path that runs native teardown
fn release_model(shared: &Shared, handle: &mut Option<Box<dyn ModelHandle>>) {
    if let Some(model) = handle.take() {
        match model.release() {
            Ok(()) => tracing::info!("Model released"),
            Err(e) => tracing::warn!("Native cleanup failed, continuing: {}", e),
        }
    }
    shared.set_loaded(None);
}
