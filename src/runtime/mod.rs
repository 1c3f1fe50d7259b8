//! Runtime facade
//!
//! The request/response surface of the runtime. It applies argument defaults
//! from [`RuntimeSettings`], forwards to the single [`InferenceEngine`] and
//! [`ModelStore`], and turns every failure into a coded [`RuntimeError`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inference::{EngineState, InferenceEngine, TokenStream};
use crate::storage::download::{ensure_model, ModelFetcher, ProgressCallback};
use crate::storage::models::{ModelFile, ModelStore};
use crate::storage::settings::RuntimeSettings;

pub mod args;
pub mod error;

pub use args::{EnsureModelArgs, GenerateArgs, LoadModelArgs, ModelNameArgs};
pub use error::{ErrorPayload, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsureModelResult {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelList {
    pub models: Vec<ModelFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state: EngineState,
}

/// What `getModelInfo` reports
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfoReport {
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_ctx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_accelerator: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
}

pub struct RuntimeFacade {
    engine: InferenceEngine,
    store: ModelStore,
    fetcher: Arc<dyn ModelFetcher>,
    settings: RuntimeSettings,
}

#[cfg(feature = "llama")]
static GLOBAL: once_cell::sync::OnceCell<RuntimeFacade> = once_cell::sync::OnceCell::new();

impl RuntimeFacade {
    pub fn new(
        engine: InferenceEngine,
        store: ModelStore,
        fetcher: Arc<dyn ModelFetcher>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            engine,
            store,
            fetcher,
            settings,
        }
    }

    /// Runtime backed by llama.cpp and plain HTTP downloads
    #[cfg(feature = "llama")]
    pub fn from_settings(settings: RuntimeSettings) -> Result<Self, RuntimeError> {
        use crate::inference::LlamaCppBackend;
        use crate::storage::download::HttpFetcher;

        let engine = InferenceEngine::spawn(LlamaCppBackend::new(), settings.stream_config())?;
        let store = ModelStore::new(settings.models_directory.clone());
        let fetcher = Arc::new(HttpFetcher::new()?);
        Ok(Self::new(engine, store, fetcher, settings))
    }

    /// The process-wide runtime, created from the saved settings on first use.
    #[cfg(feature = "llama")]
    pub fn global() -> Result<&'static RuntimeFacade, RuntimeError> {
        GLOBAL.get_or_try_init(|| Self::from_settings(crate::storage::settings::load_settings()))
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    pub async fn ensure_model(&self, args: EnsureModelArgs) -> Result<EnsureModelResult, RuntimeError> {
        self.ensure_model_with_progress(args, None).await
    }

    /// Downloads the model unless a file of that name is already stored.
    pub async fn ensure_model_with_progress(
        &self,
        args: EnsureModelArgs,
        on_progress: Option<ProgressCallback>,
    ) -> Result<EnsureModelResult, RuntimeError> {
        let request = args.into_request()?;
        let path = ensure_model(&self.store, self.fetcher.as_ref(), &request, on_progress).await?;
        Ok(EnsureModelResult { path })
    }

    pub fn list_downloaded_models(&self) -> Result<ModelList, RuntimeError> {
        Ok(ModelList {
            models: self.store.list()?,
        })
    }

    /// Deletes a stored model. The file of a loaded model cannot be deleted.
    pub fn delete_model(&self, args: ModelNameArgs) -> Result<(), RuntimeError> {
        let filename = args.filename()?;
        let path = self.store.resolve(&filename)?;
        if let Some(info) = self.engine.model_info() {
            if info.config.path == path {
                return Err(RuntimeError::InvalidArgument(format!(
                    "{filename} is loaded; unload it first"
                )));
            }
        }
        self.store.delete(&filename)?;
        Ok(())
    }

    pub async fn load_model(&self, args: LoadModelArgs) -> Result<(), RuntimeError> {
        let mut config = args.into_config(&self.settings)?;
        config.path = self.locate(&config.path);
        self.engine.load(config).await?;
        Ok(())
    }

    /// A bare filename refers to a stored model.
    fn locate(&self, path: &Path) -> PathBuf {
        let is_bare = path.components().count() == 1 && path.is_relative();
        if is_bare {
            if let Some(stored) = path
                .to_str()
                .and_then(|name| self.store.find(name).ok().flatten())
            {
                return stored.path;
            }
        }
        path.to_path_buf()
    }

    /// Starts a generation. Tokens and the final stats arrive on the stream.
    pub fn generate(&self, args: GenerateArgs) -> Result<TokenStream, RuntimeError> {
        let request = args.into_request(&self.settings)?;
        Ok(self.engine.generate(request)?)
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub async fn unload(&self) {
        self.engine.unload().await;
    }

    pub async fn clear_context(&self) -> Result<(), RuntimeError> {
        self.engine.clear_context().await?;
        Ok(())
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.engine.status(),
        }
    }

    pub fn model_info(&self) -> ModelInfoReport {
        match self.engine.model_info() {
            Some(info) => ModelInfoReport {
                loaded: true,
                model_path: Some(info.config.path),
                n_ctx: Some(info.config.context_length),
                n_threads: Some(info.config.thread_count),
                use_accelerator: Some(info.config.use_accelerator),
                size_bytes: Some(info.size_bytes),
                loaded_at: Some(info.loaded_at),
            },
            None => ModelInfoReport {
                loaded: false,
                model_path: None,
                n_ctx: None,
                n_threads: None,
                use_accelerator: None,
                size_bytes: None,
                loaded_at: None,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::inference::handle::scripted::{Script, ScriptedBackend};
    use crate::storage::download::fixtures::StaticFetcher;

    /// Facade over a scripted backend, storing models under `dir`
    pub fn scripted_facade(script: &Arc<Script>, dir: &Path) -> RuntimeFacade {
        let settings = RuntimeSettings {
            models_directory: dir.to_path_buf(),
            ..RuntimeSettings::default()
        };
        scripted_facade_with(script, settings)
    }

    pub fn scripted_facade_with(script: &Arc<Script>, settings: RuntimeSettings) -> RuntimeFacade {
        let engine = InferenceEngine::spawn(
            ScriptedBackend::new(script.clone()),
            settings.stream_config(),
        )
        .unwrap();
        RuntimeFacade::new(
            engine,
            ModelStore::new(settings.models_directory.clone()),
            Arc::new(StaticFetcher::new(b"GGUF model bytes")),
            settings,
        )
    }
}
