//! Request arguments
//!
//! Arguments arrive loosely typed. Numbers are taken wide (`i64`/`f64`) so an
//! out-of-range value is reported as `InvalidArgument` instead of a parse
//! failure, and every field is optional so a missing one can be named.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::inference::{GenerationRequest, ModelConfig};
use crate::runtime::error::RuntimeError;
use crate::storage::download::EnsureModelRequest;
use crate::storage::settings::RuntimeSettings;

/// Parses request params; `null` or absent params mean "all defaults".
pub fn parse<T: DeserializeOwned + Default>(params: Value) -> Result<T, RuntimeError> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|e| RuntimeError::InvalidArgument(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureModelArgs {
    pub url: Option<String>,
    pub filename: Option<String>,
    pub sha256: Option<String>,
}

impl EnsureModelArgs {
    pub fn into_request(self) -> Result<EnsureModelRequest, RuntimeError> {
        let url = required("url", self.url)?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(RuntimeError::InvalidArgument(format!(
                "url must be http(s), got {url:?}"
            )));
        }
        Ok(EnsureModelRequest {
            url,
            filename: required("filename", self.filename)?,
            sha256: self.sha256.filter(|s| !s.trim().is_empty()),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelNameArgs {
    pub filename: Option<String>,
}

impl ModelNameArgs {
    pub fn filename(self) -> Result<String, RuntimeError> {
        required("filename", self.filename)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadModelArgs {
    pub path: Option<String>,
    pub n_ctx: Option<i64>,
    pub n_threads: Option<i64>,
    #[serde(alias = "useMetal")]
    pub use_accelerator: Option<bool>,
}

impl LoadModelArgs {
    pub fn into_config(self, defaults: &RuntimeSettings) -> Result<ModelConfig, RuntimeError> {
        let path = required("path", self.path)?;
        Ok(ModelConfig::new(path)
            .with_context_length(positive("nCtx", self.n_ctx, defaults.context_size)?)
            .with_thread_count(positive("nThreads", self.n_threads, defaults.threads)?)
            .with_accelerator(self.use_accelerator.unwrap_or(defaults.use_accelerator)))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateArgs {
    pub prompt: Option<String>,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub repeat_penalty: Option<f64>,
    pub seed: Option<i64>,
}

impl GenerateArgs {
    pub fn into_request(self, defaults: &RuntimeSettings) -> Result<GenerationRequest, RuntimeError> {
        let prompt = required("prompt", self.prompt)?;

        let temperature = self.temperature.unwrap_or(defaults.temperature as f64);
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "temperature must be >= 0, got {temperature}"
            )));
        }
        let top_p = self.top_p.unwrap_or(defaults.top_p as f64);
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(RuntimeError::InvalidArgument(format!(
                "topP must be in (0, 1], got {top_p}"
            )));
        }
        let repeat_penalty = self.repeat_penalty.unwrap_or(defaults.repeat_penalty as f64);
        if !repeat_penalty.is_finite() || repeat_penalty < 0.0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "repeatPenalty must be >= 0, got {repeat_penalty}"
            )));
        }

        Ok(GenerationRequest {
            prompt,
            max_tokens: positive("maxTokens", self.max_tokens, defaults.max_tokens)?,
            temperature: temperature as f32,
            top_p: top_p as f32,
            top_k: non_negative("topK", self.top_k, defaults.top_k)?,
            repeat_penalty: repeat_penalty as f32,
            seed: non_negative("seed", self.seed, 0)?,
        })
    }
}

fn required(name: &'static str, value: Option<String>) -> Result<String, RuntimeError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(RuntimeError::MissingArgument(name))
}

fn positive(name: &str, value: Option<i64>, default: u32) -> Result<u32, RuntimeError> {
    match value {
        None => Ok(default),
        Some(v) if v > 0 => u32::try_from(v)
            .map_err(|_| RuntimeError::InvalidArgument(format!("{name} is too large: {v}"))),
        Some(v) => Err(RuntimeError::InvalidArgument(format!(
            "{name} must be greater than 0, got {v}"
        ))),
    }
}

fn non_negative(name: &str, value: Option<i64>, default: u32) -> Result<u32, RuntimeError> {
    match value {
        Some(0) => Ok(0),
        other => positive(name, other, default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> RuntimeSettings {
        RuntimeSettings::default()
    }

    #[test]
    fn test_load_defaults_and_alias() {
        let args: LoadModelArgs = parse(json!({ "path": "/m/tiny.gguf" })).unwrap();
        let config = args.into_config(&settings()).unwrap();
        assert_eq!(config.context_length, 2048);
        assert_eq!(config.thread_count, 4);
        assert!(!config.use_accelerator);

        let args: LoadModelArgs =
            parse(json!({ "path": "/m/tiny.gguf", "nCtx": 512, "useMetal": true })).unwrap();
        let config = args.into_config(&settings()).unwrap();
        assert_eq!(config.context_length, 512);
        assert!(config.use_accelerator);
    }

    #[test]
    fn test_load_argument_errors() {
        let args: LoadModelArgs = parse(Value::Null).unwrap();
        assert!(matches!(
            args.into_config(&settings()),
            Err(RuntimeError::MissingArgument("path"))
        ));

        let args: LoadModelArgs = parse(json!({ "path": "m.gguf", "nThreads": -2 })).unwrap();
        assert!(matches!(
            args.into_config(&settings()),
            Err(RuntimeError::InvalidArgument(_))
        ));

        assert!(matches!(
            parse::<LoadModelArgs>(json!({ "path": 7 })),
            Err(RuntimeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_generate_defaults() {
        let args: GenerateArgs = parse(json!({ "prompt": "hi" })).unwrap();
        let request = args.into_request(&settings()).unwrap();
        assert_eq!(request.prompt, "hi");
        assert_eq!(request.max_tokens, 512);
        assert_eq!(request.temperature, 0.7);
        assert_eq!(request.top_p, 0.9);
        assert_eq!(request.top_k, 40);
        assert_eq!(request.repeat_penalty, 1.1);
        assert_eq!(request.seed, 0);
    }

    #[test]
    fn test_generate_argument_errors() {
        let cases = [
            json!({}),
            json!({ "prompt": "" }),
            json!({ "prompt": "hi", "temperature": -0.1 }),
            json!({ "prompt": "hi", "topP": 0.0 }),
            json!({ "prompt": "hi", "topP": 1.5 }),
            json!({ "prompt": "hi", "maxTokens": 0 }),
            json!({ "prompt": "hi", "topK": -1 }),
        ];
        for params in cases {
            let args: GenerateArgs = parse(params.clone()).unwrap();
            let result = args.into_request(&settings());
            assert!(
                matches!(
                    result,
                    Err(RuntimeError::MissingArgument(_)) | Err(RuntimeError::InvalidArgument(_))
                ),
                "accepted {params}"
            );
        }

        let args: GenerateArgs = parse(json!({ "prompt": "hi", "topK": 0 })).unwrap();
        assert_eq!(args.into_request(&settings()).unwrap().top_k, 0);
    }

    #[test]
    fn test_ensure_model_args() {
        let args: EnsureModelArgs =
            parse(json!({ "url": "https://h/m.gguf", "filename": "m.gguf", "sha256": "" }))
                .unwrap();
        let request = args.into_request().unwrap();
        assert_eq!(request.filename, "m.gguf");
        assert_eq!(request.sha256, None);

        let args: EnsureModelArgs = parse(json!({ "url": "https://h/m.gguf" })).unwrap();
        assert!(matches!(
            args.into_request(),
            Err(RuntimeError::MissingArgument("filename"))
        ));

        let args: EnsureModelArgs =
            parse(json!({ "url": "file:///etc/passwd", "filename": "m.gguf" })).unwrap();
        assert!(matches!(
            args.into_request(),
            Err(RuntimeError::InvalidArgument(_))
        ));
    }
}
