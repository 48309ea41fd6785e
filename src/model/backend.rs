use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::{AppConfig, BackendKind},
    error::ServiceError,
    model::{BackendInput, ModelSpec},
};

/// A materialized model. Calls block for the duration of generation and are run
/// on the blocking pool by the dispatcher.
pub trait InferenceBackend: Send + Sync {
    fn generate(&self, input: &BackendInput) -> Result<String, ServiceError>;
}

/// Turns a [`ModelSpec`] into a ready backend. Loading is expensive and is
/// performed at most once per model by the registry.
#[async_trait]
pub trait BackendLoader: Send + Sync {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn InferenceBackend>, ServiceError>;
}

pub fn loader_for(config: &AppConfig) -> Result<Arc<dyn BackendLoader>, ServiceError> {
    match config.backend {
        BackendKind::Echo => Ok(Arc::new(EchoLoader)),
        #[cfg(feature = "tch-backend")]
        BackendKind::TorchScript => Ok(Arc::new(super::loader::TorchScriptLoader::new(
            config.device,
        ))),
        #[cfg(not(feature = "tch-backend"))]
        BackendKind::TorchScript => Err(ServiceError::Config(
            "torchscript backend requires the `tch-backend` feature".into(),
        )),
    }
}

/// Deterministic backend that repeats the prompt back, bounded by the token
/// ceiling. Used for local development without model weights.
pub struct EchoLoader;

#[async_trait]
impl BackendLoader for EchoLoader {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn InferenceBackend>, ServiceError> {
        Ok(Arc::new(EchoBackend {
            model_id: spec.id.clone(),
        }))
    }
}

pub struct EchoBackend {
    model_id: String,
}

impl InferenceBackend for EchoBackend {
    fn generate(&self, input: &BackendInput) -> Result<String, ServiceError> {
        let words: Vec<&str> = input
            .prompt
            .split_whitespace()
            .take(input.params.max_new_tokens)
            .collect();
        Ok(format!("[{}] {}", self.model_id, words.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::model::{GenerationParams, PromptTemplate};

    #[tokio::test]
    async fn echo_backend_is_bounded_by_token_ceiling() {
        let spec = ModelSpec {
            id: "qwen".into(),
            display_name: "Qwen".into(),
            template: PromptTemplate::ChatMl,
            location: PathBuf::from("models/qwen"),
        };
        let backend = EchoLoader.load(&spec).await.unwrap();
        let input = BackendInput::new(
            "one two three four".into(),
            PromptTemplate::ChatMl.render("one two three four"),
            GenerationParams {
                max_new_tokens: 2,
                temperature: 0.7,
                repetition_penalty: 1.0,
            },
        );
        assert_eq!(backend.generate(&input).unwrap(), "[qwen] one two");
    }
}
