use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::model::backend::InferenceBackend;

/// Chat formatting applied to the user prompt before it reaches a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplate {
    Gemma,
    ChatMl,
    Raw,
}

const CHATML_SYSTEM: &str = "You are a helpful AI assistant.";

impl PromptTemplate {
    pub fn infer(model_id: &str) -> Self {
        let id = model_id.to_lowercase();
        if id.starts_with("gemma") {
            PromptTemplate::Gemma
        } else if id.starts_with("qwen") {
            PromptTemplate::ChatMl
        } else {
            PromptTemplate::Raw
        }
    }

    pub fn render(&self, prompt: &str) -> String {
        match self {
            PromptTemplate::Gemma => {
                format!("<start_of_turn>user\n{prompt}<end_of_turn>\n<start_of_turn>model\n")
            }
            PromptTemplate::ChatMl => format!(
                "<|im_start|>system\n{CHATML_SYSTEM}<|im_end|>\n\
                 <|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n"
            ),
            PromptTemplate::Raw => prompt.to_string(),
        }
    }

    /// Tokens that end a turn for this family.
    pub fn stop_tokens(&self) -> &'static [&'static str] {
        match self {
            PromptTemplate::Gemma => &["<end_of_turn>", "<eos>"],
            PromptTemplate::ChatMl => &["<|im_end|>", "<|endoftext|>"],
            PromptTemplate::Raw => &["</s>", "<|endoftext|>"],
        }
    }
}

/// Static configuration of one servable model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: String,
    pub display_name: String,
    pub template: PromptTemplate,
    pub location: PathBuf,
}

/// A model resolved by the registry with its backend materialized.
#[derive(Clone)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub template: PromptTemplate,
    pub backend: Arc<dyn InferenceBackend>,
}

impl std::fmt::Debug for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDescriptor")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatusEntry {
    pub id: String,
    pub display_name: String,
    pub status: ModelStatus,
    pub current: bool,
}

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub response: String,
}

/// Server-side bounded sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    /// Logit divisor for tokens already present in the sequence; 1.0 disables it.
    pub repetition_penalty: f64,
}

/// Everything a backend needs for one call.
#[derive(Debug, Clone)]
pub struct BackendInput {
    /// The caller's prompt, trimmed.
    pub prompt: String,
    /// `prompt` wrapped in the model's chat template.
    pub rendered: String,
    pub params: GenerationParams,
    /// Raised once nobody is waiting for the result any more.
    pub cancelled: Arc<AtomicBool>,
}

impl BackendInput {
    pub fn new(prompt: String, rendered: String, params: GenerationParams) -> Self {
        Self {
            prompt,
            rendered,
            params,
            cancelled: Arc::default(),
        }
    }

    /// Backends that generate step by step should check this between steps
    /// and stop early once it returns true.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub elapsed: Duration,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub available_models: BTreeMap<String, String>,
    pub current_model: String,
    pub current_model_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_inferred_from_family() {
        assert_eq!(PromptTemplate::infer("gemma-2b"), PromptTemplate::Gemma);
        assert_eq!(PromptTemplate::infer("Qwen"), PromptTemplate::ChatMl);
        assert_eq!(PromptTemplate::infer("phi"), PromptTemplate::Raw);
    }

    #[test]
    fn gemma_prompt_opens_a_model_turn() {
        let rendered = PromptTemplate::Gemma.render("hello");
        assert!(rendered.starts_with("<start_of_turn>user\nhello<end_of_turn>"));
        assert!(rendered.ends_with("<start_of_turn>model\n"));
    }

    #[test]
    fn chatml_prompt_carries_system_message() {
        let rendered = PromptTemplate::ChatMl.render("hi");
        assert!(rendered.contains(CHATML_SYSTEM));
        assert!(rendered.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn request_accepts_prompt_only() {
        let request: GenerationRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(request.prompt, "hi");
        assert!(request.model.is_none());
        assert!(request.max_new_tokens.is_none());
    }
}
