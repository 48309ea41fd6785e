use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::task;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{BackendInput, GenerationParams, GenerationResult, ModelDescriptor},
};

pub const MAX_TEMPERATURE: f64 = 2.0;
pub const EMPTY_OUTPUT_REPLY: &str = "I'm sorry, I couldn't generate a response.";

/// Server-side ceilings applied to every generation.
#[derive(Debug, Clone, Copy)]
pub struct GenerationLimits {
    pub max_new_tokens: usize,
    pub default_temperature: f64,
    pub repetition_penalty: f64,
    pub timeout: Duration,
    pub max_prompt_chars: usize,
}

impl From<&AppConfig> for GenerationLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            default_temperature: config.temperature,
            repetition_penalty: config.repetition_penalty,
            timeout: config.generation_timeout,
            max_prompt_chars: config.max_prompt_chars,
        }
    }
}

pub struct GenerationDispatcher {
    limits: GenerationLimits,
    invocations: AtomicU64,
}

impl GenerationDispatcher {
    pub fn new(limits: GenerationLimits) -> Self {
        Self {
            limits,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> &GenerationLimits {
        &self.limits
    }

    /// Number of calls that reached a backend.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn validate_prompt(&self, prompt: &str) -> Result<(), ServiceError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ServiceError::EmptyPrompt);
        }
        let chars = prompt.chars().count();
        if chars > self.limits.max_prompt_chars {
            return Err(ServiceError::BadRequest(format!(
                "prompt is {chars} characters, limit is {}",
                self.limits.max_prompt_chars
            )));
        }
        Ok(())
    }

    /// Clamps client-supplied sampling parameters to the server ceilings.
    pub fn params(
        &self,
        max_new_tokens: Option<usize>,
        temperature: Option<f64>,
    ) -> GenerationParams {
        let ceiling = self.limits.max_new_tokens.max(1);
        let max_new_tokens = max_new_tokens.unwrap_or(ceiling).clamp(1, ceiling);

        let temperature = temperature
            .filter(|t| t.is_finite())
            .unwrap_or(self.limits.default_temperature);
        let temperature = if temperature.is_finite() {
            temperature.clamp(0.0, MAX_TEMPERATURE)
        } else {
            0.0
        };

        GenerationParams {
            max_new_tokens,
            temperature,
            repetition_penalty: self.limits.repetition_penalty,
        }
    }

    pub async fn generate(
        &self,
        model: &ModelDescriptor,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<GenerationResult, ServiceError> {
        self.validate_prompt(prompt)?;

        let prompt = prompt.trim().to_string();
        let input = BackendInput::new(prompt.clone(), model.template.render(&prompt), params);
        // Fires on timeout and when the request future is dropped mid-generation.
        let _cancel_on_drop = CancelOnDrop(input.cancelled.clone());
        let backend = model.backend.clone();
        let timeout = self.limits.timeout;

        self.invocations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            model = %model.id,
            max_new_tokens = params.max_new_tokens,
            temperature = params.temperature,
            prompt = %preview(&input.prompt),
            "dispatching generation"
        );

        let start = Instant::now();
        // Dropping the handle on timeout detaches the blocking call; the cancel
        // flag tells the backend to stop at its next step.
        let handle = task::spawn_blocking(move || backend.generate(&input));
        let outcome = tokio::time::timeout(timeout, handle).await;
        let elapsed = start.elapsed();

        let text = match outcome {
            Err(_) => {
                tracing::debug!(
                    model = %model.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "generation abandoned after timeout"
                );
                return Err(ServiceError::GenerationTimeout(timeout));
            }
            Ok(Err(err)) => {
                return Err(ServiceError::Backend(format!("inference task failed: {err}")));
            }
            Ok(Ok(result)) => result?,
        };

        let text = text.trim();
        let text = if text.is_empty() {
            tracing::warn!(model = %model.id, "backend returned empty output");
            EMPTY_OUTPUT_REPLY.to_string()
        } else {
            text.to_string()
        };

        tracing::info!(
            model = %model.id,
            elapsed_ms = elapsed.as_millis() as u64,
            chars = text.len(),
            "generation completed"
        );

        Ok(GenerationResult {
            text,
            elapsed,
            model: model.id.clone(),
        })
    }
}

struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn preview(prompt: &str) -> String {
    const LIMIT: usize = 50;
    if prompt.chars().count() <= LIMIT {
        prompt.to_string()
    } else {
        let head: String = prompt.chars().take(LIMIT).collect();
        format!("{head}...")
    }
}
