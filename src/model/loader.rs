//! TorchScript backend: a traced causal LM plus its HuggingFace tokenizer,
//! both read from the model's directory (`model.ts`, `tokenizer.json`).

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tokio::task;

use crate::{
    error::ServiceError,
    model::{
        BackendInput, GenerationParams, ModelSpec, PromptTemplate,
        backend::{BackendLoader, InferenceBackend},
        sampling::apply_repetition_penalty,
    },
};

const MODULE_FILE: &str = "model.ts";
const TOKENIZER_FILE: &str = "tokenizer.json";
const MAX_INPUT_TOKENS: usize = 2048;

pub struct TorchScriptLoader {
    device: Device,
}

impl TorchScriptLoader {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

#[async_trait]
impl BackendLoader for TorchScriptLoader {
    async fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn InferenceBackend>, ServiceError> {
        let spec = spec.clone();
        let device = self.device;
        let backend = task::spawn_blocking(move || TorchScriptBackend::open(&spec, device))
            .await
            .map_err(|err| ServiceError::Backend(format!("load task failed: {err}")))??;
        Ok(Arc::new(backend))
    }
}

pub struct TorchScriptBackend {
    device: Device,
    module: Mutex<tch::CModule>,
    tokenizer: Tokenizer,
    stop_ids: Vec<i64>,
}

impl TorchScriptBackend {
    pub fn open(spec: &ModelSpec, device: Device) -> Result<Self, ServiceError> {
        let module_path = spec.location.join(MODULE_FILE);
        let tokenizer_path = spec.location.join(TOKENIZER_FILE);
        require_file(&module_path)?;
        require_file(&tokenizer_path)?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ServiceError::Backend(format!("tokenizer: {e}")))?;
        let mut module = tch::CModule::load_on_device(&module_path, device)
            .map_err(|e| ServiceError::Backend(e.to_string()))?;
        module.set_eval();

        let stop_ids = stop_ids(&tokenizer, spec.template);
        tracing::debug!(model = %spec.id, ?stop_ids, "torchscript module loaded");

        Ok(Self {
            device,
            module: Mutex::new(module),
            tokenizer,
            stop_ids,
        })
    }

    fn next_token(
        &self,
        logits: &Tensor,
        history: &[i64],
        params: &GenerationParams,
    ) -> Result<i64, ServiceError> {
        // logits: [1, seq_len, vocab]
        let last = logits
            .select(1, -1)
            .squeeze()
            .to_kind(Kind::Float)
            .to_device(Device::Cpu);
        let mut scores =
            Vec::<f32>::try_from(&last).map_err(|e| ServiceError::Backend(e.to_string()))?;
        apply_repetition_penalty(&mut scores, history, params.repetition_penalty as f32);
        let scores = Tensor::from_slice(&scores);

        let next = if params.temperature <= f64::EPSILON {
            scores.argmax(0, false).int64_value(&[])
        } else {
            (&scores / params.temperature)
                .softmax(-1, Kind::Float)
                .multinomial(1, false)
                .int64_value(&[0])
        };
        Ok(next)
    }
}

impl InferenceBackend for TorchScriptBackend {
    fn generate(&self, input: &BackendInput) -> Result<String, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(input.rendered.as_str(), true)
            .map_err(|e| ServiceError::Backend(format!("tokenizer: {e}")))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if ids.len() > MAX_INPUT_TOKENS {
            ids.drain(..ids.len() - MAX_INPUT_TOKENS);
        }
        if ids.is_empty() {
            ids.push(0);
        }
        let prompt_len = ids.len();

        no_grad(|| {
            let module = self.module.lock();
            for _ in 0..input.params.max_new_tokens {
                if input.is_cancelled() {
                    tracing::debug!(generated = ids.len() - prompt_len, "generation cancelled");
                    break;
                }
                let input_tensor = Tensor::from_slice(&ids)
                    .reshape([1, ids.len() as i64])
                    .to(self.device);
                let output = module
                    .forward_is(&[tch::IValue::Tensor(input_tensor)])
                    .map_err(|e| ServiceError::Backend(e.to_string()))?;

                // Traced models return either the logits or a (logits, past) tuple.
                let logits = match output {
                    tch::IValue::Tensor(t) => t,
                    tch::IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        tch::IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Backend(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Backend("unexpected model output".into()));
                    }
                };

                let next = self.next_token(&logits, &ids, &input.params)?;
                if self.stop_ids.contains(&next) {
                    break;
                }
                ids.push(next);
            }
            Ok::<(), ServiceError>(())
        })?;

        let generated: Vec<u32> = ids[prompt_len..].iter().map(|&id| id as u32).collect();
        self.tokenizer
            .decode(&generated, true)
            .map_err(|e| ServiceError::Backend(format!("tokenizer: {e}")))
    }
}

fn require_file(path: &Path) -> Result<(), ServiceError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ServiceError::Backend(format!(
            "model artifact missing: {}",
            path.display()
        )))
    }
}

fn stop_ids(tokenizer: &Tokenizer, template: PromptTemplate) -> Vec<i64> {
    template
        .stop_tokens()
        .iter()
        .filter_map(|token| tokenizer.token_to_id(token))
        .map(i64::from)
        .collect()
}
