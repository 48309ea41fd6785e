use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

use crate::{
    error::ServiceError,
    model::{ModelSpec, PromptTemplate},
};

const DEFAULT_MODELS: &str = "gemma=google/gemma-2-2b-it,qwen=Qwen/Qwen2-0.5B-Instruct";

/// Which runtime materializes model backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Deterministic in-process backend for local development.
    Echo,
    /// TorchScript module plus a HuggingFace tokenizer.
    TorchScript,
}

impl FromStr for BackendKind {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "echo" => Ok(BackendKind::Echo),
            "torchscript" | "tch" => Ok(BackendKind::TorchScript),
            other => Err(ServiceError::Config(format!("unknown backend `{other}`"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub dev_mode: bool,
    pub api_keys_path: PathBuf,
    pub whitelist_path: PathBuf,
    pub model_dir: PathBuf,
    pub models: Vec<ModelSpec>,
    pub default_model: String,
    pub backend: BackendKind,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub repetition_penalty: f64,
    pub generation_timeout: Duration,
    pub retry_cooldown: Duration,
    pub max_prompt_chars: usize,
    pub preload_default_model: bool,
    pub strict_model_selection: bool,
    pub cors_allowed_origins: Vec<String>,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::from_lookup(|key| env::var(key).ok())?)
    }

    /// Builds the configuration from an arbitrary key lookup. Absent keys take
    /// their defaults; present but malformed values are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ServiceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = parse_var(
            &lookup,
            "SERVER_ADDR",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000),
        )?;

        let dev_mode = parse_bool(&lookup, "DEV_MODE", true)?;
        let api_keys_path = PathBuf::from(
            lookup("API_KEYS_FILE").unwrap_or_else(|| "config/api_keys.txt".to_string()),
        );
        let whitelist_path = PathBuf::from(
            lookup("WHITELIST_FILE").unwrap_or_else(|| "config/whitelist.txt".to_string()),
        );
        let model_dir =
            PathBuf::from(lookup("MODEL_DIR").unwrap_or_else(|| "models".to_string()));

        let models = parse_models(
            &lookup("MODELS").unwrap_or_else(|| DEFAULT_MODELS.to_string()),
            &model_dir,
        )?;
        let default_model = match lookup("DEFAULT_MODEL") {
            Some(id) => id.trim().to_string(),
            None => models
                .first()
                .map(|spec| spec.id.clone())
                .ok_or_else(|| ServiceError::Config("no models configured".into()))?,
        };

        let backend = match lookup("BACKEND") {
            Some(raw) => raw.parse()?,
            None => BackendKind::Echo,
        };

        let max_new_tokens: usize = parse_var(&lookup, "MAX_NEW_TOKENS", 512)?;
        if max_new_tokens == 0 {
            return Err(ServiceError::Config("MAX_NEW_TOKENS must be positive".into()));
        }
        let temperature: f64 = parse_var(&lookup, "TEMPERATURE", 0.7)?;
        let repetition_penalty: f64 = parse_var(&lookup, "REPETITION_PENALTY", 1.1)?;
        if !repetition_penalty.is_finite() || repetition_penalty <= 0.0 {
            return Err(ServiceError::Config("REPETITION_PENALTY must be positive".into()));
        }
        let generation_timeout =
            Duration::from_secs(parse_var(&lookup, "GENERATION_TIMEOUT_SECS", 120)?);
        let retry_cooldown =
            Duration::from_secs(parse_var(&lookup, "MODEL_RETRY_COOLDOWN_SECS", 30)?);
        let max_prompt_chars = parse_var(&lookup, "MAX_PROMPT_CHARS", 8000)?;
        let preload_default_model = parse_bool(&lookup, "PRELOAD_DEFAULT_MODEL", false)?;
        let strict_model_selection = parse_bool(&lookup, "STRICT_MODEL_SELECTION", false)?;
        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            dev_mode,
            api_keys_path,
            whitelist_path,
            model_dir,
            models,
            default_model,
            backend,
            max_new_tokens,
            temperature,
            repetition_penalty,
            generation_timeout,
            retry_cooldown,
            max_prompt_chars,
            preload_default_model,
            strict_model_selection,
            cors_allowed_origins,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

/// Parses `id=display name` pairs separated by commas. A bare `id` uses the id
/// as its display name.
fn parse_models(raw: &str, model_dir: &std::path::Path) -> Result<Vec<ModelSpec>, ServiceError> {
    let mut specs = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, display_name) = match entry.split_once('=') {
            Some((id, name)) => (id.trim(), name.trim()),
            None => (entry, entry),
        };
        if id.is_empty() {
            return Err(ServiceError::Config(format!("model entry `{entry}` has no id")));
        }
        let display_name = if display_name.is_empty() { id } else { display_name };
        specs.push(ModelSpec {
            id: id.to_string(),
            display_name: display_name.to_string(),
            template: PromptTemplate::infer(id),
            location: model_dir.join(id),
        });
    }
    if specs.is_empty() {
        return Err(ServiceError::Config("MODELS must name at least one model".into()));
    }
    Ok(specs)
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ServiceError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ServiceError::Config(format!("{key} has invalid value `{raw}`"))),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ServiceError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ServiceError::Config(format!("{key} has invalid value `{raw}`"))),
        },
        None => Ok(default),
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ServiceError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_development_setup() {
        let config = config_from(&[]).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.max_new_tokens, 512);
        assert_eq!(config.default_model, "gemma");
        assert_eq!(config.backend, BackendKind::Echo);
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[0].display_name, "google/gemma-2-2b-it");
        assert_eq!(config.models[1].template, PromptTemplate::ChatMl);
        assert_eq!(config.models[1].location, PathBuf::from("models").join("qwen"));
    }

    #[test]
    fn models_list_accepts_bare_ids() {
        let config = config_from(&[("MODELS", "tiny, gemma=Gemma 2B"), ("DEFAULT_MODEL", "gemma")])
            .unwrap();
        assert_eq!(config.models[0].id, "tiny");
        assert_eq!(config.models[0].display_name, "tiny");
        assert_eq!(config.models[0].template, PromptTemplate::Raw);
        assert_eq!(config.models[1].display_name, "Gemma 2B");
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config_from(&[("MAX_NEW_TOKENS", "lots")]).unwrap_err();
        assert!(matches!(err, ServiceError::Config(msg) if msg.contains("MAX_NEW_TOKENS")));
    }

    #[test]
    fn malformed_listen_address_is_rejected() {
        let err = config_from(&[("SERVER_ADDR", "localhost:eighty")]).unwrap_err();
        assert!(matches!(err, ServiceError::Config(msg) if msg.contains("SERVER_ADDR")));

        let config = config_from(&[("SERVER_ADDR", "0.0.0.0:9000")]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config_from(&[]).unwrap().listen_addr.port(), 8000);
    }

    #[test]
    fn repetition_penalty_defaults_and_bounds() {
        assert_eq!(config_from(&[]).unwrap().repetition_penalty, 1.1);
        assert_eq!(
            config_from(&[("REPETITION_PENALTY", "1.0")]).unwrap().repetition_penalty,
            1.0
        );
        assert!(config_from(&[("REPETITION_PENALTY", "0")]).is_err());
        assert!(config_from(&[("REPETITION_PENALTY", "-1.2")]).is_err());
    }

    #[test]
    fn dev_mode_flag_parses_common_spellings() {
        assert!(!config_from(&[("DEV_MODE", "False")]).unwrap().dev_mode);
        assert!(config_from(&[("DEV_MODE", "1")]).unwrap().dev_mode);
        assert!(config_from(&[("DEV_MODE", "maybe")]).is_err());
    }

    #[test]
    fn unknown_backend_is_a_config_error() {
        assert!(config_from(&[("BACKEND", "onnx")]).is_err());
        assert_eq!(
            config_from(&[("BACKEND", "TorchScript")]).unwrap().backend,
            BackendKind::TorchScript
        );
    }
}
