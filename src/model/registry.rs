use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{sync::OnceCell, task};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        ModelDescriptor, ModelSpec, ModelStatus, ModelStatusEntry,
        backend::{BackendLoader, InferenceBackend},
    },
};

#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    /// How long a failed model is left alone before the next load attempt.
    pub retry_cooldown: Duration,
    /// Reject unknown model ids instead of falling back to the current model.
    pub strict_selection: bool,
}

impl From<&AppConfig> for RegistryOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            retry_cooldown: config.retry_cooldown,
            strict_selection: config.strict_model_selection,
        }
    }
}

struct ModelSlot {
    spec: ModelSpec,
    backend: OnceCell<Arc<dyn InferenceBackend>>,
    loading: AtomicBool,
    failed_at: Mutex<Option<Instant>>,
}

impl ModelSlot {
    fn new(spec: ModelSpec) -> Self {
        Self {
            spec,
            backend: OnceCell::new(),
            loading: AtomicBool::new(false),
            failed_at: Mutex::new(None),
        }
    }

    fn status(&self) -> ModelStatus {
        if self.backend.initialized() {
            ModelStatus::Ready
        } else if self.loading.load(Ordering::Acquire) {
            ModelStatus::Loading
        } else if self.failed_at.lock().is_some() {
            ModelStatus::Failed
        } else {
            ModelStatus::Unloaded
        }
    }

    fn cooling_down(&self, cooldown: Duration) -> bool {
        self.failed_at
            .lock()
            .is_some_and(|failed| failed.elapsed() < cooldown)
    }

    fn descriptor(&self, backend: Arc<dyn InferenceBackend>) -> ModelDescriptor {
        ModelDescriptor {
            id: self.spec.id.clone(),
            display_name: self.spec.display_name.clone(),
            template: self.spec.template,
            backend,
        }
    }
}

/// Models the gateway can serve, keyed by id. Backends are loaded on first use
/// (or eagerly via [`ModelRegistry::preload_current`]) and shared by every
/// request afterwards.
pub struct ModelRegistry {
    slots: HashMap<String, Arc<ModelSlot>>,
    order: Vec<String>,
    current: String,
    loader: Arc<dyn BackendLoader>,
    options: RegistryOptions,
}

impl ModelRegistry {
    pub fn new(
        specs: Vec<ModelSpec>,
        current: &str,
        loader: Arc<dyn BackendLoader>,
        options: RegistryOptions,
    ) -> Result<Self, ServiceError> {
        if specs.is_empty() {
            return Err(ServiceError::Config("no models configured".into()));
        }

        let mut slots = HashMap::with_capacity(specs.len());
        let mut order = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = spec.id.clone();
            if slots.insert(id.clone(), Arc::new(ModelSlot::new(spec))).is_some() {
                return Err(ServiceError::Config(format!("duplicate model id `{id}`")));
            }
            order.push(id);
        }

        if !slots.contains_key(current) {
            return Err(ServiceError::Config(format!(
                "default model `{current}` is not among the configured models"
            )));
        }

        Ok(Self {
            slots,
            order,
            current: current.to_string(),
            loader,
            options,
        })
    }

    pub fn from_config(
        config: &AppConfig,
        loader: Arc<dyn BackendLoader>,
    ) -> Result<Self, ServiceError> {
        Self::new(
            config.models.clone(),
            &config.default_model,
            loader,
            RegistryOptions::from(config),
        )
    }

    /// Id → display name for every configured model. Never loads anything.
    pub fn list_available(&self) -> BTreeMap<String, String> {
        self.slots
            .values()
            .map(|slot| (slot.spec.id.clone(), slot.spec.display_name.clone()))
            .collect()
    }

    pub fn current_id(&self) -> &str {
        &self.current
    }

    pub fn current_spec(&self) -> &ModelSpec {
        &self.slots[&self.current].spec
    }

    /// Load state of each model, in configuration order.
    pub fn statuses(&self) -> Vec<ModelStatusEntry> {
        self.order
            .iter()
            .map(|id| {
                let slot = &self.slots[id];
                ModelStatusEntry {
                    id: id.clone(),
                    display_name: slot.spec.display_name.clone(),
                    status: slot.status(),
                    current: *id == self.current,
                }
            })
            .collect()
    }

    /// Picks the model for a request. Omitted or unknown ids resolve to the
    /// current model unless strict selection is enabled.
    pub async fn resolve(&self, requested: Option<&str>) -> Result<ModelDescriptor, ServiceError> {
        let requested = requested.map(str::trim).filter(|id| !id.is_empty());
        let slot = match requested {
            Some(id) => match self.slots.get(id) {
                Some(slot) => slot,
                None if self.options.strict_selection => {
                    return Err(ServiceError::BadRequest(format!("unknown model `{id}`")));
                }
                None => {
                    tracing::debug!(
                        requested = id,
                        fallback = %self.current,
                        "unknown model, using default"
                    );
                    &self.slots[&self.current]
                }
            },
            None => &self.slots[&self.current],
        };

        let backend = self.materialize(slot).await?;
        Ok(slot.descriptor(backend))
    }

    pub async fn preload_current(&self) -> Result<(), ServiceError> {
        let slot = &self.slots[&self.current];
        self.materialize(slot).await.map(|_| ())
    }

    async fn materialize(
        &self,
        slot: &Arc<ModelSlot>,
    ) -> Result<Arc<dyn InferenceBackend>, ServiceError> {
        if let Some(backend) = slot.backend.get() {
            return Ok(backend.clone());
        }

        // The load runs in its own task so a caller that goes away mid-load
        // does not cancel it; later callers wait on the same cell.
        let loader = self.loader.clone();
        let cooldown = self.options.retry_cooldown;
        match task::spawn(load_once(slot.clone(), loader, cooldown)).await {
            Ok(result) => result,
            Err(err) => {
                // A panicking loader never reached the bookkeeping in `load_once`.
                slot.loading.store(false, Ordering::Release);
                *slot.failed_at.lock() = Some(Instant::now());
                Err(ServiceError::ModelUnavailable {
                    model: slot.spec.id.clone(),
                    reason: format!("load task failed: {err}"),
                })
            }
        }
    }
}

async fn load_once(
    slot: Arc<ModelSlot>,
    loader: Arc<dyn BackendLoader>,
    cooldown: Duration,
) -> Result<Arc<dyn InferenceBackend>, ServiceError> {
    let backend = slot
        .backend
        .get_or_try_init(|| async {
            let id = slot.spec.id.clone();
            if slot.cooling_down(cooldown) {
                return Err(ServiceError::ModelUnavailable {
                    model: id,
                    reason: "in retry cool-down after a failed load".into(),
                });
            }

            slot.loading.store(true, Ordering::Release);
            tracing::info!(model = %id, location = %slot.spec.location.display(), "loading model");
            let start = Instant::now();
            let result = loader.load(&slot.spec).await;
            slot.loading.store(false, Ordering::Release);

            match result {
                Ok(backend) => {
                    *slot.failed_at.lock() = None;
                    tracing::info!(
                        model = %id,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "model ready"
                    );
                    Ok(backend)
                }
                Err(err) => {
                    *slot.failed_at.lock() = Some(Instant::now());
                    tracing::debug!(
                        model = %id,
                        retry_in_secs = cooldown.as_secs(),
                        "model failed to load"
                    );
                    Err(ServiceError::ModelUnavailable {
                        model: id,
                        reason: err.to_string(),
                    })
                }
            }
        })
        .await?;
    Ok(backend.clone())
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::model::{BackendInput, PromptTemplate};

    struct StaticBackend(&'static str);

    impl InferenceBackend for StaticBackend {
        fn generate(&self, _input: &BackendInput) -> Result<String, ServiceError> {
            Ok(self.0.to_string())
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
        fail: bool,
        panic: bool,
        delay: Duration,
    }

    #[async_trait]
    impl BackendLoader for CountingLoader {
        async fn load(
            &self,
            spec: &ModelSpec,
        ) -> Result<Arc<dyn InferenceBackend>, ServiceError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("loader crashed on {}", spec.id);
            }
            if self.fail {
                return Err(ServiceError::Backend(format!("weights missing for {}", spec.id)));
            }
            Ok(Arc::new(StaticBackend("ok")))
        }
    }

    fn spec(id: &str) -> ModelSpec {
        ModelSpec {
            id: id.to_string(),
            display_name: format!("{id} display"),
            template: PromptTemplate::infer(id),
            location: PathBuf::from("models").join(id),
        }
    }

    fn options() -> RegistryOptions {
        RegistryOptions {
            retry_cooldown: Duration::from_secs(60),
            strict_selection: false,
        }
    }

    fn registry(loader: Arc<CountingLoader>) -> ModelRegistry {
        ModelRegistry::new(vec![spec("gemma"), spec("qwen")], "gemma", loader, options()).unwrap()
    }

    #[test]
    fn rejects_duplicate_ids_and_unknown_default() {
        let loader: Arc<dyn BackendLoader> = Arc::new(CountingLoader::default());
        assert!(
            ModelRegistry::new(vec![spec("a"), spec("a")], "a", loader.clone(), options())
                .is_err()
        );
        assert!(ModelRegistry::new(vec![spec("a")], "b", loader, options()).is_err());
    }

    #[test]
    fn listing_does_not_load() {
        let loader = Arc::new(CountingLoader::default());
        let registry = registry(loader.clone());
        let available = registry.list_available();
        assert_eq!(available.len(), 2);
        assert_eq!(available["qwen"], "qwen display");
        assert!(available.values().any(|name| *name == registry.current_spec().display_name));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
        assert!(registry
            .statuses()
            .iter()
            .all(|entry| entry.status == ModelStatus::Unloaded));
    }

    #[tokio::test]
    async fn unknown_id_falls_back_to_current() {
        let loader = Arc::new(CountingLoader::default());
        let registry = registry(loader.clone());
        let model = registry.resolve(Some("nonexistent")).await.unwrap();
        assert_eq!(model.id, "gemma");
        let model = registry.resolve(None).await.unwrap();
        assert_eq!(model.id, "gemma");
        let model = registry.resolve(Some("qwen")).await.unwrap();
        assert_eq!(model.id, "qwen");
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn strict_selection_rejects_unknown_id() {
        let loader = Arc::new(CountingLoader::default());
        let registry = ModelRegistry::new(
            vec![spec("gemma")],
            "gemma",
            loader,
            RegistryOptions {
                strict_selection: true,
                ..options()
            },
        )
        .unwrap();
        let err = registry.resolve(Some("llama")).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolves_load_once() {
        let loader = Arc::new(CountingLoader {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let registry = Arc::new(registry(loader.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.resolve(Some("qwen")).await.map(|model| model.id)
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "qwen");
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        let qwen = registry
            .statuses()
            .into_iter()
            .find(|entry| entry.id == "qwen")
            .unwrap();
        assert_eq!(qwen.status, ModelStatus::Ready);
    }

    #[tokio::test]
    async fn failed_load_is_not_retried_during_cooldown() {
        let loader = Arc::new(CountingLoader {
            fail: true,
            ..Default::default()
        });
        let registry = registry(loader.clone());

        let err = registry.resolve(None).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ModelUnavailable { model, reason }
                if model == "gemma" && reason.contains("weights missing")
        ));
        let err = registry.resolve(None).await.unwrap_err();
        assert!(matches!(err, ServiceError::ModelUnavailable { .. }));

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.statuses()[0].status, ModelStatus::Failed);
    }

    #[tokio::test]
    async fn failed_load_is_retried_after_cooldown() {
        let loader = Arc::new(CountingLoader {
            fail: true,
            ..Default::default()
        });
        let registry = ModelRegistry::new(
            vec![spec("gemma")],
            "gemma",
            loader.clone(),
            RegistryOptions {
                retry_cooldown: Duration::from_millis(20),
                strict_selection: false,
            },
        )
        .unwrap();

        assert!(registry.resolve(None).await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(registry.resolve(None).await.is_err());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_loader_is_marked_failed_and_cools_down() {
        let loader = Arc::new(CountingLoader {
            panic: true,
            ..Default::default()
        });
        let registry = registry(loader.clone());

        for _ in 0..3 {
            let err = registry.resolve(None).await.unwrap_err();
            assert!(matches!(
                err,
                ServiceError::ModelUnavailable { model, .. } if model == "gemma"
            ));
        }

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.statuses()[0].status, ModelStatus::Failed);
    }
}
