pub mod backend;
mod dispatcher;
#[cfg(feature = "tch-backend")]
mod loader;
mod registry;
pub mod sampling;
mod types;

pub use backend::{BackendLoader, EchoLoader, InferenceBackend, loader_for};
pub use dispatcher::{EMPTY_OUTPUT_REPLY, GenerationDispatcher, GenerationLimits, MAX_TEMPERATURE};
#[cfg(feature = "tch-backend")]
pub use loader::{TorchScriptBackend, TorchScriptLoader};
pub use registry::{ModelRegistry, RegistryOptions};
pub use types::{
    BackendInput, GenerationParams, GenerationRequest, GenerationResponse, GenerationResult,
    ModelDescriptor, ModelSpec, ModelStatus, ModelStatusEntry, ModelsResponse, PromptTemplate,
};
