pub mod config;
pub mod error;
pub mod model;
pub mod security;
pub mod server;

pub use config::AppConfig;
pub use error::ServiceError;
pub use model::{GenerationDispatcher, GenerationLimits, ModelRegistry};
pub use security::AccessControl;
pub use server::{AppState, build_router, cors_layer};
