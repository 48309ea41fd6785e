use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, Method},
    middleware::{Next, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        GenerationDispatcher, GenerationRequest, GenerationResponse, ModelRegistry,
        ModelStatusEntry, ModelsResponse,
    },
    security::AccessControl,
};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const GENERATION_TIME_HEADER: &str = "x-generation-time-ms";

/// Origins of the local chat UI dev servers.
const DEV_UI_ORIGINS: [&str; 2] = ["http://localhost:5173", "http://localhost:5174"];

/// Process-scoped context shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub access: Arc<AccessControl>,
    pub registry: Arc<ModelRegistry>,
    pub dispatcher: Arc<GenerationDispatcher>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    models: Vec<ModelStatusEntry>,
}

/// `/api/generate` checks the API key, then the caller's address. `/api/models`
/// only checks the address. `/health` is open.
pub fn build_router(state: AppState, cors: CorsLayer) -> Router {
    let generation = Router::new()
        .route("/api/generate", post(generate))
        .route_layer(from_fn_with_state(state.clone(), require_whitelisted_origin))
        .route_layer(from_fn_with_state(state.clone(), require_api_key));

    let catalog = Router::new()
        .route("/api/models", get(list_models))
        .route_layer(from_fn_with_state(state.clone(), require_whitelisted_origin));

    Router::new()
        .route("/health", get(health))
        .merge(generation)
        .merge(catalog)
        .with_state(state)
        .layer(cors)
        // Error responses log themselves; the trace layer only records spans.
        .layer(TraceLayer::new_for_http().on_failure(()))
}

/// Dev-mode allows the local UI dev servers; `CORS_ALLOWED_ORIGINS` adds more.
pub fn cors_layer(config: &AppConfig) -> CorsLayer {
    let mut origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if config.dev_mode {
        origins.extend(DEV_UI_ORIGINS.iter().copied().map(HeaderValue::from_static));
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    state.access.authenticate(key)?;
    Ok(next.run(request).await)
}

async fn require_whitelisted_origin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    state.access.authorize_origin(peer)?;
    Ok(next.run(request).await)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        models: state.registry.statuses(),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let current = state.registry.current_spec();
    Json(ModelsResponse {
        available_models: state.registry.list_available(),
        current_model: current.display_name.clone(),
        current_model_id: current.id.clone(),
    })
}

async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let Json(request) =
        payload.map_err(|rejection| ServiceError::BadRequest(rejection.body_text()))?;

    // Cheap checks first: nothing is resolved or loaded for an invalid prompt.
    state.dispatcher.validate_prompt(&request.prompt)?;
    let model = state.registry.resolve(request.model.as_deref()).await?;
    let params = state
        .dispatcher
        .params(request.max_new_tokens, request.temperature);
    let result = state
        .dispatcher
        .generate(&model, &request.prompt, params)
        .await?;

    let elapsed_ms = result.elapsed.as_millis() as u64;
    info!(model = %result.model, elapsed_ms, "generate request served");

    Ok((
        [(
            HeaderName::from_static(GENERATION_TIME_HEADER),
            HeaderValue::from(elapsed_ms),
        )],
        Json(GenerationResponse {
            response: result.text,
        }),
    ))
}
