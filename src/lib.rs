pub mod config;
pub mod orchestrator;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use config::RunDefaults;
use orchestrator::{StrategyRunner, StrategyStore};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<StrategyRunner>,
    pub store: StrategyStore,
    pub defaults: Arc<RunDefaults>,
}

fn cors_layer(allowed_origins: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(Any);

    if allowed_origins.trim() == "*" {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    cors.allow_origin(origins)
}

pub fn build_router(state: AppState, allowed_origins: &str) -> Router {
    Router::new()
        .route("/health", get(orchestrator::handlers::health_check))
        .route("/run-strategy", post(orchestrator::handlers::run_strategy))
        .route(
            "/run-options-strategy",
            post(orchestrator::handlers::run_options_strategy),
        )
        .route("/strategies/:name", put(orchestrator::handlers::store_strategy))
        .layer(cors_layer(allowed_origins))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
