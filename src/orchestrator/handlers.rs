use super::error::BacktestError;
use super::result::{assemble, ResponseEnvelope};
use super::runner::RunRequest;
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct RunStrategyBody {
    pub strategy_file: Option<String>,
    pub symbol: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunOptionsStrategyBody {
    pub strategy_file: Option<String>,
    #[serde(alias = "symbol")]
    pub underlying: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// An absent or blank body means "use every default".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, BacktestError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| BacktestError::InvalidRequest(format!("Invalid request body: {}", e)))
}

pub async fn run_strategy(State(state): State<AppState>, body: Bytes) -> ResponseEnvelope {
    let request = parse_body::<RunStrategyBody>(&body).and_then(|body| {
        let defaults = &state.defaults;
        RunRequest::new(
            body.strategy_file
                .unwrap_or_else(|| defaults.strategy_file.clone()),
            body.symbol.unwrap_or_else(|| defaults.symbol.clone()),
            body.start.as_deref().unwrap_or(&defaults.start),
            body.end.as_deref().unwrap_or(&defaults.end),
        )
    });

    let request = match request {
        Ok(request) => request,
        Err(err) => return assemble(Err(err)),
    };

    tracing::info!(
        "Running strategy {} on {}",
        request.strategy_file,
        request.symbol
    );
    assemble(state.runner.run_stock(&request).await)
}

pub async fn run_options_strategy(State(state): State<AppState>, body: Bytes) -> ResponseEnvelope {
    let request = parse_body::<RunOptionsStrategyBody>(&body).and_then(|body| {
        let defaults = &state.defaults;
        RunRequest::new(
            body.strategy_file
                .unwrap_or_else(|| defaults.options_strategy_file.clone()),
            body.underlying.unwrap_or_else(|| defaults.symbol.clone()),
            body.start.as_deref().unwrap_or(&defaults.start),
            body.end.as_deref().unwrap_or(&defaults.end),
        )
    });

    let request = match request {
        Ok(request) => request,
        Err(err) => return assemble(Err(err)),
    };

    tracing::info!(
        "Running options strategy {} on {}",
        request.strategy_file,
        request.symbol
    );
    assemble(state.runner.run_options(&request).await)
}

pub async fn store_strategy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    source: String,
) -> Response {
    match state.store.store(&name, source).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            tracing::warn!("Failed to store strategy {}: {}", name, err);
            ResponseEnvelope::from(err).into_response()
        }
    }
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
