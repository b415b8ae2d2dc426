use super::error::{BacktestError, ErrorKind};
use super::types::{OptionContract, SimulationState};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// What a successful pipeline run hands to the assembler.
#[derive(Debug, Clone)]
pub struct BacktestRun {
    pub simulation: SimulationState,
    pub contract: Option<OptionContract>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestResult {
    pub total_return: Option<f64>,
    pub annualized_return: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub win_rate: Option<f64>,
    pub portfolio_value_series: Option<Vec<f64>>,
    pub dates: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract: Option<OptionContract>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorResult {
    pub error: String,
    pub kind: ErrorKind,
}

/// Exactly one payload per response; the status is derived from the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEnvelope {
    Success(BacktestResult),
    Failure(ErrorResult),
}

impl ResponseEnvelope {
    pub fn status(&self) -> StatusCode {
        match self {
            ResponseEnvelope::Success(_) => StatusCode::OK,
            ResponseEnvelope::Failure(err) => match err.kind {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<BacktestError> for ResponseEnvelope {
    fn from(err: BacktestError) -> Self {
        ResponseEnvelope::Failure(ErrorResult {
            error: err.to_string(),
            kind: err.kind(),
        })
    }
}

impl IntoResponse for ResponseEnvelope {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            ResponseEnvelope::Success(result) => (status, Json(result)).into_response(),
            ResponseEnvelope::Failure(error) => (status, Json(error)).into_response(),
        }
    }
}

fn finite(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        None
    }
}

pub fn assemble(outcome: Result<BacktestRun, BacktestError>) -> ResponseEnvelope {
    let run = match outcome {
        Ok(run) => run,
        Err(err) => {
            tracing::error!("Backtest failed ({:?}): {}", err.kind(), err);
            return err.into();
        }
    };

    let simulation = run.simulation;
    let stats = simulation.stats;

    // Values come from decimal arithmetic and are always finite.
    let dates: Vec<String> = simulation
        .dates
        .iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect();

    ResponseEnvelope::Success(BacktestResult {
        total_return: finite(stats.total_return),
        annualized_return: finite(stats.annualized_return),
        max_drawdown: finite(stats.max_drawdown),
        sharpe_ratio: finite(stats.sharpe_ratio),
        win_rate: finite(stats.win_rate),
        portfolio_value_series: Some(simulation.values),
        dates: Some(dates),
        contract: run.contract,
    })
}
