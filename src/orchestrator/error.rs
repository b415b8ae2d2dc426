use serde::Serialize;
use thiserror::Error;

/// Failure categories reported to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    LoadFailure,
    MissingEntryPoint,
    FetchFailure,
    MalformedOutput,
    StrategyFailure,
    SimulationFailure,
    InvalidRequest,
}

#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Strategy file was not created in time: {0}")]
    NotFound(String),

    #[error("Failed to load strategy {path}: {reason}")]
    LoadFailure { path: String, reason: String },

    #[error("Strategy {path} does not define a '{entry_point}' function")]
    MissingEntryPoint { path: String, entry_point: String },

    #[error("Market data request failed: {0}")]
    Fetch(String),

    #[error("No market data returned for {symbol}")]
    NoData { symbol: String },

    #[error("Malformed strategy output: {0}")]
    MalformedOutput(String),

    #[error("Strategy raised an error: {0}")]
    StrategyFailure(String),

    #[error("Simulation failed: {0}")]
    Simulation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl BacktestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BacktestError::NotFound(_) => ErrorKind::NotFound,
            BacktestError::LoadFailure { .. } => ErrorKind::LoadFailure,
            BacktestError::MissingEntryPoint { .. } => ErrorKind::MissingEntryPoint,
            BacktestError::Fetch(_) | BacktestError::NoData { .. } => ErrorKind::FetchFailure,
            BacktestError::MalformedOutput(_) => ErrorKind::MalformedOutput,
            BacktestError::StrategyFailure(_) => ErrorKind::StrategyFailure,
            BacktestError::Simulation(_) => ErrorKind::SimulationFailure,
            BacktestError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }
}

impl From<reqwest::Error> for BacktestError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest includes the full URL in its Display output; strip it so
        // query strings never leak into responses.
        BacktestError::Fetch(err.without_url().to_string())
    }
}
