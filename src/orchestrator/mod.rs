pub mod data;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod loader;
pub mod position_manager;
pub mod python_executor;
pub mod result;
pub mod runner;
pub mod signal_processor;
pub mod types;

pub use data::{select_option_contract, AlpacaProvider, MarketDataProvider};
pub use engine::BacktestEngine;
pub use error::{BacktestError, ErrorKind};
pub use loader::{Strategy, StrategyContract, StrategyLoader, StrategyStore, WaitPolicy};
pub use position_manager::PositionManager;
pub use python_executor::{PythonStrategy, PythonStrategyLoader};
pub use result::{assemble, BacktestResult, BacktestRun, ErrorResult, ResponseEnvelope};
pub use runner::{RunRequest, StrategyRunner};
pub use signal_processor::{apply_strategy, SignalProcessor, TradeAction};
pub use types::*;
