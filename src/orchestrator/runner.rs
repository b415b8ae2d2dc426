use super::data::{select_option_contract, MarketDataProvider};
use super::engine::BacktestEngine;
use super::error::BacktestError;
use super::loader::{StrategyContract, StrategyLoader};
use super::result::BacktestRun;
use super::signal_processor::apply_strategy;
use super::types::Direction;
use chrono::{DateTime, NaiveDate};
use std::sync::Arc;
use tracing::Instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub strategy_file: String,
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RunRequest {
    pub fn new(
        strategy_file: impl Into<String>,
        symbol: impl Into<String>,
        start: &str,
        end: &str,
    ) -> Result<Self, BacktestError> {
        let start = parse_date("start", start)?;
        let end = parse_date("end", end)?;
        if start > end {
            return Err(BacktestError::InvalidRequest(format!(
                "start {} is after end {}",
                start, end
            )));
        }

        Ok(Self {
            strategy_file: strategy_file.into(),
            symbol: symbol.into(),
            start,
            end,
        })
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp.
pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate, BacktestError> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|dt| dt.date_naive()))
        .map_err(|e| BacktestError::InvalidRequest(format!("Invalid {}: {} ({})", field, value, e)))
}

/// Load → fetch → signal → simulate, one request at a time.
#[derive(Clone)]
pub struct StrategyRunner {
    market_data: Arc<dyn MarketDataProvider>,
    loader: Arc<dyn StrategyLoader>,
    engine: BacktestEngine,
    expiration_date_lte: Option<NaiveDate>,
}

impl StrategyRunner {
    pub fn new(
        market_data: Arc<dyn MarketDataProvider>,
        loader: Arc<dyn StrategyLoader>,
        engine: BacktestEngine,
    ) -> Self {
        Self {
            market_data,
            loader,
            engine,
            expiration_date_lte: None,
        }
    }

    pub fn with_expiration_limit(mut self, expiration_date_lte: Option<NaiveDate>) -> Self {
        self.expiration_date_lte = expiration_date_lte;
        self
    }

    pub async fn run_stock(&self, request: &RunRequest) -> Result<BacktestRun, BacktestError> {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "backtest",
            %run_id,
            strategy = %request.strategy_file,
            symbol = %request.symbol
        );

        async {
            tracing::info!(
                "Starting stock backtest from {} to {}",
                request.start,
                request.end
            );

            let strategy = self
                .loader
                .load(&request.strategy_file, StrategyContract::Stock)
                .await?;

            let prices = self
                .market_data
                .fetch_price_series(&request.symbol, request.start, request.end)
                .await?;
            tracing::info!("Loaded {} bars for backtesting", prices.len());

            let signals = apply_strategy(strategy.as_ref(), &prices).await?;
            let simulation = self
                .engine
                .simulate(&prices, &signals, Direction::LongOnly)?;

            Ok(BacktestRun {
                simulation,
                contract: None,
            })
        }
        .instrument(span)
        .await
    }

    /// Options variant: first tradable call on `request.symbol` as the underlying.
    pub async fn run_options(&self, request: &RunRequest) -> Result<BacktestRun, BacktestError> {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "options_backtest",
            %run_id,
            strategy = %request.strategy_file,
            underlying = %request.symbol
        );

        async {
            tracing::info!(
                "Starting options backtest from {} to {}",
                request.start,
                request.end
            );

            let strategy = self
                .loader
                .load(&request.strategy_file, StrategyContract::Options)
                .await?;

            let expiring_by = self.expiration_date_lte.unwrap_or(request.end);
            let contracts = self
                .market_data
                .fetch_option_contracts(&request.symbol, expiring_by)
                .await?;
            let contract = select_option_contract(&contracts)
                .cloned()
                .ok_or_else(|| BacktestError::NoData {
                    symbol: format!("{} (no tradable call contracts)", request.symbol),
                })?;
            tracing::info!("Selected option contract {}", contract.symbol);

            let prices = self
                .market_data
                .fetch_option_price_series(&contract.symbol, request.start, request.end)
                .await?;
            tracing::info!("Loaded {} option bars for backtesting", prices.len());

            let signals = apply_strategy(strategy.as_ref(), &prices).await?;
            let simulation = self
                .engine
                .simulate(&prices, &signals, Direction::LongOnly)?;

            Ok(BacktestRun {
                simulation,
                contract: Some(contract),
            })
        }
        .instrument(span)
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::orchestrator::types::OptionType;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    }

    fn runner(market_data: StaticMarketData) -> StrategyRunner {
        StrategyRunner::new(
            Arc::new(market_data),
            Arc::new(StaticLoader),
            BacktestEngine::new(dec!(100), 365.0),
        )
    }

    #[test]
    fn test_request_date_validation() {
        assert!(RunRequest::new("a.py", "AAPL", "2024-02-01", "2025-02-01").is_ok());
        assert!(RunRequest::new("a.py", "AAPL", "2024-02-01T00:00:00Z", "2024-03-01").is_ok());
        assert!(matches!(
            RunRequest::new("a.py", "AAPL", "2025-02-01", "2024-02-01"),
            Err(BacktestError::InvalidRequest(_))
        ));
        assert!(matches!(
            RunRequest::new("a.py", "AAPL", "Feb 1", "2024-02-01"),
            Err(BacktestError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_stock_pipeline_round_trip() {
        let runner = runner(StaticMarketData::with_series(rising_series("AAPL", start(), 20)));
        let request = RunRequest::new("buy_and_hold.py", "AAPL", "2024-02-01", "2024-02-20").unwrap();

        let run = runner.run_stock(&request).await.unwrap();
        let expected = (119.0 / 100.0 - 1.0) * 100.0;
        assert!((run.simulation.stats.total_return - expected).abs() < 1e-9);
        assert_eq!(run.simulation.values.len(), 20);
        assert_eq!(run.simulation.dates.len(), 20);
        assert!(run.contract.is_none());
    }

    #[tokio::test]
    async fn test_pipeline_is_idempotent() {
        let runner = runner(StaticMarketData::with_series(rising_series("AAPL", start(), 15)));
        let request = RunRequest::new("buy_and_hold.py", "AAPL", "2024-02-01", "2024-02-15").unwrap();

        let first = runner.run_stock(&request).await.unwrap();
        let second = runner.run_stock(&request).await.unwrap();
        assert_eq!(first.simulation.values, second.simulation.values);
        assert_eq!(first.simulation.trades, second.simulation.trades);
    }

    #[tokio::test]
    async fn test_loader_failure_skips_fetch() {
        let market_data = Arc::new(StaticMarketData::with_series(rising_series(
            "AAPL",
            start(),
            5,
        )));
        let runner = StrategyRunner::new(
            market_data.clone(),
            Arc::new(StaticLoader),
            BacktestEngine::new(dec!(100), 365.0),
        );
        let request = RunRequest::new("no_entry.py", "AAPL", "2024-02-01", "2024-02-05").unwrap();

        let err = runner.run_stock(&request).await.unwrap_err();
        assert!(matches!(err, BacktestError::MissingEntryPoint { .. }));
        assert_eq!(market_data.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_no_data() {
        let runner = runner(StaticMarketData::with_series(rising_series("AAPL", start(), 5)));
        let request = RunRequest::new("buy_and_hold.py", "MSFT", "2024-02-01", "2024-02-05").unwrap();

        let err = runner.run_stock(&request).await.unwrap_err();
        assert!(matches!(err, BacktestError::NoData { .. }));
    }

    #[tokio::test]
    async fn test_options_pipeline_uses_first_tradable_call() {
        let mut market_data =
            StaticMarketData::with_series(rising_series("AAPL241220C00150000", start(), 10));
        market_data.contracts = vec![
            contract("AAPL241220P00150000", OptionType::Put, true),
            contract("AAPL241220C00140000", OptionType::Call, false),
            contract("AAPL241220C00150000", OptionType::Call, true),
        ];
        let runner = runner(market_data);
        let request = RunRequest::new("buy_and_hold.py", "AAPL", "2024-02-01", "2024-02-10").unwrap();

        let run = runner.run_options(&request).await.unwrap();
        assert_eq!(run.contract.unwrap().symbol, "AAPL241220C00150000");
        assert_eq!(run.simulation.values.len(), 10);
    }

    #[tokio::test]
    async fn test_options_without_tradable_call_is_fetch_failure() {
        let mut market_data = StaticMarketData::default();
        market_data.contracts = vec![contract("AAPL241220P00150000", OptionType::Put, true)];
        let runner = runner(market_data);
        let request = RunRequest::new("buy_and_hold.py", "AAPL", "2024-02-01", "2024-02-10").unwrap();

        let err = runner.run_options(&request).await.unwrap_err();
        assert_eq!(err.kind(), crate::orchestrator::ErrorKind::FetchFailure);
    }
}
