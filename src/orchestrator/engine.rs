use super::error::BacktestError;
use super::position_manager::PositionManager;
use super::signal_processor::{SignalProcessor, TradeAction};
use super::types::*;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;

/// Single-asset, one-position-at-a-time portfolio simulation.
#[derive(Debug, Clone)]
pub struct BacktestEngine {
    initial_cash: Decimal,
    year_days: f64,
}

impl BacktestEngine {
    pub fn new(initial_cash: Decimal, year_days: f64) -> Self {
        Self {
            initial_cash,
            year_days,
        }
    }

    pub fn from_config(config: &crate::config::BacktestConfig) -> Result<Self, BacktestError> {
        let initial_cash = Decimal::from_f64(config.initial_cash)
            .filter(|cash| *cash > Decimal::ZERO)
            .ok_or_else(|| {
                BacktestError::Simulation(format!(
                    "Invalid initial cash: {}",
                    config.initial_cash
                ))
            })?;
        Ok(Self::new(initial_cash, config.year_days))
    }

    pub fn initial_cash(&self) -> Decimal {
        self.initial_cash
    }

    /// Replays `signals` bar by bar against each bar's close.
    pub fn simulate(
        &self,
        prices: &PriceSeries,
        signals: &SignalSet,
        direction: Direction,
    ) -> Result<SimulationState, BacktestError> {
        let Direction::LongOnly = direction;

        if signals.len() != prices.len() {
            return Err(BacktestError::Simulation(format!(
                "{} signals for {} bars",
                signals.len(),
                prices.len()
            )));
        }

        tracing::info!(
            "Simulating {} bars for {} with initial cash {}",
            prices.len(),
            prices.symbol,
            self.initial_cash
        );

        let processor = SignalProcessor::new(signals.clone());
        let mut portfolio = Portfolio::new(self.initial_cash);
        let mut trades: Vec<Trade> = Vec::new();
        let mut values = Vec::with_capacity(prices.len());

        // Position state at bar i depends on bar i-1; order matters.
        for (idx, bar) in prices.bars().iter().enumerate() {
            match processor.evaluate(idx, portfolio.position.is_some()) {
                TradeAction::Buy { size } => {
                    let size = Decimal::from_f64(size).ok_or_else(|| {
                        BacktestError::Simulation(format!(
                            "Size {} at {} is not representable",
                            size, bar.date
                        ))
                    })?;
                    PositionManager::execute_buy(&mut portfolio, bar.date, bar.close, size);
                }
                TradeAction::Close => {
                    if let Some(trade) =
                        PositionManager::close_position(&mut portfolio, bar.date, bar.close)
                    {
                        trades.push(trade);
                    }
                }
                TradeAction::None => {}
            }

            let value = portfolio.value_at(bar.close).to_f64().ok_or_else(|| {
                BacktestError::Simulation(format!("Portfolio value overflow at {}", bar.date))
            })?;
            values.push(value);
        }

        let stats = self.statistics(&values, &trades);

        tracing::info!(
            "Simulation complete: {} closed trades, total return {:.2}%",
            trades.len(),
            stats.total_return
        );

        Ok(SimulationState {
            dates: prices.dates().collect(),
            values,
            trades,
            open_position: portfolio.position,
            stats,
        })
    }

    pub(crate) fn statistics(&self, values: &[f64], trades: &[Trade]) -> SimulationStats {
        let initial = self.initial_cash.to_f64().unwrap_or(f64::NAN);
        let last = values.last().copied().unwrap_or(initial);

        let total_return = (last / initial - 1.0) * 100.0;
        let annualized_return = if values.is_empty() {
            f64::NAN
        } else {
            ((last / initial).powf(self.year_days / values.len() as f64) - 1.0) * 100.0
        };

        SimulationStats {
            total_return,
            annualized_return,
            max_drawdown: max_drawdown(values),
            sharpe_ratio: self.sharpe_ratio(initial, values),
            win_rate: win_rate(trades),
        }
    }

    fn sharpe_ratio(&self, initial: f64, values: &[f64]) -> f64 {
        let mut previous = initial;
        let returns: Vec<f64> = values
            .iter()
            .map(|value| {
                let r = value / previous - 1.0;
                previous = *value;
                r
            })
            .collect();

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        if !std_dev.is_finite() || std_dev == 0.0 {
            return f64::NAN;
        }

        // Annualized over daily bars
        mean / std_dev * self.year_days.sqrt()
    }
}

/// Largest peak-to-trough decline, in percent of the peak.
fn max_drawdown(values: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;

    for value in values.iter().copied() {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            worst = worst.max((1.0 - value / peak) * 100.0);
        }
    }

    if values.is_empty() {
        f64::NAN
    } else {
        worst
    }
}

/// Percent of closed round-trips with positive PnL; NaN without any.
fn win_rate(trades: &[Trade]) -> f64 {
    if trades.is_empty() {
        return f64::NAN;
    }
    let winners = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();
    winners as f64 / trades.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn engine() -> BacktestEngine {
        BacktestEngine::new(dec!(100), 365.0)
    }

    fn rising(n: usize) -> PriceSeries {
        let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let bars = (0..n)
            .map(|i| {
                Bar::close_only(
                    start + chrono::Duration::days(i as i64),
                    Decimal::from(100 + i as i64),
                )
            })
            .collect();
        PriceSeries::new("TEST", bars).unwrap()
    }

    fn closes(prices: &[i64]) -> PriceSeries {
        let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let bars = prices
            .iter()
            .enumerate()
            .map(|(i, p)| Bar::close_only(start + chrono::Duration::days(i as i64), Decimal::from(*p)))
            .collect();
        PriceSeries::new("TEST", bars).unwrap()
    }

    fn signals(entries: &[bool], exits: &[bool]) -> SignalSet {
        SignalSet {
            entries: entries.to_vec(),
            exits: exits.to_vec(),
            size: SizeSpec::Scalar(1.0),
        }
    }

    #[test]
    fn test_flat_signals_hold_cash() {
        let prices = rising(10);
        let state = engine()
            .simulate(&prices, &SignalSet::flat(10), Direction::LongOnly)
            .unwrap();

        assert_eq!(state.values.len(), prices.len());
        assert_eq!(state.dates.len(), prices.len());
        assert!(state.values.iter().all(|v| *v == 100.0));
        assert_eq!(state.stats.total_return, 0.0);
        assert_eq!(state.stats.max_drawdown, 0.0);
        assert!(state.stats.sharpe_ratio.is_nan());
        assert!(state.stats.win_rate.is_nan());
        assert!(state.trades.is_empty());
    }

    #[test]
    fn test_enter_first_exit_last_tracks_price() {
        for n in [2usize, 5, 30] {
            let prices = rising(n);
            let mut entries = vec![false; n];
            let mut exits = vec![false; n];
            entries[0] = true;
            exits[n - 1] = true;

            let state = engine()
                .simulate(&prices, &signals(&entries, &exits), Direction::LongOnly)
                .unwrap();

            let first = 100.0;
            let last = (100 + n - 1) as f64;
            let expected = (last / first - 1.0) * 100.0;
            assert!((state.stats.total_return - expected).abs() < 1e-9);
            assert_eq!(state.trades.len(), 1);
            assert_eq!(state.stats.win_rate, 100.0);
            assert!(state.open_position.is_none());
        }
    }

    #[test]
    fn test_entry_and_exit_same_bar_while_flat_opens() {
        let prices = closes(&[100, 110, 120]);
        let state = engine()
            .simulate(
                &prices,
                &signals(&[true, false, false], &[true, false, false]),
                Direction::LongOnly,
            )
            .unwrap();

        assert!(state.open_position.is_some());
        assert_eq!(state.values, vec![100.0, 110.0, 120.0]);
    }

    #[test]
    fn test_exit_overrides_entry_while_open() {
        let prices = closes(&[100, 110, 120]);
        let state = engine()
            .simulate(
                &prices,
                &signals(&[true, true, false], &[false, true, false]),
                Direction::LongOnly,
            )
            .unwrap();

        assert!(state.open_position.is_none());
        assert_eq!(state.trades.len(), 1);
        assert_eq!(state.values, vec![100.0, 110.0, 110.0]);
    }

    #[test]
    fn test_open_position_not_counted_in_win_rate() {
        let prices = closes(&[100, 90, 95, 100]);
        let state = engine()
            .simulate(
                &prices,
                &signals(&[true, false, true, false], &[false, true, false, false]),
                Direction::LongOnly,
            )
            .unwrap();

        assert_eq!(state.trades.len(), 1);
        assert_eq!(state.stats.win_rate, 0.0);
        assert!(state.open_position.is_some());
    }

    #[test]
    fn test_max_drawdown_from_peak() {
        let stats = engine().statistics(&[100.0, 120.0, 90.0, 130.0], &[]);
        assert!((stats.max_drawdown - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_annualized_return_over_one_year() {
        let mut values = vec![100.0; 364];
        values.push(110.0);
        let stats = engine().statistics(&values, &[]);
        assert!((stats.annualized_return - 10.0).abs() < 1e-9);
        assert!((stats.total_return - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sharpe_defined_for_varying_returns() {
        let stats = engine().statistics(&[101.0, 100.0, 103.0, 102.0], &[]);
        assert!(stats.sharpe_ratio.is_finite());
    }

    #[test]
    fn test_signal_length_mismatch_is_simulation_failure() {
        let prices = rising(3);
        let err = engine()
            .simulate(&prices, &SignalSet::flat(2), Direction::LongOnly)
            .unwrap_err();
        assert!(matches!(err, BacktestError::Simulation(_)));
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let prices = closes(&[100, 104, 99, 107, 103, 111]);
        let s = signals(
            &[true, false, false, true, false, false],
            &[false, false, true, false, false, true],
        );
        let first = engine().simulate(&prices, &s, Direction::LongOnly).unwrap();
        let second = engine().simulate(&prices, &s, Direction::LongOnly).unwrap();
        assert_eq!(first.values, second.values);
        assert_eq!(first.trades, second.trades);
        assert_eq!(first.stats.sharpe_ratio, second.stats.sharpe_ratio);
        assert_eq!(first.stats.win_rate, 50.0);
    }
}
