use super::error::BacktestError;
use super::loader::Strategy;
use super::types::{PriceSeries, RawSignals, SignalSet, SizeSpec};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TradeAction {
    Buy { size: f64 },
    Close,
    None,
}

/// Runs `strategy` against `prices` and validates what comes back.
pub async fn apply_strategy(
    strategy: &dyn Strategy,
    prices: &PriceSeries,
) -> Result<SignalSet, BacktestError> {
    let raw = strategy.run(prices).await?;
    let signals = SignalProcessor::validate(raw, prices.len())?;

    tracing::info!(
        "Strategy {} produced {} entries and {} exits over {} bars",
        strategy.name(),
        signals.entries.iter().filter(|e| **e).count(),
        signals.exits.iter().filter(|e| **e).count(),
        prices.len()
    );

    Ok(signals)
}

/// Turns validated per-bar signals into trade actions.
pub struct SignalProcessor {
    signals: SignalSet,
}

impl SignalProcessor {
    pub fn new(signals: SignalSet) -> Self {
        Self { signals }
    }

    /// Checks shape against the price series and fills in the default size of 1.
    pub fn validate(raw: RawSignals, bars: usize) -> Result<SignalSet, BacktestError> {
        let (entries, exits) = match (raw.entries, raw.exits) {
            (Some(entries), Some(exits)) => (entries, exits),
            _ => {
                return Err(BacktestError::MalformedOutput(
                    "Strategy output missing 'entries' or 'exits'".to_string(),
                ))
            }
        };

        for (name, len) in [("entries", entries.len()), ("exits", exits.len())] {
            if len != bars {
                return Err(BacktestError::MalformedOutput(format!(
                    "'{}' has {} values but the price series has {} bars",
                    name, len, bars
                )));
            }
        }

        let size = match raw.size {
            None => SizeSpec::Scalar(1.0),
            Some(SizeSpec::PerBar(sizes)) if sizes.len() != bars => {
                return Err(BacktestError::MalformedOutput(format!(
                    "'size' has {} values but the price series has {} bars",
                    sizes.len(),
                    bars
                )))
            }
            Some(size) => size,
        };

        Ok(SignalSet {
            entries,
            exits,
            size,
        })
    }

    /// Action for bar `idx` given whether a position is open at the start of it.
    /// An open position only listens to exits; a flat book only listens to entries.
    pub fn evaluate(&self, idx: usize, in_position: bool) -> TradeAction {
        if in_position {
            if self.signals.exits.get(idx).copied().unwrap_or(false) {
                return TradeAction::Close;
            }
        } else if self.signals.entries.get(idx).copied().unwrap_or(false) {
            return match self.signals.size_at(idx) {
                Some(size) if size > 0.0 => TradeAction::Buy { size },
                _ => {
                    tracing::debug!("Ignoring entry at bar {} with unusable size", idx);
                    TradeAction::None
                }
            };
        }
        TradeAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::types::Bar;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    struct Fixed(RawSignals);

    #[async_trait]
    impl Strategy for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn run(&self, _prices: &PriceSeries) -> Result<RawSignals, BacktestError> {
            Ok(self.0.clone())
        }
    }

    fn series(n: usize) -> PriceSeries {
        let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let bars = (0..n)
            .map(|i| Bar::close_only(start + chrono::Duration::days(i as i64), dec!(10)))
            .collect();
        PriceSeries::new("TEST", bars).unwrap()
    }

    #[tokio::test]
    async fn test_size_defaults_to_one() {
        let strategy = Fixed(RawSignals {
            entries: Some(vec![true, false]),
            exits: Some(vec![false, true]),
            size: None,
        });
        let signals = apply_strategy(&strategy, &series(2)).await.unwrap();
        assert_eq!(signals.size, SizeSpec::Scalar(1.0));
    }

    #[tokio::test]
    async fn test_missing_exits_is_malformed() {
        let strategy = Fixed(RawSignals {
            entries: Some(vec![true, false]),
            exits: None,
            size: None,
        });
        let err = apply_strategy(&strategy, &series(2)).await.unwrap_err();
        assert!(matches!(err, BacktestError::MalformedOutput(_)));
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let raw = RawSignals {
            entries: Some(vec![true]),
            exits: Some(vec![false, false]),
            size: None,
        };
        assert!(matches!(
            SignalProcessor::validate(raw, 2),
            Err(BacktestError::MalformedOutput(_))
        ));

        let raw = RawSignals {
            entries: Some(vec![true, false]),
            exits: Some(vec![false, false]),
            size: Some(SizeSpec::PerBar(vec![Some(1.0)])),
        };
        assert!(SignalProcessor::validate(raw, 2).is_err());
    }

    #[test]
    fn test_exit_only_matters_when_open() {
        let processor = SignalProcessor::new(SignalSet {
            entries: vec![true, true],
            exits: vec![true, true],
            size: SizeSpec::Scalar(3.0),
        });

        assert_eq!(processor.evaluate(0, false), TradeAction::Buy { size: 3.0 });
        assert_eq!(processor.evaluate(1, true), TradeAction::Close);
    }

    #[test]
    fn test_non_positive_size_does_not_buy() {
        let processor = SignalProcessor::new(SignalSet {
            entries: vec![true, true],
            exits: vec![false, false],
            size: SizeSpec::PerBar(vec![Some(0.0), None]),
        });
        assert_eq!(processor.evaluate(0, false), TradeAction::None);
        assert_eq!(processor.evaluate(1, false), TradeAction::None);
    }
}
