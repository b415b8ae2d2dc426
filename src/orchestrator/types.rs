use super::error::BacktestError;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Decimal,
    pub volume: Option<i64>,
}

impl Bar {
    /// Bar with only a close price, the shape option data usually has.
    pub fn close_only(date: NaiveDate, close: Decimal) -> Self {
        Self {
            date,
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
        }
    }
}

/// Daily bars for one symbol, ascending by date with no duplicate dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    bars: Vec<Bar>,
}

impl PriceSeries {
    /// Builds a series from bars that are already in order.
    pub fn new(symbol: impl Into<String>, bars: Vec<Bar>) -> Result<Self, BacktestError> {
        let symbol = symbol.into();
        if bars.is_empty() {
            return Err(BacktestError::NoData { symbol });
        }

        let mut previous: Option<NaiveDate> = None;
        for bar in &bars {
            if let Some(prev) = previous {
                if bar.date <= prev {
                    return Err(BacktestError::Fetch(format!(
                        "Bars for {} are not strictly increasing at {}",
                        symbol, bar.date
                    )));
                }
            }
            previous = Some(bar.date);
        }

        Ok(Self { symbol, bars })
    }

    /// Sorts provider output by date. When a date repeats, the later bar wins.
    pub fn from_unsorted(
        symbol: impl Into<String>,
        mut bars: Vec<Bar>,
    ) -> Result<Self, BacktestError> {
        let symbol = symbol.into();
        bars.sort_by_key(|b| b.date);

        let mut deduped: Vec<Bar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.date == bar.date => {
                    tracing::warn!("Duplicate bar for {} on {}, keeping the later one", symbol, bar.date);
                    *last = bar;
                }
                _ => deduped.push(bar),
            }
        }

        Self::new(symbol, deduped)
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.bars.iter().map(|b| b.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub symbol: String,
    #[serde(rename = "type")]
    pub option_type: OptionType,
    pub strike_price: Decimal,
    pub expiration_date: NaiveDate,
    pub tradable: bool,
}

/// Signals exactly as a strategy returned them, before shape validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawSignals {
    pub entries: Option<Vec<bool>>,
    pub exits: Option<Vec<bool>>,
    pub size: Option<SizeSpec>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Scalar(f64),
    PerBar(Vec<Option<f64>>),
}

/// Validated signals, index-aligned with the price series they were built for.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSet {
    pub entries: Vec<bool>,
    pub exits: Vec<bool>,
    pub size: SizeSpec,
}

impl SignalSet {
    /// Signals that never trade.
    pub fn flat(len: usize) -> Self {
        Self {
            entries: vec![false; len],
            exits: vec![false; len],
            size: SizeSpec::Scalar(1.0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Order size requested at bar `idx`; `None` when the strategy gave no usable size.
    pub fn size_at(&self, idx: usize) -> Option<f64> {
        let size = match &self.size {
            SizeSpec::Scalar(size) => Some(*size),
            SizeSpec::PerBar(sizes) => sizes.get(idx).copied().flatten(),
        };
        size.filter(|s| s.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    #[serde(rename = "longonly")]
    LongOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub entry_date: NaiveDate,
    pub entry_price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: Decimal,
    pub position: Option<Position>,
    pub initial_cash: Decimal,
}

impl Portfolio {
    pub fn new(initial_cash: Decimal) -> Self {
        Self {
            cash: initial_cash,
            position: None,
            initial_cash,
        }
    }

    pub fn value_at(&self, close: Decimal) -> Decimal {
        match &self.position {
            Some(position) => self.cash + position.size * close,
            None => self.cash,
        }
    }
}

/// Summary statistics. Undefined values are NaN here and become null on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationStats {
    pub total_return: f64,
    pub annualized_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationState {
    pub dates: Vec<NaiveDate>,
    pub values: Vec<f64>,
    pub trades: Vec<Trade>,
    pub open_position: Option<Position>,
    pub stats: SimulationStats,
}
