use super::error::BacktestError;
use super::types::{Bar, OptionContract, OptionType, PriceSeries};
use crate::config::AlpacaConfig;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const BARS_PAGE_LIMIT: &str = "10000";
const CONTRACTS_PAGE_LIMIT: &str = "100";
const MAX_PAGES: usize = 100;

/// Source of historical daily bars and option chains.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_price_series(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceSeries, BacktestError>;

    /// Contracts for `underlying` expiring on or before `expiring_by`, in provider order.
    async fn fetch_option_contracts(
        &self,
        underlying: &str,
        expiring_by: NaiveDate,
    ) -> Result<Vec<OptionContract>, BacktestError>;

    async fn fetch_option_price_series(
        &self,
        contract_symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceSeries, BacktestError>;
}

/// The first tradable call in provider order. Deliberately simple; callers
/// rely on this exact rule.
/// Tickers and OCC option symbols are plain ASCII letters, digits and dots;
/// anything else would alter the request path or query.
pub fn validate_symbol(symbol: &str) -> Result<&str, BacktestError> {
    let valid = !symbol.is_empty()
        && symbol.len() <= 32
        && symbol.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.');
    if valid {
        Ok(symbol)
    } else {
        Err(BacktestError::InvalidRequest(format!(
            "invalid symbol {:?}: only letters, digits and '.' are allowed",
            symbol
        )))
    }
}

pub fn select_option_contract(contracts: &[OptionContract]) -> Option<&OptionContract> {
    contracts
        .iter()
        .find(|c| c.tradable && c.option_type == OptionType::Call)
}

#[derive(Debug, Deserialize)]
struct BarResponse {
    t: DateTime<Utc>,
    o: Option<f64>,
    h: Option<f64>,
    l: Option<f64>,
    c: f64,
    v: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StockBarsPage {
    bars: Option<Vec<BarResponse>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OptionBarsPage {
    bars: Option<HashMap<String, Vec<BarResponse>>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContractResponse {
    symbol: String,
    #[serde(rename = "type")]
    option_type: String,
    strike_price: Decimal,
    expiration_date: NaiveDate,
    #[serde(default)]
    tradable: bool,
}

#[derive(Debug, Deserialize)]
struct ContractsPage {
    option_contracts: Option<Vec<ContractResponse>>,
    next_page_token: Option<String>,
}

// TRUST BOUNDARY:
// Mechanical validation and type conversion of provider JSON into Bar.
// Non-finite prices are rejected rather than carried into the simulation.
fn convert_bar(raw: BarResponse) -> Result<Bar, BacktestError> {
    fn price(value: f64, field: &str) -> Result<Decimal, BacktestError> {
        Decimal::from_f64(value)
            .ok_or_else(|| BacktestError::Fetch(format!("Invalid {} price: {}", field, value)))
    }
    fn optional_price(value: Option<f64>, field: &str) -> Result<Option<Decimal>, BacktestError> {
        value.map(|v| price(v, field)).transpose()
    }

    Ok(Bar {
        date: raw.t.date_naive(),
        open: optional_price(raw.o, "open")?,
        high: optional_price(raw.h, "high")?,
        low: optional_price(raw.l, "low")?,
        close: price(raw.c, "close")?,
        volume: raw.v.filter(|v| v.is_finite()).map(|v| v.round() as i64),
    })
}

fn convert_contract(raw: ContractResponse) -> Option<OptionContract> {
    let option_type = match raw.option_type.to_ascii_lowercase().as_str() {
        "call" => OptionType::Call,
        "put" => OptionType::Put,
        other => {
            tracing::warn!("Skipping contract {} with unknown type '{}'", raw.symbol, other);
            return None;
        }
    };

    Some(OptionContract {
        symbol: raw.symbol,
        option_type,
        strike_price: raw.strike_price,
        expiration_date: raw.expiration_date,
        tradable: raw.tradable,
    })
}

pub struct AlpacaProvider {
    http: reqwest::Client,
    data_url: String,
    trading_url: String,
    headers: HeaderMap,
}

impl AlpacaProvider {
    pub fn new(config: &AlpacaConfig) -> Result<Self, BacktestError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BacktestError::Fetch(format!("Failed to build HTTP client: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            HeaderValue::from_str(&config.api_key_id)
                .map_err(|_| BacktestError::Fetch("Invalid Alpaca API key id".to_string()))?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            HeaderValue::from_str(&config.api_secret_key)
                .map_err(|_| BacktestError::Fetch("Invalid Alpaca API secret".to_string()))?,
        );

        Ok(Self {
            http,
            data_url: config.data_url.trim_end_matches('/').to_string(),
            trading_url: config.trading_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, BacktestError> {
        let url = format!("{}{}", base_url, path);
        tracing::debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .headers(self.headers.clone())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BacktestError::Fetch(format!(
                "Alpaca returned {} for {}",
                status, path
            )));
        }

        response.json::<T>().await.map_err(|e| {
            BacktestError::Fetch(format!(
                "Failed to parse Alpaca response for {}: {}",
                path,
                e.without_url()
            ))
        })
    }
}

#[async_trait]
impl MarketDataProvider for AlpacaProvider {
    async fn fetch_price_series(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceSeries, BacktestError> {
        let symbol = validate_symbol(symbol)?;
        tracing::info!("Fetching daily bars for {} from {} to {}", symbol, start, end);

        let path = format!("/v2/stocks/{}/bars", symbol);
        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("timeframe", "1Day".to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("limit", BARS_PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("page_token", token));
            }

            let page: StockBarsPage = self.get(&self.data_url, &path, &query).await?;
            for raw in page.bars.unwrap_or_default() {
                bars.push(convert_bar(raw)?);
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::info!("Fetched {} bars for {}", bars.len(), symbol);
        PriceSeries::from_unsorted(symbol, bars)
    }

    async fn fetch_option_contracts(
        &self,
        underlying: &str,
        expiring_by: NaiveDate,
    ) -> Result<Vec<OptionContract>, BacktestError> {
        let underlying = validate_symbol(underlying)?;
        tracing::info!(
            "Listing option contracts for {} expiring by {}",
            underlying,
            expiring_by
        );

        let mut contracts = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("underlying_symbols", underlying.to_string()),
                ("expiration_date_lte", expiring_by.to_string()),
                ("limit", CONTRACTS_PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("page_token", token));
            }

            let page: ContractsPage = self
                .get(&self.trading_url, "/v2/options/contracts", &query)
                .await?;
            contracts.extend(
                page.option_contracts
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(convert_contract),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::info!("Found {} option contracts for {}", contracts.len(), underlying);
        Ok(contracts)
    }

    async fn fetch_option_price_series(
        &self,
        contract_symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceSeries, BacktestError> {
        let contract_symbol = validate_symbol(contract_symbol)?;
        tracing::info!(
            "Fetching option bars for {} from {} to {}",
            contract_symbol,
            start,
            end
        );

        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query = vec![
                ("symbols", contract_symbol.to_string()),
                ("timeframe", "1Day".to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("limit", BARS_PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("page_token", token));
            }

            let page: OptionBarsPage = self
                .get(&self.data_url, "/v1beta1/options/bars", &query)
                .await?;
            let contract_bars = page
                .bars
                .and_then(|mut by_symbol| by_symbol.remove(contract_symbol))
                .unwrap_or_default();
            for raw in contract_bars {
                bars.push(convert_bar(raw)?);
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        tracing::info!("Fetched {} option bars for {}", bars.len(), contract_symbol);
        PriceSeries::from_unsorted(contract_symbol, bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn contract(symbol: &str, option_type: OptionType, tradable: bool) -> OptionContract {
        OptionContract {
            symbol: symbol.to_string(),
            option_type,
            strike_price: dec!(100),
            expiration_date: NaiveDate::from_ymd_opt(2024, 12, 20).unwrap(),
            tradable,
        }
    }

    #[test]
    fn test_select_first_tradable_call() {
        let contracts = vec![
            contract("PUT1", OptionType::Put, true),
            contract("CALL_HALTED", OptionType::Call, false),
            contract("CALL1", OptionType::Call, true),
            contract("CALL2", OptionType::Call, true),
        ];
        let selected = select_option_contract(&contracts).unwrap();
        assert_eq!(selected.symbol, "CALL1");
    }

    #[test]
    fn test_select_none_without_tradable_call() {
        let contracts = vec![
            contract("PUT1", OptionType::Put, true),
            contract("CALL_HALTED", OptionType::Call, false),
        ];
        assert!(select_option_contract(&contracts).is_none());
    }

    #[test]
    fn test_stock_page_converts_to_series() {
        let body = r#"{
            "bars": [
                {"t": "2024-02-02T05:00:00Z", "o": 179.86, "h": 187.33, "l": 179.25, "c": 185.85, "v": 102518000},
                {"t": "2024-02-01T05:00:00Z", "o": 183.99, "h": 186.95, "l": 183.82, "c": 186.86, "v": 64885000}
            ],
            "symbol": "AAPL",
            "next_page_token": null
        }"#;
        let page: StockBarsPage = serde_json::from_str(body).unwrap();
        let bars = page
            .bars
            .unwrap()
            .into_iter()
            .map(convert_bar)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let series = PriceSeries::from_unsorted("AAPL", bars).unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(
            series.bars()[0].date,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
        );
        assert_eq!(series.bars()[0].close, dec!(186.86));
        assert_eq!(series.bars()[1].volume, Some(102518000));
    }

    #[test]
    fn test_empty_page_is_no_data() {
        let page: StockBarsPage =
            serde_json::from_str(r#"{"bars": null, "symbol": "AAPL", "next_page_token": null}"#)
                .unwrap();
        assert!(page.bars.is_none());
        let err = PriceSeries::from_unsorted("AAPL", Vec::new()).unwrap_err();
        assert!(matches!(err, BacktestError::NoData { .. }));
    }

    #[test]
    fn test_option_bars_may_lack_ohlv() {
        let body = r#"{"bars": {"AAPL241220C00100000": [{"t": "2024-06-03T04:00:00Z", "c": 92.5}]}, "next_page_token": null}"#;
        let page: OptionBarsPage = serde_json::from_str(body).unwrap();
        let raw = page
            .bars
            .unwrap()
            .remove("AAPL241220C00100000")
            .unwrap()
            .remove(0);
        let bar = convert_bar(raw).unwrap();
        assert_eq!(bar.close, dec!(92.5));
        assert!(bar.open.is_none());
        assert!(bar.volume.is_none());
    }

    #[test]
    fn test_contract_strike_parses_from_string() {
        let body = r#"{"option_contracts": [
            {"symbol": "AAPL241220C00100000", "type": "call", "strike_price": "100",
             "expiration_date": "2024-12-20", "tradable": true, "status": "active"},
            {"symbol": "AAPL241220X00100000", "type": "exotic", "strike_price": "100",
             "expiration_date": "2024-12-20", "tradable": true}
        ], "next_page_token": null}"#;
        let page: ContractsPage = serde_json::from_str(body).unwrap();
        let contracts: Vec<OptionContract> = page
            .option_contracts
            .unwrap()
            .into_iter()
            .filter_map(convert_contract)
            .collect();
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].strike_price, dec!(100));
        assert_eq!(contracts[0].option_type, OptionType::Call);
    }

    #[test]
    fn test_provider_builds_with_empty_credentials() {
        let config = crate::config::Config::default().alpaca;
        assert!(AlpacaProvider::new(&config).is_ok());
    }

    #[test]
    fn test_symbol_validation() {
        assert_eq!(validate_symbol("AAPL").unwrap(), "AAPL");
        assert!(validate_symbol("BRK.B").is_ok());
        assert!(validate_symbol("AAPL241220C00150000").is_ok());
        for bad in ["", "../v2/account", "AAPL/bars", "AAPL?limit=1", "AA PL", "ÄPL"] {
            assert!(
                matches!(validate_symbol(bad), Err(BacktestError::InvalidRequest(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_unsafe_symbol_rejected_before_request() {
        let mut config = crate::config::Config::default().alpaca;
        config.data_url = "http://127.0.0.1:9".to_string();
        config.trading_url = "http://127.0.0.1:9".to_string();
        let provider = AlpacaProvider::new(&config).unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let err = provider
            .fetch_price_series("../../v2/account", start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, BacktestError::InvalidRequest(_)));

        let err = provider
            .fetch_option_price_series("X&symbols=Y", start, end)
            .await
            .unwrap_err();
        assert!(matches!(err, BacktestError::InvalidRequest(_)));
    }
}
