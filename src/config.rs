use config::{Config as ConfigBuilder, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub alpaca: AlpacaConfig,
    pub strategy: StrategyConfig,
    pub backtest: BacktestConfig,
    pub defaults: RunDefaults,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub allowed_origins: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AlpacaConfig {
    pub data_url: String,
    pub trading_url: String,
    pub api_key_id: String,
    pub api_secret_key: String,
    pub request_timeout_secs: u64,
    /// Upper bound for contract expirations when listing options.
    /// Falls back to the request's end date when unset.
    pub expiration_date_lte: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StrategyConfig {
    pub dir: PathBuf,
    pub python_bin: String,
    pub wait_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub exec_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BacktestConfig {
    pub initial_cash: f64,
    pub year_days: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunDefaults {
    pub strategy_file: String,
    pub options_strategy_file: String,
    pub symbol: String,
    pub start: String,
    pub end: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("server.port", 5001)?
            .set_default("server.allowed_origins", "http://localhost:3000")?
            .set_default("alpaca.data_url", "https://data.alpaca.markets")?
            .set_default("alpaca.trading_url", "https://paper-api.alpaca.markets")?
            .set_default("alpaca.api_key_id", "")?
            .set_default("alpaca.api_secret_key", "")?
            .set_default("alpaca.request_timeout_secs", 30)?
            .set_default("strategy.dir", "generated_strategies")?
            .set_default("strategy.python_bin", "python3")?
            .set_default("strategy.wait_timeout_ms", 5000)?
            .set_default("strategy.poll_interval_ms", 100)?
            .set_default("strategy.exec_timeout_secs", 60)?
            .set_default("backtest.initial_cash", 100.0)?
            .set_default("backtest.year_days", 365.0)?
            .set_default("defaults.strategy_file", "run_strategy.py")?
            .set_default("defaults.options_strategy_file", "options_strategy.py")?
            .set_default("defaults.symbol", "AAPL")?
            .set_default("defaults.start", "2024-02-01")?
            .set_default("defaults.end", "2025-02-01")?
            .add_source(File::with_name("config/default").required(false));

        // Add environment-specific config if specified
        if let Ok(env) = env::var("RUN_ENV") {
            builder =
                builder.add_source(File::with_name(&format!("config/{}", env)).required(false));
        }

        // Alpaca credentials from environment
        if let Ok(key_id) = env::var("APCA_API_KEY_ID") {
            builder = builder.set_override("alpaca.api_key_id", key_id)?;
        }
        if let Ok(secret) = env::var("APCA_API_SECRET_KEY") {
            builder = builder.set_override("alpaca.api_secret_key", secret)?;
        }

        if let Ok(dir) = env::var("STRATEGY_DIR") {
            builder = builder.set_override("strategy.dir", dir)?;
        }
        if let Ok(python) = env::var("PYTHON_BIN") {
            builder = builder.set_override("strategy.python_bin", python)?;
        }
        if let Ok(port) = env::var("PORT") {
            builder = builder.set_override("server.port", port)?;
        }
        if let Ok(origins) = env::var("ALLOWED_ORIGINS") {
            builder = builder.set_override("server.allowed_origins", origins)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Resolves the strategies directory to an absolute, canonical path.
    /// Creates it when missing so that uploads have somewhere to land.
    pub fn resolve_strategy_dir(&self) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.strategy.dir)?;
        self.strategy.dir.canonicalize()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 5001,
                allowed_origins: "http://localhost:3000".to_string(),
            },
            alpaca: AlpacaConfig {
                data_url: "https://data.alpaca.markets".to_string(),
                trading_url: "https://paper-api.alpaca.markets".to_string(),
                api_key_id: String::new(),
                api_secret_key: String::new(),
                request_timeout_secs: 30,
                expiration_date_lte: None,
            },
            strategy: StrategyConfig {
                dir: PathBuf::from("generated_strategies"),
                python_bin: "python3".to_string(),
                wait_timeout_ms: 5000,
                poll_interval_ms: 100,
                exec_timeout_secs: 60,
            },
            backtest: BacktestConfig {
                initial_cash: 100.0,
                year_days: 365.0,
            },
            defaults: RunDefaults {
                strategy_file: "run_strategy.py".to_string(),
                options_strategy_file: "options_strategy.py".to_string(),
                symbol: "AAPL".to_string(),
                start: "2024-02-01".to_string(),
                end: "2025-02-01".to_string(),
            },
        }
    }
}
