use anyhow::Context;
use std::sync::Arc;
use strategy_runner::config::Config;
use strategy_runner::orchestrator::{
    AlpacaProvider, BacktestEngine, PythonStrategyLoader, StrategyRunner, StrategyStore,
};
use strategy_runner::{build_router, AppState};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strategy_runner=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting strategy runner...");

    let config = Config::load().context("failed to load configuration")?;
    let strategy_dir = config
        .resolve_strategy_dir()
        .with_context(|| format!("failed to resolve strategy dir {}", config.strategy.dir.display()))?;
    info!("Strategies directory: {}", strategy_dir.display());

    if config.alpaca.api_key_id.is_empty() || config.alpaca.api_secret_key.is_empty() {
        warn!("Alpaca credentials are not set; market data requests will be rejected");
    }

    let expiration_limit = config
        .alpaca
        .expiration_date_lte
        .as_deref()
        .map(|value| strategy_runner::orchestrator::runner::parse_date("expiration_date_lte", value))
        .transpose()
        .context("invalid alpaca.expiration_date_lte")?;

    let market_data = AlpacaProvider::new(&config.alpaca).context("failed to build Alpaca client")?;
    let store = StrategyStore::new(strategy_dir.clone());
    let loader = PythonStrategyLoader::new(strategy_dir, &config.strategy, Some(store.notifier()));
    let engine = BacktestEngine::from_config(&config.backtest).context("invalid backtest config")?;

    let runner = StrategyRunner::new(Arc::new(market_data), Arc::new(loader), engine)
        .with_expiration_limit(expiration_limit);

    let state = AppState {
        runner: Arc::new(runner),
        store,
        defaults: Arc::new(config.defaults.clone()),
    };

    let app = build_router(state, &config.server.allowed_origins);

    let addr = format!("0.0.0.0:{}", config.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
