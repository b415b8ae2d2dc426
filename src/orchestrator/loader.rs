use super::error::BacktestError;
use super::types::{PriceSeries, RawSignals};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Which entry point a strategy file must expose, and what it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyContract {
    /// `run_strategy(prices) -> {entries, exits, size?}`
    Stock,
    /// `generate_signals(prices) -> (entries, exits)`
    Options,
}

impl StrategyContract {
    pub fn entry_point(&self) -> &'static str {
        match self {
            StrategyContract::Stock => "run_strategy",
            StrategyContract::Options => "generate_signals",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyContract::Stock => "stock",
            StrategyContract::Options => "options",
        }
    }
}

/// A loaded strategy whose entry point has already been validated.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the entry point against `prices`. Implementations must not be able
    /// to mutate the caller's series.
    async fn run(&self, prices: &PriceSeries) -> Result<RawSignals, BacktestError>;
}

#[async_trait]
pub trait StrategyLoader: Send + Sync {
    /// Resolves `file`, executes it fresh and checks the contract's entry point.
    async fn load(
        &self,
        file: &str,
        contract: StrategyContract,
    ) -> Result<Box<dyn Strategy>, BacktestError>;
}

#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Joins a client-supplied relative name onto the strategies directory.
/// Absolute paths and `..` components are refused.
pub fn resolve_strategy_path(dir: &Path, file: &str) -> Result<PathBuf, BacktestError> {
    let relative = Path::new(file);
    if file.trim().is_empty() {
        return Err(BacktestError::InvalidRequest(
            "strategy_file must not be empty".to_string(),
        ));
    }

    let only_normal = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !only_normal {
        return Err(BacktestError::InvalidRequest(format!(
            "strategy_file must be a relative path inside the strategies directory: {}",
            file
        )));
    }

    Ok(dir.join(relative))
}

/// Waits until `path` holds a complete file, returning early on `stored`.
///
/// A file is complete once it is non-empty and either unchanged in length
/// since the previous check or last modified at least one poll interval ago.
pub async fn wait_for_strategy_file(
    path: &Path,
    display_name: &str,
    policy: WaitPolicy,
    stored: Option<&Notify>,
) -> Result<(), BacktestError> {
    let deadline = Instant::now() + policy.timeout;
    let mut last_len: Option<u64> = None;

    loop {
        let notified = stored.map(|n| n.notified());

        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.is_file() && meta.len() > 0 {
                let settled = meta
                    .modified()
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .map(|age| age >= policy.poll_interval)
                    .unwrap_or(false);

                if settled || last_len == Some(meta.len()) {
                    return Ok(());
                }
                last_len = Some(meta.len());
            } else {
                last_len = None;
            }
        } else {
            last_len = None;
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::warn!(
                "Strategy file {} did not appear within {:?}",
                display_name,
                policy.timeout
            );
            return Err(BacktestError::NotFound(display_name.to_string()));
        }

        let nap = policy.poll_interval.min(deadline - now);
        match notified {
            Some(notified) => {
                tokio::select! {
                    _ = tokio::time::sleep(nap) => {}
                    _ = notified => {
                        tracing::debug!("Woken by strategy store while waiting for {}", display_name);
                    }
                }
            }
            None => tokio::time::sleep(nap).await,
        }
    }
}

/// Writes strategy sources into the strategies directory and signals waiters.
#[derive(Clone)]
pub struct StrategyStore {
    dir: PathBuf,
    stored: Arc<Notify>,
}

impl StrategyStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            stored: Arc::new(Notify::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.stored.clone()
    }

    /// Stores `source` under `name` via temp file + rename, so readers never
    /// observe a partially written strategy.
    pub async fn store(&self, name: &str, source: String) -> Result<(), BacktestError> {
        let path = resolve_strategy_path(&self.dir, name)?;
        if source.trim().is_empty() {
            return Err(BacktestError::InvalidRequest(
                "strategy source must not be empty".to_string(),
            ));
        }

        let display_name = name.to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(source.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| BacktestError::LoadFailure {
            path: display_name.clone(),
            reason: format!("store task failed: {}", e),
        })?
        .map_err(|e| BacktestError::LoadFailure {
            path: display_name.clone(),
            reason: format!("failed to store strategy: {}", e),
        })?;

        tracing::info!("Stored strategy {}", display_name);
        self.stored.notify_waiters();
        Ok(())
    }
}
