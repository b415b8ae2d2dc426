use super::error::BacktestError;
use super::loader::{
    resolve_strategy_path, wait_for_strategy_file, Strategy, StrategyContract, StrategyLoader,
    WaitPolicy,
};
use super::types::{PriceSeries, RawSignals};
use crate::config::StrategyConfig;
use async_trait::async_trait;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Notify;

const HARNESS: &str = include_str!("harness.py");

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum HarnessMode {
    Probe,
    Run,
}

#[derive(Debug, Serialize)]
struct HarnessRequest<'a> {
    mode: HarnessMode,
    contract: &'static str,
    entry_point: &'static str,
    filename: &'a str,
    source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prices: Option<PriceColumns>,
}

/// Column-oriented copy of a price series, the shape the harness turns into a DataFrame.
#[derive(Debug, Serialize)]
struct PriceColumns {
    date: Vec<String>,
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<f64>,
    volume: Vec<Option<i64>>,
}

impl From<&PriceSeries> for PriceColumns {
    fn from(series: &PriceSeries) -> Self {
        let bars = series.bars();
        Self {
            date: bars.iter().map(|b| b.date.format("%Y-%m-%d").to_string()).collect(),
            open: bars.iter().map(|b| b.open.and_then(|v| v.to_f64())).collect(),
            high: bars.iter().map(|b| b.high.and_then(|v| v.to_f64())).collect(),
            low: bars.iter().map(|b| b.low.and_then(|v| v.to_f64())).collect(),
            close: bars.iter().map(|b| b.close.to_f64().unwrap_or(f64::NAN)).collect(),
            volume: bars.iter().map(|b| b.volume).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HarnessErrorKind {
    LoadFailure,
    MissingEntryPoint,
    StrategyError,
    MalformedOutput,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum HarnessReply {
    Ok {
        signals: Option<RawSignals>,
    },
    Error {
        kind: HarnessErrorKind,
        message: String,
    },
}

/// Settings shared by every Python strategy process.
#[derive(Debug, Clone)]
struct Interpreter {
    python_bin: String,
    workdir: PathBuf,
    exec_timeout: Duration,
}

impl Interpreter {
    async fn execute(&self, request: &HarnessRequest<'_>) -> Result<HarnessReply, String> {
        let input_json = serde_json::to_string(request)
            .map_err(|e| format!("Failed to serialize harness input: {}", e))?;

        // -I keeps the strategies dir and PYTHON* env vars off the import path
        // while the harness loads its own modules.
        let mut child = Command::new(&self.python_bin)
            .arg("-I")
            .arg("-B")
            .arg("-c")
            .arg(HARNESS)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn {}: {}", self.python_bin, e))?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A broken pipe here means the interpreter died early; its exit
                // status and stderr below say why.
                if let Err(e) = stdin.write_all(input_json.as_bytes()).await {
                    tracing::warn!("Failed to write to Python stdin: {}", e);
                }
            }
        };

        let (_, output) = tokio::time::timeout(
            self.exec_timeout,
            async move { tokio::join!(feed, child.wait_with_output()) },
        )
        .await
        .map_err(|_| format!("timed out after {:?}", self.exec_timeout))?;
        let output = output.map_err(|e| format!("Failed to wait for Python process: {}", e))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines() {
            tracing::debug!(target: "strategy_runner::strategy_output", "{}", line);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply_line = stdout.lines().rev().find(|l| !l.trim().is_empty());

        match reply_line {
            Some(line) => serde_json::from_str::<HarnessReply>(line)
                .map_err(|e| format!("Failed to parse harness reply: {}", e)),
            None => {
                let last_err = stderr
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no output");
                Err(format!(
                    "Python process exited with {} without a reply: {}",
                    output.status, last_err
                ))
            }
        }
    }
}

/// A strategy module snapshot. Each run executes this exact source in a new interpreter.
pub struct PythonStrategy {
    name: String,
    source: String,
    contract: StrategyContract,
    interpreter: Interpreter,
}

impl PythonStrategy {
    fn map_reply_error(&self, kind: HarnessErrorKind, message: String) -> BacktestError {
        match kind {
            HarnessErrorKind::LoadFailure => BacktestError::LoadFailure {
                path: self.name.clone(),
                reason: message,
            },
            HarnessErrorKind::MissingEntryPoint => BacktestError::MissingEntryPoint {
                path: self.name.clone(),
                entry_point: self.contract.entry_point().to_string(),
            },
            HarnessErrorKind::StrategyError => BacktestError::StrategyFailure(message),
            HarnessErrorKind::MalformedOutput => BacktestError::MalformedOutput(message),
        }
    }

    async fn probe(&self) -> Result<(), BacktestError> {
        let request = HarnessRequest {
            mode: HarnessMode::Probe,
            contract: self.contract.as_str(),
            entry_point: self.contract.entry_point(),
            filename: &self.name,
            source: &self.source,
            prices: None,
        };

        match self.interpreter.execute(&request).await {
            Ok(HarnessReply::Ok { .. }) => Ok(()),
            Ok(HarnessReply::Error { kind, message }) => Err(self.map_reply_error(kind, message)),
            Err(reason) => Err(BacktestError::LoadFailure {
                path: self.name.clone(),
                reason,
            }),
        }
    }
}

#[async_trait]
impl Strategy for PythonStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, prices: &PriceSeries) -> Result<RawSignals, BacktestError> {
        tracing::info!(
            "Executing Python strategy {} for {} bars",
            self.name,
            prices.len()
        );

        let request = HarnessRequest {
            mode: HarnessMode::Run,
            contract: self.contract.as_str(),
            entry_point: self.contract.entry_point(),
            filename: &self.name,
            source: &self.source,
            prices: Some(PriceColumns::from(prices)),
        };

        match self.interpreter.execute(&request).await {
            Ok(HarnessReply::Ok {
                signals: Some(signals),
            }) => Ok(signals),
            Ok(HarnessReply::Ok { signals: None }) => Err(BacktestError::MalformedOutput(
                "strategy produced no signals".to_string(),
            )),
            Ok(HarnessReply::Error { kind, message }) => Err(self.map_reply_error(kind, message)),
            Err(reason) => Err(BacktestError::StrategyFailure(reason)),
        }
    }
}

/// Loads strategy files from the configured directory into Python subprocesses.
pub struct PythonStrategyLoader {
    dir: PathBuf,
    wait: WaitPolicy,
    stored: Option<Arc<Notify>>,
    python_bin: String,
    exec_timeout: Duration,
}

impl PythonStrategyLoader {
    pub fn new(dir: PathBuf, config: &StrategyConfig, stored: Option<Arc<Notify>>) -> Self {
        Self {
            dir,
            wait: WaitPolicy {
                timeout: Duration::from_millis(config.wait_timeout_ms),
                poll_interval: Duration::from_millis(config.poll_interval_ms),
            },
            stored,
            python_bin: config.python_bin.clone(),
            exec_timeout: Duration::from_secs(config.exec_timeout_secs),
        }
    }
}

#[async_trait]
impl StrategyLoader for PythonStrategyLoader {
    async fn load(
        &self,
        file: &str,
        contract: StrategyContract,
    ) -> Result<Box<dyn Strategy>, BacktestError> {
        let path = resolve_strategy_path(&self.dir, file)?;
        wait_for_strategy_file(&path, file, self.wait, self.stored.as_deref()).await?;

        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BacktestError::LoadFailure {
                path: file.to_string(),
                reason: e.to_string(),
            })?;

        let workdir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.dir.clone());

        let strategy = PythonStrategy {
            name: file.to_string(),
            source,
            contract,
            interpreter: Interpreter {
                python_bin: self.python_bin.clone(),
                workdir,
                exec_timeout: self.exec_timeout,
            },
        };

        strategy.probe().await?;
        tracing::info!(
            "Loaded strategy {} with entry point {}",
            file,
            contract.entry_point()
        );

        Ok(Box::new(strategy))
    }
}
