use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::error::Provider;
use serde::{Deserialize, Serialize};

const JSON_FILE: &str = "analysis_progress.json";
const TEXT_FILE: &str = "analysis_progress.txt";

/// Resumable progress of one analysis run over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCheckpoint {
    pub last_processed_wallet_id: i64,
    pub last_processed_address: String,
    pub total_wallets: u64,
    pub processed_count: u64,
    pub window_key: String,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
    pub rate_limit_hit: bool,
    pub rate_limit_provider: Option<Provider>,
    pub next_retry_after: Option<DateTime<Utc>>,
    pub completed: bool,
    #[serde(default)]
    pub aborted: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointState {
    NoCheckpoint,
    Running,
    RateLimited {
        provider: Option<Provider>,
        until: Option<DateTime<Utc>>,
    },
    Completed,
    Aborted(String),
}

impl CheckpointState {
    pub fn of(checkpoint: Option<&AnalysisCheckpoint>) -> Self {
        let Some(cp) = checkpoint else {
            return Self::NoCheckpoint;
        };
        if cp.completed {
            Self::Completed
        } else if cp.aborted {
            Self::Aborted(cp.error_message.clone().unwrap_or_default())
        } else if cp.rate_limit_hit {
            Self::RateLimited {
                provider: cp.rate_limit_provider,
                until: cp.next_retry_after,
            }
        } else {
            Self::Running
        }
    }
}

impl AnalysisCheckpoint {
    pub fn new(window_key: &str, total_wallets: u64, now: DateTime<Utc>) -> Self {
        Self {
            last_processed_wallet_id: 0,
            last_processed_address: String::new(),
            total_wallets,
            processed_count: 0,
            window_key: window_key.to_string(),
            started_at: now,
            last_checkpoint: now,
            rate_limit_hit: false,
            rate_limit_provider: None,
            next_retry_after: None,
            completed: false,
            aborted: false,
            error_message: None,
        }
    }

    pub fn state(&self) -> CheckpointState {
        CheckpointState::of(Some(self))
    }

    /// Remaining time extrapolated from the average pace so far.
    pub fn eta(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        if self.processed_count == 0 || self.total_wallets == 0 {
            return None;
        }
        let elapsed = (now - self.started_at).num_milliseconds().max(0);
        let remaining = self.total_wallets.saturating_sub(self.processed_count);
        let per_wallet = elapsed / i64::try_from(self.processed_count).unwrap_or(i64::MAX);
        Some(chrono::Duration::milliseconds(
            per_wallet.saturating_mul(i64::try_from(remaining).unwrap_or(i64::MAX)),
        ))
    }

    pub fn log_progress(&self) {
        if self.total_wallets == 0 {
            tracing::info!(window_key = %self.window_key, "progress: no wallets queued");
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = self.processed_count as f64 / self.total_wallets as f64 * 100.0;
        let eta_secs = self.eta(Utc::now()).map(|d| d.num_seconds());
        tracing::info!(
            processed = self.processed_count,
            total = self.total_wallets,
            pct = %format!("{pct:.1}"),
            eta_secs,
            "analysis progress"
        );
    }

    pub fn text_summary(&self) -> String {
        let status = match self.state() {
            CheckpointState::Completed => "COMPLETED".to_string(),
            CheckpointState::Aborted(_) => "ABORTED".to_string(),
            CheckpointState::RateLimited { provider, until } => format!(
                "RATE LIMITED ({}) until {}",
                provider.map_or("unknown", |p| p.as_str()),
                until.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            ),
            CheckpointState::Running | CheckpointState::NoCheckpoint => "RUNNING".to_string(),
        };
        let mut out = format!(
            "=== Wallet Analysis Progress ===\n\
             Window: {}\n\
             Last Update: {} UTC\n\
             Total Wallets: {}\n\
             Processed: {}\n\
             Remaining: {}\n\
             Last Wallet Id: {}\n\
             Last Wallet Address: {}\n\
             Status: {status}\n",
            self.window_key,
            self.last_checkpoint.format("%Y-%m-%d %H:%M:%S"),
            self.total_wallets,
            self.processed_count,
            self.total_wallets.saturating_sub(self.processed_count),
            self.last_processed_wallet_id,
            self.last_processed_address,
        );
        if let Some(err) = self.error_message.as_deref().filter(|e| !e.trim().is_empty()) {
            out.push_str(&format!("Error: {err}\n"));
        }
        out
    }
}

/// File-backed checkpoint: a JSON record plus a plain-text mirror.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn json_path(&self) -> PathBuf {
        self.dir.join(JSON_FILE)
    }

    pub fn text_path(&self) -> PathBuf {
        self.dir.join(TEXT_FILE)
    }

    /// Load the checkpoint for `window_key`. A checkpoint that cannot be parsed
    /// or belongs to another window is deleted.
    pub async fn load(&self, window_key: &str) -> Result<Option<AnalysisCheckpoint>> {
        let path = self.json_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no checkpoint found; starting fresh");
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        let checkpoint = match serde_json::from_str::<AnalysisCheckpoint>(&raw) {
            Ok(cp) => cp,
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint unreadable; discarding");
                self.clear().await?;
                return Ok(None);
            }
        };
        if checkpoint.window_key != window_key {
            tracing::info!(
                stored = %checkpoint.window_key,
                expected = %window_key,
                "stale checkpoint for a different window; discarding"
            );
            self.clear().await?;
            return Ok(None);
        }

        tracing::info!(
            processed = checkpoint.processed_count,
            total = checkpoint.total_wallets,
            last_wallet_id = checkpoint.last_processed_wallet_id,
            "checkpoint loaded"
        );
        Ok(Some(checkpoint))
    }

    /// Read whatever checkpoint is on disk without validating its window.
    pub async fn peek(&self) -> Result<Option<AnalysisCheckpoint>> {
        match tokio::fs::read_to_string(self.json_path()).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw).context("parsing checkpoint")?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_new(&self, window_key: &str, total_wallets: u64) -> AnalysisCheckpoint {
        tracing::info!(window_key, total_wallets, "new analysis run");
        AnalysisCheckpoint::new(window_key, total_wallets, Utc::now())
    }

    /// Write both files. Each is staged to a temp file first and the renames
    /// happen only after both writes succeeded.
    pub async fn save(&self, checkpoint: &mut AnalysisCheckpoint) -> Result<()> {
        checkpoint.last_checkpoint = Utc::now();
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let json = serde_json::to_string_pretty(checkpoint)?;
        let text = checkpoint.text_summary();
        let json_path = self.json_path();
        let text_path = self.text_path();
        let json_tmp = tmp_path(&json_path);
        let text_tmp = tmp_path(&text_path);

        tokio::fs::write(&json_tmp, json).await.context("writing checkpoint")?;
        tokio::fs::write(&text_tmp, text).await.context("writing checkpoint summary")?;
        tokio::fs::rename(&json_tmp, &json_path).await?;
        tokio::fs::rename(&text_tmp, &text_path).await?;
        tracing::debug!(processed = checkpoint.processed_count, "checkpoint saved");
        Ok(())
    }

    pub async fn mark_wallet_processed(
        &self,
        checkpoint: &mut AnalysisCheckpoint,
        wallet_id: i64,
        address: &str,
    ) -> Result<()> {
        checkpoint.last_processed_wallet_id = wallet_id;
        checkpoint.last_processed_address = address.to_string();
        checkpoint.processed_count += 1;
        checkpoint.error_message = None;
        checkpoint.rate_limit_hit = false;
        checkpoint.rate_limit_provider = None;
        checkpoint.next_retry_after = None;
        self.save(checkpoint).await
    }

    pub async fn mark_rate_limited(
        &self,
        checkpoint: &mut AnalysisCheckpoint,
        provider: Provider,
        retry_after: Duration,
    ) -> Result<()> {
        let until = Utc::now() + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());
        checkpoint.rate_limit_hit = true;
        checkpoint.rate_limit_provider = Some(provider);
        checkpoint.next_retry_after = Some(until);
        self.save(checkpoint).await?;
        tracing::warn!(%provider, retry_at = %until, "rate limited; checkpoint saved");
        Ok(())
    }

    /// Record a per-wallet error without leaving the running state.
    pub async fn record_error(&self, checkpoint: &mut AnalysisCheckpoint, message: String) -> Result<()> {
        checkpoint.error_message = Some(message);
        self.save(checkpoint).await
    }

    pub async fn mark_completed(&self, checkpoint: &mut AnalysisCheckpoint) -> Result<()> {
        checkpoint.completed = true;
        checkpoint.rate_limit_hit = false;
        self.save(checkpoint).await?;
        tracing::info!(processed = checkpoint.processed_count, "analysis completed");
        Ok(())
    }

    pub async fn mark_aborted(&self, checkpoint: &mut AnalysisCheckpoint, error: &str) -> Result<()> {
        checkpoint.aborted = true;
        checkpoint.error_message = Some(error.to_string());
        self.save(checkpoint).await
    }

    pub async fn clear(&self) -> Result<()> {
        for path in [self.json_path(), self.text_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
            }
        }
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
