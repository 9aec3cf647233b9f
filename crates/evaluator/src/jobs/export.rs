use std::path::Path;

use anyhow::{Context, Result};
use common::db::AsyncDb;
use serde::Serialize;

use crate::window::ResolvedWindow;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    pub wallet_id: i64,
    pub wallet_address: String,
    pub simple_return: Option<f64>,
    pub adjusted_return: Option<f64>,
    pub net_cash_flow_usd: f64,
    pub value_t0_usd: f64,
    pub value_t1_usd: f64,
    pub token_count: u32,
    pub stable_heavy: bool,
    pub funding_heavy: bool,
    pub price_missing: bool,
    pub notes: Option<String>,
}

/// Write the top `limit` analyses of `window` by simple return to `path` as a
/// JSON array. Returns the number of rows written.
pub async fn export_snapshot(db: &AsyncDb, window: &ResolvedWindow, path: &Path, limit: usize) -> Result<usize> {
    let rows: Vec<SnapshotRow> = db
        .analyses_for_window(window.t0_block, window.t1_block, limit)
        .await?
        .into_iter()
        .map(|(address, a)| SnapshotRow {
            wallet_id: a.wallet_id,
            wallet_address: address,
            simple_return: a.simple_return,
            adjusted_return: a.adjusted_return,
            net_cash_flow_usd: a.net_cash_flow_usd,
            value_t0_usd: a.value_t0_usd,
            value_t1_usd: a.value_t1_usd,
            token_count: a.token_count,
            stable_heavy: a.stable_heavy,
            funding_heavy: a.funding_heavy,
            price_missing: a.price_missing,
            notes: a.notes,
        })
        .collect();

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(&rows)?)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;

    tracing::info!(path = %path.display(), rows = rows.len(), "snapshot exported");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::types::{NewCandidate, WalletAnalysis};

    fn window() -> ResolvedWindow {
        ResolvedWindow {
            t0: Utc.with_ymd_and_hms(2025, 10, 10, 19, 0, 0).unwrap(),
            t1: Utc.with_ymd_and_hms(2025, 10, 10, 22, 0, 0).unwrap(),
            t0_block: 100,
            t1_block: 200,
        }
    }

    async fn analysed(db: &AsyncDb, address: &str, simple_return: Option<f64>) {
        db.upsert_candidate(&NewCandidate {
            address: address.to_string(),
            detected_at_block: 1,
            first_transfer_amount: 1.0,
            first_transfer_token: None,
            first_transfer_decimals: None,
        })
        .await
        .unwrap();
        let id = db.candidate_by_address(address).await.unwrap().unwrap().id;
        let w = window();
        db.insert_analysis(&WalletAnalysis {
            wallet_id: id,
            t0_block: w.t0_block,
            t1_block: w.t1_block,
            t0_timestamp: w.t0,
            t1_timestamp: w.t1,
            value_t0_usd: 1_000.0,
            value_t1_usd: 1_000.0 * (1.0 + simple_return.unwrap_or(0.0)),
            simple_return,
            net_cash_flow_usd: 0.0,
            adjusted_return: simple_return,
            funding_heavy: false,
            stable_heavy: false,
            price_missing: false,
            token_count: 1,
            notes: None,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_orders_by_return_and_limits() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        analysed(&db, "0x0000000000000000000000000000000000000001", Some(0.1)).await;
        analysed(&db, "0x0000000000000000000000000000000000000002", None).await;
        analysed(&db, "0x0000000000000000000000000000000000000003", Some(0.5)).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("snapshot.json");
        let n = export_snapshot(&db, &window(), &path, 2).await.unwrap();
        assert_eq!(n, 2);

        let rows: Vec<serde_json::Value> = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(rows[0]["walletAddress"], "0x0000000000000000000000000000000000000003");
        assert_eq!(rows[1]["simpleReturn"], 0.1);
    }
}
