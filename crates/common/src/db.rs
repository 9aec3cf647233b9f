use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::Error;
use crate::types::{
    normalize_address, ActivityEvent, ActivityKind, CandidateWallet, Dex, NewCandidate,
    WalletAnalysis,
};

pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// All SQLite work runs on a dedicated background thread. Clone is cheap
/// (shared sender to that thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and create the schema, all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Another process (a CLI `status` call, an admin sqlite3 session) may hold the
        // write lock at startup. Use a short busy_timeout per attempt and back off here.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying migrations"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "evaluator_db_query_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "evaluator_db_query_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("evaluator_db_query_errors_total", "op" => op).increment(1);
            }
        }

        res
    }
}

// ── Persistence interface used by the analysis core ──

impl AsyncDb {
    /// Insert a candidate unless the address is already known. Returns `true`
    /// when a new row was created.
    pub async fn upsert_candidate(&self, candidate: &NewCandidate) -> crate::error::Result<bool> {
        let c = candidate.clone();
        let inserted = self
            .call_named("candidates.upsert", move |conn| {
                let n = conn.execute(
                    "INSERT INTO candidate_wallets
                        (address, detected_at_block, first_transfer_amount,
                         first_transfer_token, first_transfer_decimals)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(address) DO NOTHING",
                    rusqlite::params![
                        normalize_address(&c.address),
                        c.detected_at_block as i64,
                        c.first_transfer_amount,
                        c.first_transfer_token.as_deref().map(normalize_address),
                        c.first_transfer_decimals,
                    ],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(inserted)
    }

    /// Unanalyzed wallets with `id > after_id`, ascending by id.
    pub async fn pending_wallets(
        &self,
        after_id: i64,
        limit: usize,
    ) -> crate::error::Result<Vec<CandidateWallet>> {
        let rows = self
            .call_named("candidates.pending", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, address, detected_at_block, first_transfer_amount,
                            first_transfer_token, first_transfer_decimals, analyzed
                     FROM candidate_wallets
                     WHERE id > ?1 AND analyzed = 0
                     ORDER BY id ASC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![after_id, limit as i64], candidate_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn count_pending_wallets(&self) -> crate::error::Result<u64> {
        let n: i64 = self
            .call_named("candidates.count_pending", |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM candidate_wallets WHERE analyzed = 0",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await?;
        Ok(n.max(0) as u64)
    }

    pub async fn mark_analyzed(&self, wallet_id: i64) -> crate::error::Result<()> {
        self.call_named("candidates.mark_analyzed", move |conn| {
            conn.execute(
                "UPDATE candidate_wallets SET analyzed = 1 WHERE id = ?1",
                rusqlite::params![wallet_id],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Insert-only. A second analysis for the same (wallet, t0, t1) fails with
    /// [`Error::PersistenceConflict`] and leaves the existing row untouched.
    pub async fn insert_analysis(&self, analysis: &WalletAnalysis) -> crate::error::Result<()> {
        let a = analysis.clone();
        let inserted = self
            .call_named("analysis.insert", move |conn| {
                match insert_analysis_row(conn, &a) {
                    Ok(_) => Ok(true),
                    Err(e) if is_unique_violation(&e) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        if inserted {
            Ok(())
        } else {
            Err(analysis_conflict(analysis))
        }
    }

    /// Stores the analysis and flags its wallet analyzed in one transaction.
    /// On a duplicate window nothing is written and [`Error::PersistenceConflict`] is returned.
    pub async fn record_analysis(&self, analysis: &WalletAnalysis) -> crate::error::Result<()> {
        let a = analysis.clone();
        let inserted = self
            .call_named("analysis.record", move |conn| {
                let tx = conn.transaction()?;
                match insert_analysis_row(&tx, &a) {
                    Ok(_) => {}
                    Err(e) if is_unique_violation(&e) => return Ok(false),
                    Err(e) => return Err(e.into()),
                }
                tx.execute(
                    "UPDATE candidate_wallets SET analyzed = 1 WHERE id = ?1",
                    rusqlite::params![a.wallet_id],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if inserted {
            Ok(())
        } else {
            Err(analysis_conflict(analysis))
        }
    }

    /// Analyses for one window joined with their address, best simple return first.
    pub async fn analyses_for_window(
        &self,
        t0_block: u64,
        t1_block: u64,
        limit: usize,
    ) -> crate::error::Result<Vec<(String, WalletAnalysis)>> {
        let rows = self
            .call_named("analysis.for_window", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT cw.address, wa.wallet_id, wa.t0_block, wa.t1_block, wa.t0_timestamp,
                            wa.t1_timestamp, wa.value_t0_usd, wa.value_t1_usd, wa.simple_return,
                            wa.net_cash_flow_usd, wa.adjusted_return, wa.funding_heavy,
                            wa.stable_heavy, wa.price_missing, wa.token_count, wa.notes
                     FROM wallet_analysis wa
                     JOIN candidate_wallets cw ON cw.id = wa.wallet_id
                     WHERE wa.t0_block = ?1 AND wa.t1_block = ?2
                     ORDER BY wa.simple_return IS NULL, wa.simple_return DESC, wa.wallet_id ASC
                     LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![t0_block as i64, t1_block as i64, limit as i64],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                WalletAnalysis {
                                    wallet_id: row.get(1)?,
                                    t0_block: row.get::<_, i64>(2)? as u64,
                                    t1_block: row.get::<_, i64>(3)? as u64,
                                    t0_timestamp: parse_ts(row, 4)?,
                                    t1_timestamp: parse_ts(row, 5)?,
                                    value_t0_usd: row.get(6)?,
                                    value_t1_usd: row.get(7)?,
                                    simple_return: row.get(8)?,
                                    net_cash_flow_usd: row.get(9)?,
                                    adjusted_return: row.get(10)?,
                                    funding_heavy: row.get(11)?,
                                    stable_heavy: row.get(12)?,
                                    price_missing: row.get(13)?,
                                    token_count: row.get(14)?,
                                    notes: row.get(15)?,
                                },
                            ))
                        },
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Append a batch; rows already present (same chain, tx, position) are skipped.
    /// Returns the number of new rows.
    pub async fn insert_activity_batch(
        &self,
        events: Vec<ActivityEvent>,
    ) -> crate::error::Result<u64> {
        let inserted = self
            .call_named("activity.insert_batch", move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = 0_u64;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO activity_events
                            (chain_id, tx_hash, log_position, block_number, timestamp, kind, dex,
                             counterparty_from, counterparty_to, pool, asset_in, amount_in_raw,
                             asset_out, amount_out_raw, via_aggregator, usd_in, usd_out,
                             usd_notional)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                                 ?15, ?16, ?17, ?18)",
                    )?;
                    for e in &events {
                        let n = stmt.execute(rusqlite::params![
                            e.chain_id,
                            e.tx_hash.to_ascii_lowercase(),
                            e.log_position as i64,
                            e.block as i64,
                            e.timestamp.to_rfc3339(),
                            e.kind.as_str(),
                            e.dex.map(|d| d.as_str()),
                            normalize_address(&e.counterparty_from),
                            e.counterparty_to.as_deref().map(normalize_address),
                            e.pool.as_deref().map(normalize_address),
                            normalize_address(&e.asset_in),
                            e.amount_in_raw.to_string(),
                            normalize_address(&e.asset_out),
                            e.amount_out_raw.to_string(),
                            e.via_aggregator,
                            e.usd_in,
                            e.usd_out,
                            e.usd_notional,
                        ])?;
                        inserted += n as u64;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await?;
        Ok(inserted)
    }

    /// Events not yet run through USD enrichment, oldest first.
    pub async fn unenriched_activity(
        &self,
        limit: usize,
    ) -> crate::error::Result<Vec<(i64, ActivityEvent)>> {
        let rows = self
            .call_named("activity.unenriched", move |conn| {
                let sql = format!(
                    "SELECT id, {ACTIVITY_COLUMNS} FROM activity_events
                     WHERE enriched = 0
                     ORDER BY block_number ASC, log_position ASC
                     LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![limit as i64], |row| {
                        Ok((row.get::<_, i64>(0)?, activity_from_row(row, 1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Unenriched rows on one chain, oldest first.
    pub async fn unenriched_activity_on_chain(
        &self,
        chain_id: i64,
        limit: usize,
    ) -> crate::error::Result<Vec<(i64, ActivityEvent)>> {
        let rows = self
            .call_named("activity.unenriched_on_chain", move |conn| {
                let sql = format!(
                    "SELECT id, {ACTIVITY_COLUMNS} FROM activity_events
                     WHERE enriched = 0 AND chain_id = ?1
                     ORDER BY block_number ASC, log_position ASC
                     LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![chain_id, limit as i64], |row| {
                        Ok((row.get::<_, i64>(0)?, activity_from_row(row, 1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    pub async fn update_activity_usd(
        &self,
        id: i64,
        usd_in: Option<f64>,
        usd_out: Option<f64>,
        usd_notional: Option<f64>,
    ) -> crate::error::Result<()> {
        self.call_named("activity.update_usd", move |conn| {
            conn.execute(
                "UPDATE activity_events
                 SET usd_in = ?2, usd_out = ?3, usd_notional = ?4, enriched = 1
                 WHERE id = ?1",
                rusqlite::params![id, usd_in, usd_out, usd_notional],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn delete_activity(&self, ids: Vec<i64>) -> crate::error::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self
            .call_named("activity.delete", move |conn| {
                let tx = conn.transaction()?;
                let mut deleted = 0_u64;
                {
                    let mut stmt = tx.prepare("DELETE FROM activity_events WHERE id = ?1")?;
                    for id in &ids {
                        deleted += stmt.execute(rusqlite::params![id])? as u64;
                    }
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted)
    }

    /// Enriched swaps inside an inclusive block range.
    pub async fn swaps_in_blocks(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> crate::error::Result<Vec<ActivityEvent>> {
        let rows = self
            .call_named("activity.swaps_in_blocks", move |conn| {
                let sql = format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM activity_events
                     WHERE kind = 'swap' AND enriched = 1
                       AND block_number BETWEEN ?1 AND ?2
                     ORDER BY block_number ASC, log_position ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![from_block as i64, to_block as i64],
                        |row| activity_from_row(row, 0),
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// A trader's enriched swaps in replay order.
    pub async fn swaps_for_trader(&self, trader: &str) -> crate::error::Result<Vec<ActivityEvent>> {
        let trader = normalize_address(trader);
        let rows = self
            .call_named("activity.swaps_for_trader", move |conn| {
                let sql = format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM activity_events
                     WHERE kind = 'swap' AND enriched = 1 AND counterparty_from = ?1
                     ORDER BY timestamp ASC, block_number ASC, log_position ASC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![trader], |row| activity_from_row(row, 0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Addresses carrying any of `labels`, lowercased.
    pub async fn labelled_addresses(
        &self,
        labels: Vec<String>,
    ) -> crate::error::Result<HashSet<String>> {
        let set = self
            .call_named("labels.addresses", move |conn| {
                let mut stmt =
                    conn.prepare("SELECT address FROM wallet_labels WHERE lower(label) = lower(?1)")?;
                let mut out = HashSet::new();
                for label in &labels {
                    let rows = stmt
                        .query_map(rusqlite::params![label], |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    out.extend(rows.iter().map(|a| normalize_address(a)));
                }
                Ok(out)
            })
            .await?;
        Ok(set)
    }

    pub async fn candidate_by_address(
        &self,
        address: &str,
    ) -> crate::error::Result<Option<CandidateWallet>> {
        let address = normalize_address(address);
        let row = self
            .call_named("candidates.by_address", move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, address, detected_at_block, first_transfer_amount,
                                first_transfer_token, first_transfer_decimals, analyzed
                         FROM candidate_wallets WHERE address = ?1",
                        rusqlite::params![address],
                        candidate_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(row)
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

const ACTIVITY_COLUMNS: &str = "chain_id, tx_hash, log_position, block_number, timestamp, kind, \
     dex, counterparty_from, counterparty_to, pool, asset_in, amount_in_raw, asset_out, \
     amount_out_raw, via_aggregator, usd_in, usd_out, usd_notional";

fn insert_analysis_row(conn: &Connection, a: &WalletAnalysis) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO wallet_analysis
            (wallet_id, t0_block, t1_block, t0_timestamp, t1_timestamp,
             value_t0_usd, value_t1_usd, simple_return, net_cash_flow_usd,
             adjusted_return, funding_heavy, stable_heavy, price_missing,
             token_count, notes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        rusqlite::params![
            a.wallet_id,
            a.t0_block as i64,
            a.t1_block as i64,
            a.t0_timestamp.to_rfc3339(),
            a.t1_timestamp.to_rfc3339(),
            a.value_t0_usd,
            a.value_t1_usd,
            a.simple_return,
            a.net_cash_flow_usd,
            a.adjusted_return,
            a.funding_heavy,
            a.stable_heavy,
            a.price_missing,
            a.token_count,
            a.notes,
        ],
    )
}

/// Only unique/primary-key collisions count as a duplicate row; foreign-key,
/// NOT NULL and CHECK failures are real errors.
fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn analysis_conflict(a: &WalletAnalysis) -> Error {
    Error::PersistenceConflict(format!(
        "analysis already exists for wallet {} blocks {}..{}",
        a.wallet_id, a.t0_block, a.t1_block
    ))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(msg),
    )
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {s:?}: {e}")))
}

fn parse_u128(row: &Row<'_>, idx: usize) -> rusqlite::Result<u128> {
    let s: String = row.get(idx)?;
    s.parse::<u128>()
        .map_err(|e| conversion_error(idx, format!("bad amount {s:?}: {e}")))
}

fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<CandidateWallet> {
    Ok(CandidateWallet {
        id: row.get(0)?,
        address: row.get(1)?,
        detected_at_block: row.get::<_, i64>(2)? as u64,
        first_transfer_amount: row.get(3)?,
        first_transfer_token: row.get(4)?,
        first_transfer_decimals: row.get(5)?,
        analyzed: row.get(6)?,
    })
}

fn activity_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<ActivityEvent> {
    let kind: String = row.get(base + 5)?;
    let dex: Option<String> = row.get(base + 6)?;
    Ok(ActivityEvent {
        chain_id: row.get(base)?,
        tx_hash: row.get(base + 1)?,
        log_position: row.get::<_, i64>(base + 2)? as u64,
        block: row.get::<_, i64>(base + 3)? as u64,
        timestamp: parse_ts(row, base + 4)?,
        kind: ActivityKind::parse(&kind)
            .ok_or_else(|| conversion_error(base + 5, format!("bad kind {kind:?}")))?,
        dex: dex.as_deref().and_then(Dex::parse),
        counterparty_from: row.get(base + 7)?,
        counterparty_to: row.get(base + 8)?,
        pool: row.get(base + 9)?,
        asset_in: row.get(base + 10)?,
        amount_in_raw: parse_u128(row, base + 11)?,
        asset_out: row.get(base + 12)?,
        amount_out_raw: parse_u128(row, base + 13)?,
        via_aggregator: row.get(base + 14)?,
        usd_in: row.get(base + 15)?,
        usd_out: row.get(base + 16)?,
        usd_notional: row.get(base + 17)?,
    })
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS candidate_wallets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL UNIQUE COLLATE NOCASE,
    detected_at_block INTEGER NOT NULL,
    first_transfer_amount REAL NOT NULL,
    first_transfer_token TEXT,
    first_transfer_decimals INTEGER,
    analyzed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_candidate_wallets_pending
    ON candidate_wallets(analyzed, id);

CREATE TABLE IF NOT EXISTS wallet_analysis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_id INTEGER NOT NULL REFERENCES candidate_wallets(id),
    t0_block INTEGER NOT NULL,
    t1_block INTEGER NOT NULL,
    t0_timestamp TEXT NOT NULL,
    t1_timestamp TEXT NOT NULL,
    value_t0_usd REAL NOT NULL,
    value_t1_usd REAL NOT NULL,
    simple_return REAL,
    net_cash_flow_usd REAL NOT NULL,
    adjusted_return REAL,
    funding_heavy INTEGER NOT NULL,
    stable_heavy INTEGER NOT NULL,
    price_missing INTEGER NOT NULL,
    token_count INTEGER NOT NULL,
    notes TEXT,
    analyzed_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet_id, t0_block, t1_block)
);

CREATE TABLE IF NOT EXISTS activity_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_id INTEGER NOT NULL,
    tx_hash TEXT NOT NULL,
    log_position INTEGER NOT NULL,
    block_number INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    kind TEXT NOT NULL,                -- transfer, swap
    dex TEXT,                          -- univ2, univ3
    counterparty_from TEXT NOT NULL,
    counterparty_to TEXT,
    pool TEXT,
    asset_in TEXT NOT NULL,
    amount_in_raw TEXT NOT NULL,       -- base units, decimal string
    asset_out TEXT NOT NULL,
    amount_out_raw TEXT NOT NULL,
    via_aggregator INTEGER NOT NULL DEFAULT 0,
    usd_in REAL,
    usd_out REAL,
    usd_notional REAL,
    enriched INTEGER NOT NULL DEFAULT 0,
    UNIQUE(chain_id, tx_hash, log_position)
);

CREATE INDEX IF NOT EXISTS idx_activity_events_trader
    ON activity_events(counterparty_from, timestamp, block_number, log_position);
CREATE INDEX IF NOT EXISTS idx_activity_events_block
    ON activity_events(block_number, log_position);

CREATE TABLE IF NOT EXISTS wallet_labels (
    chain_id INTEGER NOT NULL,
    address TEXT NOT NULL COLLATE NOCASE,
    label TEXT NOT NULL,               -- cex, bridge, lp, ...
    PRIMARY KEY (chain_id, address, label)
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,              -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                     -- JSON with run summary
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(address: &str, block: u64) -> NewCandidate {
        NewCandidate {
            address: address.to_string(),
            detected_at_block: block,
            first_transfer_amount: 50_000.0,
            first_transfer_token: Some("0xA0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".to_string()),
            first_transfer_decimals: Some(6),
        }
    }

    fn analysis(wallet_id: i64, simple_return: Option<f64>) -> WalletAnalysis {
        WalletAnalysis {
            wallet_id,
            t0_block: 100,
            t1_block: 200,
            t0_timestamp: Utc.with_ymd_and_hms(2025, 10, 10, 19, 0, 0).unwrap(),
            t1_timestamp: Utc.with_ymd_and_hms(2025, 10, 10, 22, 0, 0).unwrap(),
            value_t0_usd: 1000.0,
            value_t1_usd: 1100.0,
            simple_return,
            net_cash_flow_usd: 0.0,
            adjusted_return: simple_return,
            funding_heavy: false,
            stable_heavy: false,
            price_missing: false,
            token_count: 1,
            notes: None,
        }
    }

    fn swap(tx: &str, pos: u64, block: u64) -> ActivityEvent {
        ActivityEvent {
            chain_id: 1,
            tx_hash: tx.to_string(),
            log_position: pos,
            block,
            timestamp: Utc.timestamp_opt(1_760_000_000 + block as i64, 0).unwrap(),
            kind: ActivityKind::Swap,
            dex: Some(Dex::UniV2),
            counterparty_from: "0xTrader".to_string(),
            counterparty_to: Some("0xrouter".to_string()),
            pool: Some("0xpool".to_string()),
            asset_in: "0xaaa".to_string(),
            amount_in_raw: 340_282_366_920_938_463_463_374_607_431_768_211_455,
            asset_out: "0xbbb".to_string(),
            amount_out_raw: 5,
            via_aggregator: true,
            usd_in: None,
            usd_out: None,
            usd_notional: None,
        }
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect();

        for t in [
            "candidate_wallets",
            "wallet_analysis",
            "activity_events",
            "wallet_labels",
            "job_status",
        ] {
            assert!(tables.contains(&t.to_string()), "missing table {t}");
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();
    }

    #[tokio::test]
    async fn test_upsert_candidate_is_case_insensitive() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        assert!(db.upsert_candidate(&candidate("0xABCDEF", 10)).await.unwrap());
        assert!(!db.upsert_candidate(&candidate("0xabcdef", 11)).await.unwrap());

        let w = db.candidate_by_address("0xAbCdEf").await.unwrap().unwrap();
        assert_eq!(w.address, "0xabcdef");
        assert_eq!(w.detected_at_block, 10);
        assert_eq!(w.first_transfer_decimals, Some(6));
        assert!(!w.analyzed);
    }

    #[tokio::test]
    async fn test_pending_wallets_skips_analyzed_and_respects_cursor() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        for (i, a) in ["0x01", "0x02", "0x03", "0x04"].iter().enumerate() {
            db.upsert_candidate(&candidate(a, i as u64)).await.unwrap();
        }
        db.mark_analyzed(2).await.unwrap();

        let all = db.pending_wallets(0, 10).await.unwrap();
        let ids: Vec<i64> = all.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert_eq!(db.count_pending_wallets().await.unwrap(), 3);

        let after = db.pending_wallets(3, 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].address, "0x04");

        let limited = db.pending_wallets(0, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_analysis_rejects_duplicate_window() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.upsert_candidate(&candidate("0x01", 1)).await.unwrap();
        db.insert_analysis(&analysis(1, Some(0.1))).await.unwrap();

        let mut again = analysis(1, Some(9.9));
        again.value_t1_usd = 99_999.0;
        let err = db.insert_analysis(&again).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceConflict(_)));

        let rows = db.analyses_for_window(100, 200, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.simple_return, Some(0.1));
        assert!((rows[0].1.value_t1_usd - 1100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_insert_analysis_for_unknown_wallet_is_not_a_conflict() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let err = db.insert_analysis(&analysis(42, Some(0.1))).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_record_analysis_marks_wallet_in_same_write() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.upsert_candidate(&candidate("0x01", 1)).await.unwrap();
        db.upsert_candidate(&candidate("0x02", 1)).await.unwrap();

        db.record_analysis(&analysis(1, Some(0.2))).await.unwrap();
        let w = db.candidate_by_address("0x01").await.unwrap().unwrap();
        assert!(w.analyzed);
        assert_eq!(db.count_pending_wallets().await.unwrap(), 1);

        let err = db.record_analysis(&analysis(1, Some(3.0))).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceConflict(_)));
        let rows = db.analyses_for_window(100, 200, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.simple_return, Some(0.2));
    }

    #[tokio::test]
    async fn test_failed_record_leaves_wallet_pending() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.upsert_candidate(&candidate("0x01", 1)).await.unwrap();

        let mut bad = analysis(99, Some(0.1));
        bad.t0_block = 1;
        assert!(db.record_analysis(&bad).await.is_err());
        assert_eq!(db.count_pending_wallets().await.unwrap(), 1);
        assert!(db.analyses_for_window(1, 200, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_analyses_for_window_orders_by_return_nulls_last() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        for a in ["0x01", "0x02", "0x03"] {
            db.upsert_candidate(&candidate(a, 1)).await.unwrap();
        }
        db.insert_analysis(&analysis(1, None)).await.unwrap();
        db.insert_analysis(&analysis(2, Some(0.5))).await.unwrap();
        db.insert_analysis(&analysis(3, Some(1.5))).await.unwrap();

        let rows = db.analyses_for_window(100, 200, 10).await.unwrap();
        let addresses: Vec<&str> = rows.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(addresses, vec!["0x03", "0x02", "0x01"]);
    }

    #[tokio::test]
    async fn test_activity_batch_dedups_and_round_trips_wide_amounts() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let batch = vec![swap("0xAA", 1, 10), swap("0xaa", 1, 10), swap("0xbb", 0, 11)];
        assert_eq!(db.insert_activity_batch(batch).await.unwrap(), 2);
        assert_eq!(db.insert_activity_batch(vec![swap("0xbb", 0, 11)]).await.unwrap(), 0);

        let pending = db.unenriched_activity(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1.amount_in_raw, u128::MAX);
        assert_eq!(pending[0].1.counterparty_from, "0xtrader");
        assert_eq!(pending[0].1.dex, Some(Dex::UniV2));
    }

    #[tokio::test]
    async fn test_unenriched_activity_on_chain_filters_by_chain() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut l2 = swap("0x1", 0, 5);
        l2.chain_id = 42_161;
        db.insert_activity_batch(vec![swap("0x1", 0, 10), l2]).await.unwrap();

        let main = db.unenriched_activity_on_chain(1, 10).await.unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].1.block, 10);
        let arb = db.unenriched_activity_on_chain(42_161, 10).await.unwrap();
        assert_eq!(arb.len(), 1);
        assert_eq!(arb[0].1.chain_id, 42_161);
        assert!(db.unenriched_activity_on_chain(8_453, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enrich_then_query_swaps_and_delete() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.insert_activity_batch(vec![swap("0x1", 0, 10), swap("0x2", 0, 20)])
            .await
            .unwrap();
        let pending = db.unenriched_activity(10).await.unwrap();
        db.update_activity_usd(pending[0].0, Some(40_000.0), Some(41_000.0), Some(41_000.0))
            .await
            .unwrap();
        db.delete_activity(vec![pending[1].0]).await.unwrap();

        assert!(db.unenriched_activity(10).await.unwrap().is_empty());
        let swaps = db.swaps_in_blocks(0, 100).await.unwrap();
        assert_eq!(swaps.len(), 1);
        assert_eq!(swaps[0].usd_notional, Some(41_000.0));
        assert_eq!(db.swaps_for_trader("0xTRADER").await.unwrap().len(), 1);
        assert!(db.swaps_in_blocks(11, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_labelled_addresses_lowercases() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        db.call(|conn| {
            conn.execute_batch(
                "INSERT INTO wallet_labels VALUES (1, '0xCEX', 'cex');
                 INSERT INTO wallet_labels VALUES (1, '0xbridge', 'BRIDGE');
                 INSERT INTO wallet_labels VALUES (1, '0xfund', 'fund');",
            )?;
            Ok(())
        })
        .await
        .unwrap();
        let set = db
            .labelled_addresses(vec!["cex".to_string(), "bridge".to_string()])
            .await
            .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("0xcex"));
        assert!(set.contains("0xbridge"));
    }
}
