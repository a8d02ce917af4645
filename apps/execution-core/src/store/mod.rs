//! Position store.
//!
//! SQLite-backed record of every trade plus the reconciliation audit log.
//! Prices and quantities are stored as TEXT in decimal form, timestamps as
//! RFC3339 strings.
//!
//! The store keeps an in-memory snapshot of live positions so the
//! reconciliation engine can read without touching the database. Every
//! recorded entry or exit sets a dirty flag; the snapshot is refreshed from
//! the database on the next reconciliation cycle and the flag clears only
//! when that fresh read succeeds.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::execution::position::{ExitReason, Position, PositionStatus};
use crate::reconcile::report::ReconciliationRecord;
use crate::venue::Direction;

/// Position store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be parsed back.
    #[error("invalid stored value for '{field}': {value}")]
    Parse {
        /// Column the bad value came from.
        field: &'static str,
        /// The offending value.
        value: String,
    },

    /// JSON (de)serialization of an audit column failed.
    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The referenced trade does not exist.
    #[error("unknown trade: {trade_id}")]
    UnknownTrade {
        /// The missing trade id.
        trade_id: String,
    },
}

/// SQLite-backed position store.
#[derive(Debug)]
pub struct PositionStore {
    pool: SqlitePool,
    snapshot: RwLock<Vec<Position>>,
    dirty: AtomicBool,
}

impl PositionStore {
    /// Open (creating if missing) a file-backed store.
    ///
    /// `:memory:` opens an in-memory store instead.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        if path == ":memory:" {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Open an in-memory store. Hermetic; used by tests and dry runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // One connection, or each pool checkout would see its own empty db
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            snapshot: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(false),
        };
        store.migrate().await?;
        store.refresh_snapshot().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS trades (
                trade_id      TEXT PRIMARY KEY,
                instrument    TEXT NOT NULL,
                direction     TEXT NOT NULL,
                quantity      TEXT NOT NULL,
                entry_price   TEXT NOT NULL,
                entry_time    TEXT NOT NULL,
                stop_order_id TEXT,
                stop_price    TEXT NOT NULL,
                status        TEXT NOT NULL,
                exit_price    TEXT,
                exit_time     TEXT,
                exit_reason   TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS reconciliation_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                at          TEXT NOT NULL,
                store_count INTEGER NOT NULL,
                venue_count INTEGER NOT NULL,
                orphans     TEXT NOT NULL,
                phantoms    TEXT NOT NULL,
                mismatches  TEXT NOT NULL,
                status      TEXT NOT NULL,
                duration_ms INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a newly opened position and mark the snapshot dirty.
    pub async fn record_entry(&self, position: &Position) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO trades (
                trade_id, instrument, direction, quantity, entry_price,
                entry_time, stop_order_id, stop_price, status,
                exit_price, exit_time, exit_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&position.trade_id)
        .bind(&position.instrument)
        .bind(position.direction.as_str())
        .bind(position.quantity.to_string())
        .bind(position.entry_price.to_string())
        .bind(position.entry_time.to_rfc3339())
        .bind(position.stop_order_id.as_deref())
        .bind(position.stop_price.to_string())
        .bind(position.status.as_str())
        .bind(position.exit_price.map(|p| p.to_string()))
        .bind(position.exit_time.map(|t| t.to_rfc3339()))
        .bind(position.exit_reason.map(ExitReason::as_str))
        .execute(&self.pool)
        .await?;

        self.mark_dirty();
        tracing::info!(
            trade_id = %position.trade_id,
            instrument = %position.instrument,
            direction = position.direction.as_str(),
            quantity = %position.quantity,
            entry_price = %position.entry_price,
            "trade entry recorded"
        );
        Ok(())
    }

    /// Record the exit of a trade and mark the snapshot dirty.
    pub async fn record_exit(
        &self,
        trade_id: &str,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE trades
            SET status = ?, exit_price = ?, exit_time = ?, exit_reason = ?
            WHERE trade_id = ?
            ",
        )
        .bind(PositionStatus::Closed.as_str())
        .bind(exit_price.to_string())
        .bind(exit_time.to_rfc3339())
        .bind(reason.as_str())
        .bind(trade_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownTrade {
                trade_id: trade_id.to_string(),
            });
        }

        self.mark_dirty();
        tracing::info!(
            trade_id = %trade_id,
            exit_price = %exit_price,
            reason = reason.as_str(),
            "trade exit recorded"
        );
        Ok(())
    }

    /// Fresh read of all live (OPENING/OPEN/CLOSING) positions.
    pub async fn open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM trades
            WHERE status IN ('OPENING', 'OPEN', 'CLOSING')
            ORDER BY entry_time
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_position).collect()
    }

    /// Closed trades with an exit at or after `since`.
    pub async fn closed_trades(&self, since: DateTime<Utc>) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT * FROM trades
            WHERE status = 'CLOSED' AND exit_time >= ?
            ORDER BY exit_time
            ",
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_position).collect()
    }

    /// Append one reconciliation audit row.
    pub async fn log_reconciliation(
        &self,
        record: &ReconciliationRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO reconciliation_log (
                at, store_count, venue_count, orphans, phantoms,
                mismatches, status, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(record.at.to_rfc3339())
        .bind(i64::from(record.store_count))
        .bind(i64::from(record.venue_count))
        .bind(serde_json::to_string(&record.orphans)?)
        .bind(serde_json::to_string(&record.phantoms)?)
        .bind(serde_json::to_string(&record.mismatches)?)
        .bind(record.status.as_str())
        .bind(record.duration_ms as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent audit row, if any.
    pub async fn last_reconciliation(&self) -> Result<Option<ReconciliationRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM reconciliation_log ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_reconciliation).transpose()
    }

    /// Number of audit rows written.
    pub async fn reconciliation_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM reconciliation_log")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    /// Cached snapshot of live positions. No database I/O.
    pub async fn snapshot(&self) -> Vec<Position> {
        self.snapshot.read().await.clone()
    }

    /// Whether the snapshot may lag the database.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Flag the snapshot as stale.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Re-read live positions from the database into the snapshot.
    ///
    /// The dirty flag clears only when the read succeeds; on failure it stays
    /// set so the next cycle retries.
    pub async fn refresh_snapshot(&self) -> Result<Vec<Position>, StoreError> {
        let fresh = self.open_positions().await?;
        {
            let mut snapshot = self.snapshot.write().await;
            *snapshot = fresh.clone();
        }
        self.dirty.store(false, Ordering::SeqCst);
        Ok(fresh)
    }
}

fn row_to_position(row: &SqliteRow) -> Result<Position, StoreError> {
    let direction_raw: String = row.try_get("direction")?;
    let status_raw: String = row.try_get("status")?;

    Ok(Position {
        trade_id: row.try_get("trade_id")?,
        instrument: row.try_get("instrument")?,
        direction: Direction::parse(&direction_raw).ok_or(StoreError::Parse {
            field: "direction",
            value: direction_raw.clone(),
        })?,
        quantity: parse_decimal(row, "quantity")?,
        entry_price: parse_decimal(row, "entry_price")?,
        entry_time: parse_time(row, "entry_time")?,
        stop_order_id: row.try_get("stop_order_id")?,
        stop_price: parse_decimal(row, "stop_price")?,
        status: PositionStatus::parse(&status_raw).ok_or(StoreError::Parse {
            field: "status",
            value: status_raw.clone(),
        })?,
        exit_price: parse_opt_decimal(row, "exit_price")?,
        exit_time: parse_opt_time(row, "exit_time")?,
        exit_reason: row
            .try_get::<Option<String>, _>("exit_reason")?
            .map(|raw| {
                ExitReason::parse(&raw).ok_or(StoreError::Parse {
                    field: "exit_reason",
                    value: raw,
                })
            })
            .transpose()?,
    })
}

fn row_to_reconciliation(row: &SqliteRow) -> Result<ReconciliationRecord, StoreError> {
    use crate::reconcile::report::ReconcileStatus;

    let status_raw: String = row.try_get("status")?;
    let orphans_raw: String = row.try_get("orphans")?;
    let phantoms_raw: String = row.try_get("phantoms")?;
    let mismatches_raw: String = row.try_get("mismatches")?;
    let store_count: i64 = row.try_get("store_count")?;
    let venue_count: i64 = row.try_get("venue_count")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;

    Ok(ReconciliationRecord {
        at: parse_time(row, "at")?,
        store_count: store_count as u32,
        venue_count: venue_count as u32,
        orphans: serde_json::from_str(&orphans_raw)?,
        phantoms: serde_json::from_str(&phantoms_raw)?,
        mismatches: serde_json::from_str(&mismatches_raw)?,
        status: ReconcileStatus::parse(&status_raw).ok_or(StoreError::Parse {
            field: "status",
            value: status_raw.clone(),
        })?,
        duration_ms: duration_ms as u64,
    })
}

fn parse_decimal(row: &SqliteRow, field: &'static str) -> Result<Decimal, StoreError> {
    let raw: String = row.try_get(field)?;
    Decimal::from_str(&raw).map_err(|_| StoreError::Parse { field, value: raw })
}

fn parse_opt_decimal(row: &SqliteRow, field: &'static str) -> Result<Option<Decimal>, StoreError> {
    row.try_get::<Option<String>, _>(field)?
        .map(|raw| Decimal::from_str(&raw).map_err(|_| StoreError::Parse { field, value: raw }))
        .transpose()
}

fn parse_time(row: &SqliteRow, field: &'static str) -> Result<DateTime<Utc>, StoreError> {
    let raw: String = row.try_get(field)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Parse { field, value: raw })
}

fn parse_opt_time(
    row: &SqliteRow,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    row.try_get::<Option<String>, _>(field)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| StoreError::Parse { field, value: raw })
        })
        .transpose()
}
