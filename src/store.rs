use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, Row};
use std::path::Path;

use crate::model::brick::{Brick, BrickColor};
use crate::series::BrickSink;

/// Keyed brick store on sqlite. One row per (series_key, open_ts); writes are
/// idempotent upserts so redelivery after a crash or resume replay never
/// duplicates a brick.
#[derive(Debug)]
pub struct BrickStore {
    conn: Connection,
}

fn to_epoch(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp()
}

fn from_epoch(secs: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.naive_utc())
        .with_context(|| format!("timestamp {} out of range", secs))
}

fn brick_from_row(row: &Row<'_>) -> rusqlite::Result<(Brick, i64)> {
    let open_ts: i64 = row.get("open_ts")?;
    let color_str: String = row.get("color")?;
    let trading_day_str: String = row.get("trading_day")?;
    let brick = Brick {
        series_key: row.get("series_key")?,
        instrument: row.get("instrument")?,
        height_label: row.get("height_label")?,
        open: row.get("open")?,
        high: row.get("high")?,
        low: row.get("low")?,
        close: row.get("close")?,
        volume: row.get("volume")?,
        // open_time is filled in by the caller from open_ts.
        open_time: NaiveDateTime::default(),
        seconds: row.get("seconds")?,
        color: BrickColor::parse(&color_str).unwrap_or(BrickColor::Flat),
        trading_day: trading_day_str
            .parse()
            .unwrap_or_else(|_| NaiveDate::default()),
    };
    Ok((brick, open_ts))
}

impl BrickStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open brick store at {}", path.display()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bricks (
                series_key TEXT NOT NULL,
                instrument TEXT NOT NULL,
                height_label TEXT NOT NULL,
                open_ts INTEGER NOT NULL,
                seconds INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                color TEXT NOT NULL,
                trading_day TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL,
                -- A gap tick can chain several bricks onto one open
                -- timestamp, so the open price is part of the key
                -- (mirrors keying on datetime plus open in the stored data).
                PRIMARY KEY(series_key, open_ts, open)
            );

            CREATE TABLE IF NOT EXISTS series_meta (
                series_key TEXT PRIMARY KEY,
                instrument TEXT NOT NULL,
                height_label TEXT NOT NULL,
                last_close_ts INTEGER,
                updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Idempotent upsert keyed by (series_key, open_ts). Calling twice with
    /// the same closed brick leaves exactly one record.
    pub fn upsert(&self, brick: &Brick) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            r#"
            INSERT INTO bricks (
                series_key, instrument, height_label, open_ts, seconds,
                open, high, low, close, volume, color, trading_day, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(series_key, open_ts, open) DO UPDATE SET
                seconds = excluded.seconds,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume,
                color = excluded.color,
                trading_day = excluded.trading_day,
                updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                brick.series_key,
                brick.instrument,
                brick.height_label,
                to_epoch(brick.open_time),
                brick.seconds,
                brick.open,
                brick.high,
                brick.low,
                brick.close,
                brick.volume,
                brick.color.as_str(),
                brick.trading_day.to_string(),
                now_ms,
            ],
        )?;
        Ok(())
    }

    /// The most recently closed brick of a series, for resume.
    pub fn latest(&self, series_key: &str) -> Result<Option<Brick>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT series_key, instrument, height_label, open_ts, seconds,
                   open, high, low, close, volume, color, trading_day
            FROM bricks
            WHERE series_key = ?1
            ORDER BY open_ts DESC, rowid DESC
            LIMIT 1
            "#,
        )?;
        let mut rows = stmt.query_map([series_key], brick_from_row)?;
        match rows.next() {
            Some(row) => {
                let (mut brick, open_ts) = row?;
                brick.open_time = from_epoch(open_ts)?;
                Ok(Some(brick))
            }
            None => Ok(None),
        }
    }

    /// All bricks of a series with open_ts in [start, end), ascending.
    pub fn query_range(
        &self,
        series_key: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Brick>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT series_key, instrument, height_label, open_ts, seconds,
                   open, high, low, close, volume, color, trading_day
            FROM bricks
            WHERE series_key = ?1 AND open_ts >= ?2 AND open_ts < ?3
            ORDER BY open_ts ASC, rowid ASC
            "#,
        )?;
        let rows = stmt.query_map(
            params![series_key, to_epoch(start), to_epoch(end)],
            brick_from_row,
        )?;
        let mut bricks = Vec::new();
        for row in rows {
            let (mut brick, open_ts) = row?;
            brick.open_time = from_epoch(open_ts)?;
            bricks.push(brick);
        }
        Ok(bricks)
    }

    pub fn count(&self, series_key: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bricks WHERE series_key = ?1",
            [series_key],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Create the open_ts index and the composite query index if missing.
    /// Safe to call repeatedly.
    pub fn ensure_indexes(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bricks_open_ts
                ON bricks(open_ts);
            CREATE INDEX IF NOT EXISTS idx_bricks_open_close_volume
                ON bricks(open_ts, open, close, volume);
            "#,
        )?;
        Ok(())
    }

    /// Refresh the per-series latest-close bookkeeping used by future
    /// resumes. Returns the recorded close timestamp, if any brick exists.
    pub fn update_latest_close(&self, series_key: &str) -> Result<Option<NaiveDateTime>> {
        let latest = self.latest(series_key)?;
        let Some(brick) = latest else {
            return Ok(None);
        };
        let close_ts = brick.close_time();
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            r#"
            INSERT INTO series_meta (series_key, instrument, height_label, last_close_ts, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(series_key) DO UPDATE SET
                last_close_ts = excluded.last_close_ts,
                updated_at_ms = excluded.updated_at_ms
            "#,
            params![
                series_key,
                brick.instrument,
                brick.height_label,
                to_epoch(close_ts),
                now_ms,
            ],
        )?;
        Ok(Some(close_ts))
    }

    pub fn latest_close_meta(&self, series_key: &str) -> Result<Option<NaiveDateTime>> {
        let mut stmt = self
            .conn
            .prepare("SELECT last_close_ts FROM series_meta WHERE series_key = ?1")?;
        let mut rows = stmt.query_map([series_key], |row| row.get::<_, Option<i64>>(0))?;
        match rows.next() {
            Some(row) => match row? {
                Some(secs) => Ok(Some(from_epoch(secs)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }
}

/// Brick sink backed by the store. A failed upsert is retried once (the
/// keyed upsert makes the retry safe); a second failure is logged and
/// counted but never aborts the consume loop.
#[derive(Debug)]
pub struct StoreSink {
    store: BrickStore,
    pub persisted: u64,
    pub failures: u64,
}

impl StoreSink {
    pub fn new(store: BrickStore) -> Self {
        Self {
            store,
            persisted: 0,
            failures: 0,
        }
    }

    pub fn store(&self) -> &BrickStore {
        &self.store
    }

    pub fn into_store(self) -> BrickStore {
        self.store
    }
}

impl BrickSink for StoreSink {
    fn on_brick(&mut self, brick: &Brick) -> Result<()> {
        match self.store.upsert(brick) {
            Ok(()) => {
                self.persisted += 1;
                tracing::info!(
                    series = %brick.series_key,
                    open_time = %brick.open_time,
                    open = brick.open,
                    close = brick.close,
                    color = %brick.color,
                    "persisted brick"
                );
                Ok(())
            }
            Err(first_err) => {
                tracing::warn!(
                    series = %brick.series_key,
                    open_time = %brick.open_time,
                    error = %first_err,
                    "brick upsert failed, retrying once"
                );
                match self.store.upsert(brick) {
                    Ok(()) => {
                        self.persisted += 1;
                        Ok(())
                    }
                    Err(retry_err) => {
                        self.failures += 1;
                        tracing::error!(
                            series = %brick.series_key,
                            open_time = %brick.open_time,
                            open = brick.open,
                            close = brick.close,
                            error = %retry_err,
                            "brick upsert failed after retry; a later resume will re-derive it"
                        );
                        Ok(())
                    }
                }
            }
        }
    }
}
