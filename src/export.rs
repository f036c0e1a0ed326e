use anyhow::{Context, Result};
use chrono::{NaiveDate, Timelike};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::model::brick::Brick;
use crate::store::BrickStore;

/// A brick whose open AND close both fall inside auction hours represents no
/// genuine continuous trading and is dropped from exports.
fn is_auction_artifact(brick: &Brick, auction_hours: &[u32]) -> bool {
    auction_hours.contains(&brick.open_time.hour())
        && auction_hours.contains(&brick.close_time().hour())
}

/// Read a series' persisted bricks with open timestamps in [start, end),
/// ascending, with auction artifacts removed.
pub fn export(
    store: &BrickStore,
    series_key: &str,
    start: NaiveDate,
    end: NaiveDate,
    auction_hours: &[u32],
) -> Result<Vec<Brick>> {
    let start_ts = start
        .and_hms_opt(0, 0, 0)
        .context("invalid export start date")?;
    let end_ts = end
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .context("invalid export end date")?;
    let bricks = store.query_range(series_key, start_ts, end_ts)?;
    Ok(bricks
        .into_iter()
        .filter(|b| !is_auction_artifact(b, auction_hours))
        .collect())
}

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    index: String,
    trading_date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    seconds: i64,
    color: &'a str,
    series_key: &'a str,
}

/// Serialize a series' bricks to CSV. When no path is given the file lands
/// in the working directory as `renko_{series_key}_{start}_{end}.csv`.
/// Returns the written path and row count.
pub fn export_to_csv(
    store: &BrickStore,
    series_key: &str,
    start: NaiveDate,
    end: NaiveDate,
    auction_hours: &[u32],
    path: Option<&Path>,
) -> Result<(PathBuf, usize)> {
    let bricks = export(store, series_key, start, end, auction_hours)?;

    let path = match path {
        Some(p) => p.to_path_buf(),
        None => PathBuf::from(format!(
            "renko_{}_{}_{}.csv",
            series_key,
            start.format("%Y%m%d"),
            end.format("%Y%m%d"),
        )),
    };

    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for brick in &bricks {
        writer.serialize(ExportRow {
            index: brick.open_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            trading_date: brick.trading_day.to_string(),
            open: brick.open,
            high: brick.high,
            low: brick.low,
            close: brick.close,
            volume: brick.volume,
            seconds: brick.seconds,
            color: brick.color.as_str(),
            series_key: &brick.series_key,
        })?;
    }
    writer.flush()?;

    tracing::info!(
        series = %series_key,
        rows = bricks.len(),
        path = %path.display(),
        "export finished"
    );
    Ok((path, bricks.len()))
}
