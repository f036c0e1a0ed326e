use anyhow::Result;
use chrono::NaiveDateTime;

use crate::registry::SeriesRegistry;
use crate::store::BrickStore;

/// Rehydrates each series from the last persisted brick and returns the
/// global watermark: the minimum per-series close timestamp, i.e. the
/// earliest point any series still needs. The fetch loop refetches from
/// there and per-series watermark filtering discards what each series
/// already has.
pub fn resume(store: &BrickStore, registry: &mut SeriesRegistry) -> Result<Option<NaiveDateTime>> {
    let mut global: Option<NaiveDateTime> = None;

    for (series_key, entry) in registry.entries_mut() {
        let Some(brick) = store.latest(series_key)? else {
            tracing::info!(series = %series_key, "no persisted bricks, series starts empty");
            continue;
        };

        let close_ts = brick.close_time();
        let reference_price = brick.close;
        let configured = entry.series.height();

        tracing::info!(
            series = %series_key,
            open_time = %brick.open_time,
            close = brick.close,
            watermark = %close_ts,
            "resuming series from last persisted brick"
        );

        // Seed the open brick from the record without re-emitting it, then
        // recompute the threshold from the resumed price level.
        entry.series.resume_from(brick);
        entry.series.update_height(reference_price, configured);
        entry.watermark = Some(close_ts);

        global = Some(match global {
            Some(g) => g.min(close_ts),
            None => close_ts,
        });
    }

    Ok(global)
}
