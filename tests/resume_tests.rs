use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use renko_rebuild::config::HeightSpec;
use renko_rebuild::model::tick::Tick;
use renko_rebuild::registry::SeriesRegistry;
use renko_rebuild::resume::resume;
use renko_rebuild::store::{BrickStore, StoreSink};

fn ts(secs: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
        + chrono::Duration::seconds(i64::from(secs))
}

fn tick(price: f64, secs: u32) -> Tick {
    Tick::new("RB99", "SHFE", ts(secs), price, 1.0)
}

fn specs(labels: &[&str]) -> Vec<HeightSpec> {
    labels.iter().map(|l| HeightSpec::parse(l).unwrap()).collect()
}

/// A wandering price path that closes bricks in both directions.
fn tick_stream() -> Vec<Tick> {
    let prices = [
        100.0, 104.0, 111.0, 108.0, 121.0, 119.0, 95.0, 99.0, 130.0, 128.0, 142.0, 118.0, 150.0,
    ];
    prices
        .iter()
        .enumerate()
        .map(|(i, &p)| tick(p, (i as u32) * 10))
        .collect()
}

#[test]
fn resume_rehydrates_open_brick_and_watermark() {
    let dir = TempDir::new().unwrap();
    let store = BrickStore::open(&dir.path().join("renko.sqlite")).unwrap();
    let mut registry = SeriesRegistry::new("RB99", 1.0, &specs(&["10"]));
    let mut sink = StoreSink::new(store);

    for t in &tick_stream()[..5] {
        registry.on_tick(t, &mut sink).unwrap();
    }
    assert!(sink.persisted > 0);
    let store = sink.into_store();
    let stored_latest = store.latest("RB99_10").unwrap().unwrap();

    let mut resumed = SeriesRegistry::new("RB99", 1.0, &specs(&["10"]));
    let watermark = resume(&store, &mut resumed).unwrap().unwrap();
    assert_eq!(watermark, stored_latest.close_time());

    let entry = resumed.entry("RB99_10").unwrap();
    assert_eq!(entry.watermark, Some(watermark));
    let cur = entry.series.current().unwrap();
    assert_eq!(cur.open_time, stored_latest.open_time);
    assert!((cur.open - stored_latest.open).abs() < f64::EPSILON);
    assert!((cur.close - stored_latest.close).abs() < f64::EPSILON);
}

#[test]
fn resume_of_empty_store_leaves_series_empty() {
    let dir = TempDir::new().unwrap();
    let store = BrickStore::open(&dir.path().join("renko.sqlite")).unwrap();
    let mut registry = SeriesRegistry::new("RB99", 1.0, &specs(&["5", "10"]));
    assert!(resume(&store, &mut registry).unwrap().is_none());
    for (_, entry) in registry.entries_mut() {
        assert!(entry.series.is_empty());
        assert!(entry.watermark.is_none());
    }
}

#[test]
/// A run interrupted mid-stream and resumed over the same replayed history
/// converges on the same persisted bricks as a single uninterrupted run.
fn resumed_run_matches_from_scratch_run() {
    let ticks = tick_stream();

    // Reference: one uninterrupted run.
    let full_dir = TempDir::new().unwrap();
    let full_store = BrickStore::open(&full_dir.path().join("renko.sqlite")).unwrap();
    let mut full_registry = SeriesRegistry::new("RB99", 1.0, &specs(&["5", "10"]));
    let mut full_sink = StoreSink::new(full_store);
    for t in &ticks {
        full_registry.on_tick(t, &mut full_sink).unwrap();
    }
    let full_store = full_sink.into_store();

    // Interrupted run: first 7 ticks, then a fresh process replays the whole
    // range and lets the per-series watermarks discard what is covered.
    let part_dir = TempDir::new().unwrap();
    let part_store = BrickStore::open(&part_dir.path().join("renko.sqlite")).unwrap();
    let mut part_registry = SeriesRegistry::new("RB99", 1.0, &specs(&["5", "10"]));
    let mut part_sink = StoreSink::new(part_store);
    for t in &ticks[..7] {
        part_registry.on_tick(t, &mut part_sink).unwrap();
    }
    let part_store = part_sink.into_store();

    let mut resumed_registry = SeriesRegistry::new("RB99", 1.0, &specs(&["5", "10"]));
    resume(&part_store, &mut resumed_registry).unwrap();
    let mut resumed_sink = StoreSink::new(part_store);
    for t in &ticks {
        resumed_registry.on_tick(t, &mut resumed_sink).unwrap();
    }
    let part_store = resumed_sink.into_store();

    for key in ["RB99_5", "RB99_10"] {
        let expected = full_store.query_range(key, ts(0), ts(100_000)).unwrap();
        let actual = part_store.query_range(key, ts(0), ts(100_000)).unwrap();
        assert_eq!(
            expected.len(),
            actual.len(),
            "brick count diverged for {}",
            key
        );
        for (e, a) in expected.iter().zip(&actual) {
            assert_eq!(e.open_time, a.open_time, "open_time diverged for {}", key);
            assert_eq!(e.seconds, a.seconds, "duration diverged for {}", key);
            assert!((e.open - a.open).abs() < f64::EPSILON);
            assert!((e.close - a.close).abs() < f64::EPSILON);
            assert_eq!(e.color, a.color);
        }
    }
}
