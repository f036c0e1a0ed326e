use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

use crate::config::HeightSpec;
use crate::model::tick::Tick;
use crate::series::{BrickSeries, BrickSink};

/// One configured height for an instrument: the series plus its resume
/// watermark. Ticks older than the watermark are already represented in
/// storage for this series and must not be replayed into it.
#[derive(Debug)]
pub struct SeriesEntry {
    pub series: BrickSeries,
    pub watermark: Option<NaiveDateTime>,
}

/// Owns one BrickSeries per configured height for a single instrument and
/// fans each tick out to all of them. Different heights may resume from
/// different watermarks, so the skip decision is per series, never global.
#[derive(Debug)]
pub struct SeriesRegistry {
    instrument: String,
    entries: BTreeMap<String, SeriesEntry>,
}

impl SeriesRegistry {
    pub fn new(instrument: &str, price_tick: f64, specs: &[HeightSpec]) -> Self {
        let instrument = instrument.to_ascii_uppercase();
        let mut entries = BTreeMap::new();
        for spec in specs {
            let series = BrickSeries::new(&instrument, price_tick, spec);
            entries.insert(
                series.series_key().to_string(),
                SeriesEntry {
                    series,
                    watermark: None,
                },
            );
        }
        Self {
            instrument,
            entries,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn series_keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = (&String, &mut SeriesEntry)> {
        self.entries.iter_mut()
    }

    pub fn entry(&self, series_key: &str) -> Option<&SeriesEntry> {
        self.entries.get(series_key)
    }

    /// Fan one tick out to every series whose watermark does not already
    /// cover it.
    pub fn on_tick(&mut self, tick: &Tick, sink: &mut dyn BrickSink) -> Result<()> {
        for entry in self.entries.values_mut() {
            if let Some(watermark) = entry.watermark {
                if tick.timestamp < watermark {
                    continue;
                }
            }
            entry.series.on_tick(tick, sink)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::brick::Brick;
    use chrono::NaiveDate;

    fn ts(secs: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(i64::from(secs))
    }

    fn tick_at(price: f64, secs: u32) -> Tick {
        Tick::new("RB99", "SHFE", ts(secs), price, 1.0)
    }

    fn registry(labels: &[&str]) -> SeriesRegistry {
        let specs: Vec<_> = labels
            .iter()
            .map(|l| HeightSpec::parse(l).unwrap())
            .collect();
        SeriesRegistry::new("rb99", 1.0, &specs)
    }

    #[test]
    fn fans_tick_to_all_series() {
        let mut reg = registry(&["5", "10"]);
        let mut sink: Vec<Brick> = Vec::new();
        reg.on_tick(&tick_at(100.0, 0), &mut sink).unwrap();
        reg.on_tick(&tick_at(110.0, 1), &mut sink).unwrap();
        // 10-point move: two bricks from the 5-series, one from the 10-series.
        assert_eq!(sink.len(), 3);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.instrument(), "RB99");
        assert_eq!(reg.series_keys(), vec!["RB99_10", "RB99_5"]);
    }

    #[test]
    fn watermark_skips_only_that_series() {
        let mut reg = registry(&["5", "10"]);
        for (_, entry) in reg.entries_mut() {
            if entry.series.height_label() == "10" {
                entry.watermark = Some(ts(100));
            }
        }
        let mut sink: Vec<Brick> = Vec::new();
        // Before the 10-series watermark: only the 5-series sees these ticks.
        reg.on_tick(&tick_at(100.0, 0), &mut sink).unwrap();
        reg.on_tick(&tick_at(105.0, 1), &mut sink).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].series_key, "RB99_5");

        // At the watermark both series participate again.
        reg.on_tick(&tick_at(110.0, 100), &mut sink).unwrap();
        assert_eq!(sink.len(), 2);
    }
}
