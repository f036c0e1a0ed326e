use anyhow::Result;
use chrono::NaiveDateTime;

use crate::config::{HeightMode, HeightSpec};
use crate::model::brick::{Brick, BrickColor};
use crate::model::tick::Tick;

/// Tolerance for threshold comparisons on f64 prices.
const PRICE_EPS: f64 = 1e-9;

/// Receives each closed brick exactly once, in emission order. Persistence,
/// strategies, and test harnesses are interchangeable implementations; the
/// series knows nothing about what consumes its output.
pub trait BrickSink {
    fn on_brick(&mut self, brick: &Brick) -> Result<()>;
}

impl BrickSink for Vec<Brick> {
    fn on_brick(&mut self, brick: &Brick) -> Result<()> {
        self.push(brick.clone());
        Ok(())
    }
}

/// Single-instrument, single-height brick construction state machine.
/// Pure and synchronous; no I/O. Mutated only by the consume loop that owns
/// its registry, so no internal locking.
#[derive(Debug)]
pub struct BrickSeries {
    series_key: String,
    instrument: String,
    height_label: String,
    price_tick: f64,
    mode: HeightMode,
    /// Active threshold in absolute price units.
    height: f64,
    /// The currently open brick; absent until the first accepted tick.
    current: Option<Brick>,
    /// Latest accepted tick timestamp; older ticks are discarded.
    last_tick_ts: Option<NaiveDateTime>,
}

impl BrickSeries {
    pub fn new(instrument: &str, price_tick: f64, spec: &HeightSpec) -> Self {
        let instrument = instrument.to_ascii_uppercase();
        Self {
            series_key: format!("{}_{}", instrument, spec.label),
            instrument,
            height_label: spec.label.clone(),
            price_tick,
            mode: spec.mode,
            height: spec.initial_height(price_tick).max(price_tick),
            current: None,
            last_tick_ts: None,
        }
    }

    pub fn series_key(&self) -> &str {
        &self.series_key
    }

    pub fn height_label(&self) -> &str {
        &self.height_label
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn current(&self) -> Option<&Brick> {
        self.current.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Threshold in price units for a per-mille height at the given price level.
    fn per_mille_height(&self, price: f64, k: u32) -> f64 {
        let ticks = (price / 1000.0 * f64::from(k)).round();
        (ticks * self.price_tick).max(self.price_tick)
    }

    /// Recompute the threshold for subsequent bricks. Already-closed bricks
    /// and the currently open one keep their shape. Per-mille series derive
    /// the height from the reference price; fixed and smoothed series take
    /// the supplied height verbatim.
    pub fn update_height(&mut self, reference_price: f64, new_height: f64) {
        self.height = match self.mode {
            HeightMode::PerMille { k } => self.per_mille_height(reference_price, k),
            HeightMode::Fixed { .. } | HeightMode::Smoothed { .. } => {
                if new_height > 0.0 {
                    new_height
                } else {
                    self.height
                }
            }
        };
    }

    /// Seed the series from the last persisted brick without emitting it.
    /// The record becomes the open brick again: the first replayed tick at or
    /// after the watermark re-closes it onto the same storage key, which the
    /// idempotent upsert absorbs, and everything after continues as a
    /// from-scratch run would have.
    pub fn resume_from(&mut self, brick: Brick) {
        self.last_tick_ts = Some(brick.close_time());
        self.current = Some(brick);
    }

    fn open_brick(&self, price: f64, volume: f64, timestamp: NaiveDateTime) -> Brick {
        Brick {
            series_key: self.series_key.clone(),
            instrument: self.instrument.clone(),
            height_label: self.height_label.clone(),
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            open_time: timestamp,
            seconds: 0,
            color: BrickColor::Flat,
            trading_day: timestamp.date(),
        }
    }

    /// Fold one tick into the series. Closes and emits as many bricks as the
    /// price movement spans; a gap of k thresholds yields k same-colored
    /// bricks from this one call, each exactly one height tall.
    pub fn on_tick(&mut self, tick: &Tick, sink: &mut dyn BrickSink) -> Result<()> {
        if let Some(last) = self.last_tick_ts {
            if tick.timestamp < last {
                tracing::debug!(
                    series = %self.series_key,
                    tick_ts = %tick.timestamp,
                    last_ts = %last,
                    "discarding out-of-order tick"
                );
                return Ok(());
            }
        }
        self.last_tick_ts = Some(tick.timestamp);

        if self.current.is_none() {
            if let HeightMode::PerMille { k } = self.mode {
                self.height = self.per_mille_height(tick.price, k);
            }
            self.current = Some(self.open_brick(tick.price, tick.volume, tick.timestamp));
            return Ok(());
        }

        let mut volume_pending = tick.volume;
        loop {
            let Some(cur) = self.current.as_mut() else {
                break;
            };
            cur.volume += volume_pending;
            volume_pending = 0.0;
            cur.seconds = (tick.timestamp - cur.open_time).num_seconds();

            let delta = tick.price - cur.open;
            if delta.abs() + PRICE_EPS < self.height {
                cur.high = cur.high.max(tick.price);
                cur.low = cur.low.min(tick.price);
                cur.close = tick.price;
                break;
            }

            // Close exactly at the threshold; the excess movement belongs to
            // the next brick in the chain.
            let close_price = if delta > 0.0 {
                cur.open + self.height
            } else {
                cur.open - self.height
            };
            cur.close = close_price;
            cur.high = cur.high.max(close_price);
            cur.low = cur.low.min(close_price);
            cur.color = BrickColor::from_prices(cur.open, close_price);
            debug_assert!(cur.is_valid_ohlc());

            let closed = cur.clone();
            sink.on_brick(&closed)?;

            if let HeightMode::PerMille { k } = self.mode {
                self.height = self.per_mille_height(close_price, k);
            }
            self.current = Some(self.open_brick(close_price, 0.0, tick.timestamp));
        }
        Ok(())
    }
}
