use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::session::InstrumentClass;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub instrument: InstrumentConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub exchange: String,
    pub class: InstrumentClass,
    pub price_tick: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Height labels, e.g. "10" (fixed), "5K" (per-mille of price), "10s" (smoothed).
    pub heights: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Resume from the store instead of rebuilding from scratch.
    #[serde(default)]
    pub refill: bool,
    #[serde(default = "default_inter_batch_delay_secs")]
    pub inter_batch_delay_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

fn default_inter_batch_delay_secs() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    2048
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub rest_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Hours whose bricks are auction artifacts, not continuous trading.
    #[serde(default = "default_auction_hours")]
    pub auction_hours: Vec<u32>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            auction_hours: default_auction_hours(),
        }
    }
}

fn default_auction_hours() -> Vec<u32> {
    vec![8, 20]
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Parsed form of a height label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeightSpec {
    /// The label exactly as configured; also part of the series key.
    pub label: String,
    pub mode: HeightMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeightMode {
    /// `price_tick * n`, constant for the life of the run.
    Fixed { n: u32 },
    /// `price_tick * round(price / 1000 * k)`, recomputed at each brick close.
    PerMille { k: u32 },
    /// Starts at `price_tick * n`, adjustable between bricks via `update_height`.
    Smoothed { n: u32 },
}

impl HeightSpec {
    /// Parse a label: "10" fixed, "5K" per-mille, a trailing "s" marks smoothed.
    pub fn parse(label: &str) -> Result<Self> {
        let full = label.trim();
        if full.is_empty() {
            bail!("height label is empty");
        }
        let (body, smoothed) = match full.strip_suffix('s') {
            Some(b) => (b, true),
            None => (full, false),
        };

        let mode = if let Some(k_str) = body.strip_suffix('K') {
            if smoothed {
                bail!("height '{}': per-mille heights cannot be smoothed", full);
            }
            let k: u32 = k_str
                .parse()
                .with_context(|| format!("height '{}': invalid per-mille quantity", full))?;
            if k == 0 {
                bail!("height '{}': per-mille quantity must be > 0", full);
            }
            HeightMode::PerMille { k }
        } else {
            let n: u32 = body
                .parse()
                .with_context(|| format!("height '{}': invalid tick multiple", full))?;
            if n == 0 {
                bail!("height '{}': tick multiple must be > 0", full);
            }
            if smoothed {
                HeightMode::Smoothed { n }
            } else {
                HeightMode::Fixed { n }
            }
        };

        Ok(Self {
            label: full.to_string(),
            mode,
        })
    }

    /// The threshold seeded at series construction, before any price is known.
    pub fn initial_height(&self, price_tick: f64) -> f64 {
        match self.mode {
            HeightMode::Fixed { n } | HeightMode::Smoothed { n } => price_tick * f64::from(n),
            // Per-mille heights use K ticks as the seed until the first price arrives.
            HeightMode::PerMille { k } => price_tick * f64::from(k),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Fatal configuration checks, run before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.instrument.symbol.trim().is_empty() {
            bail!("instrument.symbol must not be empty");
        }
        if !(self.instrument.price_tick > 0.0) {
            bail!(
                "instrument.price_tick must be > 0, got {}",
                self.instrument.price_tick
            );
        }
        if self.pipeline.heights.is_empty() {
            bail!("pipeline.heights must name at least one height");
        }
        for label in &self.pipeline.heights {
            HeightSpec::parse(label)
                .with_context(|| format!("pipeline.heights entry '{}' is invalid", label))?;
        }
        if self.pipeline.start_date > self.pipeline.end_date {
            bail!(
                "pipeline.start_date {} is after end_date {}",
                self.pipeline.start_date,
                self.pipeline.end_date
            );
        }
        if self.pipeline.queue_capacity == 0 {
            bail!("pipeline.queue_capacity must be > 0");
        }
        if self.pipeline.poll_timeout_ms == 0 {
            bail!("pipeline.poll_timeout_ms must be > 0");
        }
        Ok(())
    }

    pub fn height_specs(&self) -> Result<Vec<HeightSpec>> {
        self.pipeline
            .heights
            .iter()
            .map(|label| HeightSpec::parse(label))
            .collect()
    }

    pub fn series_key(&self, label: &str) -> String {
        format!("{}_{}", self.instrument.symbol.to_ascii_uppercase(), label)
    }
}
