use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use std::time::Duration;

use crate::config::Config;
use crate::error::AppError;
use crate::model::tick::Tick;
use crate::queue::{tick_queue, QueuePoll, RawTick, TickConsumer, TickProducer};
use crate::registry::SeriesRegistry;
use crate::resume;
use crate::session::SessionFilter;
use crate::source::TickSource;
use crate::store::{BrickStore, StoreSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub days_fetched: u32,
    pub days_failed: u32,
    pub ticks_enqueued: u64,
    pub ticks_processed: u64,
    pub ticks_session_filtered: u64,
    pub malformed_ticks: u64,
    pub tick_errors: u64,
    pub bricks_persisted: u64,
    pub upsert_failures: u64,
}

#[derive(Debug, Default)]
struct ConsumeStats {
    processed: u64,
    session_filtered: u64,
    malformed: u64,
    errors: u64,
    persisted: u64,
    upsert_failures: u64,
}

/// One-shot batch rebuild for a single instrument: resume, fetch day by day,
/// feed the consume loop through the bounded queue, then drain, index, and
/// stop. Owns the queue, the consumer task handle, and the lifecycle state;
/// an embedding application composes controllers instead of one per process.
///
/// Hazard: running two controllers concurrently against the same series keys
/// in the same store is undefined; one pipeline instance per instrument is
/// assumed.
pub struct PipelineController<S> {
    config: Config,
    source: S,
    state: PipelineState,
}

impl<S: TickSource> PipelineController<S> {
    pub fn new(config: Config, source: S) -> Result<Self> {
        // Fail fast on an unusable instance, before any I/O.
        config.validate()?;
        Ok(Self {
            config,
            source,
            state: PipelineState::Created,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        let specs = self.config.height_specs()?;
        let instrument = self.config.instrument.symbol.to_ascii_uppercase();
        let mut registry =
            SeriesRegistry::new(&instrument, self.config.instrument.price_tick, &specs);
        let series_keys = registry.series_keys();

        let store = BrickStore::open(&self.config.store.path)?;
        let global_watermark = if self.config.pipeline.refill {
            resume::resume(&store, &mut registry)?
        } else {
            None
        };

        let (producer, consumer) = tick_queue(
            self.config.pipeline.queue_capacity,
            Duration::from_millis(self.config.pipeline.poll_timeout_ms),
        );
        let filter = SessionFilter::for_class(self.config.instrument.class);
        let exchange = self.config.instrument.exchange.clone();
        let sink = StoreSink::new(store);

        let consumer_handle = tokio::spawn(consume_loop(
            consumer,
            registry,
            sink,
            filter,
            instrument.clone(),
            exchange,
        ));
        self.state = PipelineState::Running;

        let mut summary = RunSummary::default();
        self.fetch_loop(&instrument, global_watermark, &producer, &mut summary)
            .await;

        self.state = PipelineState::Draining;
        producer.mark_loaded();

        let (stats, store) = consumer_handle
            .await
            .context("consume loop task panicked")?;
        summary.ticks_processed = stats.processed;
        summary.ticks_session_filtered = stats.session_filtered;
        summary.malformed_ticks = stats.malformed;
        summary.tick_errors = stats.errors;
        summary.bricks_persisted = stats.persisted;
        summary.upsert_failures = stats.upsert_failures;

        store.ensure_indexes()?;
        for key in &series_keys {
            store.update_latest_close(key)?;
        }

        self.state = PipelineState::Stopped;
        tracing::info!(
            instrument = %instrument,
            days_fetched = summary.days_fetched,
            days_failed = summary.days_failed,
            ticks_enqueued = summary.ticks_enqueued,
            ticks_processed = summary.ticks_processed,
            bricks_persisted = summary.bricks_persisted,
            "rebuild finished"
        );
        Ok(summary)
    }

    /// Iterate calendar days, request each tick batch, filter ticks already
    /// covered by the watermark, and enqueue the rest. Paced with a fixed
    /// delay between batches so the external source is not hammered.
    async fn fetch_loop(
        &self,
        instrument: &str,
        global_watermark: Option<NaiveDateTime>,
        producer: &TickProducer,
        summary: &mut RunSummary,
    ) {
        let start_day = effective_start_day(self.config.pipeline.start_date, global_watermark);
        let end_day = self
            .config
            .pipeline
            .end_date
            .min(chrono::Utc::now().date_naive());
        tracing::info!(
            instrument,
            start = %start_day,
            end = %end_day,
            watermark = ?global_watermark,
            "starting historical fetch"
        );

        let mut last_tick_ts: Option<NaiveDateTime> = None;
        let mut day = start_day;
        while day <= end_day {
            match self.source.fetch_day(instrument, day).await {
                Err(e) => {
                    summary.days_failed += 1;
                    tracing::error!(instrument, day = %day, error = %e, "day fetch failed, skipping");
                }
                Ok(ticks) => {
                    summary.days_fetched += 1;
                    for tick in ticks {
                        // Within-stream monotonic guard: stale repeats from the
                        // source are dropped before they reach the queue.
                        if let Some(last) = last_tick_ts {
                            if tick.timestamp < last {
                                continue;
                            }
                        }
                        last_tick_ts = Some(tick.timestamp);

                        if let Some(watermark) = global_watermark {
                            if tick.timestamp < watermark {
                                continue;
                            }
                        }

                        let raw = RawTick {
                            timestamp: tick.timestamp,
                            price: tick.price,
                            volume: tick.volume,
                        };
                        if !producer.enqueue(raw).await {
                            tracing::warn!("consume loop hung up, stopping fetch");
                            return;
                        }
                        summary.ticks_enqueued += 1;
                    }
                }
            }

            let Some(next) = day.succ_opt() else { break };
            day = next;
            if day <= end_day && self.config.pipeline.inter_batch_delay_secs > 0 {
                tokio::time::sleep(Duration::from_secs(
                    self.config.pipeline.inter_batch_delay_secs,
                ))
                .await;
            }
        }
    }
}

fn effective_start_day(start_date: NaiveDate, watermark: Option<NaiveDateTime>) -> NaiveDate {
    match watermark {
        Some(w) if w.date() > start_date => w.date(),
        _ => start_date,
    }
}

fn validate_raw(raw: &RawTick) -> Result<(), AppError> {
    if !raw.price.is_finite() || raw.price <= 0.0 {
        return Err(AppError::MalformedTick {
            timestamp: raw.timestamp.to_string(),
            reason: format!("non-positive price {}", raw.price),
        });
    }
    if !raw.volume.is_finite() || raw.volume < 0.0 {
        return Err(AppError::MalformedTick {
            timestamp: raw.timestamp.to_string(),
            reason: format!("negative volume {}", raw.volume),
        });
    }
    Ok(())
}

/// Dequeue ticks, apply the session filter, feed the registry, persist
/// closed bricks. Exits exactly when production is finished and the queue is
/// drained; a failure on a single tick is logged and the loop continues.
async fn consume_loop(
    mut consumer: TickConsumer,
    mut registry: SeriesRegistry,
    mut sink: StoreSink,
    filter: SessionFilter,
    instrument: String,
    exchange: String,
) -> (ConsumeStats, BrickStore) {
    let mut stats = ConsumeStats::default();
    loop {
        match consumer.poll().await {
            QueuePoll::Tick(raw) => {
                if let Err(e) = validate_raw(&raw) {
                    stats.malformed += 1;
                    tracing::warn!(error = %e, "dropping malformed tick");
                    continue;
                }
                if filter.should_discard(&raw.timestamp) {
                    stats.session_filtered += 1;
                    continue;
                }
                let tick = Tick::new(&instrument, &exchange, raw.timestamp, raw.price, raw.volume);
                match registry.on_tick(&tick, &mut sink) {
                    Ok(()) => stats.processed += 1,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(
                            timestamp = %raw.timestamp,
                            price = raw.price,
                            error = %e,
                            "tick processing failed, continuing"
                        );
                    }
                }
            }
            QueuePoll::TimedOut => {
                if consumer.is_finished() {
                    tracing::info!("queue drained and production finished");
                    break;
                }
            }
            QueuePoll::Disconnected => {
                tracing::info!("producer hung up, queue drained");
                break;
            }
        }
    }
    stats.persisted = sink.persisted;
    stats.upsert_failures = sink.failures;
    (stats, sink.into_store())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_start_prefers_later_watermark() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let w = NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap();
        assert_eq!(
            effective_start_day(start, Some(w)),
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
        );
        assert_eq!(effective_start_day(start, None), start);

        let earlier = NaiveDate::from_ymd_opt(2023, 12, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        assert_eq!(effective_start_day(start, Some(earlier)), start);
    }

    #[test]
    fn raw_tick_validation() {
        let at = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let good = RawTick {
            timestamp: at,
            price: 100.0,
            volume: 2.0,
        };
        assert!(validate_raw(&good).is_ok());
        assert!(validate_raw(&RawTick { price: 0.0, ..good }).is_err());
        assert!(validate_raw(&RawTick {
            price: f64::NAN,
            ..good
        })
        .is_err());
        assert!(validate_raw(&RawTick {
            volume: -1.0,
            ..good
        })
        .is_err());
    }
}
