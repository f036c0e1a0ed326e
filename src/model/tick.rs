use chrono::{NaiveDate, NaiveDateTime};

/// One trade print from the historical feed. Immutable once created; the
/// trading day is the only derived field.
#[derive(Debug, Clone)]
pub struct Tick {
    pub instrument: String,
    pub exchange: String,
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub volume: f64,
    pub trading_day: NaiveDate,
}

impl Tick {
    pub fn new(
        instrument: &str,
        exchange: &str,
        timestamp: NaiveDateTime,
        price: f64,
        volume: f64,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            exchange: exchange.to_string(),
            timestamp,
            price,
            volume,
            trading_day: timestamp.date(),
        }
    }
}
