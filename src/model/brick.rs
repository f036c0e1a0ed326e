use chrono::{Duration, NaiveDate, NaiveDateTime};

/// Direction of a brick, derived from close vs. open at close time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrickColor {
    Up,
    Down,
    Flat,
}

impl BrickColor {
    pub fn from_prices(open: f64, close: f64) -> Self {
        if close > open {
            Self::Up
        } else if close < open {
            Self::Down
        } else {
            Self::Flat
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Flat => "flat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "flat" => Some(Self::Flat),
            _ => None,
        }
    }
}

impl std::fmt::Display for BrickColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One Renko brick. While a series is accumulating, its current brick lives in
/// memory and mutates; once a threshold is crossed the brick is closed,
/// handed to the sink, and never touched again.
#[derive(Debug, Clone)]
pub struct Brick {
    pub series_key: String,
    pub instrument: String,
    pub height_label: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub open_time: NaiveDateTime,
    /// Duration of the brick in seconds (close_time - open_time).
    pub seconds: i64,
    pub color: BrickColor,
    pub trading_day: NaiveDate,
}

impl Brick {
    pub fn close_time(&self) -> NaiveDateTime {
        self.open_time + Duration::seconds(self.seconds)
    }

    /// OHLC sanity: low <= min(open, close) <= max(open, close) <= high.
    pub fn is_valid_ohlc(&self) -> bool {
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo && hi <= self.high
    }
}
