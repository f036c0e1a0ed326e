use chrono::{NaiveDateTime, Timelike};
use serde::Deserialize;

/// Instrument class selects the default trading-session policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentClass {
    Stock,
    CommodityFuture,
    IndexFuture,
}

/// Pure tick-discard policy evaluated by the consume loop, keyed by
/// instrument class. The brick state machine itself never sees calendar
/// rules, which keeps it deterministic under test.
#[derive(Debug, Clone)]
pub struct SessionFilter {
    /// Whole hours with no continuous trading (settlement / night-session gap).
    blocked_hours: Vec<u32>,
    /// Opening-auction window: minutes of hour 9 strictly below this are discarded.
    pre_open_cutoff_min: Option<u32>,
}

impl SessionFilter {
    pub fn new(blocked_hours: Vec<u32>, pre_open_cutoff_min: Option<u32>) -> Self {
        Self {
            blocked_hours,
            pre_open_cutoff_min,
        }
    }

    pub fn for_class(class: InstrumentClass) -> Self {
        match class {
            InstrumentClass::Stock => Self::new(vec![], Some(30)),
            InstrumentClass::CommodityFuture => Self::new(vec![8, 20], None),
            InstrumentClass::IndexFuture => Self::new(vec![8, 20], Some(30)),
        }
    }

    pub fn should_discard(&self, timestamp: &NaiveDateTime) -> bool {
        let hour = timestamp.hour();
        if self.blocked_hours.contains(&hour) {
            return true;
        }
        if let Some(cutoff) = self.pre_open_cutoff_min {
            if hour == 9 && timestamp.minute() < cutoff {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn commodity_future_blocks_settlement_hours() {
        let f = SessionFilter::for_class(InstrumentClass::CommodityFuture);
        assert!(f.should_discard(&dt(8, 59)));
        assert!(f.should_discard(&dt(20, 0)));
        assert!(!f.should_discard(&dt(9, 0)));
        assert!(!f.should_discard(&dt(21, 0)));
    }

    #[test]
    fn index_future_also_blocks_pre_open_auction() {
        let f = SessionFilter::for_class(InstrumentClass::IndexFuture);
        assert!(f.should_discard(&dt(9, 0)));
        assert!(f.should_discard(&dt(9, 29)));
        assert!(!f.should_discard(&dt(9, 30)));
        assert!(f.should_discard(&dt(8, 30)));
    }

    #[test]
    fn stock_only_blocks_pre_open_auction() {
        let f = SessionFilter::for_class(InstrumentClass::Stock);
        assert!(f.should_discard(&dt(9, 15)));
        assert!(!f.should_discard(&dt(9, 30)));
        assert!(!f.should_discard(&dt(8, 0)));
        assert!(!f.should_discard(&dt(20, 0)));
    }
}
