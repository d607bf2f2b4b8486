/// Live quote snapshot built from tick callbacks
use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::types::{Bar, TickType};
use crate::utils::format_ib_datetime;

/// Running view of the latest ticks for one subscription
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteSnapshot {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    /// Previous session close
    pub close: Option<f64>,
    pub volume: Option<i64>,
    pub last_trade_time: Option<DateTime<Utc>>,
}

impl QuoteSnapshot {
    /// Apply a price tick; returns false for tick kinds the snapshot ignores
    pub fn apply_price(&mut self, tick_type: TickType, price: f64) -> bool {
        // The gateway sends -1 when a price is not available
        if !price.is_finite() || price < 0.0 {
            return false;
        }

        let slot = match tick_type {
            TickType::Bid => &mut self.bid,
            TickType::Ask => &mut self.ask,
            TickType::Last => &mut self.last,
            TickType::Open => &mut self.open,
            TickType::High => &mut self.high,
            TickType::Low => &mut self.low,
            TickType::Close => &mut self.close,
            TickType::Volume | TickType::LastTimestamp | TickType::Other(_) => return false,
        };

        *slot = Some(price);
        true
    }

    /// Apply a size tick; only cumulative volume is tracked
    pub fn apply_size(&mut self, tick_type: TickType, size: i64) -> bool {
        match tick_type {
            TickType::Volume if size >= 0 => {
                self.volume = Some(size);
                true
            }
            _ => false,
        }
    }

    /// Apply a string tick; only the last trade time (unix seconds) is tracked
    pub fn apply_string(&mut self, tick_type: TickType, value: &str) -> bool {
        if tick_type != TickType::LastTimestamp {
            return false;
        }

        match value.trim().parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0)) {
            Some(time) => {
                self.last_trade_time = Some(time);
                true
            }
            None => false,
        }
    }

    /// Last trade price, falling back to the previous close
    pub fn price(&self) -> Option<f64> {
        self.last.or(self.close)
    }

    /// Materialize the snapshot as a bar record.
    ///
    /// The date is the last trade time when known, otherwise `received_at`, both
    /// rendered in `tz`. Missing open/high/low fall back to the current price.
    pub fn to_bar(&self, tz: Tz, received_at: DateTime<Utc>) -> Option<Bar> {
        let price = self.price()?;
        let stamp = self.last_trade_time.unwrap_or(received_at);

        Some(Bar {
            date: format_ib_datetime(stamp, tz),
            open: self.open.unwrap_or(price),
            high: self.high.unwrap_or(price),
            low: self.low.unwrap_or(price),
            close: price,
            volume: self.volume.unwrap_or(0),
        })
    }
}
