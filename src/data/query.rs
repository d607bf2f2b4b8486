/// Historical bar request parameters
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Data type requested for historical bars
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhatToShow {
    Trades,
    Midpoint,
    Bid,
    Ask,
    BidAsk,
    AdjustedLast,
    HistoricalVolatility,
    OptionImpliedVolatility,
}

impl WhatToShow {
    pub fn as_str(&self) -> &str {
        match self {
            WhatToShow::Trades => "TRADES",
            WhatToShow::Midpoint => "MIDPOINT",
            WhatToShow::Bid => "BID",
            WhatToShow::Ask => "ASK",
            WhatToShow::BidAsk => "BID_ASK",
            WhatToShow::AdjustedLast => "ADJUSTED_LAST",
            WhatToShow::HistoricalVolatility => "HISTORICAL_VOLATILITY",
            WhatToShow::OptionImpliedVolatility => "OPTION_IMPLIED_VOLATILITY",
        }
    }
}

/// Bar sizes the gateway accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarSize {
    Sec,
    Sec5,
    Sec10,
    Sec15,
    Sec30,
    Min,
    Min2,
    Min3,
    Min5,
    Min10,
    Min15,
    Min20,
    Min30,
    Hour,
    Hour2,
    Hour3,
    Hour4,
    Hour8,
    Day,
    Week,
    Month,
}

impl BarSize {
    pub fn as_str(&self) -> &str {
        match self {
            BarSize::Sec => "1 secs",
            BarSize::Sec5 => "5 secs",
            BarSize::Sec10 => "10 secs",
            BarSize::Sec15 => "15 secs",
            BarSize::Sec30 => "30 secs",
            BarSize::Min => "1 min",
            BarSize::Min2 => "2 mins",
            BarSize::Min3 => "3 mins",
            BarSize::Min5 => "5 mins",
            BarSize::Min10 => "10 mins",
            BarSize::Min15 => "15 mins",
            BarSize::Min20 => "20 mins",
            BarSize::Min30 => "30 mins",
            BarSize::Hour => "1 hour",
            BarSize::Hour2 => "2 hours",
            BarSize::Hour3 => "3 hours",
            BarSize::Hour4 => "4 hours",
            BarSize::Hour8 => "8 hours",
            BarSize::Day => "1 day",
            BarSize::Week => "1 week",
            BarSize::Month => "1 month",
        }
    }

    /// Parse a bar size setting such as `1 hour` or `30 secs`
    pub fn from_setting(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

        let size = match normalized.as_str() {
            "1 secs" | "1 sec" => BarSize::Sec,
            "5 secs" => BarSize::Sec5,
            "10 secs" => BarSize::Sec10,
            "15 secs" => BarSize::Sec15,
            "30 secs" => BarSize::Sec30,
            "1 min" => BarSize::Min,
            "2 mins" => BarSize::Min2,
            "3 mins" => BarSize::Min3,
            "5 mins" => BarSize::Min5,
            "10 mins" => BarSize::Min10,
            "15 mins" => BarSize::Min15,
            "20 mins" => BarSize::Min20,
            "30 mins" => BarSize::Min30,
            "1 hour" => BarSize::Hour,
            "2 hours" => BarSize::Hour2,
            "3 hours" => BarSize::Hour3,
            "4 hours" => BarSize::Hour4,
            "8 hours" => BarSize::Hour8,
            "1 day" => BarSize::Day,
            "1 week" | "1w" => BarSize::Week,
            "1 month" => BarSize::Month,
            _ => {
                return Err(GatewayError::InvalidParameter(format!(
                    "Unsupported bar size setting: '{}'",
                    s
                )))
            }
        };

        Ok(size)
    }
}

/// Unit of a duration string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationUnit {
    Seconds,
    Days,
    Weeks,
    Months,
    Years,
}

/// Parsed duration string, e.g. `1 D`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationSpec {
    pub amount: i32,
    pub unit: DurationUnit,
}

impl DurationSpec {
    /// Parse `<n> S|D|W|M|Y`
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || GatewayError::InvalidParameter(format!("Invalid duration string: '{}'", s));

        let mut parts = s.split_whitespace();
        let amount = parts
            .next()
            .and_then(|n| n.parse::<i32>().ok())
            .filter(|n| *n > 0)
            .ok_or_else(invalid)?;

        let unit = match parts.next() {
            Some("S") => DurationUnit::Seconds,
            Some("D") => DurationUnit::Days,
            Some("W") => DurationUnit::Weeks,
            Some("M") => DurationUnit::Months,
            Some("Y") => DurationUnit::Years,
            _ => return Err(invalid()),
        };

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(DurationSpec { amount, unit })
    }
}

/// Historical bars request window and format
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalQuery {
    /// `YYYYMMDD HH:MM:SS[ zone]`; empty means "now"
    pub end_date_time: String,
    pub duration: String,
    pub bar_size: String,
    pub what_to_show: WhatToShow,
    pub use_rth: bool,
    /// 1 renders bar dates as `YYYYMMDD HH:MM:SS`, 2 as unix seconds
    pub format_date: i32,
    /// Streaming bar updates; only `false` is accepted
    pub keep_up_to_date: bool,
}

impl Default for HistoricalQuery {
    fn default() -> Self {
        HistoricalQuery {
            end_date_time: String::new(),
            duration: "1 D".to_string(),
            bar_size: "1 hour".to_string(),
            what_to_show: WhatToShow::Trades,
            use_rth: false,
            format_date: 1,
            keep_up_to_date: false,
        }
    }
}

impl HistoricalQuery {
    /// Query ending at `end_date_time` with the given window and bar size
    pub fn new(end_date_time: &str, duration: &str, bar_size: &str) -> Self {
        HistoricalQuery {
            end_date_time: end_date_time.to_string(),
            duration: duration.to_string(),
            bar_size: bar_size.to_string(),
            ..Default::default()
        }
    }

    pub fn duration_spec(&self) -> Result<DurationSpec> {
        DurationSpec::parse(&self.duration)
    }

    pub fn bar_size_setting(&self) -> Result<BarSize> {
        BarSize::from_setting(&self.bar_size)
    }

    pub fn validate(&self) -> Result<()> {
        self.duration_spec()?;
        self.bar_size_setting()?;

        if self.format_date != 1 && self.format_date != 2 {
            return Err(GatewayError::InvalidParameter(format!(
                "format_date must be 1 or 2, got {}",
                self.format_date
            )));
        }

        if self.keep_up_to_date {
            return Err(GatewayError::InvalidParameter(
                "keep_up_to_date requests are not supported; bars are fetched once".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_query() {
        let query = HistoricalQuery::default();
        assert_eq!(query.end_date_time, "");
        assert_eq!(query.duration, "1 D");
        assert_eq!(query.bar_size, "1 hour");
        assert_eq!(query.what_to_show.as_str(), "TRADES");
        assert!(!query.use_rth);
        assert_eq!(query.format_date, 1);
        assert!(!query.keep_up_to_date);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(
            DurationSpec::parse("1 D").unwrap(),
            DurationSpec { amount: 1, unit: DurationUnit::Days }
        );
        assert_eq!(DurationSpec::parse("3600 S").unwrap().unit, DurationUnit::Seconds);
        assert!(DurationSpec::parse("1D").is_err());
        assert!(DurationSpec::parse("0 D").is_err());
        assert!(DurationSpec::parse("2 X").is_err());
        assert!(DurationSpec::parse("1 D extra").is_err());
    }

    #[test]
    fn test_bar_size_parsing() {
        assert_eq!(BarSize::from_setting("1 hour").unwrap(), BarSize::Hour);
        assert_eq!(BarSize::from_setting("30  secs").unwrap(), BarSize::Sec30);
        assert_eq!(BarSize::from_setting("1 Day").unwrap(), BarSize::Day);
        assert!(BarSize::from_setting("7 mins").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let query = HistoricalQuery::new("", "one day", "1 hour");
        assert!(query.validate().is_err());

        let query = HistoricalQuery::new("", "1 D", "90 mins");
        assert!(query.validate().is_err());
    }

    #[test]
    fn test_validate_format_options() {
        let epoch = HistoricalQuery {
            format_date: 2,
            ..Default::default()
        };
        assert!(epoch.validate().is_ok());

        let unknown = HistoricalQuery {
            format_date: 3,
            ..Default::default()
        };
        assert!(unknown.validate().is_err());

        let streaming = HistoricalQuery {
            keep_up_to_date: true,
            ..Default::default()
        };
        assert!(matches!(streaming.validate(), Err(GatewayError::InvalidParameter(_))));
    }
}
