/// Time utilities for gateway timestamps
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{GatewayError, Result};

/// Timestamp layout used on the wire (`formatDate=1`)
pub const IB_DATETIME_FORMAT: &str = "%Y%m%d %H:%M:%S";

/// Parse a zone name such as `US/Eastern` or `America/New_York`
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| GatewayError::ParseError(format!("Unknown timezone '{}': {}", name, e)))
}

/// Parse a gateway timestamp.
///
/// Accepts `YYYYMMDD HH:MM:SS`, the same with a trailing zone name, the UTC form
/// `YYYYMMDD-HH:MM:SS`, and date-only `YYYYMMDD` (daily bars). The zone suffix is
/// dropped; the result is the wall-clock time as written.
pub fn parse_ib_datetime(s: &str) -> Result<NaiveDateTime> {
    let (naive, _) = split_ib_datetime(s)?;
    Ok(naive)
}

/// Split a timestamp into wall-clock time and optional zone name
fn split_ib_datetime(s: &str) -> Result<(NaiveDateTime, Option<&str>)> {
    let s = s.trim();
    let mut parts = s.split_whitespace();

    let date_part = parts
        .next()
        .ok_or_else(|| GatewayError::ParseError("Empty timestamp".to_string()))?;

    if let Some((date, time)) = date_part.split_once('-') {
        let naive = parse_date_time(date, time, s)?;
        return Ok((naive, Some("UTC")));
    }

    match parts.next() {
        None => {
            let date = NaiveDate::parse_from_str(date_part, "%Y%m%d")
                .map_err(|e| GatewayError::ParseError(format!("Invalid date '{}': {}", s, e)))?;
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| GatewayError::ParseError(format!("Invalid date '{}'", s)))?;
            Ok((midnight, None))
        }
        Some(time_part) => {
            let naive = parse_date_time(date_part, time_part, s)?;
            Ok((naive, parts.next()))
        }
    }
}

fn parse_date_time(date: &str, time: &str, original: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(&format!("{} {}", date, time), IB_DATETIME_FORMAT)
        .map_err(|e| GatewayError::ParseError(format!("Invalid timestamp '{}': {}", original, e)))
}

/// Build a request end time: wall clock in `tz`, suffixed with the zone name
pub fn format_query_time(wall_clock: NaiveDateTime, tz: Tz) -> String {
    format!("{} {}", wall_clock.format(IB_DATETIME_FORMAT), tz.name())
}

/// Resolve a request end time to an instant. Empty means "now" and yields `None`.
///
/// Without a zone suffix the wall clock is read in `default_tz`.
pub fn parse_query_time(s: &str, default_tz: Tz) -> Result<Option<DateTime<Utc>>> {
    if s.trim().is_empty() {
        return Ok(None);
    }

    let (naive, zone) = split_ib_datetime(s)?;
    let tz = match zone {
        Some(name) => parse_timezone(name)?,
        None => default_tz,
    };

    let local = tz.from_local_datetime(&naive).earliest().ok_or_else(|| {
        GatewayError::ParseError(format!("'{}' does not exist in {}", s, tz.name()))
    })?;

    Ok(Some(local.with_timezone(&Utc)))
}

/// Format an instant as a gateway timestamp in `tz`
pub fn format_ib_datetime(instant: DateTime<Utc>, tz: Tz) -> String {
    instant.with_timezone(&tz).format(IB_DATETIME_FORMAT).to_string()
}
