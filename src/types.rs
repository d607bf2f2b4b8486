/// Core type definitions for the gateway client
use chrono::NaiveDateTime;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GatewayError, Result};
use crate::utils::parse_ib_datetime;

pub const DEFAULT_EXCHANGE: &str = "SMART";
pub const DEFAULT_CURRENCY: &str = "USD";

/// OHLCV bar record as delivered by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Gateway-formatted date, e.g. `20240101 09:30:00` or `20240101` for daily bars
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Bar {
    pub fn new(date: impl Into<String>, open: f64, high: f64, low: f64, close: f64, volume: i64) -> Self {
        Bar {
            date: date.into(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Parse the date column into a timestamp (zone suffix is ignored)
    pub fn timestamp(&self) -> Result<NaiveDateTime> {
        parse_ib_datetime(&self.date)
    }
}

/// Security type (subset used by this client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityType {
    Stock,
    Option,
}

impl SecurityType {
    pub fn as_str(&self) -> &str {
        match self {
            SecurityType::Stock => "STK",
            SecurityType::Option => "OPT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "STK" => Some(SecurityType::Stock),
            "OPT" => Some(SecurityType::Option),
            _ => None,
        }
    }
}

/// Option right (Call or Put)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    pub fn as_str(&self) -> &str {
        match self {
            OptionRight::Call => "C",
            OptionRight::Put => "P",
        }
    }

    /// Accepts `C`, `CALL`, `P`, `PUT` in any case
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "C" | "CALL" => Some(OptionRight::Call),
            "P" | "PUT" => Some(OptionRight::Put),
            _ => None,
        }
    }
}

/// Contract descriptor identifying a tradeable instrument.
///
/// Built fresh for every request and never mutated afterwards, so the fields are
/// only reachable through accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    symbol: String,
    security_type: SecurityType,
    exchange: String,
    currency: String,
    expiry: Option<String>,
    strike: Option<f64>,
    right: Option<OptionRight>,
}

impl Contract {
    /// Stock descriptor
    pub fn stock(symbol: &str, exchange: &str, currency: &str) -> Self {
        Contract {
            symbol: symbol.to_string(),
            security_type: SecurityType::Stock,
            exchange: exchange.to_string(),
            currency: currency.to_string(),
            expiry: None,
            strike: None,
            right: None,
        }
    }

    /// Stock descriptor routed through SMART in USD
    pub fn smart_stock(symbol: &str) -> Self {
        Self::stock(symbol, DEFAULT_EXCHANGE, DEFAULT_CURRENCY)
    }

    /// Option descriptor. `expiry` must be `YYYYMMDD`.
    pub fn option(
        symbol: &str,
        expiry: &str,
        strike: f64,
        right: OptionRight,
        exchange: &str,
        currency: &str,
    ) -> Result<Self> {
        if symbol.trim().is_empty() {
            return Err(GatewayError::InvalidContract("symbol is empty".to_string()));
        }

        if expiry.len() != 8 || NaiveDate::parse_from_str(expiry, "%Y%m%d").is_err() {
            return Err(GatewayError::InvalidContract(format!(
                "expiry must be YYYYMMDD, got '{}'",
                expiry
            )));
        }

        if !strike.is_finite() || strike <= 0.0 {
            return Err(GatewayError::InvalidContract(format!(
                "strike must be a positive number, got {}",
                strike
            )));
        }

        Ok(Contract {
            symbol: symbol.to_string(),
            security_type: SecurityType::Option,
            exchange: exchange.to_string(),
            currency: currency.to_string(),
            expiry: Some(expiry.to_string()),
            strike: Some(strike),
            right: Some(right),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn security_type(&self) -> SecurityType {
        self.security_type
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn expiry(&self) -> Option<&str> {
        self.expiry.as_deref()
    }

    pub fn strike(&self) -> Option<f64> {
        self.strike
    }

    pub fn right(&self) -> Option<OptionRight> {
        self.right
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.expiry, self.strike, self.right) {
            (Some(expiry), Some(strike), Some(right)) => write!(
                f,
                "{} {} {} {} {}@{} ({})",
                self.symbol,
                self.security_type.as_str(),
                expiry,
                strike,
                right.as_str(),
                self.exchange,
                self.currency
            ),
            _ => write!(
                f,
                "{} {} @{} ({})",
                self.symbol,
                self.security_type.as_str(),
                self.exchange,
                self.currency
            ),
        }
    }
}

/// Market data mode requested before a quote subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketDataType {
    Live,
    Frozen,
    Delayed,
    DelayedFrozen,
}

impl MarketDataType {
    /// Wire code sent with the market data type request
    pub fn code(&self) -> i32 {
        match self {
            MarketDataType::Live => 1,
            MarketDataType::Frozen => 2,
            MarketDataType::Delayed => 3,
            MarketDataType::DelayedFrozen => 4,
        }
    }
}

/// Price/size tick kinds a quote snapshot understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickType {
    Bid,
    Ask,
    Last,
    High,
    Low,
    Volume,
    Close,
    Open,
    /// Unix time of the last trade, delivered as a string tick
    LastTimestamp,
    Other(i32),
}

impl TickType {
    /// Map a gateway tick code, folding delayed ticks onto their live counterparts
    pub fn from_code(code: i32) -> Self {
        match code {
            1 | 66 => TickType::Bid,
            2 | 67 => TickType::Ask,
            4 | 68 => TickType::Last,
            6 | 72 => TickType::High,
            7 | 73 => TickType::Low,
            8 | 74 => TickType::Volume,
            9 | 75 => TickType::Close,
            14 | 76 => TickType::Open,
            45 | 88 => TickType::LastTimestamp,
            other => TickType::Other(other),
        }
    }
}

/// Gateway endpoint settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    /// Pause between connecting and starting the dispatch loop
    pub connect_settle_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: "localhost".to_string(),
            port: 4002,
            client_id: 1,
            connect_settle_ms: 2_000,
        }
    }
}

/// Per-request behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Upper bound on waiting for live quote ticks
    pub quote_wait_ms: u64,
    /// Upper bound on waiting for a historical data end callback
    pub history_wait_ms: u64,
    pub market_data_type: MarketDataType,
    /// Cancel the streaming quote subscription once the snapshot has been read
    pub cancel_quote_subscription: bool,
    /// Zone used when the gateway returns bar dates
    pub display_timezone: String,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            quote_wait_ms: 2_000,
            history_wait_ms: 10_000,
            market_data_type: MarketDataType::Live,
            cancel_quote_subscription: true,
            display_timezone: "US/Eastern".to_string(),
        }
    }
}

/// Configuration for the client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub requests: RequestConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewayConfig::default(),
            requests: RequestConfig::default(),
            log_level: "optionv1=debug,info".to_string(),
        }
    }
}
