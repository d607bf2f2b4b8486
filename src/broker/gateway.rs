/// Gateway seam: outbound requests and inbound callback events
use tokio::sync::mpsc;

use crate::data::HistoricalQuery;
use crate::error::Result;
use crate::types::{Bar, Contract, MarketDataType, TickType};

/// Callback deliveries from the gateway's receive loop
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    HistoricalBar {
        req_id: i32,
        bar: Bar,
    },
    HistoricalDataEnd {
        req_id: i32,
        start: String,
        end: String,
    },
    TickPrice {
        req_id: i32,
        tick_type: TickType,
        price: f64,
    },
    TickSize {
        req_id: i32,
        tick_type: TickType,
        size: i64,
    },
    /// String-valued tick, e.g. the last trade time in unix seconds
    TickString {
        req_id: i32,
        tick_type: TickType,
        value: String,
    },
    TickSnapshotEnd {
        req_id: i32,
    },
    Error {
        req_id: i32,
        code: i32,
        message: String,
    },
    ConnectionClosed,
}

pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

/// Request side of a gateway session.
///
/// Implementations push every callback into the `EventSender` handed over in
/// `connect`; request methods only enqueue the outbound message and never wait
/// for a reply.
pub trait Gateway: Send + Sync {
    fn connect(&self, host: &str, port: u16, client_id: i32, events: EventSender) -> Result<()>;

    fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn request_market_data_type(&self, market_data_type: MarketDataType) -> Result<()>;

    fn request_market_data(
        &self,
        req_id: i32,
        contract: &Contract,
        generic_ticks: &str,
        snapshot: bool,
        regulatory_snapshot: bool,
    ) -> Result<()>;

    fn cancel_market_data(&self, req_id: i32) -> Result<()>;

    fn request_historical_data(&self, req_id: i32, contract: &Contract, query: &HistoricalQuery) -> Result<()>;

    fn cancel_historical_data(&self, req_id: i32) -> Result<()>;
}

/// Delayed data is shown instead of live data (no subscription)
pub const DELAYED_DATA_NOTICE: i32 = 10167;

/// Gateway notices (farm status and similar) use the 2100 range
pub fn is_notice_code(code: i32) -> bool {
    (2100..2200).contains(&code) || code == DELAYED_DATA_NOTICE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_codes() {
        assert!(is_notice_code(2104));
        assert!(is_notice_code(2158));
        assert!(is_notice_code(10167));
        assert!(!is_notice_code(200));
        assert!(!is_notice_code(162));
    }
}
