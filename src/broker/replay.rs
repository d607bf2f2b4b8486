/// Replay gateway: answers requests with scripted callback sequences
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::broker::gateway::{EventSender, Gateway, GatewayEvent};
use crate::data::HistoricalQuery;
use crate::error::{GatewayError, Result};
use crate::types::{Bar, Contract, MarketDataType, TickType};

/// One scripted tick of a quote subscription
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptedTick {
    Price(TickType, f64),
    Size(TickType, i64),
    /// Last trade time in unix seconds, delivered as a string tick
    LastTradeTime(i64),
}

/// Outbound call seen by the replay gateway
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedRequest {
    MarketDataType(MarketDataType),
    MarketData {
        req_id: i32,
        contract: Contract,
        snapshot: bool,
    },
    CancelMarketData {
        req_id: i32,
    },
    HistoricalData {
        req_id: i32,
        contract: Contract,
        query: HistoricalQuery,
    },
    CancelHistoricalData {
        req_id: i32,
    },
}

#[derive(Default)]
struct ReplayState {
    events: Option<EventSender>,
    requests: Vec<RecordedRequest>,
}

/// In-process gateway that replays canned responses keyed by symbol.
///
/// Symbols without a script get no callbacks at all, which is how a request that
/// never completes looks from the caller's side.
#[derive(Default)]
pub struct ReplayGateway {
    history: HashMap<String, Vec<Bar>>,
    quotes: HashMap<String, Vec<ScriptedTick>>,
    rejections: HashMap<String, (i32, String)>,
    refuse_connection: bool,
    state: Mutex<ReplayState>,
}

impl ReplayGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer historical requests for `symbol` with `bars` followed by an end marker
    pub fn with_history(mut self, symbol: &str, bars: Vec<Bar>) -> Self {
        self.history.insert(symbol.to_string(), bars);
        self
    }

    /// Answer quote subscriptions for `symbol` with `ticks`
    pub fn with_quote(mut self, symbol: &str, ticks: Vec<ScriptedTick>) -> Self {
        self.quotes.insert(symbol.to_string(), ticks);
        self
    }

    /// Answer any request for `symbol` with an error callback
    pub fn with_rejection(mut self, symbol: &str, code: i32, message: &str) -> Self {
        self.rejections.insert(symbol.to_string(), (code, message.to_string()));
        self
    }

    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connection = true;
        self
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock_state().map(|s| s.requests.clone()).unwrap_or_default()
    }

    /// Simulate the gateway dropping the socket
    pub fn drop_connection(&self) {
        if let Ok(mut state) = self.lock_state() {
            if let Some(events) = state.events.take() {
                let _ = events.send(GatewayEvent::ConnectionClosed);
            }
        }
        warn!("[REPLAY] Connection dropped");
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, ReplayState>> {
        self.state
            .lock()
            .map_err(|_| GatewayError::InternalError("replay state lock poisoned".to_string()))
    }

    /// Record the request and hand back the event sender
    fn record(&self, request: RecordedRequest) -> Result<EventSender> {
        let mut state = self.lock_state()?;
        let events = state.events.clone().ok_or(GatewayError::NotConnected)?;
        state.requests.push(request);
        Ok(events)
    }

    fn emit(events: &EventSender, event: GatewayEvent) -> Result<()> {
        events
            .send(event)
            .map_err(|e| GatewayError::ChannelClosed(format!("Failed to deliver event: {}", e)))
    }

    fn emit_rejection(&self, events: &EventSender, req_id: i32, symbol: &str) -> Result<bool> {
        match self.rejections.get(symbol) {
            Some((code, message)) => {
                Self::emit(
                    events,
                    GatewayEvent::Error {
                        req_id,
                        code: *code,
                        message: message.clone(),
                    },
                )?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Gateway for ReplayGateway {
    fn connect(&self, host: &str, port: u16, client_id: i32, events: EventSender) -> Result<()> {
        if self.refuse_connection {
            return Err(GatewayError::ConnectionFailed(format!(
                "{}:{} refused client {}",
                host, port, client_id
            )));
        }

        Self::emit(
            &events,
            GatewayEvent::Error {
                req_id: -1,
                code: 2104,
                message: "Market data farm connection is OK:usfarm".to_string(),
            },
        )?;

        self.lock_state()?.events = Some(events);
        info!("[REPLAY] Connected as client {} ({}:{})", client_id, host, port);
        Ok(())
    }

    fn disconnect(&self) {
        if let Ok(mut state) = self.lock_state() {
            state.events = None;
        }
        info!("[REPLAY] Disconnected");
    }

    fn is_connected(&self) -> bool {
        self.lock_state().map(|s| s.events.is_some()).unwrap_or(false)
    }

    fn request_market_data_type(&self, market_data_type: MarketDataType) -> Result<()> {
        self.record(RecordedRequest::MarketDataType(market_data_type))?;
        Ok(())
    }

    fn request_market_data(
        &self,
        req_id: i32,
        contract: &Contract,
        _generic_ticks: &str,
        snapshot: bool,
        _regulatory_snapshot: bool,
    ) -> Result<()> {
        let events = self.record(RecordedRequest::MarketData {
            req_id,
            contract: contract.clone(),
            snapshot,
        })?;

        if self.emit_rejection(&events, req_id, contract.symbol())? {
            return Ok(());
        }

        if let Some(ticks) = self.quotes.get(contract.symbol()) {
            debug!("[REPLAY] Replaying {} ticks for request {}", ticks.len(), req_id);
            for tick in ticks {
                let event = match *tick {
                    ScriptedTick::Price(tick_type, price) => GatewayEvent::TickPrice { req_id, tick_type, price },
                    ScriptedTick::Size(tick_type, size) => GatewayEvent::TickSize { req_id, tick_type, size },
                    ScriptedTick::LastTradeTime(secs) => GatewayEvent::TickString {
                        req_id,
                        tick_type: TickType::LastTimestamp,
                        value: secs.to_string(),
                    },
                };
                Self::emit(&events, event)?;
            }
        }

        if snapshot {
            Self::emit(&events, GatewayEvent::TickSnapshotEnd { req_id })?;
        }

        Ok(())
    }

    fn cancel_market_data(&self, req_id: i32) -> Result<()> {
        self.record(RecordedRequest::CancelMarketData { req_id })?;
        Ok(())
    }

    fn request_historical_data(&self, req_id: i32, contract: &Contract, query: &HistoricalQuery) -> Result<()> {
        let events = self.record(RecordedRequest::HistoricalData {
            req_id,
            contract: contract.clone(),
            query: query.clone(),
        })?;

        if self.emit_rejection(&events, req_id, contract.symbol())? {
            return Ok(());
        }

        let bars = match self.history.get(contract.symbol()) {
            Some(bars) => bars,
            None => {
                debug!("[REPLAY] No history scripted for {}", contract.symbol());
                return Ok(());
            }
        };

        for bar in bars {
            Self::emit(&events, GatewayEvent::HistoricalBar { req_id, bar: bar.clone() })?;
        }

        let start = bars
            .first()
            .map(|b| b.date.clone())
            .unwrap_or_else(|| query.end_date_time.clone());
        let end = if query.end_date_time.is_empty() {
            bars.last().map(|b| b.date.clone()).unwrap_or_default()
        } else {
            query.end_date_time.clone()
        };

        Self::emit(&events, GatewayEvent::HistoricalDataEnd { req_id, start, end })
    }

    fn cancel_historical_data(&self, req_id: i32) -> Result<()> {
        self.record(RecordedRequest::CancelHistoricalData { req_id })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_requests_fail_before_connect() {
        let gateway = ReplayGateway::new();
        let result = gateway.request_market_data_type(MarketDataType::Live);
        assert!(matches!(result, Err(GatewayError::NotConnected)));
        assert!(gateway.requests().is_empty());
    }

    #[test]
    fn test_history_replay_sequence() {
        let bars = vec![
            Bar::new("20250311 04:00:00", 1.0, 2.0, 0.5, 1.5, 100),
            Bar::new("20250311 05:00:00", 1.5, 2.5, 1.0, 2.0, 200),
        ];
        let gateway = ReplayGateway::new().with_history("TQQQ", bars.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        gateway.connect("localhost", 4002, 1, tx).unwrap();
        assert!(gateway.is_connected());

        // connect notice
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Error { code: 2104, .. }));

        let query = HistoricalQuery::new("20250312 09:00:00 US/Eastern", "1 D", "1 hour");
        gateway
            .request_historical_data(5, &Contract::stock("TQQQ", "ARCA", "USD"), &query)
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), GatewayEvent::HistoricalBar { req_id: 5, bar: bars[0].clone() });
        assert_eq!(rx.try_recv().unwrap(), GatewayEvent::HistoricalBar { req_id: 5, bar: bars[1].clone() });
        assert_eq!(
            rx.try_recv().unwrap(),
            GatewayEvent::HistoricalDataEnd {
                req_id: 5,
                start: "20250311 04:00:00".to_string(),
                end: "20250312 09:00:00 US/Eastern".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(gateway.requests().len(), 1);
    }

    #[test]
    fn test_quote_replay_sequence() {
        let gateway = ReplayGateway::new().with_quote(
            "SPY",
            vec![
                ScriptedTick::Price(TickType::Last, 512.5),
                ScriptedTick::Size(TickType::Volume, 900),
                ScriptedTick::LastTradeTime(1704119400),
            ],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.connect("localhost", 4002, 1, tx).unwrap();
        let _ = rx.try_recv();

        gateway
            .request_market_data(3, &Contract::smart_stock("SPY"), "", true, false)
            .unwrap();

        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::TickPrice { req_id: 3, .. }));
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::TickSize { size: 900, .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            GatewayEvent::TickString {
                req_id: 3,
                tick_type: TickType::LastTimestamp,
                value: "1704119400".to_string(),
            }
        );
        assert_eq!(rx.try_recv().unwrap(), GatewayEvent::TickSnapshotEnd { req_id: 3 });
    }

    #[test]
    fn test_rejection_replaces_answer() {
        let gateway = ReplayGateway::new()
            .with_history("QQQ", vec![Bar::new("20240314", 1.0, 1.0, 1.0, 1.0, 1)])
            .with_rejection("QQQ", 200, "No security definition has been found for the request");
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.connect("localhost", 4002, 1, tx).unwrap();
        let _ = rx.try_recv();

        gateway
            .request_historical_data(9, &Contract::smart_stock("QQQ"), &HistoricalQuery::default())
            .unwrap();
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Error { req_id: 9, code: 200, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_refused_connection() {
        let gateway = ReplayGateway::new().refusing_connections();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            gateway.connect("localhost", 4002, 1, tx),
            Err(GatewayError::ConnectionFailed(_))
        ));
        assert!(!gateway.is_connected());
    }
}
