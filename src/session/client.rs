/// Gateway session: request dispatch and callback handling
use chrono::Utc;
use chrono_tz::Tz;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::broker::gateway::{is_notice_code, EventReceiver, Gateway, GatewayEvent};
use crate::data::HistoricalQuery;
use crate::error::{GatewayError, Result};
use crate::session::registry::{Completion, PendingRequest, RequestKind, RequestOutcome, RequestRegistry};
use crate::types::{Bar, Contract, MarketDataType, RequestConfig};
use crate::utils::{parse_ib_datetime, parse_timezone};

/// Records of the most recently issued request
#[derive(Default)]
struct LatestBuffer {
    req_id: Option<i32>,
    records: Vec<Bar>,
}

/// One client session against a TWS / IB Gateway instance.
///
/// Requests are issued from any task; callbacks are consumed by a single
/// dispatch loop started with [`IbSession::spawn_event_loop`].
pub struct IbSession {
    gateway: Arc<dyn Gateway>,
    registry: RequestRegistry,
    latest: RwLock<LatestBuffer>,
    events: Mutex<Option<EventReceiver>>,
    connected: AtomicBool,
    config: RequestConfig,
    display_tz: Tz,
}

impl IbSession {
    pub fn new(gateway: Arc<dyn Gateway>, config: RequestConfig) -> Result<Self> {
        let display_tz = parse_timezone(&config.display_timezone)?;

        Ok(IbSession {
            gateway,
            registry: RequestRegistry::new(),
            latest: RwLock::new(LatestBuffer::default()),
            events: Mutex::new(None),
            connected: AtomicBool::new(false),
            config,
            display_tz,
        })
    }

    /// Open the socket session. Callbacks queue up until the dispatch loop runs.
    pub async fn connect(&self, host: &str, port: u16, client_id: i32) -> Result<()> {
        info!("🔌 Connecting to gateway at {}:{} as client {}", host, port, client_id);

        let (tx, rx) = mpsc::unbounded_channel();
        self.gateway.connect(host, port, client_id, tx)?;

        *self.events.lock().await = Some(rx);
        self.connected.store(true, Ordering::SeqCst);

        info!("✅ Connected to gateway");
        Ok(())
    }

    /// Start the dispatch loop on a background task
    pub async fn spawn_event_loop(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let rx = self.events.lock().await.take().ok_or_else(|| {
            if self.is_connected() {
                GatewayError::InternalError("event loop already running".to_string())
            } else {
                GatewayError::NotConnected
            }
        })?;

        let session = Arc::clone(self);
        Ok(tokio::spawn(async move {
            session.run(rx).await;
        }))
    }

    /// Drain callbacks until the gateway side of the channel goes away
    pub async fn run(&self, mut rx: EventReceiver) {
        debug!("Event loop started");

        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }

        self.connected.store(false, Ordering::SeqCst);
        let closed = self.registry.close_all().await;
        if closed > 0 {
            warn!("Event loop ended with {} request(s) still open", closed);
        }
        debug!("Event loop ended");
    }

    async fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::HistoricalBar { req_id, bar } => self.historical_data(req_id, bar).await,
            GatewayEvent::HistoricalDataEnd { req_id, start, end } => {
                self.historical_data_end(req_id, &start, &end).await
            }
            GatewayEvent::TickPrice { req_id, tick_type, price } => {
                let snapshot = self
                    .registry
                    .apply_price(req_id, tick_type, price, self.display_tz, Utc::now())
                    .await;
                debug!("tick_price: {} {:?} {}", req_id, tick_type, price);
                self.record_snapshot(req_id, snapshot).await;
            }
            GatewayEvent::TickSize { req_id, tick_type, size } => {
                let snapshot = self
                    .registry
                    .apply_size(req_id, tick_type, size, self.display_tz, Utc::now())
                    .await;
                debug!("tick_size: {} {:?} {}", req_id, tick_type, size);
                self.record_snapshot(req_id, snapshot).await;
            }
            GatewayEvent::TickString { req_id, tick_type, value } => {
                let snapshot = self
                    .registry
                    .apply_string(req_id, tick_type, &value, self.display_tz, Utc::now())
                    .await;
                debug!("tick_string: {} {:?} {}", req_id, tick_type, value);
                self.record_snapshot(req_id, snapshot).await;
            }
            GatewayEvent::TickSnapshotEnd { req_id } => {
                debug!("tick_snapshot_end: {}", req_id);
                self.registry.complete(req_id, Completion::Finished).await;
            }
            GatewayEvent::Error { req_id, code, message } => self.gateway_error(req_id, code, message).await,
            GatewayEvent::ConnectionClosed => self.connection_closed().await,
        }
    }

    async fn historical_data(&self, req_id: i32, bar: Bar) {
        debug!("historical_data: {} {:?}", req_id, bar);

        if !self.registry.append_bar(req_id, bar.clone()).await {
            debug!("Dropping bar for unknown request {}", req_id);
            return;
        }

        let mut latest = self.latest.write().await;
        if latest.req_id == Some(req_id) {
            latest.records.push(bar);
        }
    }

    async fn historical_data_end(&self, req_id: i32, start: &str, end: &str) {
        // Period bounds are informational; an unparseable one is still logged verbatim
        let start = parse_ib_datetime(start)
            .map(|t| t.to_string())
            .unwrap_or_else(|_| start.to_string());
        let end = parse_ib_datetime(end)
            .map(|t| t.to_string())
            .unwrap_or_else(|_| end.to_string());

        info!(
            "historical data request {} for period between {} and {} is complete",
            req_id, start, end
        );
        self.registry.complete(req_id, Completion::Finished).await;
    }

    async fn record_snapshot(&self, req_id: i32, snapshot: Option<Bar>) {
        if let Some(bar) = snapshot {
            let mut latest = self.latest.write().await;
            if latest.req_id == Some(req_id) {
                latest.records.push(bar);
            }
        }
    }

    async fn gateway_error(&self, req_id: i32, code: i32, message: String) {
        if req_id < 0 || is_notice_code(code) {
            info!("Gateway notice {} (req {}): {}", code, req_id, message);
            return;
        }

        if self
            .registry
            .complete(req_id, Completion::Rejected { code, message: message.clone() })
            .await
        {
            error!("❌ Request {} failed: {} - {}", req_id, code, message);
        } else {
            warn!("Gateway error {} for inactive request {}: {}", code, req_id, message);
        }
    }

    async fn connection_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let closed = self.registry.close_all().await;
        warn!("Gateway connection closed ({} request(s) aborted)", closed);
    }

    /// Close the session. Open requests resolve as closed once the loop drains.
    pub fn disconnect(&self) {
        self.gateway.disconnect();
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from gateway");
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.gateway.is_connected()
    }

    /// Records delivered so far for the most recently issued request
    pub async fn data(&self) -> Vec<Bar> {
        self.latest.read().await.records.clone()
    }

    pub fn request_config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn display_timezone(&self) -> Tz {
        self.display_tz
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    async fn begin(&self, kind: RequestKind) -> PendingRequest {
        let pending = self.registry.register(kind).await;

        let mut latest = self.latest.write().await;
        latest.req_id = Some(pending.req_id);
        latest.records.clear();

        pending
    }

    /// Discard a request whose send failed
    async fn abandon(&self, req_id: i32, e: GatewayError) -> GatewayError {
        self.registry.take(req_id).await;
        error!(
            "[{}] Request {} could not be sent: {} (recoverable: {})",
            e.error_code(),
            req_id,
            e,
            e.is_recoverable()
        );
        e
    }

    pub fn request_market_data_type(&self, market_data_type: MarketDataType) -> Result<()> {
        self.ensure_connected()?;
        debug!("Switching market data type to {:?}", market_data_type);
        self.gateway.request_market_data_type(market_data_type)
    }

    /// Subscribe to quote ticks for `contract`
    pub async fn request_market_data(&self, contract: &Contract, snapshot: bool) -> Result<PendingRequest> {
        self.ensure_connected()?;
        let pending = self.begin(RequestKind::Quote).await;

        info!("📡 Requesting market data for {} (req {})", contract, pending.req_id);
        if let Err(e) = self
            .gateway
            .request_market_data(pending.req_id, contract, "", snapshot, false)
        {
            return Err(self.abandon(pending.req_id, e).await);
        }

        Ok(pending)
    }

    /// Ask for historical bars of `contract` over the query window
    pub async fn request_historical_data(&self, contract: &Contract, query: &HistoricalQuery) -> Result<PendingRequest> {
        query.validate()?;
        self.ensure_connected()?;
        let pending = self.begin(RequestKind::Historical).await;

        info!(
            "📊 Requesting {} {} bars for {} ending '{}' (req {})",
            query.duration, query.bar_size, contract, query.end_date_time, pending.req_id
        );
        if let Err(e) = self.gateway.request_historical_data(pending.req_id, contract, query) {
            return Err(self.abandon(pending.req_id, e).await);
        }

        Ok(pending)
    }

    pub fn cancel_market_data(&self, req_id: i32) -> Result<()> {
        debug!("Cancelling market data request {}", req_id);
        self.gateway.cancel_market_data(req_id)
    }

    pub fn cancel_historical_data(&self, req_id: i32) -> Result<()> {
        debug!("Cancelling historical data request {}", req_id);
        self.gateway.cancel_historical_data(req_id)
    }

    /// Wait until the request completes or `wait` elapses, then release its slot
    pub async fn wait_for(&self, pending: PendingRequest, wait: Duration) -> RequestOutcome {
        let PendingRequest { req_id, kind, done } = pending;

        let signalled = match time::timeout(wait, done).await {
            Ok(Ok(completion)) => Some(completion),
            Ok(Err(_)) => Some(Completion::Closed),
            Err(_) => None,
        };

        match self.registry.take(req_id).await {
            Some(outcome) => outcome,
            None => RequestOutcome {
                req_id,
                kind,
                records: Vec::new(),
                completion: signalled,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::replay::{RecordedRequest, ReplayGateway, ScriptedTick};
    use crate::testing::connected_session;
    use crate::types::TickType;

    #[tokio::test(start_paused = true)]
    async fn test_historical_request_completes() {
        let bars = vec![
            Bar::new("20250311 04:00:00", 60.0, 61.0, 59.5, 60.5, 1000),
            Bar::new("20250311 05:00:00", 60.5, 62.0, 60.0, 61.5, 1500),
        ];
        let (session, _gateway) = connected_session(ReplayGateway::new().with_history("TQQQ", bars.clone())).await;

        let query = HistoricalQuery::new("20250312 09:00:00 US/Eastern", "1 D", "1 hour");
        let pending = session
            .request_historical_data(&Contract::stock("TQQQ", "ARCA", "USD"), &query)
            .await
            .unwrap();
        let outcome = session.wait_for(pending, Duration::from_secs(10)).await;

        assert_eq!(outcome.completion, Some(Completion::Finished));
        assert_eq!(outcome.records, bars);
        assert_eq!(session.data().await, bars);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_empty() {
        let (session, _gateway) = connected_session(ReplayGateway::new()).await;

        let pending = session
            .request_historical_data(&Contract::smart_stock("NONE"), &HistoricalQuery::default())
            .await
            .unwrap();
        let req_id = pending.req_id;
        let outcome = session.wait_for(pending, Duration::from_secs(10)).await;

        assert!(outcome.timed_out());
        assert!(outcome.records.is_empty());
        assert!(!session.registry.contains(req_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_request_clears_latest_buffer() {
        let gateway = ReplayGateway::new()
            .with_history("TQQQ", vec![Bar::new("20250311 04:00:00", 1.0, 1.0, 1.0, 1.0, 1)])
            .with_quote("SPY", vec![ScriptedTick::Price(TickType::Last, 500.0)]);
        let (session, _gateway) = connected_session(gateway).await;

        let pending = session
            .request_historical_data(&Contract::smart_stock("TQQQ"), &HistoricalQuery::default())
            .await
            .unwrap();
        session.wait_for(pending, Duration::from_secs(10)).await;
        assert_eq!(session.data().await.len(), 1);

        let pending = session.request_market_data(&Contract::smart_stock("SPY"), false).await.unwrap();
        let outcome = session.wait_for(pending, Duration::from_secs(2)).await;

        let data = session.data().await;
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].close, 500.0);
        assert_eq!(outcome.records, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notice_does_not_fail_requests() {
        let (session, _gateway) = connected_session(
            ReplayGateway::new().with_history("TQQQ", vec![Bar::new("20250311", 1.0, 1.0, 1.0, 1.0, 1)]),
        )
        .await;

        let pending = session
            .request_historical_data(&Contract::smart_stock("TQQQ"), &HistoricalQuery::default())
            .await
            .unwrap();
        session
            .handle_event(GatewayEvent::Error {
                req_id: pending.req_id,
                code: 2106,
                message: "HMDS data farm connection is OK:ushmds".to_string(),
            })
            .await;
        let outcome = session.wait_for(pending, Duration::from_secs(10)).await;

        assert_eq!(outcome.completion, Some(Completion::Finished));
        assert_eq!(outcome.into_records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_resolves_request() {
        let gateway = ReplayGateway::new().with_rejection("QQQ", 200, "No security definition has been found");
        let (session, _gateway) = connected_session(gateway).await;

        let pending = session
            .request_historical_data(&Contract::smart_stock("QQQ"), &HistoricalQuery::default())
            .await
            .unwrap();
        let outcome = session.wait_for(pending, Duration::from_secs(10)).await;

        assert_eq!(
            outcome.completion,
            Some(Completion::Rejected {
                code: 200,
                message: "No security definition has been found".to_string(),
            })
        );
        assert!(matches!(
            outcome.failure(),
            Some(GatewayError::RequestRejected { code: 200, .. })
        ));
        assert!(outcome.into_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_query_not_sent() {
        let (session, gateway) = connected_session(ReplayGateway::new()).await;

        let query = HistoricalQuery::new("", "1 day", "1 hour");
        let result = session.request_historical_data(&Contract::smart_stock("TQQQ"), &query).await;

        assert!(matches!(result, Err(GatewayError::InvalidParameter(_))));
        assert!(gateway.requests().is_empty());
        assert_eq!(session.registry.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_drop_aborts_open_requests() {
        let (session, gateway) = connected_session(ReplayGateway::new()).await;

        let pending = session.request_market_data(&Contract::smart_stock("SPY"), false).await.unwrap();
        gateway.drop_connection();
        let outcome = session.wait_for(pending, Duration::from_secs(2)).await;

        assert_eq!(outcome.completion, Some(Completion::Closed));
        assert!(!session.is_connected());
        assert!(matches!(
            session.request_market_data(&Contract::smart_stock("SPY"), false).await,
            Err(GatewayError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_before_connect_fail() {
        let session = IbSession::new(Arc::new(ReplayGateway::new()), RequestConfig::default()).unwrap();

        assert!(!session.is_connected());
        assert!(matches!(
            session.request_market_data_type(MarketDataType::Live),
            Err(GatewayError::NotConnected)
        ));
        let session = Arc::new(session);
        assert!(matches!(session.spawn_event_loop().await, Err(GatewayError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_records_cancel_and_stops() {
        let (session, gateway) = connected_session(ReplayGateway::new()).await;

        let pending = session.request_market_data(&Contract::smart_stock("SPY"), false).await.unwrap();
        session.cancel_market_data(pending.req_id).unwrap();
        assert!(gateway
            .requests()
            .contains(&RecordedRequest::CancelMarketData { req_id: pending.req_id }));

        session.disconnect();
        assert!(!session.is_connected());
        assert!(!gateway.is_connected());
    }

    #[test]
    fn test_unknown_display_timezone_rejected() {
        let config = RequestConfig {
            display_timezone: "Mars/Olympus".to_string(),
            ..Default::default()
        };
        assert!(IbSession::new(Arc::new(ReplayGateway::new()), config).is_err());
    }
}
