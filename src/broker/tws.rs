/// TWS / IB Gateway binding over the `ibapi` client
use chrono::DateTime;
use chrono_tz::Tz;
use ibapi::contracts::{Contract as IbContract, SecurityType as IbSecurityType};
use ibapi::market_data::historical::{self, ToDuration};
use ibapi::market_data::realtime::TickTypes;
use ibapi::market_data::MarketDataType as IbMarketDataType;
use ibapi::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::broker::gateway::{EventSender, Gateway, GatewayEvent};
use crate::data::{BarSize, DurationUnit, HistoricalQuery, WhatToShow};
use crate::error::{GatewayError, Result};
use crate::types::{Bar, Contract, MarketDataType, SecurityType, TickType};
use crate::utils::{format_ib_datetime, parse_query_time};

/// How often a streaming worker checks its cancel flag
const TICK_POLL: Duration = Duration::from_millis(250);

struct Connection {
    client: Arc<Client>,
    events: EventSender,
}

/// State shared between the gateway and its worker threads
#[derive(Default)]
struct Shared {
    connection: Mutex<Option<Connection>>,
    cancels: Mutex<HashMap<i32, Arc<AtomicBool>>>,
}

impl Shared {
    fn lock_connection(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.connection
            .lock()
            .map_err(|_| GatewayError::InternalError("connection lock poisoned".to_string()))
    }

    fn lock_cancels(&self) -> Result<MutexGuard<'_, HashMap<i32, Arc<AtomicBool>>>> {
        self.cancels
            .lock()
            .map_err(|_| GatewayError::InternalError("cancel lock poisoned".to_string()))
    }

    fn session(&self) -> Result<(Arc<Client>, EventSender)> {
        let guard = self.lock_connection()?;
        let connection = guard.as_ref().ok_or(GatewayError::NotConnected)?;
        Ok((Arc::clone(&connection.client), connection.events.clone()))
    }

    fn raise_cancel(&self, req_id: i32) -> Result<()> {
        if let Some(flag) = self.lock_cancels()?.get(&req_id) {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn cancel_all(&self) {
        if let Ok(cancels) = self.lock_cancels() {
            for flag in cancels.values() {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Tear down after the socket failed. Only the first caller notifies the session.
    fn connection_lost(&self, reason: &str) {
        self.cancel_all();

        let dropped = self.lock_connection().ok().and_then(|mut c| c.take());
        if let Some(connection) = dropped {
            warn!("🔌 Gateway connection lost: {}", reason);
            let _ = connection.events.send(GatewayEvent::ConnectionClosed);
        }
    }

    /// Route a client error: socket failures close the session, the rest fail one request
    fn report(&self, events: &EventSender, req_id: i32, e: &ibapi::Error) {
        if is_connection_loss(e) {
            self.connection_lost(&e.to_string());
        } else {
            send_failure(events, req_id, e.to_string());
        }
    }
}

/// Cancel flag of one worker; the entry is released when the worker ends
struct CancelGuard {
    shared: Arc<Shared>,
    req_id: i32,
    flag: Arc<AtomicBool>,
}

impl CancelGuard {
    fn register(shared: &Arc<Shared>, req_id: i32) -> Result<Self> {
        let flag = Arc::new(AtomicBool::new(false));
        shared.lock_cancels()?.insert(req_id, Arc::clone(&flag));
        Ok(CancelGuard {
            shared: Arc::clone(shared),
            req_id,
            flag,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Ok(mut cancels) = self.shared.lock_cancels() {
            cancels.remove(&self.req_id);
        }
    }
}

/// Gateway backed by a live socket session.
///
/// `ibapi` calls block, so each request runs on its own worker thread and pushes
/// its callbacks into the session's event channel. A worker that sees the socket
/// fail drops the connection and sends `ConnectionClosed`.
pub struct TwsGateway {
    display_tz: Tz,
    shared: Arc<Shared>,
}

impl TwsGateway {
    /// `display_tz` is the zone bar dates are rendered in
    pub fn new(display_tz: Tz) -> Self {
        TwsGateway {
            display_tz,
            shared: Arc::new(Shared::default()),
        }
    }
}

impl Gateway for TwsGateway {
    fn connect(&self, host: &str, port: u16, client_id: i32, events: EventSender) -> Result<()> {
        let address = format!("{}:{}", host, port);
        let client = Client::connect(&address, client_id)
            .map_err(|e| GatewayError::ConnectionFailed(format!("{}: {}", address, e)))?;

        info!("Gateway server version {}", client.server_version());
        *self.shared.lock_connection()? = Some(Connection {
            client: Arc::new(client),
            events,
        });
        Ok(())
    }

    fn disconnect(&self) {
        self.shared.cancel_all();
        // Dropping the last client handle closes the socket
        if let Ok(mut connection) = self.shared.lock_connection() {
            connection.take();
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.lock_connection().map(|c| c.is_some()).unwrap_or(false)
    }

    fn request_market_data_type(&self, market_data_type: MarketDataType) -> Result<()> {
        let (client, _) = self.shared.session()?;
        let ib_type = match market_data_type {
            MarketDataType::Live => IbMarketDataType::Live,
            MarketDataType::Frozen => IbMarketDataType::Frozen,
            MarketDataType::Delayed => IbMarketDataType::Delayed,
            MarketDataType::DelayedFrozen => IbMarketDataType::DelayedFrozen,
        };

        client.switch_market_data_type(ib_type).map_err(|e| {
            if is_connection_loss(&e) {
                self.shared.connection_lost(&e.to_string());
            }
            GatewayError::RequestFailed(e.to_string())
        })
    }

    fn request_market_data(
        &self,
        req_id: i32,
        contract: &Contract,
        generic_ticks: &str,
        snapshot: bool,
        regulatory_snapshot: bool,
    ) -> Result<()> {
        let (client, events) = self.shared.session()?;
        let ib_contract = to_ib_contract(contract);
        let generic_ticks: Vec<String> = generic_ticks
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        let guard = CancelGuard::register(&self.shared, req_id)?;

        thread::spawn(move || {
            let ticks: Vec<&str> = generic_ticks.iter().map(String::as_str).collect();
            let subscription = match client.market_data(&ib_contract, &ticks, snapshot, regulatory_snapshot) {
                Ok(subscription) => subscription,
                Err(e) => {
                    guard.shared.report(&events, req_id, &e);
                    return;
                }
            };

            while !guard.is_cancelled() {
                match subscription.next_timeout(TICK_POLL) {
                    Some(tick) => {
                        let ended = matches!(tick, TickTypes::SnapshotEnd);
                        if !forward_tick(&events, req_id, tick) || ended {
                            break;
                        }
                    }
                    None => {
                        if let Some(e) = subscription.error() {
                            guard.shared.report(&events, req_id, &e);
                            break;
                        }
                    }
                }
            }

            subscription.cancel();
            debug!("Market data worker {} finished", req_id);
        });

        Ok(())
    }

    fn cancel_market_data(&self, req_id: i32) -> Result<()> {
        self.shared.raise_cancel(req_id)
    }

    fn request_historical_data(&self, req_id: i32, contract: &Contract, query: &HistoricalQuery) -> Result<()> {
        let (client, events) = self.shared.session()?;
        let ib_contract = to_ib_contract(contract);

        let end = match parse_query_time(&query.end_date_time, self.display_tz)? {
            Some(instant) => Some(
                OffsetDateTime::from_unix_timestamp(instant.timestamp())
                    .map_err(|e| GatewayError::InvalidParameter(format!("end time out of range: {}", e)))?,
            ),
            None => None,
        };
        let duration = to_ib_duration(query)?;
        let bar_size = to_ib_bar_size(query.bar_size_setting()?)?;
        let what_to_show = to_ib_what_to_show(query.what_to_show);
        let use_rth = query.use_rth;
        let format_date = query.format_date;
        let display_tz = self.display_tz;
        let guard = CancelGuard::register(&self.shared, req_id)?;

        thread::spawn(move || {
            let data = match client.historical_data(&ib_contract, end, duration, bar_size, what_to_show, use_rth) {
                Ok(data) => data,
                Err(e) => {
                    guard.shared.report(&events, req_id, &e);
                    return;
                }
            };

            if guard.is_cancelled() {
                debug!("Historical request {} cancelled, dropping {} bars", req_id, data.bars.len());
                return;
            }

            for bar in &data.bars {
                let event = GatewayEvent::HistoricalBar {
                    req_id,
                    bar: Bar {
                        date: render_time(bar.date, display_tz, format_date),
                        open: bar.open,
                        high: bar.high,
                        low: bar.low,
                        close: bar.close,
                        volume: bar.volume.round() as i64,
                    },
                };
                if events.send(event).is_err() {
                    return;
                }
            }

            let _ = events.send(GatewayEvent::HistoricalDataEnd {
                req_id,
                start: render_time(data.start, display_tz, format_date),
                end: render_time(data.end, display_tz, format_date),
            });
        });

        Ok(())
    }

    fn cancel_historical_data(&self, req_id: i32) -> Result<()> {
        self.shared.raise_cancel(req_id)
    }
}

fn is_connection_loss(e: &ibapi::Error) -> bool {
    matches!(
        e,
        ibapi::Error::ConnectionReset | ibapi::Error::ConnectionFailed | ibapi::Error::Shutdown
    )
}

fn to_ib_contract(contract: &Contract) -> IbContract {
    let security_type = match contract.security_type() {
        SecurityType::Stock => IbSecurityType::Stock,
        SecurityType::Option => IbSecurityType::Option,
    };

    IbContract {
        symbol: contract.symbol().to_string(),
        security_type,
        exchange: contract.exchange().to_string(),
        currency: contract.currency().to_string(),
        last_trade_date_or_contract_month: contract.expiry().unwrap_or_default().to_string(),
        strike: contract.strike().unwrap_or_default(),
        right: contract.right().map(|r| r.as_str().to_string()).unwrap_or_default(),
        ..Default::default()
    }
}

fn to_ib_duration(query: &HistoricalQuery) -> Result<historical::Duration> {
    let parsed = query.duration_spec()?;
    Ok(match parsed.unit {
        DurationUnit::Seconds => parsed.amount.seconds(),
        DurationUnit::Days => parsed.amount.days(),
        DurationUnit::Weeks => parsed.amount.weeks(),
        DurationUnit::Months => parsed.amount.months(),
        DurationUnit::Years => parsed.amount.years(),
    })
}

fn to_ib_bar_size(size: BarSize) -> Result<historical::BarSize> {
    use historical::BarSize as Ib;

    Ok(match size {
        BarSize::Sec => Ib::Sec,
        BarSize::Sec5 => Ib::Sec5,
        BarSize::Sec10 => Ib::Sec10,
        BarSize::Sec15 => Ib::Sec15,
        BarSize::Sec30 => Ib::Sec30,
        BarSize::Min => Ib::Min,
        BarSize::Min2 => Ib::Min2,
        BarSize::Min3 => Ib::Min3,
        BarSize::Min5 => Ib::Min5,
        BarSize::Min15 => Ib::Min15,
        BarSize::Min20 => Ib::Min20,
        BarSize::Min30 => Ib::Min30,
        BarSize::Hour => Ib::Hour,
        BarSize::Hour2 => Ib::Hour2,
        BarSize::Hour3 => Ib::Hour3,
        BarSize::Hour4 => Ib::Hour4,
        BarSize::Hour8 => Ib::Hour8,
        BarSize::Day => Ib::Day,
        BarSize::Week => Ib::Week,
        BarSize::Month => Ib::Month,
        BarSize::Min10 => {
            return Err(GatewayError::InvalidParameter(
                "bar size '10 mins' is not supported by this client".to_string(),
            ))
        }
    })
}

fn to_ib_what_to_show(what: WhatToShow) -> historical::WhatToShow {
    use historical::WhatToShow as Ib;

    match what {
        WhatToShow::Trades => Ib::Trades,
        WhatToShow::Midpoint => Ib::MidPoint,
        WhatToShow::Bid => Ib::Bid,
        WhatToShow::Ask => Ib::Ask,
        WhatToShow::BidAsk => Ib::BidAsk,
        WhatToShow::AdjustedLast => Ib::AdjustedLast,
        WhatToShow::HistoricalVolatility => Ib::HistoricalVolatility,
        WhatToShow::OptionImpliedVolatility => Ib::OptionImpliedVolatility,
    }
}

/// Bar date in the requested layout: `format_date == 2` gives unix seconds
fn render_time(instant: OffsetDateTime, tz: Tz, format_date: i32) -> String {
    if format_date == 2 {
        return instant.unix_timestamp().to_string();
    }

    match DateTime::from_timestamp(instant.unix_timestamp(), 0) {
        Some(utc) => format_ib_datetime(utc, tz),
        None => instant.to_string(),
    }
}

fn send_failure(events: &EventSender, req_id: i32, message: String) {
    warn!("Request {} failed in client: {}", req_id, message);
    let _ = events.send(GatewayEvent::Error {
        req_id,
        code: -1,
        message,
    });
}

/// Translate one streaming tick; returns false once the session side is gone
fn forward_tick(events: &EventSender, req_id: i32, tick: TickTypes) -> bool {
    let mut batch = Vec::with_capacity(2);

    match tick {
        TickTypes::Price(p) => batch.push(GatewayEvent::TickPrice {
            req_id,
            tick_type: TickType::from_code(p.tick_type as i32),
            price: p.price,
        }),
        TickTypes::Size(s) => batch.push(GatewayEvent::TickSize {
            req_id,
            tick_type: TickType::from_code(s.tick_type as i32),
            size: s.size.round() as i64,
        }),
        TickTypes::PriceSize(ps) => {
            batch.push(GatewayEvent::TickPrice {
                req_id,
                tick_type: TickType::from_code(ps.price_tick_type as i32),
                price: ps.price,
            });
            batch.push(GatewayEvent::TickSize {
                req_id,
                tick_type: TickType::from_code(ps.size_tick_type as i32),
                size: ps.size.round() as i64,
            });
        }
        TickTypes::String(s) => batch.push(GatewayEvent::TickString {
            req_id,
            tick_type: TickType::from_code(s.tick_type as i32),
            value: s.value,
        }),
        TickTypes::SnapshotEnd => batch.push(GatewayEvent::TickSnapshotEnd { req_id }),
        TickTypes::Notice(notice) => batch.push(GatewayEvent::Error {
            req_id,
            code: notice.code,
            message: notice.message,
        }),
        _ => {}
    }

    batch.into_iter().all(|event| events.send(event).is_ok())
}
