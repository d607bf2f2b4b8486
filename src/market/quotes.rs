/// Live quote helper
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Result;
use crate::session::IbSession;
use crate::types::{Bar, Contract};

/// Latest price record for a stock.
///
/// Subscribes to streaming quotes, collects ticks for up to `quote_wait_ms`, and
/// returns the most recent snapshot. `None` when nothing arrived in time. A
/// rejection or disconnect mid-wait is logged and whatever arrived is returned.
pub async fn get_stock_price(session: &IbSession, symbol: &str, exchange: &str, currency: &str) -> Result<Option<Bar>> {
    let config = session.request_config().clone();
    let contract = Contract::stock(symbol, exchange, currency);

    session.request_market_data_type(config.market_data_type)?;
    let pending = session.request_market_data(&contract, false).await?;
    let req_id = pending.req_id;

    let outcome = session
        .wait_for(pending, Duration::from_millis(config.quote_wait_ms))
        .await;

    if config.cancel_quote_subscription && session.is_connected() {
        session.cancel_market_data(req_id)?;
    }

    let mut records = outcome.into_records();
    match records.pop() {
        Some(bar) => {
            info!("💹 {} last {} at {}", symbol, bar.close, bar.date);
            Ok(Some(bar))
        }
        None => {
            warn!("No quote for {} within {} ms", symbol, config.quote_wait_ms);
            Ok(None)
        }
    }
}
