/// Historical bar helpers for stocks and options
use std::time::Duration;
use tracing::{info, warn};

use crate::data::{BarTable, HistoricalQuery};
use crate::error::Result;
use crate::session::IbSession;
use crate::types::{Contract, OptionRight, DEFAULT_CURRENCY, DEFAULT_EXCHANGE};

/// Option leg to fetch bars for
#[derive(Debug, Clone, PartialEq)]
pub struct OptionRequest {
    pub symbol: String,
    /// `YYYYMMDD`
    pub expiry: String,
    pub strike: f64,
    pub right: OptionRight,
    pub exchange: String,
    pub currency: String,
}

impl OptionRequest {
    /// Option routed through SMART in USD
    pub fn new(symbol: &str, expiry: &str, strike: f64, right: OptionRight) -> Self {
        OptionRequest {
            symbol: symbol.to_string(),
            expiry: expiry.to_string(),
            strike,
            right,
            exchange: DEFAULT_EXCHANGE.to_string(),
            currency: DEFAULT_CURRENCY.to_string(),
        }
    }

    pub fn on_exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_string();
        self
    }

    pub fn in_currency(mut self, currency: &str) -> Self {
        self.currency = currency.to_string();
        self
    }

    pub fn to_contract(&self) -> Result<Contract> {
        Contract::option(
            &self.symbol,
            &self.expiry,
            self.strike,
            self.right,
            &self.exchange,
            &self.currency,
        )
    }
}

/// Historical bars for any contract.
///
/// Waits up to `history_wait_ms` for the end marker. On timeout the request is
/// cancelled and whatever arrived is returned; a rejection or disconnect is
/// logged and likewise yields the bars received so far.
pub async fn get_historical_bars(session: &IbSession, contract: &Contract, query: &HistoricalQuery) -> Result<BarTable> {
    let wait_ms = session.request_config().history_wait_ms;

    let pending = session.request_historical_data(contract, query).await?;
    let req_id = pending.req_id;
    let outcome = session.wait_for(pending, Duration::from_millis(wait_ms)).await;

    if outcome.timed_out() {
        warn!(
            "⏱️ Historical request {} for {} not complete after {} ms ({} bars received)",
            req_id,
            contract,
            wait_ms,
            outcome.records.len()
        );
        if session.is_connected() {
            session.cancel_historical_data(req_id)?;
        }
    }

    let table = BarTable::new(outcome.into_records());
    info!("📊 {} bars for {}", table.len(), contract);
    Ok(table)
}

/// Historical bars for a single option contract
pub async fn get_option_chain_historical_prices(
    session: &IbSession,
    option: &OptionRequest,
    query: &HistoricalQuery,
) -> Result<BarTable> {
    let contract = option.to_contract()?;
    get_historical_bars(session, &contract, query).await
}

/// The demo's stock descriptor: TQQQ on ARCA in USD
pub fn create_contract() -> Contract {
    Contract::stock("TQQQ", "ARCA", DEFAULT_CURRENCY)
}
