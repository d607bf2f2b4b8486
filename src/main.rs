/// Demo entry point: TQQQ stock bars and one QQQ option leg
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use optionv1::{
    broker::TwsGateway,
    config::load_config_from_env,
    data::HistoricalQuery,
    market::{create_contract, get_historical_bars, get_option_chain_historical_prices, OptionRequest},
    session::IbSession,
    utils::format_query_time,
    Config, OptionRight,
};

/// Application state
struct DemoApp {
    config: Config,
    session: Arc<IbSession>,
}

impl DemoApp {
    fn new(config: Config) -> anyhow::Result<Self> {
        let session = IbSession::new(Arc::new(TwsGateway::new(display_tz(&config)?)), config.requests.clone())
            .context("failed to create session")?;

        Ok(DemoApp {
            config,
            session: Arc::new(session),
        })
    }

    async fn run(&self) -> anyhow::Result<()> {
        let gateway = &self.config.gateway;
        self.session
            .connect(&gateway.host, gateway.port, gateway.client_id)
            .await
            .with_context(|| format!("could not connect to {}:{}", gateway.host, gateway.port))?;

        // Give the gateway time to send its farm status notices
        tokio::time::sleep(Duration::from_millis(gateway.connect_settle_ms)).await;
        let _event_loop = self.session.spawn_event_loop().await?;

        let end = chrono::NaiveDate::from_ymd_opt(2025, 3, 12)
            .and_then(|d| d.and_hms_opt(9, 0, 0))
            .context("invalid query time")?;
        let query_time = format_query_time(end, chrono_tz::US::Eastern);
        println!("{}", query_time);

        let query = HistoricalQuery::new(&query_time, "1 D", "1 hour");

        let stock = get_historical_bars(&self.session, &create_contract(), &query).await?;
        for bar in stock.rows() {
            println!("{:?}", bar);
        }
        println!("{}", stock);
        println!("{}", stock.describe());

        let option = OptionRequest::new("QQQ", "20240315", 430.0, OptionRight::Call);
        match get_option_chain_historical_prices(&self.session, &option, &query).await {
            Ok(table) => println!("{}", table),
            Err(e) => warn!(
                "[{}] Option history unavailable: {} (recoverable: {})",
                e.error_code(),
                e,
                e.is_recoverable()
            ),
        }

        self.session.disconnect();
        info!("Done");
        Ok(())
    }
}

fn display_tz(config: &Config) -> anyhow::Result<chrono_tz::Tz> {
    Ok(optionv1::utils::parse_timezone(&config.requests.display_timezone)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config_from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.as_str())
        .init();

    info!("Starting optionv1...");

    let app = DemoApp::new(config)?;
    app.run().await
}
