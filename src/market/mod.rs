pub mod history;
pub mod quotes;

pub use history::{create_contract, get_historical_bars, get_option_chain_historical_prices, OptionRequest};
pub use quotes::get_stock_price;
