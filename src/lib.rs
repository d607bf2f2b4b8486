pub mod types;
pub mod error;
pub mod utils;
pub mod data;
pub mod broker;
pub mod session;
pub mod market;
pub mod config;

#[cfg(test)]
pub(crate) mod testing;

pub use types::*;
pub use error::{GatewayError, Result};
