pub mod query;
pub mod quote;
pub mod table;

pub use query::{BarSize, DurationSpec, DurationUnit, HistoricalQuery, WhatToShow};
pub use quote::QuoteSnapshot;
pub use table::{BarTable, ColumnStats, TableSummary, BAR_COLUMNS};
