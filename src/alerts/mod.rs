pub mod binance;
pub mod crossing;
pub mod ingestion;
pub mod persistence;
pub mod pipeline;
pub mod reconciler;
pub mod types;
