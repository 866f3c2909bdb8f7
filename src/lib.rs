//! Library crate for fofa-view-rs: decoding, aggregation and export of FOFA search results.
pub mod aggregator;
pub mod client;
pub mod config;
pub mod decoder;
pub mod export;
pub mod query;
pub mod server;
pub mod session;
pub mod types;
