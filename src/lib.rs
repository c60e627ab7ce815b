pub mod cli;
pub mod config;
pub mod error;
pub mod generator;
pub mod ingest;
pub mod metrics;
pub mod query;
pub mod reading;
pub mod store;

#[cfg(test)]
pub mod test_support;
