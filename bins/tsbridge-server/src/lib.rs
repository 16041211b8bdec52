//! MQTT → TimescaleDB ingest server: configuration to running pipelines.

pub mod bootstrap;
pub mod error;

pub use error::ServerError;
