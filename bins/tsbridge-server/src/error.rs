use tsbridge_api::{BusError, StoreError};
use tsbridge_engine::EngineError;

/// Bootstrap and run-time failures of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("topic '{topic}': unknown schema '{schema}'")]
    UnknownSchema { topic: String, schema: String },

    #[error("topic '{topic}': schema '{schema}' has no acceptance filter, remove `accept`")]
    FilterUnsupported { topic: String, schema: String },

    #[error("database: {0}")]
    Store(#[from] StoreError),

    #[error("broker: {0}")]
    Bus(#[from] BusError),
}
