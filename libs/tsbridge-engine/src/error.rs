use tsbridge_api::{BusError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("relay queue for topic '{topic}' is full ({capacity} records), writer is not keeping up")]
    Backpressure { topic: String, capacity: usize },

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("no topic pipelines to supervise")]
    NoPipelines,
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Bus` and `Store`, context is added to the inner error.
    /// For `Config`, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Bus(e) => EngineError::Bus(e.with_context(ctx)),
            EngineError::Store(e) => EngineError::Store(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
