//! Ingest core: per-topic receiver/writer pipelines joined by a bounded
//! relay queue, and a fail-fast supervisor over the whole set.
//!
//! The message bus and the store are reached only through the
//! [`tsbridge_api::MessageBus`] and [`tsbridge_api::Store`] traits.

pub mod binding;
pub mod config;
pub mod error;
pub mod queue;
pub mod receiver;
pub mod supervisor;
pub mod task;
pub mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use binding::{Pipeline, PipelineContext, PipelineTask, TopicBinding};
pub use config::{BridgeConfig, BrokerConfig, DbConfig, OverflowPolicy, TopicConfig};
pub use error::EngineError;
pub use supervisor::{ShutdownReport, Supervisor};
pub use task::{Role, TaskExit, TaskId};
