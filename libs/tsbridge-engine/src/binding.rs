use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tsbridge_api::{MessageBus, RecordSchema, Store};

use crate::config::{OverflowPolicy, TopicConfig};
use crate::queue::relay_queue;
use crate::receiver::Receiver;
use crate::task::{Role, TaskExit, TaskId};
use crate::writer::Writer;

/// Shared collaborators handed to every pipeline at launch.
#[derive(Clone)]
pub struct PipelineContext {
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<dyn Store>,
    /// Cancelled by the supervisor when the first task terminates.
    pub token: CancellationToken,
}

/// A task ready to be spawned by the supervisor.
pub struct PipelineTask {
    pub id: TaskId,
    pub future: Pin<Box<dyn Future<Output = TaskExit> + Send>>,
}

/// Type-erased topic pipeline, so bindings with different record types can
/// be supervised together.
pub trait Pipeline: Send {
    fn topic(&self) -> &str;

    fn schema_name(&self) -> &str;

    /// Create the relay queue and split into a receiver task and a writer task.
    fn into_tasks(self: Box<Self>, ctx: &PipelineContext) -> Vec<PipelineTask>;
}

/// Topic name + record schema + relay queue settings.
///
/// Immutable once built; consumed when the supervisor launches it.
pub struct TopicBinding<S: RecordSchema> {
    topic: String,
    schema: Arc<S>,
    queue_capacity: usize,
    overflow: OverflowPolicy,
}

impl<S: RecordSchema> TopicBinding<S> {
    pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

    pub fn new(topic: impl Into<String>, schema: S) -> Self {
        Self {
            topic: topic.into(),
            schema: Arc::new(schema),
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }

    /// Binding for a configured topic; the schema is resolved by the caller.
    pub fn from_config(cfg: &TopicConfig, schema: S) -> Self {
        Self::new(cfg.name.clone(), schema)
            .with_queue_capacity(cfg.queue_capacity)
            .with_overflow(cfg.overflow)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn schema(&self) -> &S {
        &self.schema
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }
}

impl<S: RecordSchema> Pipeline for TopicBinding<S> {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn schema_name(&self) -> &str {
        self.schema.name()
    }

    fn into_tasks(self: Box<Self>, ctx: &PipelineContext) -> Vec<PipelineTask> {
        let (tx, rx) = relay_queue(self.queue_capacity);

        let receiver = Receiver::new(self.topic.clone(), self.schema.clone(), tx, self.overflow);
        let writer = Writer::new(self.topic.clone(), self.schema, rx);

        vec![
            PipelineTask {
                id: TaskId::new(self.topic.clone(), Role::Receiver),
                future: Box::pin(receiver.run(ctx.bus.clone(), ctx.token.clone())),
            },
            PipelineTask {
                id: TaskId::new(self.topic, Role::Writer),
                future: Box::pin(writer.run(ctx.store.clone(), ctx.token.clone())),
            },
        ]
    }
}
