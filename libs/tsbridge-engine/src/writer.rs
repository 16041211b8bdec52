use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tsbridge_api::{RecordSchema, Statement, Store, StoreError};

use crate::error::EngineError;
use crate::queue::RelayReceiver;
use crate::task::TaskExit;

/// Database half of a topic pipeline: relay queue → one transaction per record.
///
/// Runs the schema's DDL once before the first pop. Any store failure ends
/// the task; there is no retry.
pub struct Writer<S: RecordSchema> {
    topic: String,
    schema: Arc<S>,
    queue: RelayReceiver<S::Record>,
}

impl<S: RecordSchema> Writer<S> {
    pub fn new(topic: impl Into<String>, schema: Arc<S>, queue: RelayReceiver<S::Record>) -> Self {
        Self {
            topic: topic.into(),
            schema,
            queue,
        }
    }

    pub async fn run(mut self, store: Arc<dyn Store>, token: CancellationToken) -> TaskExit {
        tracing::info!(topic = %self.topic, schema = %self.schema.name(), "initialising table");
        match transact(&*store, self.schema.ddl(), &token).await {
            None => return TaskExit::Cancelled,
            Some(Err(e)) => {
                tracing::error!(topic = %self.topic, error = %e, "table initialisation failed");
                return TaskExit::Faulted(EngineError::Store(e.with_context(format!("ddl for '{}'", self.topic))));
            }
            Some(Ok(())) => {}
        }

        tracing::info!(topic = %self.topic, "waiting for records");
        loop {
            let popped = tokio::select! {
                biased;
                _ = token.cancelled() => return TaskExit::Cancelled,
                record = self.queue.pop() => record,
            };
            let Some(record) = popped else {
                tracing::info!(topic = %self.topic, "relay queue closed");
                return TaskExit::Finished;
            };

            match serde_json::to_string(&record) {
                Ok(json) => tracing::info!(topic = %self.topic, record = %json, "writing"),
                Err(_) => tracing::info!(topic = %self.topic, record = ?record, "writing"),
            }

            let insert = self.schema.insert(&record);
            match transact(&*store, vec![insert], &token).await {
                None => return TaskExit::Cancelled,
                Some(Err(e)) => {
                    tracing::error!(topic = %self.topic, error = %e, "database failure, stopping writer");
                    return TaskExit::Faulted(EngineError::Store(e));
                }
                Some(Ok(())) => tracing::debug!(topic = %self.topic, "inserted"),
            }
        }
    }
}

/// One unit of work, abandoned (and rolled back by the store) on cancellation.
async fn transact(
    store: &dyn Store,
    statements: Vec<Statement>,
    token: &CancellationToken,
) -> Option<Result<(), StoreError>> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = store.transaction(statements) => Some(result),
    }
}
