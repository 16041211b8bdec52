use std::ops::ControlFlow;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use tsbridge_api::{Acceptance, MessageBus, RecordSchema};

use crate::config::OverflowPolicy;
use crate::error::EngineError;
use crate::queue::{PushError, RelaySender};
use crate::task::TaskExit;

/// Network half of a topic pipeline: bus → decode → filter → relay queue.
///
/// Never touches the store. Payload problems are logged and skipped;
/// a full queue (under [`OverflowPolicy::Abort`]) or a bus fault ends the task.
pub struct Receiver<S: RecordSchema> {
    topic: String,
    schema: Arc<S>,
    queue: RelaySender<S::Record>,
    overflow: OverflowPolicy,
}

impl<S: RecordSchema> Receiver<S> {
    pub fn new(
        topic: impl Into<String>,
        schema: Arc<S>,
        queue: RelaySender<S::Record>,
        overflow: OverflowPolicy,
    ) -> Self {
        Self {
            topic: topic.into(),
            schema,
            queue,
            overflow,
        }
    }

    pub async fn run(self, bus: Arc<dyn MessageBus>, token: CancellationToken) -> TaskExit {
        tracing::info!(topic = %self.topic, schema = %self.schema.name(), "subscribing");

        let subscribed = tokio::select! {
            biased;
            _ = token.cancelled() => return TaskExit::Cancelled,
            result = bus.subscribe(&self.topic) => result,
        };
        let mut subscription = match subscribed {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(topic = %self.topic, error = %e, "subscription failed");
                return TaskExit::Faulted(EngineError::Bus(e).with_context(format!("subscribe '{}'", self.topic)));
            }
        };

        tracing::info!(topic = %self.topic, "receiving");
        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => return TaskExit::Cancelled,
                message = subscription.recv() => message,
            };
            match received {
                Ok(Some(message)) => {
                    if let ControlFlow::Break(exit) = self.handle(&message.payload) {
                        return exit;
                    }
                }
                Ok(None) => {
                    tracing::info!(topic = %self.topic, "bus closed the subscription");
                    return TaskExit::Finished;
                }
                Err(e) => {
                    tracing::error!(topic = %self.topic, error = %e, "bus connection lost");
                    return TaskExit::Faulted(EngineError::Bus(e));
                }
            }
        }
    }

    /// Decode, filter and enqueue one payload.
    fn handle(&self, payload: &[u8]) -> ControlFlow<TaskExit> {
        let record = match self.schema.decode(payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "invalid payload, ignoring");
                return ControlFlow::Continue(());
            }
        };

        if let Acceptance::Reject(reason) = self.schema.accept(&record) {
            tracing::info!(topic = %self.topic, %reason, "record rejected, ignoring");
            return ControlFlow::Continue(());
        }

        match self.queue.push(record) {
            Ok(()) => ControlFlow::Continue(()),
            Err(PushError::Full(record)) => match self.overflow {
                OverflowPolicy::Abort => {
                    tracing::error!(
                        topic = %self.topic,
                        capacity = self.queue.capacity(),
                        "records backed up, not reaching the database fast enough"
                    );
                    ControlFlow::Break(TaskExit::Faulted(EngineError::Backpressure {
                        topic: self.topic.clone(),
                        capacity: self.queue.capacity(),
                    }))
                }
                OverflowPolicy::Drop => {
                    tracing::warn!(
                        topic = %self.topic,
                        capacity = self.queue.capacity(),
                        record = ?record,
                        "relay queue full, dropping record"
                    );
                    ControlFlow::Continue(())
                }
            },
            Err(PushError::Closed(_)) => {
                tracing::info!(topic = %self.topic, "writer has stopped");
                ControlFlow::Break(TaskExit::Finished)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tsbridge_api::{BindValue, Statement, ValidationError};

    use super::*;
    use crate::queue::relay_queue;
    use crate::testing::MemoryBus;

    /// Accepts payloads of the form `"<n>"`, rejects odd numbers.
    struct EvenNumbers;

    impl RecordSchema for EvenNumbers {
        type Record = i32;

        fn name(&self) -> &str {
            "even"
        }

        fn decode(&self, payload: &[u8]) -> Result<i32, ValidationError> {
            Ok(serde_json::from_slice(payload)?)
        }

        fn accept(&self, record: &i32) -> Acceptance {
            if record % 2 == 0 {
                Acceptance::Accept
            } else {
                Acceptance::Reject(format!("{record} is odd"))
            }
        }

        fn ddl(&self) -> Vec<Statement> {
            Vec::new()
        }

        fn insert_sql(&self) -> &'static str {
            "INSERT INTO even (n) VALUES ($1)"
        }

        fn insert_params(&self, record: &i32) -> Vec<BindValue> {
            vec![BindValue::Int4(*record)]
        }
    }

    fn spawn_receiver(
        bus: &Arc<MemoryBus>,
        capacity: usize,
        overflow: OverflowPolicy,
    ) -> (tokio::task::JoinHandle<TaskExit>, crate::queue::RelayReceiver<i32>, CancellationToken) {
        let (tx, rx) = relay_queue(capacity);
        let receiver = Receiver::new("numbers", Arc::new(EvenNumbers), tx, overflow);
        let token = CancellationToken::new();
        let handle = tokio::spawn(receiver.run(bus.clone(), token.clone()));
        (handle, rx, token)
    }

    async fn join(handle: tokio::task::JoinHandle<TaskExit>) -> TaskExit {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("receiver did not stop")
            .expect("receiver panicked")
    }

    #[tokio::test]
    async fn invalid_and_rejected_payloads_never_reach_the_queue() {
        let bus = Arc::new(MemoryBus::new());
        let (handle, mut rx, token) = spawn_receiver(&bus, 8, OverflowPolicy::Abort);

        bus.publish("numbers", "not a number");
        bus.publish("numbers", "3");
        bus.publish("numbers", "4");
        bus.publish("numbers", "\"six\"");
        bus.publish("numbers", "8");

        assert_eq!(rx.pop().await, Some(4));
        assert_eq!(rx.pop().await, Some(8));
        assert!(rx.is_empty());

        token.cancel();
        assert!(join(handle).await.is_cancelled());
    }

    #[tokio::test]
    async fn overflow_faults_exactly_once() {
        let bus = Arc::new(MemoryBus::new());
        let (handle, mut rx, _token) = spawn_receiver(&bus, 2, OverflowPolicy::Abort);

        for n in [2, 4, 6, 8] {
            bus.publish("numbers", n.to_string());
        }

        match join(handle).await {
            TaskExit::Faulted(EngineError::Backpressure { topic, capacity }) => {
                assert_eq!(topic, "numbers");
                assert_eq!(capacity, 2);
            }
            other => panic!("expected backpressure fault, got {other:?}"),
        }

        // Only what fit was accepted; nothing beyond capacity slipped in.
        assert_eq!(rx.pop().await, Some(2));
        assert_eq!(rx.pop().await, Some(4));
        assert_eq!(rx.pop().await, None);
    }

    #[tokio::test]
    async fn drop_policy_discards_and_keeps_running() {
        let bus = Arc::new(MemoryBus::new());
        let (handle, mut rx, token) = spawn_receiver(&bus, 1, OverflowPolicy::Drop);

        bus.publish("numbers", "2");
        bus.publish("numbers", "4");
        bus.publish("numbers", "6");
        bus.wait_delivered("numbers", 3).await;

        assert_eq!(rx.pop().await, Some(2));
        bus.publish("numbers", "10");
        assert_eq!(rx.pop().await, Some(10));
        assert!(!handle.is_finished());

        token.cancel();
        assert!(join(handle).await.is_cancelled());
    }

    #[tokio::test]
    async fn bus_fault_is_fatal() {
        let bus = Arc::new(MemoryBus::new());
        let (handle, _rx, _token) = spawn_receiver(&bus, 4, OverflowPolicy::Abort);

        bus.fail("numbers", "connection reset");
        match join(handle).await {
            TaskExit::Faulted(EngineError::Bus(e)) => assert!(e.message().contains("connection reset")),
            other => panic!("expected bus fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_subscription_is_fatal() {
        let bus = Arc::new(MemoryBus::new());
        bus.refuse_subscriptions("not authorized");
        let (handle, _rx, _token) = spawn_receiver(&bus, 4, OverflowPolicy::Abort);
        assert!(join(handle).await.is_faulted());
    }

    #[tokio::test]
    async fn closed_stream_finishes_normally() {
        let bus = Arc::new(MemoryBus::new());
        let (handle, mut rx, _token) = spawn_receiver(&bus, 4, OverflowPolicy::Abort);

        bus.publish("numbers", "12");
        bus.close("numbers");

        assert!(matches!(join(handle).await, TaskExit::Finished));
        assert_eq!(rx.pop().await, Some(12));
        assert_eq!(rx.pop().await, None);
    }
}
