//! Bounded single-producer, single-consumer relay between a receiver and its writer.
//!
//! `push` never waits: a full queue is reported back to the receiver, which
//! applies the topic's overflow policy. `pop` suspends until a record arrives
//! or the sending side is gone.

use tokio::sync::mpsc;

/// Create a relay queue holding at most `capacity` records.
///
/// # Panics
///
/// Panics if `capacity` is zero. Configuration validation rejects that earlier.
pub fn relay_queue<T>(capacity: usize) -> (RelaySender<T>, RelayReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (RelaySender { tx, capacity }, RelayReceiver { rx })
}

/// Why a record could not be enqueued. The record is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue holds `capacity` records already.
    Full(T),
    /// The writer dropped its end.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(v) | PushError::Closed(v) => v,
        }
    }
}

/// Write end, owned by the receiver.
#[derive(Debug)]
pub struct RelaySender<T> {
    tx: mpsc::Sender<T>,
    capacity: usize,
}

impl<T> RelaySender<T> {
    pub fn push(&self, record: T) -> Result<(), PushError<T>> {
        self.tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(v) => PushError::Full(v),
            mpsc::error::TrySendError::Closed(v) => PushError::Closed(v),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records currently queued.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read end, owned by the writer.
#[derive(Debug)]
pub struct RelayReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> RelayReceiver<T> {
    /// Next record in FIFO order; `None` once the receiver is gone and the queue is drained.
    pub async fn pop(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Refuse further pushes. Queued records can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let (tx, mut rx) = relay_queue(4);
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(rx.pop().await, Some(i));
        }
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let (tx, mut rx) = relay_queue(2);
        tx.push("a").unwrap();
        tx.push("b").unwrap();
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.push("c"), Err(PushError::Full("c")));
        assert_eq!(rx.len(), 2);

        assert_eq!(rx.pop().await, Some("a"));
        tx.push("c").unwrap();
        assert_eq!(rx.pop().await, Some("b"));
        assert_eq!(rx.pop().await, Some("c"));
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn pop_returns_none_after_sender_drops() {
        let (tx, mut rx) = relay_queue(2);
        tx.push(1).unwrap();
        drop(tx);
        assert_eq!(rx.pop().await, Some(1));
        assert_eq!(rx.pop().await, None);
    }

    #[tokio::test]
    async fn push_fails_once_reader_is_gone() {
        let (tx, rx) = relay_queue(2);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.push(7).unwrap_err().into_inner(), 7);
    }

    #[tokio::test]
    async fn pop_waits_for_a_record() {
        let (tx, mut rx) = relay_queue::<u32>(1);
        let waiter = tokio::spawn(async move { rx.pop().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        tx.push(42).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(42));
    }
}
