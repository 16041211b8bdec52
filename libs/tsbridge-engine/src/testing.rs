//! In-memory [`MessageBus`] and [`Store`] doubles.
//!
//! Enabled for this crate's own tests and, through the `testing` feature,
//! for downstream integration tests. The `wait_*` helpers panic after a few
//! seconds so a wedged pipeline fails the test instead of hanging it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};

use tsbridge_api::{BusError, Message, MessageBus, Statement, Store, StoreError, Subscription};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait_until(notify: &Notify, what: &str, mut ready: impl FnMut() -> bool) {
    let wait = async {
        loop {
            let notified = notify.notified();
            if ready() {
                return;
            }
            notified.await;
        }
    };
    if tokio::time::timeout(WAIT_LIMIT, wait).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

type Delivery = Result<Message, BusError>;

struct TopicChannel {
    tx: Option<mpsc::UnboundedSender<Delivery>>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
    delivered: Arc<AtomicUsize>,
}

impl TopicChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
            delivered: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicChannel>,
    refusal: Option<String>,
    subscribed: usize,
}

/// Exact-match topic bus. Each topic can be subscribed once; messages
/// published before the subscription are buffered.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<BusState>,
    notify: Arc<Notify>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn send(&self, topic: &str, delivery: Delivery) {
        let mut state = lock(&self.state);
        let channel = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new);
        if let Some(tx) = &channel.tx {
            let _ = tx.send(delivery);
        }
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let message = Message {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        self.send(topic, Ok(message));
    }

    /// Queue a connection failure on `topic`'s stream.
    pub fn fail(&self, topic: &str, message: &str) {
        self.send(topic, Err(BusError::new(message)));
    }

    /// End `topic`'s stream cleanly once buffered messages are drained.
    pub fn close(&self, topic: &str) {
        let mut state = lock(&self.state);
        let channel = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new);
        channel.tx = None;
    }

    /// Make every subsequent `subscribe` fail.
    pub fn refuse_subscriptions(&self, message: &str) {
        lock(&self.state).refusal = Some(message.to_string());
    }

    pub fn subscriptions(&self) -> usize {
        lock(&self.state).subscribed
    }

    /// Messages on `topic` that the subscriber has fully handled, i.e. it has
    /// come back asking for the next one.
    pub fn delivered(&self, topic: &str) -> usize {
        lock(&self.state)
            .topics
            .get(topic)
            .map_or(0, |c| c.delivered.load(Ordering::SeqCst))
    }

    pub async fn wait_subscribed(&self, n: usize) {
        wait_until(&self.notify, "subscriptions", || self.subscriptions() >= n).await;
    }

    pub async fn wait_delivered(&self, topic: &str, n: usize) {
        wait_until(&self.notify, "deliveries", || self.delivered(topic) >= n).await;
    }
}

impl MessageBus for MemoryBus {
    fn subscribe(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Subscription>, BusError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.refusal {
                return Err(BusError::new(reason.clone()));
            }
            let channel = state
                .topics
                .entry(topic.clone())
                .or_insert_with(TopicChannel::new);
            let rx = channel
                .rx
                .take()
                .ok_or_else(|| BusError::new(format!("'{topic}' already subscribed")))?;
            let delivered = channel.delivered.clone();
            state.subscribed += 1;
            drop(state);
            self.notify.notify_waiters();

            Ok(Box::new(MemorySubscription {
                rx,
                delivered,
                notify: self.notify.clone(),
                in_hand: false,
            }) as Box<dyn Subscription>)
        })
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
    delivered: Arc<AtomicUsize>,
    notify: Arc<Notify>,
    /// A message was handed out and not yet acknowledged by the next `recv`.
    in_hand: bool,
}

impl Subscription for MemorySubscription {
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Message>, BusError>> + Send + '_>> {
        Box::pin(async move {
            if std::mem::take(&mut self.in_hand) {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                self.notify.notify_waiters();
            }
            match self.rx.recv().await {
                Some(Ok(message)) => {
                    self.in_hand = true;
                    Ok(Some(message))
                }
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    committed: Vec<Vec<Statement>>,
    attempts: usize,
    unreachable: bool,
    stalled: bool,
}

/// Records committed transactions and tracks leased connections.
///
/// A transaction holds a lease for as long as its future is alive, so
/// `open_transactions()` drops back to zero when a stalled unit is abandoned.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    open: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

struct Lease {
    open: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Lease {
    fn acquire(open: &Arc<AtomicUsize>, notify: &Arc<Notify>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        notify.notify_waiters();
        Self {
            open: open.clone(),
            notify: notify.clone(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every subsequent transaction with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Make subsequent transactions hang until dropped.
    pub fn set_stalled(&self, stalled: bool) {
        lock(&self.state).stalled = stalled;
    }

    /// Committed units of work, in commit order.
    pub fn transactions(&self) -> Vec<Vec<Statement>> {
        lock(&self.state).committed.clone()
    }

    /// Committed `INSERT` statements targeting `table`.
    pub fn inserts_into(&self, table: &str) -> Vec<Statement> {
        let prefix = format!("INSERT INTO {table} ");
        lock(&self.state)
            .committed
            .iter()
            .flatten()
            .filter(|s| s.sql.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Transactions started, whatever their outcome.
    pub fn attempts(&self) -> usize {
        lock(&self.state).attempts
    }

    pub fn open_transactions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn wait_for_transactions(&self, n: usize) {
        wait_until(&self.notify, "commits", || self.transactions().len() >= n).await;
    }

    pub async fn wait_for_inserts(&self, table: &str, n: usize) {
        wait_until(&self.notify, "inserts", || self.inserts_into(table).len() >= n).await;
    }

    pub async fn wait_for_open(&self, n: usize) {
        wait_until(&self.notify, "open transactions", || self.open_transactions() >= n).await;
    }
}

impl Store for MemoryStore {
    fn transaction(
        &self,
        statements: Vec<Statement>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            lock(&self.state).attempts += 1;
            let _lease = Lease::acquire(&self.open, &self.notify);
            tokio::task::yield_now().await;

            let (unreachable, stalled) = {
                let state = lock(&self.state);
                (state.unreachable, state.stalled)
            };
            if unreachable {
                return Err(StoreError::connection("database unreachable"));
            }
            if stalled {
                std::future::pending::<()>().await;
            }

            lock(&self.state).committed.push(statements);
            self.notify.notify_waiters();
            Ok(())
        })
    }
}
