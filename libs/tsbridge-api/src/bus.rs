use std::future::Future;
use std::pin::Pin;

use crate::error::BusError;

/// One message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

/// Filtered view of the bus for one topic.
pub trait Subscription: Send {
    /// Next message for this subscription.
    ///
    /// `Ok(None)` means the bus closed the stream cleanly.
    /// `Err` means the connection was lost.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Message>, BusError>> + Send + '_>>;
}

/// Publish/subscribe bus connection shared by all receivers.
pub trait MessageBus: Send + Sync {
    /// Register a subscription for `topic` and return its message stream.
    fn subscribe(
        &self,
        topic: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Subscription>, BusError>> + Send + '_>>;
}
