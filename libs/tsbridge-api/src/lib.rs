pub mod bus;
pub mod de;
pub mod error;
pub mod schema;
pub mod store;
pub mod value;

pub use bus::{Message, MessageBus, Subscription};
pub use error::{BusError, StoreError, StoreErrorKind, ValidationError};
pub use schema::{Acceptance, RecordSchema};
pub use store::{Statement, Store};
pub use value::BindValue;
