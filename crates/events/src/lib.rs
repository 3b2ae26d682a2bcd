//! `tally-events` — message-bus abstraction for ledger domain events.
//!
//! The bus is the **transport** for events after they are committed to the
//! store via the transactional outbox; it is never the system of record.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod record;
pub mod tenant;

pub use bus::{Delivered, MessageBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryMessageBus};
pub use record::BusRecord;
pub use tenant::TenantScoped;
