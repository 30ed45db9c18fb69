//! Queue notifications: pub/sub mechanics and the kill sink.

pub mod bus;
pub mod in_memory_bus;
pub mod sink;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use sink::{EventSink, JobKilled, SinkError, TracingSink};
