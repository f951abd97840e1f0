pub mod bus;
pub mod id;
pub mod thinking;

pub use bus::{BusEvent, EventBus};
pub use thinking::strip_thinking_tags;
