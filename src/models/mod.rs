pub mod event;
pub mod forward;

// Re-export main types
pub use event::{Event, EventBus};
pub use forward::{Direction, ForwardSpec};
