//! Data passed between the listener and the backends

pub mod event;
pub mod session;

pub use event::{Event, EventType, HttpRequestEvent};
pub use session::{SessionConnection, SessionState, SessionType};
