//! msgr events — typed event model and the single-consumer dispatcher.

pub mod dispatcher;
pub mod types;

pub use dispatcher::{DispatchOutcome, DispatcherStats, EventDispatcher};
pub use types::*;
