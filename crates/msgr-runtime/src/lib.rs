//! Engine facade — wires cookies, session, guardian, stream and dispatcher.
//!
//! [`Engine::login`] restores a session from an AppState; [`Engine::listen`]
//! registers the one event consumer and starts the realtime stream.

pub mod engine;
pub mod types;

pub use engine::{Engine, EngineBuilder};
pub use types::*;

pub use msgr_core::{ConnectionState, EngineConfig, Error, ErrorKind, Result};
pub use msgr_cookies::AppState;
pub use msgr_events::{Event, EventKind};
pub use msgr_realtime::StopOutcome;
