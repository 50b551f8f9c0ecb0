//! msgr core — error taxonomy, engine configuration, connection state.

pub mod config;
pub mod error;
pub mod state;

pub use config::EngineConfig;
pub use error::{Error, ErrorKind, Result};
pub use state::ConnectionState;
