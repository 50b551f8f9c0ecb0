//! msgr realtime — the push stream.
//!
//! MQTT 3.1 packets ride WebSocket binary frames. [`StreamManager`] owns
//! the connection: handshake, subscriptions, heartbeat, frame
//! classification and reconnect with jittered exponential backoff. The
//! socket sits behind [`StreamConnector`] so tests can run the whole
//! lifecycle in memory through [`memory::MemoryConnector`].

pub mod backoff;
pub mod frames;
pub mod manager;
pub mod memory;
pub mod mqtt;
pub mod transport;

pub use backoff::{Backoff, MalformedWindow};
pub use manager::{StopOutcome, StreamHandle, StreamManager, StreamState, StreamStats};
pub use mqtt::Packet;
pub use transport::{
    ConnectRequest, FrameTransport, StreamConnector, WebSocketConnector, WebSocketTransport,
};
