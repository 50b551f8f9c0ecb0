//! In-process connector. Each dial hands its server half to whoever holds
//! the receiver returned by [`MemoryConnector::new`], which plays the
//! realtime endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use msgr_core::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::frames::TOPIC_CREATE_QUEUE;
use crate::mqtt::{Connect, Packet};
use crate::transport::{ConnectRequest, FrameTransport, StreamConnector};

pub struct MemoryConnector {
    dials: mpsc::UnboundedSender<ServerConn>,
    refusals: Mutex<VecDeque<Error>>,
    attempts: AtomicU32,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (dials, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            dials,
            refusals: Mutex::new(VecDeque::new()),
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Fail the next dial with `err`. Calls queue up.
    pub fn refuse_next(&self, err: Error) {
        self.refusals.lock().push_back(err);
    }

    /// Dials made so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamConnector for MemoryConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn FrameTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.refusals.lock().pop_front() {
            return Err(err);
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        self.dials
            .send(ServerConn {
                request,
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| Error::Network("connection refused".into()))?;

        Ok(Box::new(MemoryTransport {
            tx: Some(client_tx),
            rx: client_rx,
        }))
    }
}

pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Network("transport closed".into()))?;
        tx.send(frame)
            .map_err(|_| Error::Network("peer went away".into()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Server end of one in-memory connection. Dropping it closes the
/// connection from the server side.
pub struct ServerConn {
    pub request: ConnectRequest,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl ServerConn {
    /// Next packet from the client; `None` once it hung up.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        match self.incoming.recv().await {
            Some(frame) => Packet::decode(&frame).map(Some),
            None => Ok(None),
        }
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send_raw(packet.encode())
    }

    pub fn send_raw(&self, frame: Vec<u8>) -> Result<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| Error::Network("client went away".into()))
    }

    /// Play the server side of the handshake: CONNACK the CONNECT, SUBACK
    /// the SUBSCRIBE and swallow the sync queue request.
    pub async fn accept(&mut self) -> Result<Connect> {
        self.accept_with(0).await
    }

    /// Handshake that answers CONNECT with `return_code`. A non-zero code
    /// ends the exchange after CONNACK.
    pub async fn accept_with(&mut self, return_code: u8) -> Result<Connect> {
        let connect = match self.next_packet().await? {
            Some(Packet::Connect(connect)) => connect,
            other => return Err(unexpected("CONNECT", other)),
        };
        self.send_packet(&Packet::ConnAck {
            session_present: false,
            return_code,
        })?;
        if return_code != 0 {
            return Ok(connect);
        }

        let packet_id = match self.next_packet().await? {
            Some(Packet::Subscribe { packet_id, topics }) => {
                let granted = vec![0; topics.len()];
                self.send_packet(&Packet::SubAck { packet_id, granted })?;
                packet_id
            }
            other => return Err(unexpected("SUBSCRIBE", other)),
        };
        match self.next_packet().await? {
            Some(Packet::Publish(p)) if p.topic == TOPIC_CREATE_QUEUE => {}
            other => return Err(unexpected("sync queue PUBLISH", other)),
        }
        tracing::debug!("In-memory handshake complete (subscribe id {})", packet_id);
        Ok(connect)
    }
}

fn unexpected(wanted: &str, got: Option<Packet>) -> Error {
    Error::Protocol(format!(
        "expected {}, got {}",
        wanted,
        got.map(|p| p.name()).unwrap_or("hang-up")
    ))
}
