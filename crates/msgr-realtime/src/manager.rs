//! Stream manager — dial, handshake, stream, reconnect.
//!
//! One task per listening session. It owns the transport and walks
//! `Connecting -> Connected -> Streaming`, drops to `Reconnecting` on any
//! loss and redials after a [`Backoff`] delay until stopped or until the
//! session is terminated. Everything it learns reaches the consumer through
//! the [`EventDispatcher`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use msgr_core::{ConnectionState, Error, Result};
use msgr_events::{EventDispatcher, EventKind, FatalError, Warning, WarningKind};
use msgr_session::{SessionContext, TaskTicket};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, MalformedWindow};
use crate::frames::{self, create_queue_payload, SUBSCRIPTIONS, TOPIC_CREATE_QUEUE};
use crate::mqtt::{
    Connect, Packet, Publish, CONNACK_BAD_CREDENTIALS, CONNACK_NOT_AUTHORIZED,
};
use crate::transport::{ConnectRequest, FrameTransport, StreamConnector};

/// MQTT client id the web client presents.
pub const MQTT_CLIENT_ID: &str = "mqttwsclient";
pub const MQTT_KEEP_ALIVE_SECS: u16 = 10;
/// Endpoint that marks a thread read.
pub const MARK_READ_PATH: &str = "/ajax/mercury/change_read_status.php";

const APP_ID: &str = "219994525426954";
const RECENT_DELAYS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Connected,
    Streaming,
    Reconnecting,
    Closed,
}

impl StreamState {
    /// Session-level state this stream state implies.
    pub fn connection_state(self) -> ConnectionState {
        match self {
            Self::Idle | Self::Connected | Self::Closed => ConnectionState::Authenticated,
            Self::Connecting => ConnectionState::Connecting,
            Self::Streaming => ConnectionState::Streaming,
            Self::Reconnecting => ConnectionState::Reconnecting,
        }
    }
}

/// Result of [`StreamHandle::stop_listening`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopOutcome {
    Stopped,
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub state: StreamState,
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub events_published: u64,
    pub last_delay_ms: Option<u64>,
    /// Most recent reconnect delays, oldest first.
    pub recent_delays_ms: Vec<u64>,
}

#[derive(Default)]
struct Counters {
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
    events_published: AtomicU64,
}

struct Shared {
    ctx: Arc<SessionContext>,
    events: EventDispatcher,
    connector: Arc<dyn StreamConnector>,
    state: watch::Sender<StreamState>,
    stop: watch::Sender<bool>,
    counters: Counters,
    delays: Mutex<VecDeque<Duration>>,
}

impl Shared {
    fn set_state(&self, next: StreamState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Stream state: {:?} -> {:?}", current, next);
            *current = next;
            true
        });
        self.ctx.set_connection_state(next.connection_state());
    }

    fn record_delay(&self, delay: Duration) {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        let mut delays = self.delays.lock();
        if delays.len() == RECENT_DELAYS {
            delays.pop_front();
        }
        delays.push_back(delay);
    }

    fn publish(&self, kind: EventKind) {
        match self.events.publish(kind) {
            Ok(_) => {
                self.counters.events_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => debug!("Dispatcher closed; stream event dropped"),
        }
    }

    fn warn(&self, kind: WarningKind, message: String) {
        self.publish(EventKind::Warning(Warning::new(kind, message)));
    }

    fn stats(&self) -> StreamStats {
        let delays = self.delays.lock();
        StreamStats {
            state: *self.state.borrow(),
            connect_attempts: self.counters.connect_attempts.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            malformed_frames: self.counters.malformed_frames.load(Ordering::Relaxed),
            events_published: self.counters.events_published.load(Ordering::Relaxed),
            last_delay_ms: delays.back().map(|d| d.as_millis() as u64),
            recent_delays_ms: delays.iter().map(|d| d.as_millis() as u64).collect(),
        }
    }
}

/// How one connection ended.
enum SessionEnd {
    Stopped,
    Terminated,
    Lost { error: Error, uptime: Duration },
}

fn lost(error: Error, uptime: Duration) -> SessionEnd {
    SessionEnd::Lost { error, uptime }
}

enum Step {
    Stop,
    Terminated,
    Frame(Result<Option<Vec<u8>>>),
    Ping,
    PongOverdue,
}

pub struct StreamManager {
    shared: Arc<Shared>,
    backoff: Backoff,
    malformed: MalformedWindow,
    last_seq_id: Option<u64>,
    packet_id: u16,
}

impl StreamManager {
    /// Start streaming for `ctx`. The task is registered with the session's
    /// task registry and runs until stopped or terminated.
    pub fn spawn(
        ctx: Arc<SessionContext>,
        events: EventDispatcher,
        connector: Arc<dyn StreamConnector>,
    ) -> StreamHandle {
        let (state, _) = watch::channel(StreamState::Idle);
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            ctx: ctx.clone(),
            events,
            connector,
            state,
            stop,
            counters: Counters::default(),
            delays: Mutex::new(VecDeque::new()),
        });

        let manager = StreamManager {
            shared: shared.clone(),
            backoff: Backoff::from_config(ctx.config()),
            malformed: MalformedWindow::from_config(ctx.config()),
            last_seq_id: None,
            packet_id: 0,
        };
        let (ticket, task) = ctx.registry().spawn("realtime-stream", manager.run());

        StreamHandle {
            ticket,
            shared,
            task: Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
        }
    }

    // ---------------------------------------------------------------
    // Reconnect loop
    // ---------------------------------------------------------------

    async fn run(mut self) {
        let shared = self.shared.clone();
        let ctx = shared.ctx.clone();
        let mut stop = shared.stop.subscribe();

        loop {
            if *stop.borrow() {
                break;
            }
            if let Some(cause) = ctx.terminal_cause() {
                warn!("Session terminated; realtime stream gives up: {}", cause);
                shared.publish(EventKind::Error(FatalError {
                    kind: cause.kind(),
                    message: format!("realtime stream aborted: {}", cause),
                }));
                break;
            }

            shared.set_state(StreamState::Connecting);
            match self.connect_and_stream(&mut stop).await {
                SessionEnd::Stopped => break,
                SessionEnd::Terminated => continue,
                SessionEnd::Lost { error, uptime } => {
                    if uptime >= ctx.config().backoff_reset_after() {
                        self.backoff.reset();
                    }
                    if error.is_auth() {
                        ctx.raise_auth_alarm();
                    }
                    let delay = self.backoff.next_delay();
                    shared.record_delay(delay);
                    shared.set_state(StreamState::Reconnecting);
                    warn!(
                        "Realtime stream lost after {:?}: {}; reconnecting in {:?}",
                        uptime, error, delay
                    );
                    let kind = match &error {
                        Error::Protocol(_) => WarningKind::Protocol,
                        _ => WarningKind::Network,
                    };
                    shared.warn(
                        kind,
                        format!(
                            "stream lost ({}); reconnecting in {} ms",
                            error,
                            delay.as_millis()
                        ),
                    );

                    tokio::select! {
                        biased;
                        _ = stopped(&mut stop) => break,
                        _ = ctx.terminated() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        shared.set_state(StreamState::Closed);
        debug!("Realtime stream task finished");
    }

    // ---------------------------------------------------------------
    // One connection
    // ---------------------------------------------------------------

    async fn connect_and_stream(&mut self, stop: &mut watch::Receiver<bool>) -> SessionEnd {
        let shared = self.shared.clone();
        let ctx = shared.ctx.clone();
        let config = ctx.config();
        shared
            .counters
            .connect_attempts
            .fetch_add(1, Ordering::Relaxed);

        let session_id: u64 = rand::thread_rng().gen_range(1..(1u64 << 53));
        let request = match ConnectRequest::for_session(&ctx, session_id) {
            Ok(request) => request,
            Err(e) => return lost(e, Duration::ZERO),
        };
        debug!("Dialing {}", request.url);

        let dial = tokio::select! {
            biased;
            _ = stopped(stop) => return SessionEnd::Stopped,
            _ = ctx.terminated() => return SessionEnd::Terminated,
            dial = timeout(config.connect_timeout(), shared.connector.connect(request)) => dial,
        };
        let mut transport = match dial {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return lost(e, Duration::ZERO),
            Err(_) => {
                return lost(
                    Error::Timeout(format!("dial exceeded {:?}", config.connect_timeout())),
                    Duration::ZERO,
                )
            }
        };

        if let Err(e) = self.handshake(transport.as_mut(), &ctx, session_id, stop).await {
            let _ = transport.close().await;
            return match e {
                HandshakeEnd::Stopped => SessionEnd::Stopped,
                HandshakeEnd::Terminated => SessionEnd::Terminated,
                HandshakeEnd::Failed(error) => lost(error, Duration::ZERO),
            };
        }

        shared.set_state(StreamState::Streaming);
        info!("Realtime stream up for user {}", ctx.user_id());
        let connected_at = Instant::now();
        self.malformed.clear();

        let ping_every = config.ping_interval();
        let mut ping = interval_at(connected_at + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = stopped(stop) => Step::Stop,
                _ = ctx.terminated() => Step::Terminated,
                frame = transport.recv() => Step::Frame(frame),
                _ = ping.tick() => Step::Ping,
                _ = overdue(pong_deadline) => Step::PongOverdue,
            };
            let uptime = connected_at.elapsed();

            match step {
                Step::Stop => {
                    close_gracefully(transport.as_mut(), config.close_timeout()).await;
                    return SessionEnd::Stopped;
                }
                Step::Terminated => {
                    let _ = transport.close().await;
                    return SessionEnd::Terminated;
                }
                Step::Frame(Ok(Some(bytes))) => {
                    shared
                        .counters
                        .frames_received
                        .fetch_add(1, Ordering::Relaxed);
                    let outcome = match Packet::decode(&bytes) {
                        Ok(Packet::PingResp) => {
                            pong_deadline = None;
                            Ok(())
                        }
                        Ok(packet) => self.handle_packet(transport.as_mut(), packet).await,
                        Err(e) => self.malformed(e),
                    };
                    if let Err(e) = outcome {
                        let _ = transport.close().await;
                        return lost(e, uptime);
                    }
                }
                Step::Frame(Ok(None)) => {
                    return lost(Error::Network("closed by server".into()), uptime)
                }
                Step::Frame(Err(e)) => return lost(e, uptime),
                Step::Ping => {
                    if pong_deadline.is_none() {
                        if let Err(e) = transport.send(Packet::PingReq.encode()).await {
                            return lost(e, uptime);
                        }
                        pong_deadline = Some(Instant::now() + config.pong_timeout());
                    }
                }
                Step::PongOverdue => {
                    let _ = transport.close().await;
                    return lost(
                        Error::Timeout(format!("no PINGRESP within {:?}", config.pong_timeout())),
                        uptime,
                    );
                }
            }
        }
    }

    /// CONNECT, await CONNACK, then subscribe and open the sync queue.
    async fn handshake(
        &mut self,
        transport: &mut dyn FrameTransport,
        ctx: &SessionContext,
        session_id: u64,
        stop: &mut watch::Receiver<bool>,
    ) -> std::result::Result<(), HandshakeEnd> {
        let limit = ctx.config().connect_timeout();
        transport
            .send(connect_packet(ctx, session_id).encode())
            .await
            .map_err(HandshakeEnd::Failed)?;

        let ack = tokio::select! {
            biased;
            _ = stopped(stop) => return Err(HandshakeEnd::Stopped),
            _ = ctx.terminated() => return Err(HandshakeEnd::Terminated),
            ack = timeout(limit, transport.recv()) => ack,
        };
        let bytes = match ack {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                return Err(HandshakeEnd::Failed(Error::Network(
                    "closed during handshake".into(),
                )))
            }
            Ok(Err(e)) => return Err(HandshakeEnd::Failed(e)),
            Err(_) => {
                return Err(HandshakeEnd::Failed(Error::Timeout(format!(
                    "no CONNACK within {:?}",
                    limit
                ))))
            }
        };
        match Packet::decode(&bytes).map_err(HandshakeEnd::Failed)? {
            Packet::ConnAck { return_code: 0, .. } => {}
            Packet::ConnAck { return_code, .. }
                if return_code == CONNACK_BAD_CREDENTIALS || return_code == CONNACK_NOT_AUTHORIZED =>
            {
                return Err(HandshakeEnd::Failed(Error::AuthExpired(format!(
                    "CONNACK refused with code {}",
                    return_code
                ))))
            }
            Packet::ConnAck { return_code, .. } => {
                return Err(HandshakeEnd::Failed(Error::Protocol(format!(
                    "CONNACK refused with code {}",
                    return_code
                ))))
            }
            other => {
                return Err(HandshakeEnd::Failed(Error::Protocol(format!(
                    "expected CONNACK, got {}",
                    other.name()
                ))))
            }
        }
        self.shared.set_state(StreamState::Connected);

        let subscribe = Packet::Subscribe {
            packet_id: self.next_packet_id(),
            topics: SUBSCRIPTIONS.iter().map(|t| (t.to_string(), 0)).collect(),
        };
        transport
            .send(subscribe.encode())
            .await
            .map_err(HandshakeEnd::Failed)?;

        let resume = self
            .last_seq_id
            .map(|seq| seq.to_string())
            .or_else(|| ctx.page_hints().iris_seq_id);
        let queue = Publish::new(
            TOPIC_CREATE_QUEUE,
            create_queue_payload(&ctx.user_id(), resume.as_deref()),
        )
        .with_qos1(self.next_packet_id());
        transport
            .send(Packet::Publish(queue).encode())
            .await
            .map_err(HandshakeEnd::Failed)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Inbound packets
    // ---------------------------------------------------------------

    async fn handle_packet(
        &mut self,
        transport: &mut dyn FrameTransport,
        packet: Packet,
    ) -> Result<()> {
        match packet {
            Packet::Publish(publish) => {
                if publish.qos > 0 {
                    if let Some(id) = publish.packet_id {
                        transport
                            .send(Packet::PubAck { packet_id: id }.encode())
                            .await?;
                    }
                }
                match frames::decode_publish(&publish.topic, &publish.payload) {
                    Ok(decoded) => {
                        if let Some(seq) = decoded.last_seq_id {
                            self.last_seq_id = Some(seq);
                        }
                        for kind in decoded.events {
                            self.deliver(kind);
                        }
                        Ok(())
                    }
                    Err(e) => self.malformed(e),
                }
            }
            Packet::PingReq => transport.send(Packet::PingResp.encode()).await,
            Packet::SubAck { packet_id, granted } => {
                if granted.iter().any(|&code| code == 0x80) {
                    warn!("Server rejected some subscriptions (SUBACK {})", packet_id);
                }
                Ok(())
            }
            Packet::PubAck { packet_id } => {
                debug!("PUBACK {}", packet_id);
                Ok(())
            }
            Packet::Disconnect => Err(Error::Network("server sent DISCONNECT".into())),
            other => {
                debug!("Ignoring unexpected {}", other.name());
                Ok(())
            }
        }
    }

    /// Drop one malformed frame. Too many within the window forces a
    /// reconnect.
    fn malformed(&mut self, error: Error) -> Result<()> {
        self.shared
            .counters
            .malformed_frames
            .fetch_add(1, Ordering::Relaxed);
        warn!("Dropping malformed frame: {}", error);
        self.shared
            .warn(WarningKind::Protocol, format!("malformed frame dropped: {}", error));

        if self.malformed.record(Instant::now()) {
            let config = self.shared.ctx.config();
            return Err(Error::Protocol(format!(
                "more than {} malformed frames within {:?}",
                config.malformed_threshold,
                config.malformed_window()
            )));
        }
        Ok(())
    }

    fn deliver(&self, kind: EventKind) {
        let ctx = &self.shared.ctx;
        if let EventKind::Message(message) = &kind {
            let own = message.sender_id == ctx.user_id();
            if own && !ctx.config().self_listen {
                debug!("Skipping own message {}", message.message_id);
                return;
            }
            if !own && ctx.config().auto_mark_read {
                mark_read(ctx.clone(), message.thread_id.clone());
            }
        }
        self.shared.publish(kind);
    }

    fn next_packet_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.checked_add(1).unwrap_or(1);
        self.packet_id
    }
}

enum HandshakeEnd {
    Stopped,
    Terminated,
    Failed(Error),
}

fn connect_packet(ctx: &SessionContext, session_id: u64) -> Packet {
    let username = json!({
        "u": ctx.user_id(),
        "s": session_id,
        "chat_on": ctx.config().online,
        "fg": false,
        "d": ctx.client_id(),
        "ct": "websocket",
        "aid": APP_ID,
        "mqtt_sid": "",
        "cp": 3,
        "ecp": 10,
        "st": SUBSCRIPTIONS,
        "pm": [],
        "dc": "",
        "no_auto_fg": true,
        "gas": null,
        "pack": [],
        "a": ctx.stealth().user_agent(),
    });
    Packet::Connect(Connect {
        client_id: MQTT_CLIENT_ID.to_string(),
        username: username.to_string(),
        keep_alive: MQTT_KEEP_ALIVE_SECS,
        clean_session: true,
    })
}

fn mark_read(ctx: Arc<SessionContext>, thread_id: String) {
    let task_ctx = ctx.clone();
    ctx.registry().spawn("mark-read", async move {
        let ctx = task_ctx;
        let key = format!("ids[{}]", thread_id);
        let watermark = Utc::now().timestamp_millis().to_string();
        let url = ctx.url(MARK_READ_PATH);
        let form = [
            (key.as_str(), "true"),
            ("watermarkTimestamp", watermark.as_str()),
            ("shouldSendReadReceipt", "true"),
        ];
        if let Err(e) = ctx.post_form(&url, &form).await {
            warn!("Marking thread {} read failed: {}", thread_id, e);
        }
    });
}

async fn close_gracefully(transport: &mut dyn FrameTransport, limit: Duration) {
    let close = async {
        let _ = transport.send(Packet::Disconnect.encode()).await;
        transport.close().await
    };
    match timeout(limit, close).await {
        Ok(Ok(())) => debug!("Realtime stream closed"),
        Ok(Err(e)) => debug!("Close failed: {}", e),
        Err(_) => warn!("Close not acknowledged within {:?}", limit),
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

async fn overdue(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------
// Handle
// ---------------------------------------------------------------

/// Handle to a running stream. Dropping it stops the stream.
pub struct StreamHandle {
    ticket: TaskTicket,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl StreamHandle {
    pub fn ticket(&self) -> &TaskTicket {
        &self.ticket
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> StreamStats {
        self.shared.stats()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Close the stream. The dispatcher is closed first, so no event is
    /// delivered once this returns. Only the first call does anything.
    pub async fn stop_listening(&self) -> StopOutcome {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return StopOutcome::NotConnected;
        }

        self.shared.events.close();
        self.shared.stop.send_replace(true);

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            let ctx = &self.shared.ctx;
            let grace = ctx.config().close_timeout() + Duration::from_secs(1);
            if timeout(grace, &mut task).await.is_err() {
                warn!("Realtime stream did not stop within {:?}; aborting", grace);
                task.abort();
                ctx.registry().cancel(&self.ticket.id);
            }
        }

        self.shared.set_state(StreamState::Closed);
        info!("Stopped listening");
        StopOutcome::Stopped
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.shared.stop.send_replace(true);
            self.shared.ctx.registry().cancel(&self.ticket.id);
        }
    }
}
