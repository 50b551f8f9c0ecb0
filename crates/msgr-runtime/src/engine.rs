//! Engine — one restored session and everything running on it.

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use msgr_cookies::AppState;
use msgr_core::{ConnectionState, EngineConfig, Error, Result};
use msgr_events::{DispatcherStats, Event, EventDispatcher};
use msgr_guardian::{GuardianHandle, SessionGuardian, SessionGuardianStatus};
use msgr_realtime::{
    StopOutcome, StreamConnector, StreamHandle, StreamManager, StreamStats, WebSocketConnector,
};
use msgr_session::{AntiDetectionStatus, Bootstrap, HttpTransport, SessionContext};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::types::EngineStatus;

/// Configures how an [`Engine`] reaches the network.
pub struct EngineBuilder {
    config: EngineConfig,
    http: Option<Arc<dyn HttpTransport>>,
    connector: Option<Arc<dyn StreamConnector>>,
    seed: Option<u64>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            http: None,
            connector: None,
            seed: None,
        }
    }

    pub fn http(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.http = Some(transport);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Bootstrap the session and arm the guardian.
    pub async fn login(self, app_state: &AppState) -> Result<Engine> {
        let mut bootstrap = Bootstrap::new(self.config);
        if let Some(http) = self.http {
            bootstrap = bootstrap.transport(http);
        }
        if let Some(seed) = self.seed {
            bootstrap = bootstrap.seed(seed);
        }
        let ctx = bootstrap.run(app_state).await?;

        let events = EventDispatcher::new(ctx.config().event_queue_capacity);
        let guardian = ctx
            .config()
            .guardian_enabled()
            .then(|| SessionGuardian::spawn(ctx.clone(), events.clone()));
        let connector: Arc<dyn StreamConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector),
        };

        info!(
            "Engine ready for user {} (guardian {})",
            ctx.user_id(),
            if guardian.is_some() { "armed" } else { "off" }
        );

        Ok(Engine {
            ctx,
            events,
            connector,
            guardian,
            stream: Mutex::new(None),
            final_stream: Mutex::new(None),
            listening: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

pub struct Engine {
    ctx: Arc<SessionContext>,
    events: EventDispatcher,
    connector: Arc<dyn StreamConnector>,
    guardian: Option<GuardianHandle>,
    stream: Mutex<Option<StreamHandle>>,
    /// Counters of the stream as it stood when it was stopped.
    final_stream: Mutex<Option<StreamStats>>,
    listening: AtomicBool,
    stopped: AtomicBool,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Log in with the default HTTP client and WebSocket connector.
    pub async fn login(app_state: &AppState, config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).login(app_state).await
    }

    /// Normalize `input` (JSON, Netscape or header string) and log in.
    pub async fn login_with_cookies(input: &str, config: EngineConfig) -> Result<Self> {
        let app_state = AppState::parse(input)?;
        Self::login(&app_state, config).await
    }

    /// Read an AppState file and log in.
    pub async fn login_from_file(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let app_state = AppState::load(path)?;
        Self::login(&app_state, config).await
    }

    // ---------------------------------------------------------------
    // Listening
    // ---------------------------------------------------------------

    /// Register the event consumer and, when `listenEvents` is on, start
    /// the realtime stream. Events are delivered one at a time in sequence
    /// order.
    pub fn listen<F, Fut>(&self, listener: F) -> Result<()>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ctx.ensure_live()?;
        if self.stopped.load(Ordering::SeqCst) || self.events.is_closed() {
            return Err(Error::NotConnected);
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyListening);
        }

        let delivery = match self.events.register(listener) {
            Ok(delivery) => delivery,
            Err(e) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.ctx.registry().spawn("event-delivery", delivery);

        if self.ctx.config().listen_events {
            let handle = StreamManager::spawn(
                self.ctx.clone(),
                self.events.clone(),
                self.connector.clone(),
            );
            *self.stream.lock() = Some(handle);
            info!("Listening: realtime stream started");
        } else {
            info!("Listening without realtime stream (listenEvents is off)");
        }
        Ok(())
    }

    /// Stop the stream and event delivery. The first call after `listen`
    /// returns `Stopped`; every other call returns `NotConnected`.
    pub async fn stop_listening(&self) -> StopOutcome {
        if !self.listening.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return StopOutcome::NotConnected;
        }

        let stream = self.stream.lock().take();
        match stream {
            Some(handle) => {
                let outcome = handle.stop_listening().await;
                *self.final_stream.lock() = Some(handle.stats());
                outcome
            }
            None => {
                self.events.close();
                StopOutcome::Stopped
            }
        }
    }

    /// Stop listening, cancel the guardian and every other session task.
    pub async fn shutdown(&self) {
        let outcome = self.stop_listening().await;
        debug!("Shutdown: stop_listening -> {:?}", outcome);
        if let Some(guardian) = &self.guardian {
            guardian.cancel();
        }
        self.events.close();
        let cancelled = self.ctx.registry().cancel_all();
        info!("Engine shut down ({} tasks cancelled)", cancelled);
    }

    // ---------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn user_id(&self) -> String {
        self.ctx.user_id()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.ctx.connection_state()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    pub fn anti_detection_status(&self) -> AntiDetectionStatus {
        self.ctx.anti_detection_status()
    }

    pub fn guardian_status(&self) -> Option<SessionGuardianStatus> {
        self.guardian.as_ref().map(|g| g.status())
    }

    /// Live counters while listening, the final snapshot once stopped.
    pub fn stream_stats(&self) -> Option<StreamStats> {
        if let Some(stream) = self.stream.lock().as_ref() {
            return Some(stream.stats());
        }
        self.final_stream.lock().clone()
    }

    pub fn dispatcher_stats(&self) -> DispatcherStats {
        self.events.stats()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            user_id: self.ctx.user_id(),
            client_id: self.ctx.client_id().to_string(),
            connection_state: self.ctx.connection_state(),
            listening: self.is_listening(),
            anti_detection: self.anti_detection_status(),
            guardian: self.guardian_status(),
            stream: self.stream_stats(),
            dispatcher: self.dispatcher_stats(),
            terminal_cause: self.ctx.terminal_cause().map(|e| e.to_string()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.events.close();
        let cancelled = self.ctx.registry().cancel_all();
        debug!("Engine dropped, {} tasks cancelled", cancelled);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("ctx", &self.ctx)
            .field("listening", &self.is_listening())
            .field("guardian", &self.guardian.is_some())
            .finish()
    }
}
