//! Session guardian — keep-alive, token refresh, logout recovery.
//!
//! One periodic task per session. Each tick starts at most one cycle; a
//! tick that finds the previous cycle still running is skipped, and every
//! cycle is bounded by a timeout so a hung request cannot stall scheduling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use msgr_core::{ConnectionState, Error};
use msgr_events::{EventDispatcher, EventKind, FatalError, Warning, WarningKind};
use msgr_session::{rebootstrap, SessionContext, TaskTicket};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Path of the lightweight keep-alive request.
pub const KEEP_ALIVE_PATH: &str = "/ajax/presence/reconnect.php?reason=14";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianCounters {
    pub keep_alives_sent: u64,
    pub cycles_completed: u64,
    pub ticks_skipped: u64,
    pub cycles_timed_out: u64,
    pub token_refreshes: u64,
    pub recoveries: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGuardianStatus {
    pub last_refresh: DateTime<Utc>,
    /// `None` when proactive refresh is off.
    pub next_refresh: Option<DateTime<Utc>>,
    /// Minutes.
    pub keep_alive_interval: u64,
    pub connection_state: ConnectionState,
    pub running: bool,
    #[serde(flatten)]
    pub counters: GuardianCounters,
}

#[derive(Default)]
struct Counters {
    keep_alives_sent: AtomicU64,
    cycles_completed: AtomicU64,
    ticks_skipped: AtomicU64,
    cycles_timed_out: AtomicU64,
    token_refreshes: AtomicU64,
    recoveries: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> GuardianCounters {
        GuardianCounters {
            keep_alives_sent: self.keep_alives_sent.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            cycles_timed_out: self.cycles_timed_out.load(Ordering::Relaxed),
            token_refreshes: self.token_refreshes.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    in_flight: AtomicBool,
    /// An auth alarm arrived while a cycle was running.
    pending_alarm: AtomicBool,
    running: AtomicBool,
    /// Drives both the due check and the reported refresh times.
    last_refresh_at: Mutex<Instant>,
    counters: Counters,
}

/// Clears the in-flight flag on every exit path, abort included.
struct InFlightGuard(Arc<Shared>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Where an auth-class failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthSource {
    KeepAlive,
    Refresh,
    Request,
}

pub struct SessionGuardian;

impl SessionGuardian {
    /// Arm the guardian for `ctx`. The task is registered with the
    /// session's task registry and runs until cancelled or terminated.
    pub fn spawn(ctx: Arc<SessionContext>, events: EventDispatcher) -> GuardianHandle {
        let shared = Arc::new(Shared {
            in_flight: AtomicBool::new(false),
            pending_alarm: AtomicBool::new(false),
            running: AtomicBool::new(true),
            last_refresh_at: Mutex::new(token_age_anchor(ctx.tokens().refreshed_at)),
            counters: Counters::default(),
        });

        info!(
            "Session guardian armed: keep-alive every {} min, refresh every {} min (auto={}), anti-logout={}",
            ctx.config().keep_alive_interval,
            ctx.config().token_refresh_interval,
            ctx.config().auto_refresh_token,
            ctx.config().anti_logout
        );

        let (ticket, _handle) = ctx.registry().spawn(
            "session-guardian",
            run(ctx.clone(), events, shared.clone()),
        );

        GuardianHandle {
            ticket,
            ctx,
            shared,
        }
    }
}

/// Handle to an armed guardian; its ticket identifies the scheduled task.
pub struct GuardianHandle {
    ticket: TaskTicket,
    ctx: Arc<SessionContext>,
    shared: Arc<Shared>,
}

impl GuardianHandle {
    pub fn ticket(&self) -> &TaskTicket {
        &self.ticket
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> GuardianCounters {
        self.shared.counters.snapshot()
    }

    /// Stop scheduling. A cycle already in flight is left to its timeout.
    pub fn cancel(&self) -> bool {
        self.shared.running.store(false, Ordering::SeqCst);
        self.ctx.registry().cancel(&self.ticket.id)
    }

    pub fn status(&self) -> SessionGuardianStatus {
        let config = self.ctx.config();
        let elapsed = self.shared.last_refresh_at.lock().elapsed();
        let since = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        let last_refresh = Utc::now() - since;
        let next_refresh = config.auto_refresh_token.then(|| {
            last_refresh + chrono::Duration::minutes(config.token_refresh_interval as i64)
        });

        SessionGuardianStatus {
            last_refresh,
            next_refresh,
            keep_alive_interval: config.keep_alive_interval,
            connection_state: self.ctx.connection_state(),
            running: self.is_running(),
            counters: self.counters(),
        }
    }
}

impl Drop for GuardianHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ---------------------------------------------------------------
// Scheduling loop
// ---------------------------------------------------------------

async fn run(ctx: Arc<SessionContext>, events: EventDispatcher, shared: Arc<Shared>) {
    let period = ctx.config().keep_alive();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let reactive = tokio::select! {
            _ = ticker.tick() => false,
            _ = ctx.auth_alarm().notified() => true,
            _ = ctx.terminated() => break,
        };
        if ctx.is_terminated() {
            break;
        }

        if shared.in_flight.swap(true, Ordering::SeqCst) {
            if reactive {
                shared.pending_alarm.store(true, Ordering::SeqCst);
                debug!("Auth alarm deferred until the running cycle ends");
            } else {
                shared.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                debug!("Guardian tick skipped: previous cycle still in flight");
            }
            continue;
        }

        let guard = InFlightGuard(shared.clone());
        let cycle = bounded_cycle(ctx.clone(), events.clone(), shared.clone(), reactive, guard);
        ctx.registry().spawn("guardian-cycle", cycle);
    }

    shared.running.store(false, Ordering::SeqCst);
    debug!("Session guardian stopped");
}

async fn bounded_cycle(
    ctx: Arc<SessionContext>,
    events: EventDispatcher,
    shared: Arc<Shared>,
    reactive: bool,
    guard: InFlightGuard,
) {
    let limit = ctx.config().guardian_cycle_timeout();
    match tokio::time::timeout(limit, cycle(&ctx, &events, &shared, reactive)).await {
        Ok(()) => {
            shared.counters.cycles_completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            shared.counters.cycles_timed_out.fetch_add(1, Ordering::Relaxed);
            warn!("Guardian cycle abandoned after {:?}", limit);
        }
    }

    // Release the slot before re-raising so the loop can start the
    // deferred reactive cycle.
    drop(guard);
    if shared.pending_alarm.swap(false, Ordering::SeqCst) && !ctx.is_terminated() {
        debug!("Replaying auth alarm deferred during the last cycle");
        ctx.raise_auth_alarm();
    }
}

async fn cycle(ctx: &SessionContext, events: &EventDispatcher, shared: &Shared, reactive: bool) {
    if reactive {
        debug!("Guardian woken by an auth-class request failure");
        handle_auth_failure(
            ctx,
            events,
            shared,
            Error::AuthExpired("request rejected with an auth-class error".into()),
            AuthSource::Request,
        )
        .await;
        return;
    }

    match ctx.probe(&ctx.url(KEEP_ALIVE_PATH)).await {
        Ok(_) => {
            shared.counters.keep_alives_sent.fetch_add(1, Ordering::Relaxed);
            debug!("Keep-alive ok");
        }
        Err(e) if e.is_auth() => {
            shared.counters.keep_alives_sent.fetch_add(1, Ordering::Relaxed);
            handle_auth_failure(ctx, events, shared, e, AuthSource::KeepAlive).await;
            return;
        }
        Err(e) => {
            shared.counters.keep_alives_sent.fetch_add(1, Ordering::Relaxed);
            warn!("Keep-alive failed: {}", e);
            publish_warning(events, WarningKind::Network, format!("keep-alive failed: {}", e));
        }
    }

    let refresh_due = ctx.config().auto_refresh_token
        && shared.last_refresh_at.lock().elapsed() >= ctx.config().token_refresh();
    if refresh_due {
        refresh(ctx, events, shared).await;
    }
}

async fn refresh(ctx: &SessionContext, events: &EventDispatcher, shared: &Shared) {
    match rebootstrap(ctx).await {
        Ok(_) => {
            *shared.last_refresh_at.lock() = Instant::now();
            shared.counters.token_refreshes.fetch_add(1, Ordering::Relaxed);
            info!("Anti-forgery token refreshed");
        }
        Err(e) if e.is_auth() => {
            handle_auth_failure(ctx, events, shared, e, AuthSource::Refresh).await;
        }
        Err(e) => {
            warn!("Token refresh failed: {}", e);
            publish_warning(
                events,
                WarningKind::TokenRefreshFailed,
                format!("token refresh failed: {}", e),
            );
        }
    }
}

/// One silent re-bootstrap, or termination.
async fn handle_auth_failure(
    ctx: &SessionContext,
    events: &EventDispatcher,
    shared: &Shared,
    cause: Error,
    source: AuthSource,
) {
    let config = ctx.config();
    // A rejected request with proactive refresh on still earns one token
    // refresh; an observed logout needs anti-logout for a second chance.
    let may_recover = config.anti_logout
        || (source == AuthSource::Request && config.auto_refresh_token);

    if !may_recover {
        terminate(ctx, events, cause);
        return;
    }

    warn!("Logout detected ({:?}): {}; attempting silent re-bootstrap", source, cause);
    match rebootstrap(ctx).await {
        Ok(_) => {
            *shared.last_refresh_at.lock() = Instant::now();
            shared.counters.recoveries.fetch_add(1, Ordering::Relaxed);
            info!("Session recovered");
            publish_warning(
                events,
                WarningKind::SessionRecovered,
                format!("session recovered after: {}", cause),
            );
        }
        Err(e) => {
            let fatal = if e.is_fatal() {
                e
            } else {
                Error::AuthExpired(format!("{}; re-bootstrap failed: {}", cause, e))
            };
            terminate(ctx, events, fatal);
        }
    }
}

fn terminate(ctx: &SessionContext, events: &EventDispatcher, cause: Error) {
    if ctx.terminate(cause.clone()) {
        error!("Guardian terminated the session: {}", cause);
        let _ = events.publish(EventKind::Error(FatalError::from(&cause)));
    }
}

/// Tokio instant matching a wall-clock refresh time, so elapsed-time
/// checks follow the runtime clock.
fn token_age_anchor(refreshed_at: DateTime<Utc>) -> Instant {
    let age = (Utc::now() - refreshed_at).to_std().unwrap_or_default();
    let now = Instant::now();
    now.checked_sub(age).unwrap_or(now)
}

fn publish_warning(events: &EventDispatcher, kind: WarningKind, message: String) {
    if events.publish(EventKind::Warning(Warning::new(kind, message))).is_err() {
        debug!("Dispatcher closed; guardian warning dropped");
    }
}
