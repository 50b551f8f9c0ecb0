//! Session context — identity, tokens, cookie jar and connection state.
//!
//! One context per engine. The guardian swaps tokens and the jar absorbs
//! `Set-Cookie` headers while action wrappers keep issuing requests; every
//! update is a whole-value swap under a short lock, never held across an
//! await.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use msgr_cookies::{AppState, CookieJar};
use msgr_core::{ConnectionState, EngineConfig, Error, Result};
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, warn};
use url::Url;

use crate::classify::{classify, is_logout_url};
use crate::extract::ExtractorChain;
use crate::registry::TaskRegistry;
use crate::stealth::{AntiDetection, AntiDetectionStatus};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Redirect hops followed by [`SessionContext::fetch_page`].
pub const MAX_REDIRECTS: usize = 3;

/// Anti-forgery token and its checksum. Replaced as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub fb_dtsg: String,
    pub jazoest: String,
    pub refreshed_at: DateTime<Utc>,
}

impl SessionTokens {
    pub fn new(fb_dtsg: impl Into<String>) -> Self {
        let fb_dtsg = fb_dtsg.into();
        Self {
            jazoest: compute_jazoest(&fb_dtsg),
            fb_dtsg,
            refreshed_at: Utc::now(),
        }
    }

    fn empty() -> Self {
        Self {
            fb_dtsg: String::new(),
            jazoest: String::new(),
            refreshed_at: Utc::now(),
        }
    }
}

/// Checksum of the token: "2" followed by the sum of its UTF-16 code units.
pub fn compute_jazoest(token: &str) -> String {
    let sum: u64 = token.encode_utf16().map(u64::from).sum();
    format!("2{}", sum)
}

/// Render `n` in base 36, as the request counter is sent.
pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Realtime hints found in page data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageHints {
    pub realtime_endpoint: Option<String>,
    pub iris_seq_id: Option<String>,
}

pub struct SessionContext {
    user_id: RwLock<String>,
    client_id: String,
    config: Arc<EngineConfig>,
    jar: RwLock<CookieJar>,
    tokens: RwLock<Arc<SessionTokens>>,
    hints: RwLock<PageHints>,
    request_counter: AtomicU64,
    state: watch::Sender<ConnectionState>,
    terminal: RwLock<Option<Error>>,
    auth_alarm: Notify,
    registry: TaskRegistry,
    stealth: AntiDetection,
    transport: Arc<dyn HttpTransport>,
    extractors: ExtractorChain,
}

impl SessionContext {
    pub(crate) fn assemble(
        user_id: String,
        client_id: String,
        config: EngineConfig,
        app_state: &AppState,
        stealth: AntiDetection,
        transport: Arc<dyn HttpTransport>,
        extractors: ExtractorChain,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            user_id: RwLock::new(user_id),
            client_id,
            config: Arc::new(config),
            jar: RwLock::new(CookieJar::from_app_state(app_state)),
            tokens: RwLock::new(Arc::new(SessionTokens::empty())),
            hints: RwLock::new(PageHints::default()),
            request_counter: AtomicU64::new(0),
            state,
            terminal: RwLock::new(None),
            auth_alarm: Notify::new(),
            registry: TaskRegistry::new(),
            stealth,
            transport,
            extractors,
        }
    }

    // ---------------------------------------------------------------
    // Identity and tokens
    // ---------------------------------------------------------------

    pub fn user_id(&self) -> String {
        self.user_id.read().clone()
    }

    pub(crate) fn set_user_id(&self, user_id: String) {
        *self.user_id.write() = user_id;
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tokens(&self) -> Arc<SessionTokens> {
        self.tokens.read().clone()
    }

    /// Replace token and checksum together.
    pub fn swap_tokens(&self, tokens: SessionTokens) -> Arc<SessionTokens> {
        let next = Arc::new(tokens);
        std::mem::replace(&mut *self.tokens.write(), next)
    }

    pub fn page_hints(&self) -> PageHints {
        self.hints.read().clone()
    }

    pub(crate) fn set_page_hints(&self, hints: PageHints) {
        *self.hints.write() = hints;
    }

    /// Next value of the per-session request counter.
    pub fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn request_count(&self) -> u64 {
        self.request_counter.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------
    // Cookies
    // ---------------------------------------------------------------

    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.jar.read().header_for(url)
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.jar.read().find(name).map(|c| c.value.clone())
    }

    /// Snapshot of the live jar.
    pub fn app_state(&self) -> AppState {
        self.jar.read().to_app_state()
    }

    fn absorb_cookies(&self, response: &HttpResponse) {
        if response.set_cookies.is_empty() {
            return;
        }
        let Ok(url) = Url::parse(&response.url) else {
            return;
        };
        let mut jar = self.jar.write();
        for header in &response.set_cookies {
            jar.apply_set_cookie(header, &url);
        }
        debug!("Absorbed {} Set-Cookie headers", response.set_cookies.len());
    }

    // ---------------------------------------------------------------
    // Connection state
    // ---------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Move to `next` unless the session is already terminated.
    pub fn set_connection_state(&self, next: ConnectionState) -> bool {
        if next.is_terminal() {
            warn!("Use terminate() to end a session");
            return false;
        }
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            debug!("Connection state: {} -> {}", current, next);
            *current = next;
            true
        })
    }

    /// End the session permanently with `cause`. Only the first call wins.
    pub fn terminate(&self, cause: Error) -> bool {
        {
            let mut slot = self.terminal.write();
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause.clone());
        }
        error!("Session terminated: {}", cause);
        self.state.send_modify(|s| *s = ConnectionState::Terminated);
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminal.read().is_some()
    }

    pub fn terminal_cause(&self) -> Option<Error> {
        self.terminal.read().clone()
    }

    /// Fail fast with the stored cause once terminated.
    pub fn ensure_live(&self) -> Result<()> {
        match self.terminal.read().as_ref() {
            Some(cause) => Err(cause.clone()),
            None => Ok(()),
        }
    }

    /// Resolves once the session is terminated.
    pub async fn terminated(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    // ---------------------------------------------------------------
    // Collaborators
    // ---------------------------------------------------------------

    /// Woken whenever a request through this context hits an auth-class error.
    pub fn auth_alarm(&self) -> &Notify {
        &self.auth_alarm
    }

    pub fn raise_auth_alarm(&self) {
        self.auth_alarm.notify_one();
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn stealth(&self) -> &AntiDetection {
        &self.stealth
    }

    pub fn anti_detection_status(&self) -> AntiDetectionStatus {
        self.stealth.status()
    }

    pub fn extractors(&self) -> &ExtractorChain {
        &self.extractors
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    // ---------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------

    /// Send one request through the anti-detection layer. No classification.
    pub async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        self.ensure_live()?;

        let url = Url::parse(&request.url)
            .map_err(|e| Error::Internal(format!("bad request URL {}: {}", request.url, e)))?;
        if request.header("Cookie").is_none() {
            if let Some(cookies) = self.cookie_header(&url) {
                request.set_header("Cookie", cookies);
            }
        }
        if request.header("Origin").is_none() {
            request.set_header("Origin", self.config.base_url.trim_end_matches('/'));
        }
        if request.header("Referer").is_none() {
            request.set_header("Referer", self.url("/"));
        }
        self.stealth.decorate(&mut request);
        self.stealth.pace().await;

        let timeout = self.config.request_timeout();
        let target = request.url.clone();
        let response = tokio::time::timeout(timeout, self.transport.execute(request))
            .await
            .map_err(|_| Error::Timeout(format!("{} after {:?}", target, timeout)))??;

        self.absorb_cookies(&response);
        Ok(response)
    }

    /// Classified GET. Auth-class failures wake the guardian.
    pub async fn get(&self, url: &str) -> Result<HttpResponse> {
        let result = match self.send(HttpRequest::get(url)).await {
            Ok(response) => classify(&response).map(|_| response),
            Err(e) => Err(e),
        };
        self.observe(result)
    }

    /// Classified GET that leaves the auth alarm alone. The guardian uses
    /// it for its own requests.
    pub async fn probe(&self, url: &str) -> Result<HttpResponse> {
        let response = self.send(HttpRequest::get(url)).await?;
        classify(&response)?;
        Ok(response)
    }

    /// Classified form POST carrying the session's standard fields.
    pub async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse> {
        let tokens = self.tokens();
        let user_id = self.user_id();
        let req_id = to_base36(self.next_request_id());

        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter().copied())
            .append_pair("__user", &user_id)
            .append_pair("__a", "1")
            .append_pair("__req", &req_id)
            .append_pair("fb_dtsg", &tokens.fb_dtsg)
            .append_pair("jazoest", &tokens.jazoest)
            .finish();

        let mut request = HttpRequest::post(url, body);
        request.set_header("Content-Type", "application/x-www-form-urlencoded");

        let result = match self.send(request).await {
            Ok(response) => classify(&response).map(|_| response),
            Err(e) => Err(e),
        };
        self.observe(result)
    }

    fn observe(&self, result: Result<HttpResponse>) -> Result<HttpResponse> {
        if let Err(e) = &result {
            if e.is_auth() && !self.is_terminated() {
                warn!("Auth-class failure, waking guardian: {}", e);
                self.raise_auth_alarm();
            }
        }
        result
    }

    /// GET a page, following up to [`MAX_REDIRECTS`] redirects. Login and
    /// checkpoint redirects are `AuthExpired`. Does not wake the guardian.
    pub async fn fetch_page(&self, url: &str) -> Result<HttpResponse> {
        let mut current = url.to_string();
        for _ in 0..=MAX_REDIRECTS {
            let response = self.send(HttpRequest::get(&current)).await?;
            if !response.is_redirect() {
                classify(&response)?;
                return Ok(response);
            }

            let location = response.location.as_deref().unwrap_or_default();
            let next = Url::parse(&current)
                .and_then(|base| base.join(location))
                .map_err(|e| Error::Protocol(format!("bad redirect {}: {}", location, e)))?;
            if is_logout_url(next.as_str()) {
                return Err(Error::AuthExpired(format!("redirected to {}", next)));
            }
            debug!("Following redirect {} -> {}", current, next);
            current = next.to_string();
        }

        Err(Error::Network(format!(
            "more than {} redirects fetching {}",
            MAX_REDIRECTS, url
        )))
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("user_id", &self.user_id())
            .field("client_id", &self.client_id)
            .field("state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jazoest() {
        // 'a' = 97, 'b' = 98
        assert_eq!(compute_jazoest("ab"), "2195");
        assert_eq!(compute_jazoest(""), "20");
        // Non-ASCII counts UTF-16 code units.
        assert_eq!(compute_jazoest("é"), "2233");
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1295), "zz");
    }

    #[test]
    fn test_tokens_pair() {
        let tokens = SessionTokens::new("ab");
        assert_eq!(tokens.jazoest, "2195");
        assert_eq!(tokens.fb_dtsg, "ab");
    }
}
