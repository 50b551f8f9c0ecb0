//! Session bootstrap — cookies in, authenticated token-bearing context out.

use std::sync::Arc;

use msgr_cookies::AppState;
use msgr_core::{ConnectionState, EngineConfig, Error, Result};
use rand::Rng;
use tracing::{info, warn};

use crate::context::{PageHints, SessionContext, SessionTokens};
use crate::extract::{is_logged_out, ExtractorChain, PageData};
use crate::stealth::AntiDetection;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Configurable bootstrap. [`bootstrap`] covers the common case.
pub struct Bootstrap {
    config: EngineConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    extractors: ExtractorChain,
    seed: Option<u64>,
}

impl Bootstrap {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            extractors: ExtractorChain::standard(),
            seed: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn extractors(mut self, extractors: ExtractorChain) -> Self {
        self.extractors = extractors;
        self
    }

    /// Fix the anti-detection seed (user agent and header variant).
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub async fn run(self, app_state: &AppState) -> Result<Arc<SessionContext>> {
        let config = self.config;
        config.validate()?;

        let identity = app_state
            .find_any(&config.identity_cookies)
            .filter(|c| !c.value.is_empty())
            .ok_or_else(|| {
                Error::InvalidAppState(format!(
                    "missing identity cookie (one of {})",
                    config.identity_cookies.join(", ")
                ))
            })?;
        app_state
            .find_any(&config.secret_cookies)
            .filter(|c| !c.value.is_empty())
            .ok_or_else(|| {
                Error::InvalidAppState(format!(
                    "missing session-secret cookie (one of {})",
                    config.secret_cookies.join(", ")
                ))
            })?;
        let user_id = identity.value.clone();

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new(config.request_timeout())?),
        };
        let stealth = match self.seed {
            Some(seed) => AntiDetection::with_seed(&config, seed),
            None => AntiDetection::new(&config),
        };
        let client_id = generate_client_id();

        info!(
            "Bootstrapping session for user {} ({} cookies)",
            user_id,
            app_state.len()
        );

        let ctx = Arc::new(SessionContext::assemble(
            user_id,
            client_id,
            config,
            app_state,
            stealth,
            transport,
            self.extractors,
        ));

        rebootstrap(&ctx).await?;
        ctx.set_connection_state(ConnectionState::Authenticated);
        info!(
            "Session authenticated: user={}, client={}",
            ctx.user_id(),
            ctx.client_id()
        );
        Ok(ctx)
    }
}

/// Bootstrap with the default HTTP transport and extractors.
pub async fn bootstrap(app_state: &AppState, config: EngineConfig) -> Result<Arc<SessionContext>> {
    Bootstrap::new(config).run(app_state).await
}

/// Fetch the home page and extract page data. Bounded by the bootstrap
/// timeout; a logged-out page is `AuthExpired`.
pub async fn fetch_page_data(ctx: &SessionContext) -> Result<PageData> {
    let timeout = ctx.config().bootstrap_timeout();
    let url = ctx.url("/");

    let response = tokio::time::timeout(timeout, ctx.fetch_page(&url))
        .await
        .map_err(|_| Error::Network(format!("page fetch timed out after {:?}", timeout)))??;

    let data = ctx.extractors().extract(&response.body)?;
    if is_logged_out(&data) {
        return Err(Error::AuthExpired("page reports a logged-out user".into()));
    }
    Ok(data)
}

/// Re-derive tokens from the still-present cookies and swap them in.
/// Used at bootstrap, for proactive refresh, and for silent recovery.
pub async fn rebootstrap(ctx: &SessionContext) -> Result<Arc<SessionTokens>> {
    let data = fetch_page_data(ctx).await?;

    if let Some(page_user) = data.user_id.as_ref() {
        if *page_user != ctx.user_id() {
            warn!(
                "Page user id {} differs from cookie user id {}; using page value",
                page_user,
                ctx.user_id()
            );
            ctx.set_user_id(page_user.clone());
        }
    }

    ctx.set_page_hints(PageHints {
        realtime_endpoint: data.realtime_endpoint.clone(),
        iris_seq_id: data.iris_seq_id.clone(),
    });
    ctx.swap_tokens(SessionTokens::new(data.token));
    Ok(ctx.tokens())
}

/// Random 31-bit client identifier in hexadecimal.
pub fn generate_client_id() -> String {
    format!("{:x}", rand::thread_rng().gen_range(0..(1u32 << 31)))
}
