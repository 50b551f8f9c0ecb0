//! Anti-detection layer — request jitter, header variants, fixed user agent.
//!
//! Every choice that shapes the session's fingerprint (user agent, header
//! variant) is made once when the layer is built and never changes. Only
//! the per-request jitter delay is drawn fresh each time.

use std::time::Duration;

use msgr_core::EngineConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::transport::HttpRequest;

/// Curated pool of current desktop browser user agents.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36 Edg/128.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.6 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:130.0) Gecko/20100101 Firefox/130.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36",
];

/// Agent used when rotation is off and none is pinned.
pub const DEFAULT_USER_AGENT: &str = USER_AGENTS[0];

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Cosmetic header sets. Only ordering and optional headers differ.
const HEADER_VARIANTS: &[&[(&str, &str)]] = &[
    &[
        ("Accept-Encoding", "gzip, deflate, br"),
        ("Sec-Fetch-Site", "same-origin"),
        ("Sec-Fetch-Mode", "cors"),
    ],
    &[
        ("Sec-Fetch-Mode", "cors"),
        ("Sec-Fetch-Site", "same-origin"),
        ("Accept-Encoding", "gzip, deflate, br, zstd"),
        ("DNT", "1"),
    ],
    &[
        ("Cache-Control", "no-cache"),
        ("Pragma", "no-cache"),
        ("Accept-Encoding", "gzip, deflate, br"),
    ],
    &[
        ("Accept-Encoding", "gzip, deflate"),
        ("Sec-Fetch-Dest", "empty"),
        ("Sec-Fetch-Mode", "cors"),
        ("Sec-Fetch-Site", "same-origin"),
    ],
];

/// Headers the layer sets itself, always first and always identical.
pub const MANDATORY_HEADERS: &[&str] = &["User-Agent", "Accept", "Accept-Language"];

/// Effective policy, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiDetectionStatus {
    pub jitter_enabled: bool,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub header_variability_enabled: bool,
    pub header_variant: usize,
    pub random_user_agent: bool,
    pub current_user_agent: String,
}

#[derive(Debug, Clone)]
pub struct AntiDetection {
    jitter: Option<(u64, u64)>,
    variant: Option<usize>,
    user_agent: String,
    random_user_agent: bool,
}

impl AntiDetection {
    /// Seed session-scoped choices from OS entropy.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_seed(config, rand::thread_rng().gen())
    }

    /// Deterministic construction, for reproducible sessions.
    pub fn with_seed(config: &EngineConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let user_agent = if config.random_user_agent_active() {
            USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())].to_string()
        } else {
            config
                .user_agent
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
        };

        let variant = config
            .header_variability_active()
            .then(|| rng.gen_range(0..HEADER_VARIANTS.len()));

        let jitter = config
            .jitter_active()
            .then_some((config.jitter_min_ms, config.jitter_max_ms));

        info!(
            "Anti-detection: jitter={:?}, header_variant={:?}, user_agent={}",
            jitter, variant, user_agent
        );

        Self {
            jitter,
            variant,
            user_agent,
            random_user_agent: config.random_user_agent_active(),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// A fresh uniformly random delay, or zero when jitter is off.
    pub fn jitter_delay(&self) -> Duration {
        match self.jitter {
            Some((min, max)) if max > min => {
                Duration::from_millis(rand::thread_rng().gen_range(min..=max))
            }
            Some((min, _)) => Duration::from_millis(min),
            None => Duration::ZERO,
        }
    }

    /// Sleep for this request's jitter. Only the calling task waits.
    pub async fn pace(&self) {
        let delay = self.jitter_delay();
        if !delay.is_zero() {
            debug!("Jitter: delaying request by {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Write mandatory headers first, then the session's cosmetic variant.
    /// Headers the caller already set (Cookie, Referer, ...) are kept as-is.
    pub fn decorate(&self, request: &mut HttpRequest) {
        let caller_headers = std::mem::take(&mut request.headers);

        request.headers.push(("User-Agent".into(), self.user_agent.clone()));
        request.headers.push(("Accept".into(), ACCEPT.into()));
        request
            .headers
            .push(("Accept-Language".into(), ACCEPT_LANGUAGE.into()));

        if let Some(index) = self.variant {
            for (name, value) in HEADER_VARIANTS[index] {
                let overridden = caller_headers
                    .iter()
                    .any(|(k, _)| k.eq_ignore_ascii_case(name));
                if !overridden {
                    request.headers.push((name.to_string(), value.to_string()));
                }
            }
        }

        for (name, value) in caller_headers {
            let mandatory = MANDATORY_HEADERS
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&name));
            if !mandatory {
                request.headers.push((name, value));
            }
        }
    }

    pub fn status(&self) -> AntiDetectionStatus {
        let (jitter_min_ms, jitter_max_ms) = self.jitter.unwrap_or((0, 0));
        AntiDetectionStatus {
            jitter_enabled: self.jitter.is_some(),
            jitter_min_ms,
            jitter_max_ms,
            header_variability_enabled: self.variant.is_some(),
            header_variant: self.variant.unwrap_or(0),
            random_user_agent: self.random_user_agent,
            current_user_agent: self.user_agent.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(req: &HttpRequest) -> Vec<&str> {
        req.headers.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn test_user_agent_fixed_for_session() {
        let config = EngineConfig::default();
        let layer = AntiDetection::with_seed(&config, 7);
        assert!(USER_AGENTS.contains(&layer.user_agent()));

        let first = layer.user_agent().to_string();
        for _ in 0..10 {
            let mut req = HttpRequest::get("https://x.com/");
            layer.decorate(&mut req);
            assert_eq!(req.header("User-Agent"), Some(first.as_str()));
        }
        assert_eq!(
            AntiDetection::with_seed(&config, 7).user_agent(),
            layer.user_agent()
        );
    }

    #[test]
    fn test_mandatory_headers_first_and_caller_headers_kept() {
        let layer = AntiDetection::with_seed(&EngineConfig::default(), 1);
        let mut req = HttpRequest::get("https://x.com/");
        req.set_header("Cookie", "a=1");
        req.set_header("Referer", "https://x.com/");
        req.set_header("User-Agent", "spoofed");
        layer.decorate(&mut req);

        assert_eq!(&names(&req)[..3], MANDATORY_HEADERS);
        assert_eq!(req.header("Cookie"), Some("a=1"));
        assert_eq!(req.header("Referer"), Some("https://x.com/"));
        assert_ne!(req.header("User-Agent"), Some("spoofed"));
        assert_eq!(
            req.headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
                .count(),
            1
        );
    }

    #[test]
    fn test_variant_stable_across_requests() {
        let layer = AntiDetection::with_seed(&EngineConfig::default(), 99);
        let mut a = HttpRequest::get("https://x.com/a");
        let mut b = HttpRequest::post("https://x.com/b", String::new());
        layer.decorate(&mut a);
        layer.decorate(&mut b);
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn test_disabled_layer() {
        let config = EngineConfig {
            anti_detection: false,
            user_agent: Some("pinned/1.0".into()),
            ..Default::default()
        };
        let layer = AntiDetection::new(&config);
        assert_eq!(layer.jitter_delay(), Duration::ZERO);
        assert_eq!(layer.user_agent(), "pinned/1.0");

        let mut req = HttpRequest::get("https://x.com/");
        layer.decorate(&mut req);
        assert_eq!(names(&req), MANDATORY_HEADERS);

        let status = layer.status();
        assert!(!status.jitter_enabled);
        assert!(!status.header_variability_enabled);
        assert!(!status.random_user_agent);
        assert_eq!(status.current_user_agent, "pinned/1.0");
    }

    #[test]
    fn test_jitter_within_bounds() {
        let config = EngineConfig {
            jitter_min_ms: 10,
            jitter_max_ms: 20,
            ..Default::default()
        };
        let layer = AntiDetection::new(&config);
        for _ in 0..100 {
            let d = layer.jitter_delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        let status = layer.status();
        assert!(status.jitter_enabled);
        assert_eq!((status.jitter_min_ms, status.jitter_max_ms), (10, 20));
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("currentUserAgent").is_some());
    }
}
