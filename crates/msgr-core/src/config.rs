//! Engine configuration: recognized options plus timing tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://www.facebook.com";
pub const DEFAULT_REALTIME_ENDPOINT: &str = "wss://edge-chat.facebook.com/chat";

/// Full engine configuration.
///
/// Field names serialize in camelCase so that option files written for
/// other clients of the platform load unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Appear online when the realtime stream connects.
    #[serde(default = "default_true")]
    pub online: bool,
    /// Deliver events authored by the session's own user.
    #[serde(default = "default_false")]
    pub self_listen: bool,
    /// Run the realtime stream at all.
    #[serde(default = "default_true")]
    pub listen_events: bool,
    /// Mark inbound messages read as they arrive.
    #[serde(default = "default_false")]
    pub auto_mark_read: bool,
    /// Master switch for jitter, header variability and user-agent rotation.
    #[serde(default = "default_true")]
    pub anti_detection: bool,
    #[serde(default = "default_true")]
    pub request_jitter: bool,
    #[serde(default = "default_true")]
    pub header_variability: bool,
    #[serde(default = "default_true")]
    pub random_user_agent: bool,
    /// Master switch for guardian logout recovery.
    #[serde(default = "default_true")]
    pub anti_logout: bool,
    /// Keep-alive cadence in minutes.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_interval: u64,
    #[serde(default = "default_true")]
    pub auto_refresh_token: bool,

    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_realtime_endpoint")]
    pub realtime_endpoint: String,
    /// Cookie names accepted as the identity cookie, in preference order.
    #[serde(default = "default_identity_cookies")]
    pub identity_cookies: Vec<String>,
    /// Cookie names accepted as the session-secret cookie.
    #[serde(default = "default_secret_cookies")]
    pub secret_cookies: Vec<String>,
    /// Pinned user agent; ignored when `randomUserAgent` is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    #[serde(default = "default_jitter_min")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max_ms: u64,
    /// Proactive token refresh cadence in minutes.
    #[serde(default = "default_token_refresh")]
    pub token_refresh_interval: u64,
    #[serde(default = "default_cycle_timeout")]
    pub guardian_cycle_timeout_secs: u64,
    #[serde(default = "default_thirty")]
    pub bootstrap_timeout_secs: u64,
    #[serde(default = "default_thirty")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_backoff_reset")]
    pub backoff_reset_after_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ten")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ten")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,
    #[serde(default = "default_malformed_window")]
    pub malformed_window_secs: u64,
    #[serde(default = "default_malformed_threshold")]
    pub malformed_threshold: u32,
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_keep_alive() -> u64 {
    10
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.into()
}
fn default_realtime_endpoint() -> String {
    DEFAULT_REALTIME_ENDPOINT.into()
}
fn default_identity_cookies() -> Vec<String> {
    vec!["c_user".into(), "uid".into()]
}
fn default_secret_cookies() -> Vec<String> {
    vec!["xs".into(), "sid".into()]
}
fn default_jitter_min() -> u64 {
    150
}
fn default_jitter_max() -> u64 {
    900
}
fn default_token_refresh() -> u64 {
    60
}
fn default_cycle_timeout() -> u64 {
    30
}
fn default_thirty() -> u64 {
    30
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_max() -> u64 {
    60_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_backoff_jitter() -> f64 {
    0.3
}
fn default_backoff_reset() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_ten() -> u64 {
    10
}
fn default_close_timeout() -> u64 {
    3
}
fn default_malformed_window() -> u64 {
    60
}
fn default_malformed_threshold() -> u32 {
    20
}
fn default_queue_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            online: true,
            self_listen: false,
            listen_events: true,
            auto_mark_read: false,
            anti_detection: true,
            request_jitter: true,
            header_variability: true,
            random_user_agent: true,
            anti_logout: true,
            keep_alive_interval: default_keep_alive(),
            auto_refresh_token: true,
            base_url: default_base_url(),
            realtime_endpoint: default_realtime_endpoint(),
            identity_cookies: default_identity_cookies(),
            secret_cookies: default_secret_cookies(),
            user_agent: None,
            jitter_min_ms: default_jitter_min(),
            jitter_max_ms: default_jitter_max(),
            token_refresh_interval: default_token_refresh(),
            guardian_cycle_timeout_secs: default_cycle_timeout(),
            bootstrap_timeout_secs: default_thirty(),
            request_timeout_secs: default_thirty(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            backoff_factor: default_backoff_factor(),
            backoff_jitter: default_backoff_jitter(),
            backoff_reset_after_secs: default_backoff_reset(),
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: default_ten(),
            pong_timeout_secs: default_ten(),
            close_timeout_secs: default_close_timeout(),
            malformed_window_secs: default_malformed_window(),
            malformed_threshold: default_malformed_threshold(),
            event_queue_capacity: default_queue_capacity(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `MSGR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_bool("MSGR_ONLINE") {
            config.online = v;
        }
        if let Some(v) = env_bool("MSGR_SELF_LISTEN") {
            config.self_listen = v;
        }
        if let Some(v) = env_bool("MSGR_LISTEN_EVENTS") {
            config.listen_events = v;
        }
        if let Some(v) = env_bool("MSGR_AUTO_MARK_READ") {
            config.auto_mark_read = v;
        }
        if let Some(v) = env_bool("MSGR_ANTI_DETECTION") {
            config.anti_detection = v;
        }
        if let Some(v) = env_bool("MSGR_ANTI_LOGOUT") {
            config.anti_logout = v;
        }
        if let Some(v) = env_bool("MSGR_AUTO_REFRESH_TOKEN") {
            config.auto_refresh_token = v;
        }
        if let Some(v) = env_parse("MSGR_KEEP_ALIVE_INTERVAL") {
            config.keep_alive_interval = v;
        }
        if let Ok(v) = std::env::var("MSGR_BASE_URL") {
            config.base_url = v;
        }
        if let Ok(v) = std::env::var("MSGR_USER_AGENT") {
            config.user_agent = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_interval == 0 {
            return Err(Error::Config("keepAliveInterval must be at least 1 minute".into()));
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            return Err(Error::Config(format!(
                "jitterMinMs ({}) exceeds jitterMaxMs ({})",
                self.jitter_min_ms, self.jitter_max_ms
            )));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(
                "backoffBaseMs must be non-zero and not exceed backoffMaxMs".into(),
            ));
        }
        if self.backoff_factor < 2.0 {
            return Err(Error::Config("backoffFactor must be at least 2.0".into()));
        }
        if !(0.0..0.5).contains(&self.backoff_jitter) {
            return Err(Error::Config("backoffJitter must be within [0, 0.5)".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::Config("eventQueueCapacity must be non-zero".into()));
        }
        if self.identity_cookies.is_empty() || self.secret_cookies.is_empty() {
            return Err(Error::Config("mandatory cookie name lists must not be empty".into()));
        }
        if self.token_refresh_interval == 0 {
            return Err(Error::Config("tokenRefreshInterval must be at least 1 minute".into()));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Effective policy
    // ---------------------------------------------------------------

    pub fn jitter_active(&self) -> bool {
        self.anti_detection && self.request_jitter
    }

    pub fn header_variability_active(&self) -> bool {
        self.anti_detection && self.header_variability
    }

    pub fn random_user_agent_active(&self) -> bool {
        self.anti_detection && self.random_user_agent
    }

    /// The guardian runs when it has anything to supervise.
    pub fn guardian_enabled(&self) -> bool {
        self.anti_logout || self.auto_refresh_token
    }

    // ---------------------------------------------------------------
    // Durations
    // ---------------------------------------------------------------

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval * 60)
    }

    pub fn token_refresh(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval * 60)
    }

    pub fn guardian_cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.guardian_cycle_timeout_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn malformed_window(&self) -> Duration {
        Duration::from_secs(self.malformed_window_secs)
    }

    pub fn backoff_reset_after(&self) -> Duration {
        Duration::from_secs(self.backoff_reset_after_secs)
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.online);
        assert!(!config.self_listen);
        assert!(config.listen_events);
        assert_eq!(config.keep_alive_interval, 10);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.identity_cookies, vec!["c_user", "uid"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_camel_case() {
        let config = EngineConfig::from_json(
            r#"{"selfListen": true, "keepAliveInterval": 5, "antiDetection": false}"#,
        )
        .unwrap();
        assert!(config.self_listen);
        assert_eq!(config.keep_alive_interval, 5);
        assert_eq!(config.keep_alive(), Duration::from_secs(300));
        assert!(!config.jitter_active());
        assert!(!config.header_variability_active());
        assert!(!config.random_user_agent_active());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(EngineConfig::from_json(r#"{"keepAliveInterval": 0}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"jitterMinMs": 10, "jitterMaxMs": 5}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"backoffJitter": 0.7}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"backoffFactor": 1.5}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"eventQueueCapacity": 0}"#).is_err());
    }

    #[test]
    fn test_guardian_enabled() {
        let mut config = EngineConfig::default();
        assert!(config.guardian_enabled());
        config.anti_logout = false;
        config.auto_refresh_token = false;
        assert!(!config.guardian_enabled());
    }
}
