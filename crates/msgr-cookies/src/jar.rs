//! Live cookie jar used by the session's HTTP client.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use url::Url;

use crate::normalize::{canonical_domain, parse_cookie_date};
use crate::types::{AppState, CookieRecord};

/// Cookies keyed by (domain, name). Insertion order is not preserved;
/// iteration is sorted by key so header output is stable.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: BTreeMap<(String, String), CookieRecord>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_app_state(state: &AppState) -> Self {
        let mut jar = Self::new();
        for record in state.cookies() {
            jar.insert(record.clone());
        }
        jar
    }

    /// Insert or replace the cookie with the same (domain, name).
    pub fn insert(&mut self, record: CookieRecord) {
        self.cookies
            .insert((record.domain.clone(), record.name.clone()), record);
    }

    pub fn remove(&mut self, domain: &str, name: &str) -> Option<CookieRecord> {
        let (domain, _) = canonical_domain(domain);
        self.cookies.remove(&(domain, name.to_string()))
    }

    pub fn get(&self, domain: &str, name: &str) -> Option<&CookieRecord> {
        let (domain, _) = canonical_domain(domain);
        self.cookies.get(&(domain, name.to_string()))
    }

    /// First cookie with `name` on any domain.
    pub fn find(&self, name: &str) -> Option<&CookieRecord> {
        self.cookies.values().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// `Cookie` header value for a request to `url`, or `None` if no cookie
    /// applies.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        self.header_for_at(url, chrono::Utc::now().timestamp())
    }

    pub fn header_for_at(&self, url: &Url, now: i64) -> Option<String> {
        let host = url.host_str()?.to_lowercase();
        let path = url.path();

        let pairs: Vec<String> = self
            .cookies
            .values()
            .filter(|c| !c.is_expired_at(now))
            .filter(|c| domain_matches(c, &host))
            .filter(|c| path_matches(&c.path, path))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Absorb one `Set-Cookie` header received from `url`.
    pub fn apply_set_cookie(&mut self, header: &str, url: &Url) {
        self.apply_set_cookie_at(header, url, chrono::Utc::now().timestamp())
    }

    pub fn apply_set_cookie_at(&mut self, header: &str, url: &Url, now: i64) {
        let Some(host) = url.host_str() else {
            return;
        };

        let mut parts = header.split(';');
        let Some((name, value)) = parts.next().and_then(|p| p.split_once('=')) else {
            warn!("Ignoring malformed Set-Cookie header");
            return;
        };
        let name = name.trim();
        if name.is_empty() {
            return;
        }

        let mut record = CookieRecord {
            domain: host.to_lowercase(),
            path: "/".into(),
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            expiry: None,
            host_only: true,
        };
        let mut max_age: Option<i64> = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    let (domain, _) = canonical_domain(val);
                    let host = host.to_lowercase();
                    if host != domain && !host.ends_with(&format!(".{}", domain)) {
                        warn!("Rejecting cookie {} for foreign domain {}", name, domain);
                        return;
                    }
                    record.domain = domain;
                    record.host_only = false;
                }
                "path" if val.starts_with('/') => record.path = val.to_string(),
                "expires" => record.expiry = parse_cookie_date(val),
                "max-age" => max_age = val.parse().ok(),
                _ => {}
            }
        }

        if let Some(secs) = max_age {
            record.expiry = Some(now + secs);
        }

        if record.is_expired_at(now) {
            debug!("Server cleared cookie {} on {}", record.name, record.domain);
            self.cookies.remove(&(record.domain, record.name));
        } else {
            self.insert(record);
        }
    }

    /// Snapshot the jar back into an AppState.
    pub fn to_app_state(&self) -> AppState {
        AppState::from_records(self.cookies.values().cloned().collect())
    }
}

fn domain_matches(cookie: &CookieRecord, host: &str) -> bool {
    if cookie.host_only {
        host == cookie.domain
    } else {
        host == cookie.domain || host.ends_with(&format!(".{}", cookie.domain))
    }
}

fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path == "/" || cookie_path == request_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn jar() -> CookieJar {
        let state = AppState::parse(
            r#"[{"domain":".x.com","name":"uid","value":"1"},
                {"domain":"www.x.com","name":"locale","value":"en","hostOnly":true},
                {"domain":".x.com","name":"scoped","value":"s","path":"/api"},
                {"domain":".x.com","name":"old","value":"o","expiry":100}]"#,
        )
        .unwrap();
        CookieJar::from_app_state(&state)
    }

    #[test]
    fn test_header_matching() {
        let jar = jar();
        let header = jar.header_for_at(&url("https://www.x.com/"), 1_000).unwrap();
        assert!(header.contains("uid=1"));
        assert!(header.contains("locale=en"));
        assert!(!header.contains("scoped"));
        assert!(!header.contains("old"));

        let header = jar.header_for_at(&url("https://edge.x.com/api/v1"), 1_000).unwrap();
        assert!(header.contains("scoped=s"));
        assert!(!header.contains("locale"));

        assert!(jar.header_for_at(&url("https://www.y.com/"), 1_000).is_none());
        assert!(jar.header_for_at(&url("https://notx.com/"), 1_000).is_none());
    }

    #[test]
    fn test_path_prefix_boundary() {
        assert!(path_matches("/api", "/api"));
        assert!(path_matches("/api", "/api/v1"));
        assert!(!path_matches("/api", "/apiv1"));
        assert!(path_matches("/api/", "/api/v1"));
    }

    #[test]
    fn test_apply_set_cookie() {
        let mut jar = jar();
        let origin = url("https://www.x.com/login");

        jar.apply_set_cookie_at("sid=new; Domain=.x.com; Path=/; Max-Age=3600", &origin, 1_000);
        let sid = jar.get("x.com", "sid").unwrap();
        assert_eq!(sid.value, "new");
        assert_eq!(sid.expiry, Some(4_600));
        assert!(!sid.host_only);

        jar.apply_set_cookie_at("uid=2; Domain=x.com", &origin, 1_000);
        assert_eq!(jar.get(".x.com", "uid").unwrap().value, "2");

        jar.apply_set_cookie_at("uid=deleted; Domain=x.com; Max-Age=0", &origin, 1_000);
        assert!(jar.get("x.com", "uid").is_none());

        jar.apply_set_cookie_at(
            "tmp=1; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
            &origin,
            1_000,
        );
        assert!(jar.get("www.x.com", "tmp").is_none());
    }

    #[test]
    fn test_rejects_foreign_domain() {
        let mut jar = CookieJar::new();
        jar.apply_set_cookie_at("a=1; Domain=evil.com", &url("https://www.x.com/"), 0);
        assert!(jar.is_empty());
        jar.apply_set_cookie_at("garbage", &url("https://www.x.com/"), 0);
        assert!(jar.is_empty());
    }

    #[test]
    fn test_round_trip_to_app_state() {
        let jar = jar();
        let state = jar.to_app_state();
        assert_eq!(state.len(), 4);
        assert_eq!(CookieJar::from_app_state(&state).len(), 4);
        assert_eq!(jar.find("locale").unwrap().domain, "www.x.com");
    }
}
