//! Canonical cookie types.

use std::collections::HashMap;
use std::path::Path;

use msgr_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::normalize;

/// One cookie in canonical form.
///
/// `domain` is lower-case with no leading dot; `host_only` records whether
/// the cookie is sent to subdomains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRecord {
    pub domain: String,
    pub path: String,
    pub name: String,
    pub value: String,
    /// Unix timestamp in seconds; `None` for session cookies.
    pub expiry: Option<i64>,
    pub host_only: bool,
}

impl CookieRecord {
    pub fn new(domain: &str, name: &str, value: &str) -> Self {
        let (domain, had_dot) = normalize::canonical_domain(domain);
        Self {
            domain,
            path: "/".into(),
            name: name.to_string(),
            value: value.to_string(),
            expiry: None,
            host_only: !had_dot,
        }
    }

    /// Whether the cookie has expired at `now` (Unix seconds).
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expiry.map_or(false, |exp| exp <= now)
    }

    fn key(&self) -> (String, String) {
        (self.domain.clone(), self.name.clone())
    }
}

/// An exported browser session: an ordered set of cookies, unique per
/// (domain, name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppState {
    cookies: Vec<CookieRecord>,
}

impl AppState {
    /// Build from records, collapsing duplicate (domain, name) pairs.
    /// The first occurrence keeps its position; the last one wins the value.
    pub fn from_records(records: Vec<CookieRecord>) -> Self {
        let mut cookies: Vec<CookieRecord> = Vec::with_capacity(records.len());
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for record in records {
            match index.get(&record.key()) {
                Some(&pos) => cookies[pos] = record,
                None => {
                    index.insert(record.key(), cookies.len());
                    cookies.push(record);
                }
            }
        }

        Self { cookies }
    }

    /// Normalize any supported encoding (JSON, Netscape, header string).
    pub fn parse(input: &str) -> Result<Self> {
        normalize::normalize(input, normalize::DEFAULT_COOKIE_DOMAIN)
    }

    /// Like [`AppState::parse`], with the domain used for header strings.
    pub fn parse_with_default_domain(input: &str, default_domain: &str) -> Result<Self> {
        normalize::normalize(input, default_domain)
    }

    /// Read and normalize a cookie export from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidAppState(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&data)
    }

    pub fn cookies(&self) -> &[CookieRecord] {
        &self.cookies
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// First cookie with the given name, on any domain.
    pub fn get(&self, name: &str) -> Option<&CookieRecord> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// First cookie matching any of `names`, honouring the order of `names`.
    pub fn find_any<S: AsRef<str>>(&self, names: &[S]) -> Option<&CookieRecord> {
        names.iter().find_map(|n| self.get(n.as_ref()))
    }

    /// Canonical JSON encoding. Parsing it yields an identical AppState.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.cookies).unwrap_or_else(|_| "[]".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_canonicalizes_domain() {
        let c = CookieRecord::new(".X.com", "uid", "1");
        assert_eq!(c.domain, "x.com");
        assert!(!c.host_only);
        assert_eq!(c.path, "/");

        let c = CookieRecord::new("www.x.com", "uid", "1");
        assert!(c.host_only);
    }

    #[test]
    fn test_from_records_dedupes() {
        let state = AppState::from_records(vec![
            CookieRecord::new(".x.com", "a", "1"),
            CookieRecord::new(".x.com", "b", "2"),
            CookieRecord::new(".x.com", "a", "3"),
            CookieRecord::new(".y.com", "a", "4"),
        ]);
        assert_eq!(state.len(), 3);
        assert_eq!(state.cookies()[0].name, "a");
        assert_eq!(state.cookies()[0].value, "3");
        assert_eq!(state.cookies()[2].domain, "y.com");
    }

    #[test]
    fn test_find_any_respects_preference() {
        let state = AppState::from_records(vec![
            CookieRecord::new(".x.com", "uid", "1"),
            CookieRecord::new(".x.com", "c_user", "2"),
        ]);
        let found = state.find_any(&["c_user", "uid"]).unwrap();
        assert_eq!(found.value, "2");
        assert!(state.find_any(&["xs"]).is_none());
    }

    #[test]
    fn test_expiry() {
        let mut c = CookieRecord::new(".x.com", "a", "1");
        assert!(!c.is_expired_at(i64::MAX));
        c.expiry = Some(100);
        assert!(c.is_expired_at(100));
        assert!(!c.is_expired_at(99));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appstate.json");
        std::fs::write(
            &path,
            r#"[{"key":"c_user","value":"42","domain":".facebook.com","path":"/"}]"#,
        )
        .unwrap();

        let state = AppState::load(&path).unwrap();
        assert_eq!(state.get("c_user").unwrap().value, "42");

        let missing = AppState::load(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(Error::InvalidAppState(_))));
    }
}
