//! Cookie normalizer — JSON exports, Netscape cookie files, header strings.
//!
//! Every input is reduced to the canonical [`AppState`]. The canonical JSON
//! form is itself a valid input, and normalizing it is a no-op.

use msgr_core::{Error, Result};
use serde_json::Value;
use tracing::debug;

use crate::types::{AppState, CookieRecord};

/// Domain assigned to cookies that arrive as a bare header string.
pub const DEFAULT_COOKIE_DOMAIN: &str = "facebook.com";

/// Longest fragment quoted back in a parse error.
const FRAGMENT_LIMIT: usize = 80;

/// Recognized cookie encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieFormat {
    Json,
    Netscape,
    Header,
}

/// Guess the encoding of `input`. `None` when nothing fits.
pub fn detect_format(input: &str) -> Option<CookieFormat> {
    let trimmed = input.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return Some(CookieFormat::Json);
    }
    let netscape = trimmed.starts_with("# Netscape")
        || trimmed.starts_with("# HTTP Cookie File")
        || trimmed
            .lines()
            .any(|l| !l.starts_with('#') && l.split('\t').count() >= 6);
    if netscape {
        return Some(CookieFormat::Netscape);
    }
    if trimmed.contains('=') {
        return Some(CookieFormat::Header);
    }
    None
}

/// Normalize `input` into an AppState.
pub fn normalize(input: &str, default_domain: &str) -> Result<AppState> {
    if input.trim().is_empty() {
        return Err(Error::ParseFailure("empty cookie input".into()));
    }

    let format = detect_format(input).ok_or_else(|| {
        Error::ParseFailure(format!(
            "unrecognized cookie encoding near `{}`",
            fragment(input.trim())
        ))
    })?;

    let records = match format {
        CookieFormat::Json => parse_json(input)?,
        CookieFormat::Netscape => parse_netscape(input)?,
        CookieFormat::Header => parse_header(input, default_domain)?,
    };

    debug!("Normalized {} cookies from {:?} input", records.len(), format);
    Ok(AppState::from_records(records))
}

// ---------------------------------------------------------------
// JSON
// ---------------------------------------------------------------

fn parse_json(input: &str) -> Result<Vec<CookieRecord>> {
    let value: Value = serde_json::from_str(input).map_err(|e| {
        Error::ParseFailure(format!("invalid cookie JSON ({}): `{}`", e, fragment(input.trim())))
    })?;

    let entries = match &value {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("cookies") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(Error::ParseFailure(format!(
                    "cookie JSON object has no `cookies` array: `{}`",
                    fragment(&value.to_string())
                )))
            }
        },
        other => {
            return Err(Error::ParseFailure(format!(
                "cookie JSON must be an array: `{}`",
                fragment(&other.to_string())
            )))
        }
    };

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| record_from_json(i, entry))
        .collect()
}

fn record_from_json(index: usize, entry: &Value) -> Result<CookieRecord> {
    let fail = |what: &str| {
        Error::ParseFailure(format!(
            "cookie entry {} {}: `{}`",
            index,
            what,
            fragment(&entry.to_string())
        ))
    };

    let obj = entry.as_object().ok_or_else(|| fail("is not an object"))?;

    let name = obj
        .get("name")
        .or_else(|| obj.get("key"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| fail("has no `name`/`key`"))?;

    let value = match obj.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => return Err(fail("has no `value`")),
    };

    let raw_domain = obj
        .get("domain")
        .and_then(Value::as_str)
        .ok_or_else(|| fail("has no `domain`"))?;
    let (domain, had_dot) = canonical_domain(raw_domain);
    if domain.is_empty() {
        return Err(fail("has an empty `domain`"));
    }

    let path = obj
        .get("path")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
        .to_string();

    let expiry_field = ["expiry", "expires", "expirationDate"]
        .iter()
        .find_map(|k| obj.get(*k));
    let expiry = match expiry_field {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64().map(|f| f.floor() as i64),
        Some(Value::String(s)) => {
            if s.eq_ignore_ascii_case("infinity") || s.eq_ignore_ascii_case("session") {
                None
            } else {
                Some(parse_cookie_date(s).ok_or_else(|| fail("has an unreadable expiry"))?)
            }
        }
        Some(_) => return Err(fail("has an unreadable expiry")),
    };

    let host_only = obj
        .get("hostOnly")
        .and_then(Value::as_bool)
        .unwrap_or(!had_dot);

    Ok(CookieRecord {
        domain,
        path,
        name: name.to_string(),
        value,
        expiry,
        host_only,
    })
}

// ---------------------------------------------------------------
// Netscape cookie file
// ---------------------------------------------------------------

fn parse_netscape(input: &str) -> Result<Vec<CookieRecord>> {
    let mut records = Vec::new();

    for (lineno, raw) in input.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        let line = match line.strip_prefix("#HttpOnly_") {
            Some(rest) => rest,
            None if line.trim().is_empty() || line.starts_with('#') => continue,
            None => line,
        };

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 6 {
            return Err(Error::ParseFailure(format!(
                "Netscape line {} has {} fields, expected 7: `{}`",
                lineno + 1,
                fields.len(),
                fragment(line)
            )));
        }

        let (domain, _) = canonical_domain(fields[0]);
        let include_subdomains = fields[1].eq_ignore_ascii_case("TRUE");
        let expiry: i64 = fields[4].trim().parse().map_err(|_| {
            Error::ParseFailure(format!(
                "Netscape line {} has a bad expiry `{}`",
                lineno + 1,
                fragment(fields[4])
            ))
        })?;

        if domain.is_empty() || fields[5].is_empty() {
            return Err(Error::ParseFailure(format!(
                "Netscape line {} is missing a domain or name: `{}`",
                lineno + 1,
                fragment(line)
            )));
        }

        records.push(CookieRecord {
            domain,
            path: if fields[2].is_empty() { "/".into() } else { fields[2].to_string() },
            name: fields[5].to_string(),
            value: fields.get(6).copied().unwrap_or("").to_string(),
            expiry: if expiry == 0 { None } else { Some(expiry) },
            host_only: !include_subdomains,
        });
    }

    Ok(records)
}

// ---------------------------------------------------------------
// Header string
// ---------------------------------------------------------------

fn parse_header(input: &str, default_domain: &str) -> Result<Vec<CookieRecord>> {
    let header = input.trim();
    let header = header
        .strip_prefix("Cookie:")
        .or_else(|| header.strip_prefix("cookie:"))
        .unwrap_or(header);

    let (domain, _) = canonical_domain(default_domain);

    header
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (name, value) = part
                .split_once('=')
                .filter(|(n, _)| !n.trim().is_empty())
                .ok_or_else(|| {
                    Error::ParseFailure(format!("malformed cookie pair `{}`", fragment(part)))
                })?;
            Ok(CookieRecord {
                domain: domain.clone(),
                path: "/".into(),
                name: name.trim().to_string(),
                value: value.trim().to_string(),
                expiry: None,
                host_only: false,
            })
        })
        .collect()
}

// ---------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------

/// Lower-case a domain and strip leading dots. Returns whether a dot was
/// present, which marks a domain (not host-only) cookie.
pub(crate) fn canonical_domain(raw: &str) -> (String, bool) {
    let trimmed = raw.trim();
    let had_dot = trimmed.starts_with('.');
    (trimmed.trim_start_matches('.').to_lowercase(), had_dot)
}

/// Parse the date formats seen in cookie exports and `Expires` attributes.
pub(crate) fn parse_cookie_date(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if let Ok(n) = s.parse::<f64>() {
        return Some(n.floor() as i64);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    // Netscape style: "Wed, 21-Oct-2026 07:28:00 GMT"
    let dashed = s.replace('-', " ");
    chrono::DateTime::parse_from_rfc2822(&dashed)
        .ok()
        .map(|dt| dt.timestamp())
}

fn fragment(s: &str) -> String {
    if s.chars().count() <= FRAGMENT_LIMIT {
        s.to_string()
    } else {
        let cut: String = s.chars().take(FRAGMENT_LIMIT).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"[{"domain":".x.com","name":"uid","value":"100001"},
                               {"domain":".x.com","name":"sid","value":"abc:1"}]"#;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(SCENARIO), Some(CookieFormat::Json));
        assert_eq!(
            detect_format("# Netscape HTTP Cookie File\n"),
            Some(CookieFormat::Netscape)
        );
        assert_eq!(detect_format("a=1; b=2"), Some(CookieFormat::Header));
        assert_eq!(detect_format("no cookies here"), None);
    }

    #[test]
    fn test_parse_json_scenario() {
        let state = AppState::parse(SCENARIO).unwrap();
        assert_eq!(state.len(), 2);
        let uid = state.get("uid").unwrap();
        assert_eq!(uid.domain, "x.com");
        assert_eq!(uid.value, "100001");
        assert!(!uid.host_only);
        assert_eq!(uid.path, "/");
        assert_eq!(uid.expiry, None);
    }

    #[test]
    fn test_parse_json_legacy_fields() {
        let input = r#"{"cookies": [
            {"key": "c_user", "value": 42, "domain": "www.facebook.com", "expirationDate": 1893456000.5},
            {"key": "xs", "value": "s", "domain": ".facebook.com", "expires": "Tue, 01 Jan 2030 00:00:00 GMT", "hostOnly": true}
        ]}"#;
        let state = AppState::parse(input).unwrap();

        let c_user = state.get("c_user").unwrap();
        assert_eq!(c_user.value, "42");
        assert!(c_user.host_only);
        assert_eq!(c_user.expiry, Some(1893456000));

        let xs = state.get("xs").unwrap();
        assert!(xs.host_only, "explicit hostOnly wins over the leading dot");
        assert_eq!(xs.expiry, Some(1893456000));
    }

    #[test]
    fn test_parse_netscape() {
        let input = "# Netscape HTTP Cookie File\n\
                     .facebook.com\tTRUE\t/\tTRUE\t1893456000\tc_user\t42\n\
                     #HttpOnly_.facebook.com\tTRUE\t/\tTRUE\t0\txs\tsecret\n\
                     \n\
                     www.facebook.com\tFALSE\t/path\tFALSE\t0\tlocale\ten_US\n";
        let state = AppState::parse(input).unwrap();
        assert_eq!(state.len(), 3);

        let xs = state.get("xs").unwrap();
        assert_eq!(xs.value, "secret");
        assert_eq!(xs.expiry, None);
        assert!(!xs.host_only);

        let locale = state.get("locale").unwrap();
        assert!(locale.host_only);
        assert_eq!(locale.path, "/path");
    }

    #[test]
    fn test_parse_header_string() {
        let state =
            AppState::parse_with_default_domain("uid=100001; sid=abc:1=2; ", ".x.com").unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state.get("sid").unwrap().value, "abc:1=2");
        assert_eq!(state.get("sid").unwrap().domain, "x.com");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let inputs = [
            SCENARIO.to_string(),
            "uid=1; sid=2".to_string(),
            ".x.com\tTRUE\t/\tFALSE\t1893456000\tuid\t1\n".to_string(),
        ];
        for input in inputs {
            let first = AppState::parse(&input).unwrap();
            let second = AppState::parse(&first.to_json()).unwrap();
            assert_eq!(first, second);
            let third = AppState::parse(&second.to_json()).unwrap();
            assert_eq!(second, third);
        }
    }

    #[test]
    fn test_malformed_inputs_name_the_fragment() {
        let err = AppState::parse(r#"[{"domain": ".x.com", "value": "1"}]"#).unwrap_err();
        match err {
            Error::ParseFailure(msg) => {
                assert!(msg.contains("entry 0"));
                assert!(msg.contains("name"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = AppState::parse("uid=1; broken; sid=2").unwrap_err();
        assert!(matches!(err, Error::ParseFailure(ref m) if m.contains("broken")));

        let err = AppState::parse("[1, 2").unwrap_err();
        assert!(matches!(err, Error::ParseFailure(_)));

        let err = AppState::parse("   ").unwrap_err();
        assert!(matches!(err, Error::ParseFailure(_)));

        let err = AppState::parse("x.com\tTRUE\t/\tFALSE\tsoon\tuid\t1").unwrap_err();
        assert!(matches!(err, Error::ParseFailure(ref m) if m.contains("soon")));
    }

    #[test]
    fn test_parse_cookie_date() {
        assert_eq!(
            parse_cookie_date("Wed, 21-Oct-2026 07:28:00 GMT"),
            parse_cookie_date("Wed, 21 Oct 2026 07:28:00 GMT")
        );
        assert!(parse_cookie_date("2026-10-21T07:28:00Z").is_some());
        assert_eq!(parse_cookie_date("1700000000"), Some(1700000000));
        assert_eq!(parse_cookie_date("not a date"), None);
    }
}
