//! Response classification — logout signatures, auth-class error codes.

use msgr_core::{Error, Result};
use serde_json::Value;

use crate::transport::HttpResponse;

/// Error code for "not logged in".
pub const ERROR_NOT_LOGGED_IN: i64 = 1357001;
/// Error code for a stale anti-forgery token.
pub const ERROR_STALE_TOKEN: i64 = 1357004;

const LOGOUT_MARKERS: &[&str] = &["/login", "/checkpoint"];

/// JSON endpoints prefix their payloads with an anti-hijacking loop.
const JSON_GUARD: &str = "for (;;);";

pub fn is_logout_url(url: &str) -> bool {
    LOGOUT_MARKERS.iter().any(|m| url.contains(m))
}

/// Map a response to an error when it signals logout or failure.
pub fn classify(response: &HttpResponse) -> Result<()> {
    if is_logout_url(&response.url) {
        return Err(Error::AuthExpired(format!("landed on {}", response.url)));
    }
    if let Some(location) = response.location.as_deref() {
        if is_logout_url(location) {
            return Err(Error::AuthExpired(format!("redirected to {}", location)));
        }
    }

    match response.status {
        401 | 403 => {
            return Err(Error::AuthExpired(format!(
                "HTTP {} from {}",
                response.status, response.url
            )))
        }
        s if s >= 500 => {
            return Err(Error::Network(format!("HTTP {} from {}", s, response.url)))
        }
        s if s >= 400 => {
            return Err(Error::Protocol(format!("HTTP {} from {}", s, response.url)))
        }
        _ => {}
    }

    match error_code(&response.body) {
        Some(code @ (ERROR_NOT_LOGGED_IN | ERROR_STALE_TOKEN)) => Err(Error::AuthExpired(
            format!("error code {} from {}", code, response.url),
        )),
        _ => Ok(()),
    }
}

/// Parse a JSON body (with or without the guard prefix).
pub fn parse_json_body(body: &str) -> Option<Value> {
    let trimmed = body.trim_start();
    let json = trimmed.strip_prefix(JSON_GUARD).unwrap_or(trimmed);
    serde_json::from_str(json).ok()
}

fn error_code(body: &str) -> Option<i64> {
    let trimmed = body.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with(JSON_GUARD)) {
        return None;
    }
    parse_json_body(body)?.get("error")?.as_i64()
}
