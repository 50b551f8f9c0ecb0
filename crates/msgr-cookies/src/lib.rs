//! msgr cookies — canonical cookie records, format normalization, live jar.
//!
//! Accepts the cookie exports people actually have (browser-extension JSON,
//! Netscape `cookies.txt`, a raw `Cookie:` header) and reduces them to one
//! canonical [`AppState`].

pub mod jar;
pub mod normalize;
pub mod types;

pub use jar::CookieJar;
pub use normalize::{detect_format, normalize, CookieFormat, DEFAULT_COOKIE_DOMAIN};
pub use types::{AppState, CookieRecord};
