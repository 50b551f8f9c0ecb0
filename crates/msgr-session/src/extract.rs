//! Page-data extraction — anti-forgery token, user id, realtime hints.
//!
//! The token is embedded in the home page in several historical shapes.
//! Extractors are tried in order and the first one that yields a token wins.

use msgr_core::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static USER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(?:USER_ID|actorID)"\s*:\s*"(\d+)""#).unwrap());
static ENDPOINT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""endpoint"\s*:\s*"(wss:[^"]+)""#).unwrap());
static IRIS_SEQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""irisSeqID"\s*:\s*"?(\d+)"?"#).unwrap());

/// Values scraped from an authenticated page load.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageData {
    pub token: String,
    pub user_id: Option<String>,
    pub realtime_endpoint: Option<String>,
    pub iris_seq_id: Option<String>,
    /// Name of the extractor that found the token.
    pub source: String,
}

pub trait PageDataExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Return the anti-forgery token if this shape is present.
    fn extract_token(&self, html: &str) -> Option<String>;
}

/// Extractor driven by one regex whose first capture group is the token.
pub struct RegexExtractor {
    name: String,
    pattern: Regex,
}

impl RegexExtractor {
    pub fn new(name: &str, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::Config(format!("bad extractor pattern {}: {}", name, e)))?;
        Ok(Self {
            name: name.to_string(),
            pattern,
        })
    }
}

impl PageDataExtractor for RegexExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract_token(&self, html: &str) -> Option<String> {
        self.pattern
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|t| !t.is_empty())
    }
}

const STANDARD_PATTERNS: &[(&str, &str)] = &[
    (
        "DTSGInitialData",
        r#"\["DTSGInitialData",\s*\[\],\s*\{\s*"token"\s*:\s*"([^"]+)""#,
    ),
    (
        "DTSGInitData",
        r#"\["DTSGInitData",\s*\[\],\s*\{\s*"token"\s*:\s*"([^"]+)""#,
    ),
    ("fb_dtsg input", r#"name="fb_dtsg"\s+value="([^"]+)""#),
    ("dtsg object", r#""dtsg"\s*:\s*\{\s*"token"\s*:\s*"([^"]+)""#),
];

/// Ordered list of extractors.
pub struct ExtractorChain {
    extractors: Vec<Box<dyn PageDataExtractor>>,
}

impl ExtractorChain {
    pub fn empty() -> Self {
        Self {
            extractors: Vec::new(),
        }
    }

    /// The four known token shapes, newest first.
    pub fn standard() -> Self {
        let extractors = STANDARD_PATTERNS
            .iter()
            .filter_map(|(name, pattern)| RegexExtractor::new(name, pattern).ok())
            .map(|e| Box::new(e) as Box<dyn PageDataExtractor>)
            .collect();
        Self { extractors }
    }

    pub fn with(mut self, extractor: impl PageDataExtractor + 'static) -> Self {
        self.extractors.push(Box::new(extractor));
        self
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    pub fn extract(&self, html: &str) -> Result<PageData> {
        for extractor in &self.extractors {
            match extractor.extract_token(html) {
                Some(token) => {
                    debug!("Token found by extractor {}", extractor.name());
                    return Ok(PageData {
                        token,
                        user_id: capture(&USER_ID_RE, html),
                        realtime_endpoint: capture(&ENDPOINT_RE, html)
                            .map(|e| e.replace("\\/", "/")),
                        iris_seq_id: capture(&IRIS_SEQ_RE, html),
                        source: extractor.name().to_string(),
                    });
                }
                None => debug!("Extractor {} found nothing", extractor.name()),
            }
        }

        Err(Error::ParseFailure(format!(
            "no anti-forgery token found by any of {} extractors",
            self.extractors.len()
        )))
    }
}

impl Default for ExtractorChain {
    fn default() -> Self {
        Self::standard()
    }
}

fn capture(re: &Regex, html: &str) -> Option<String> {
    re.captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether the page still embeds a user id, and it is the logged-out id.
pub fn is_logged_out(data: &PageData) -> bool {
    data.user_id.as_deref() == Some("0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_chain_has_four_extractors() {
        assert_eq!(ExtractorChain::standard().len(), 4);
    }

    #[test]
    fn test_initial_data_shape() {
        let html = r#"<script>require(["DTSGInitialData",[],{"token":"AQH-tok:1"},258]);
            {"USER_ID":"100001","irisSeqID":"77",
             "endpoint":"wss:\/\/edge-chat.x.com\/chat?region=prn"}</script>"#;
        let data = ExtractorChain::standard().extract(html).unwrap();
        assert_eq!(data.token, "AQH-tok:1");
        assert_eq!(data.user_id.as_deref(), Some("100001"));
        assert_eq!(data.iris_seq_id.as_deref(), Some("77"));
        assert_eq!(
            data.realtime_endpoint.as_deref(),
            Some("wss://edge-chat.x.com/chat?region=prn")
        );
        assert_eq!(data.source, "DTSGInitialData");
    }

    #[test]
    fn test_falls_through_to_later_shapes() {
        let html = r#"<form><input type="hidden" name="fb_dtsg" value="formtok" /></form>"#;
        let data = ExtractorChain::standard().extract(html).unwrap();
        assert_eq!(data.token, "formtok");
        assert_eq!(data.source, "fb_dtsg input");
        assert!(data.user_id.is_none());

        let html = r#"{"dtsg":{"token":"objtok","expire":1}, "actorID":"5"}"#;
        let data = ExtractorChain::standard().extract(html).unwrap();
        assert_eq!(data.token, "objtok");
        assert_eq!(data.user_id.as_deref(), Some("5"));
    }

    #[test]
    fn test_no_match_is_parse_failure() {
        let err = ExtractorChain::standard()
            .extract("<html>nothing</html>")
            .unwrap_err();
        assert!(matches!(err, Error::ParseFailure(_)));
    }

    #[test]
    fn test_custom_extractor() {
        let chain = ExtractorChain::empty()
            .with(RegexExtractor::new("custom", r"TOKEN=(\w+)").unwrap());
        assert_eq!(chain.extract("x TOKEN=abc y").unwrap().token, "abc");
        assert!(RegexExtractor::new("bad", "(").is_err());
    }

    #[test]
    fn test_logged_out_page() {
        let html = r#"["DTSGInitData",[],{"token":"t"}] "USER_ID":"0""#;
        let data = ExtractorChain::standard().extract(html).unwrap();
        assert!(is_logged_out(&data));
    }
}
