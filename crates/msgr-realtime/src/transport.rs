//! Frame transports — the WebSocket carrying MQTT, behind a trait seam.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use msgr_core::{Error, Result};
use msgr_session::SessionContext;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

/// One open connection carrying whole MQTT packets.
///
/// `recv` must be cancel-safe: the stream loop polls it inside `select!`.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Next frame, or `None` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens [`FrameTransport`]s. Swapped for an in-memory connector in tests.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn FrameTransport>>;
}

/// Everything needed to dial the realtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    /// Target the endpoint from page data when present, else the configured
    /// one, tagged with the session and client ids. Carries the session's
    /// cookies and browser headers.
    pub fn for_session(ctx: &SessionContext, session_id: u64) -> Result<Self> {
        let endpoint = ctx
            .page_hints()
            .realtime_endpoint
            .unwrap_or_else(|| ctx.config().realtime_endpoint.clone());
        let mut url = Url::parse(&endpoint)
            .map_err(|e| Error::Config(format!("bad realtime endpoint {}: {}", endpoint, e)))?;
        url.query_pairs_mut()
            .append_pair("sid", &session_id.to_string())
            .append_pair("cid", ctx.client_id());

        let mut headers = Vec::new();
        if let Some(cookies) = ctx.cookie_header(&cookie_scope(&url)) {
            headers.push(("Cookie".to_string(), cookies));
        }
        let base = ctx.config().base_url.trim_end_matches('/').to_string();
        headers.push(("Origin".to_string(), base.clone()));
        headers.push(("Referer".to_string(), format!("{}/", base)));
        headers.push(("User-Agent".to_string(), ctx.stealth().user_agent().to_string()));

        Ok(Self {
            url: url.to_string(),
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Cookies are scoped to http(s) URLs; map ws(s) onto them.
fn cookie_scope(url: &Url) -> Url {
    let mut scoped = url.clone();
    let scheme = if url.scheme() == "ws" { "http" } else { "https" };
    if scoped.set_scheme(scheme).is_err() {
        return url.clone();
    }
    scoped
}

// ---------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn FrameTransport>> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("bad realtime URL: {}", e)))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Internal(format!("header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Internal(format!("header value for {}: {}", name, e)))?;
            ws_request.headers_mut().insert(name, value);
        }

        let (ws, response) = connect_async(ws_request).await.map_err(map_ws_error)?;
        info!("Realtime socket open (HTTP {})", response.status());
        Ok(Box::new(WebSocketTransport { ws }))
    }
}

fn map_ws_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => match response.status().as_u16() {
            401 | 403 => Error::AuthExpired(format!(
                "realtime handshake refused with HTTP {}",
                response.status()
            )),
            status => Error::Network(format!("realtime handshake failed with HTTP {}", status)),
        },
        other => Error::Network(format!("realtime socket: {}", other)),
    }
}

pub struct WebSocketTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.ws
            .send(Message::Binary(frame))
            .await
            .map_err(map_ws_error)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Close(frame))) => {
                    debug!("Realtime socket closed by server: {:?}", frame);
                    return Ok(None);
                }
                // Control frames are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.ws.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_scope() {
        let url = Url::parse("wss://edge-chat.x.com/chat?sid=1").unwrap();
        assert_eq!(cookie_scope(&url).scheme(), "https");
        let url = Url::parse("ws://127.0.0.1:9000/chat").unwrap();
        assert_eq!(cookie_scope(&url).scheme(), "http");
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let request = ConnectRequest {
            url: "wss://x/chat".into(),
            headers: vec![("User-Agent".into(), "ua".into())],
        };
        assert_eq!(request.header("user-agent"), Some("ua"));
        assert_eq!(request.header("Cookie"), None);
    }

    #[test]
    fn test_handshake_errors() {
        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        assert!(map_ws_error(tungstenite::Error::Http(response)).is_auth());
        assert!(matches!(
            map_ws_error(tungstenite::Error::ConnectionClosed),
            Error::Network(_)
        ));
    }
}
