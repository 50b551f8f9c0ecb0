//! msgr session — the live session every other component works through.
//!
//! [`bootstrap`] turns a canonical [`msgr_cookies::AppState`] into a
//! [`SessionContext`] holding identity, the anti-forgery token pair, the
//! cookie jar and the connection state. All outgoing requests pass through
//! the context's [`AntiDetection`] layer and [`HttpTransport`].

pub mod bootstrap;
pub mod classify;
pub mod context;
pub mod extract;
pub mod registry;
pub mod stealth;
pub mod transport;

pub use bootstrap::{bootstrap, fetch_page_data, rebootstrap, Bootstrap};
pub use classify::classify;
pub use context::{compute_jazoest, PageHints, SessionContext, SessionTokens};
pub use extract::{ExtractorChain, PageData, PageDataExtractor, RegexExtractor};
pub use registry::{TaskRegistry, TaskTicket};
pub use stealth::{AntiDetection, AntiDetectionStatus};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport};
