use bytes::Bytes;
use http::{HeaderMap, Method};

use gproxy_protocol::WireFormat;

/// A classified inbound call, ready to be forwarded.
///
/// `body` is shared by every dispatch attempt; cloning only bumps a refcount.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub format: WireFormat,
    pub method: Method,
    /// Path below the format segment, e.g. `v1beta/models/gemini-2.0-flash:generateContent`.
    pub path: String,
    /// Query forwarded upstream, with proxy-facing auth material removed.
    pub query: Option<String>,
    pub upstream_url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub model: Option<String>,
    pub stream: bool,
}

