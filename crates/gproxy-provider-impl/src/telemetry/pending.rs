use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde_json::{json, Value};
use time::OffsetDateTime;

use gproxy_protocol::{parse_usage_bytes, UsageMetadata, WireFormat};
use gproxy_provider_core::{
    CallContext, DispatchAttempt, ProxyError, ProxyRequest, RequestLog, Sanitizer,
};

/// Raw material for a [`RequestLog`]. Sanitizing and usage parsing happen in
/// the telemetry worker, off the response path.
#[derive(Debug, Clone)]
pub struct PendingRequestLog {
    pub request_id: String,
    pub client_request_id: Option<String>,
    pub credential_id: Option<i64>,
    pub proxy_key_id: Option<i64>,
    pub user_id: Option<i64>,
    pub format: WireFormat,
    pub model: Option<String>,
    pub stream: bool,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub request_headers: HeaderMap,
    pub request_body: Bytes,
    pub request_truncated: bool,
    pub response_status: Option<StatusCode>,
    pub response_headers: HeaderMap,
    pub response_body: Bytes,
    pub response_truncated: bool,
    pub usage: Option<UsageMetadata>,
    pub error: Option<ProxyError>,
    pub success: bool,
    pub duration_ms: i64,
    pub attempts: Vec<DispatchAttempt>,
    pub created_at: OffsetDateTime,
}

impl PendingRequestLog {
    pub fn new(request: &ProxyRequest, ctx: &CallContext, capture_limit: usize) -> Self {
        let request_truncated = request.body.len() > capture_limit;
        let request_body = if request_truncated {
            request.body.slice(..capture_limit)
        } else {
            request.body.clone()
        };
        Self {
            request_id: ctx.request_id.clone(),
            client_request_id: ctx.client_request_id.clone(),
            credential_id: None,
            proxy_key_id: ctx.proxy_key_id,
            user_id: ctx.user_id,
            format: request.format,
            model: request.model.clone(),
            stream: request.stream,
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            request_headers: request.headers.clone(),
            request_body,
            request_truncated,
            response_status: None,
            response_headers: HeaderMap::new(),
            response_body: Bytes::new(),
            response_truncated: false,
            usage: None,
            error: None,
            success: false,
            duration_ms: 0,
            attempts: Vec::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn into_request_log(self, sanitizer: &Sanitizer) -> RequestLog {
        let request = json!({
            "method": self.method.as_str(),
            "path": sanitizer.text(&self.path),
            "query": self.query.as_deref().map(|query| sanitizer.text(query)),
            "headers": sanitizer.headers(&self.request_headers),
            "body": sanitizer.body(&self.request_body),
            "truncated": self.request_truncated,
        });

        let response = self.success.then(|| {
            json!({
                "status": self.response_status.map(|status| status.as_u16()),
                "headers": sanitizer.headers(&self.response_headers),
                "body": sanitizer.body(&self.response_body),
                "truncated": self.response_truncated,
            })
        });

        let error = self.error.as_ref().map(|err| error_snapshot(err, sanitizer));

        let usage = match self.usage {
            Some(usage) => Some(usage),
            None if self.success && !self.response_body.is_empty() => {
                parse_usage_bytes(&self.response_body, self.format)
            }
            None => None,
        };

        let upstream_status = self
            .response_status
            .or_else(|| self.error.as_ref().and_then(|err| err.status))
            .map(|status| i32::from(status.as_u16()));

        RequestLog {
            request_id: self.request_id,
            client_request_id: self.client_request_id.map(|id| sanitizer.text(&id)),
            credential_id: self.credential_id,
            proxy_key_id: self.proxy_key_id,
            user_id: self.user_id,
            format: self.format,
            model: self.model,
            stream: self.stream,
            request,
            response,
            error,
            success: self.success,
            duration_ms: self.duration_ms,
            attempts: i32::try_from(self.attempts.len()).unwrap_or(i32::MAX),
            upstream_status,
            usage,
            attempt_log: self.attempts,
            created_at: self.created_at,
        }
    }
}

fn error_snapshot(err: &ProxyError, sanitizer: &Sanitizer) -> Value {
    let mut summary = sanitizer.value(&err.summary());
    if let (Some(passthrough), Some(map)) = (&err.passthrough, summary.as_object_mut()) {
        map.insert(
            "upstream_body".to_string(),
            sanitizer.body(&passthrough.body),
        );
    }
    summary
}
