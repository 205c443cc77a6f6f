use std::io;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::RETRY_AFTER;
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;

use gproxy_provider_core::{BodyStream, ProxyError, UpstreamPassthroughError};

use crate::headers::filter_response_headers;

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

/// Sends one request upstream. Transport failures surface as `network_error`.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError>;
}

#[derive(Clone)]
pub struct WreqUpstream {
    client: wreq::Client,
}

impl WreqUpstream {
    pub fn new(client: wreq::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpstreamClient for WreqUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        let response = self
            .client
            .request(request.method, request.url.as_str())
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(network_failure)?;

        let status = response.status();
        let headers = response.headers().clone();
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|err| io::Error::other(err.to_string())));
        Ok(UpstreamResponse {
            status,
            headers,
            body: Box::pin(stream),
        })
    }
}

pub fn network_failure(err: wreq::Error) -> ProxyError {
    let code = if err.is_timeout() {
        "upstream_timeout"
    } else if err.is_connect() {
        "upstream_connect"
    } else {
        "upstream_transport"
    };
    ProxyError::network_error(err.to_string()).with_code(code)
}

/// Reads at most `limit` bytes; anything beyond is dropped.
pub async fn collect_body(mut body: BodyStream, limit: usize) -> Result<Bytes, io::Error> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let room = limit.saturating_sub(buf.len());
        if room == 0 {
            continue;
        }
        let take = room.min(chunk.len());
        buf.extend_from_slice(&chunk[..take]);
    }
    Ok(buf.freeze())
}

/// Maps a non-2xx upstream response to a [`ProxyError`] that carries the raw
/// response for passthrough.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: Bytes) -> ProxyError {
    let message = upstream_error_message(&body)
        .unwrap_or_else(|| format!("upstream responded with {}", status.as_u16()));
    let passthrough =
        UpstreamPassthroughError::new(status, filter_response_headers(headers), body.clone());

    let err = match status {
        StatusCode::TOO_MANY_REQUESTS => ProxyError::rate_limit(message)
            .with_retry_after(retry_after_seconds(headers).map(Duration::from_secs)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProxyError::invalid_key(message),
        StatusCode::BAD_REQUEST if reports_invalid_key(&body) => {
            ProxyError::invalid_key(message).with_code("API_KEY_INVALID")
        }
        status if status.is_server_error() => ProxyError::server_error(message),
        status if status.is_client_error() => ProxyError::validation_error(message),
        _ => ProxyError::network_error(message).with_code("unexpected_upstream_status"),
    };
    err.with_status(status).with_passthrough(passthrough)
}

fn reports_invalid_key(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    text.contains("API_KEY_INVALID") || text.contains("API key not valid")
}

/// `error.message` from either wire format; some endpoints wrap it in an array.
fn upstream_error_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let value = match value {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    let error = value.get("error")?;
    match error {
        Value::String(message) => Some(message.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

pub fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let value = value.trim();
            if let Ok(seconds) = value.parse::<u64>() {
                return Some(seconds);
            }
            if let Ok(when) = httpdate::parse_http_date(value) {
                return when
                    .duration_since(SystemTime::now())
                    .ok()
                    .map(|duration| duration.as_secs());
            }
            None
        })
}
