use axum::body::Body;
use axum::response::Response;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::json;
use thiserror::Error;

use gproxy_provider_core::{ProxyError, StoreError};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-gproxy-request-id");
const ERROR_TYPE_HEADER: HeaderName = HeaderName::from_static("x-gproxy-error-type");
const ERROR_CODE_HEADER: HeaderName = HeaderName::from_static("x-gproxy-error-code");
const ERROR_MESSAGE_HEADER: HeaderName = HeaderName::from_static("x-gproxy-error-message");

/// Failures raised by the front end before any upstream call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("key store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Store(_) => "store_unavailable",
        }
    }
}

pub fn gateway_error_response(err: &GatewayError, request_id: &str) -> Response {
    let body = json!({
        "error": err.error_type(),
        "message": err.to_string(),
        "gproxy_request_id": request_id,
    });
    json_response(err.status(), body.to_string(), request_id)
}

/// Raw upstream failure when one was captured, otherwise a JSON error body.
pub fn proxy_error_response(err: &ProxyError, request_id: &str) -> Response {
    let Some(passthrough) = &err.passthrough else {
        return json_response(
            err.http_status(),
            err.to_json(request_id).to_string(),
            request_id,
        );
    };

    let mut resp = Response::new(Body::from(passthrough.body.clone()));
    *resp.status_mut() = passthrough.status;
    resp.headers_mut().extend(passthrough.headers.clone());
    let headers = resp.headers_mut();
    insert_header(headers, ERROR_TYPE_HEADER, err.kind.as_str());
    insert_header(headers, ERROR_CODE_HEADER, err.code_or_kind());
    insert_header(headers, ERROR_MESSAGE_HEADER, &header_safe(&err.message));
    insert_header(headers, REQUEST_ID_HEADER, request_id);
    resp
}

fn json_response(status: StatusCode, body: String, request_id: &str) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    insert_header(resp.headers_mut(), REQUEST_ID_HEADER, request_id);
    resp
}

pub(crate) fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Header values must be visible ASCII; upstream messages are not.
fn header_safe(message: &str) -> String {
    message
        .chars()
        .map(|ch| if ch.is_ascii_graphic() || ch == ' ' { ch } else { ' ' })
        .take(256)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use gproxy_provider_core::UpstreamPassthroughError;

    use super::*;

    #[test]
    fn gateway_errors_map_to_status() {
        let err = GatewayError::InvalidRequest("missing format".to_string());
        let resp = gateway_error_response(&err, "req-1");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get(REQUEST_ID_HEADER).unwrap(), "req-1");

        let err = GatewayError::Store(StoreError::Unavailable("down".to_string()));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error_type(), "store_unavailable");
    }

    #[test]
    fn passthrough_keeps_upstream_status_and_adds_error_headers() {
        let mut upstream_headers = HeaderMap::new();
        upstream_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let err = ProxyError::rate_limit("Resource has been exhausted\n(check quota)")
            .with_status(StatusCode::TOO_MANY_REQUESTS)
            .with_passthrough(UpstreamPassthroughError::new(
                StatusCode::TOO_MANY_REQUESTS,
                upstream_headers,
                Bytes::from_static(br#"{"error":{"code":429}}"#),
            ));

        let resp = proxy_error_response(&err, "req-2");
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = resp.headers();
        assert_eq!(headers.get("x-gproxy-error-type").unwrap(), "rate_limit");
        assert_eq!(headers.get("x-gproxy-error-code").unwrap(), "rate_limit");
        assert_eq!(
            headers.get("x-gproxy-error-message").unwrap(),
            "Resource has been exhausted (check quota)"
        );
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-2");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn explicit_status_wins_without_passthrough() {
        let err = ProxyError::no_credentials();
        let resp = proxy_error_response(&err, "req-3");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().get("x-gproxy-error-type").is_none());
    }
}
