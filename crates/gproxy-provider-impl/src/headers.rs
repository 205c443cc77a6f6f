use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue};

use gproxy_protocol::WireFormat;
use gproxy_provider_core::ProxyError;

/// Response headers that never reach the caller.
const DROPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "set-cookie",
    "alt-svc",
    "server-timing",
    "vary",
];

/// Inbound headers that are not forwarded upstream.
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "accept-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "cookie",
    "authorization",
    "x-goog-api-key",
    "x-api-key",
    "api-key",
    "x-request-id",
];

const TUNING_HEADER_PREFIX: &str = "x-gproxy-";

pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if DROPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Fresh upstream header set for one attempt; `inbound` is left untouched.
pub fn build_upstream_headers(
    format: WireFormat,
    inbound: &HeaderMap,
    secret: &str,
) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        let lower = name.as_str();
        if DROPPED_REQUEST_HEADERS.contains(&lower) || lower.starts_with(TUNING_HEADER_PREFIX) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    match format {
        WireFormat::Gemini => {
            headers.insert(
                HeaderName::from_static("x-goog-api-key"),
                secret_header(secret)?,
            );
        }
        WireFormat::OpenAI => {
            let mut bearer = String::with_capacity(secret.len() + 7);
            bearer.push_str("Bearer ");
            bearer.push_str(secret);
            headers.insert(AUTHORIZATION, secret_header(&bearer)?);
        }
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    Ok(headers)
}

fn secret_header(value: &str) -> Result<HeaderValue, ProxyError> {
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        ProxyError::invalid_key("credential secret is not a valid header value")
            .with_code("malformed_credential")
    })?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, SET_COOKIE};

    use super::*;

    #[test]
    fn strips_encoding_and_cookies_but_keeps_content_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        upstream.insert(SET_COOKIE, HeaderValue::from_static("a=b"));
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        upstream.insert("vary", HeaderValue::from_static("Origin"));

        let filtered = filter_response_headers(&upstream);
        assert!(filtered.get(CONTENT_ENCODING).is_none());
        assert!(filtered.get(SET_COOKIE).is_none());
        assert!(filtered.get("vary").is_none());
        assert_eq!(filtered.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(filtered.get(CONTENT_LENGTH).unwrap(), "42");
    }

    #[test]
    fn gemini_attempt_gets_goog_key_and_loses_caller_auth() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-goog-api-key", HeaderValue::from_static("proxy-key"));
        inbound.insert("x-gproxy-retry-max", HeaderValue::from_static("2"));
        inbound.insert("host", HeaderValue::from_static("localhost:8787"));
        inbound.insert("accept-encoding", HeaderValue::from_static("gzip"));
        inbound.insert("x-custom", HeaderValue::from_static("kept"));

        let headers =
            build_upstream_headers(WireFormat::Gemini, &inbound, "AIza-upstream").unwrap();
        assert_eq!(headers.get("x-goog-api-key").unwrap(), "AIza-upstream");
        assert!(headers.get("x-gproxy-retry-max").is_none());
        assert!(headers.get("host").is_none());
        assert!(headers.get("accept-encoding").is_none());
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");

        assert_eq!(inbound.get("x-goog-api-key").unwrap(), "proxy-key");
        assert_eq!(inbound.len(), 5);
    }

    #[test]
    fn openai_attempt_gets_bearer() {
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer proxy-key"));
        let headers = build_upstream_headers(WireFormat::OpenAI, &inbound, "sk-up").unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-up");
        assert!(headers.get("x-goog-api-key").is_none());
    }

    #[test]
    fn malformed_secret_is_an_invalid_key() {
        let err = build_upstream_headers(WireFormat::Gemini, &HeaderMap::new(), "bad\nkey")
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("malformed_credential"));
        assert!(err.retryable);
    }
}
