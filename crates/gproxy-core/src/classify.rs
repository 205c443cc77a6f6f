use bytes::Bytes;
use http::{HeaderMap, Method};
use serde_json::Value;
use url::form_urlencoded;

use gproxy_protocol::WireFormat;
use gproxy_provider_core::ProxyRequest;

use crate::error::GatewayError;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

const VERSION_SEGMENTS: &[&str] = &["v1", "v1beta"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamBases {
    pub gemini: String,
    pub openai: String,
}

impl Default for UpstreamBases {
    fn default() -> Self {
        Self {
            gemini: DEFAULT_GEMINI_BASE_URL.to_string(),
            openai: DEFAULT_OPENAI_BASE_URL.to_string(),
        }
    }
}

impl UpstreamBases {
    pub fn for_format(&self, format: WireFormat) -> &str {
        match format {
            WireFormat::Gemini => &self.gemini,
            WireFormat::OpenAI => &self.openai,
        }
    }
}

/// Splits `gemini/...` or `openai/...` into the format and the upstream path.
pub fn split_format(path: &str) -> Result<(WireFormat, &str), GatewayError> {
    let path = path.trim_start_matches('/');
    let (segment, rest) = path.split_once('/').unwrap_or((path, ""));
    let format = WireFormat::from_segment(segment).ok_or_else(|| {
        GatewayError::InvalidRequest(format!(
            "path must start with /gemini or /openai, got `/{segment}`"
        ))
    })?;
    Ok((format, rest))
}

/// `path` is everything below `/api/gproxy/`. The body is shared, never consumed.
pub fn classify_request(
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
    bases: &UpstreamBases,
) -> Result<ProxyRequest, GatewayError> {
    let (format, rest) = split_format(path)?;
    let query = forward_query(format, query);

    let (model, stream) = match format {
        WireFormat::Gemini => {
            let alt_sse = query_has(query.as_deref(), "alt", "sse");
            match native_action(rest) {
                Some((model, action)) => (
                    Some(model.to_string()),
                    alt_sse || action == "streamGenerateContent" || action == "stream",
                ),
                None => {
                    let (model, stream) = peek_body(&body);
                    (model, stream || alt_sse)
                }
            }
        }
        WireFormat::OpenAI => peek_body(&body),
    };

    let mut upstream_url = build_url(bases.for_format(format), rest);
    if let Some(query) = &query {
        upstream_url.push('?');
        upstream_url.push_str(query);
    }

    Ok(ProxyRequest {
        format,
        method: method.clone(),
        path: rest.to_string(),
        query,
        upstream_url,
        headers: headers.clone(),
        body,
        model,
        stream,
    })
}

/// `models/<model>:<action>` in the last path segment.
fn native_action(path: &str) -> Option<(&str, &str)> {
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    let (model, action) = last.split_once(':')?;
    if model.is_empty() {
        return None;
    }
    Some((model, action))
}

fn peek_body(body: &Bytes) -> (Option<String>, bool) {
    let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
        return (None, false);
    };
    let model = map.get("model").and_then(Value::as_str).map(str::to_string);
    let stream = map.get("stream").and_then(Value::as_bool).unwrap_or(false);
    (model, stream)
}

/// The native format accepts the proxy key as `?key=`; it must not travel upstream.
fn forward_query(format: WireFormat, query: Option<&str>) -> Option<String> {
    let query = query.filter(|query| !query.is_empty())?;
    match format {
        WireFormat::OpenAI => Some(query.to_string()),
        WireFormat::Gemini => {
            let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
                .filter(|(name, _)| name != "key")
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect();
            if pairs.is_empty() {
                return None;
            }
            Some(
                form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish(),
            )
        }
    }
}

fn query_has(query: Option<&str>, name: &str, value: &str) -> bool {
    query.is_some_and(|query| {
        form_urlencoded::parse(query.as_bytes())
            .any(|(key, val)| key == name && val.eq_ignore_ascii_case(value))
    })
}

/// Joins base and path, dropping a leading version segment the base already has.
pub fn build_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.split('/').any(|segment| VERSION_SEGMENTS.contains(&segment)) {
        for version in VERSION_SEGMENTS {
            if path == *version {
                path = "";
                break;
            }
            if let Some(rest) = path
                .strip_prefix(version)
                .and_then(|rest| rest.strip_prefix('/'))
            {
                path = rest;
                break;
            }
        }
    }
    format!("{base}/{path}")
}
