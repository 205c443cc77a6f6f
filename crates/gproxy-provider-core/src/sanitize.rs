//! Secret redaction for anything that is persisted or logged.
//!
//! All functions are pure and idempotent: sanitizing an already sanitized
//! value returns it unchanged.

use std::sync::LazyLock;

use http::HeaderMap;
use regex::Regex;
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";
pub const REDACTED_API_KEY: &str = "[REDACTED_API_KEY]";
pub const TRUNCATED_MARKER: &str = "...[TRUNCATED]";
pub const DEFAULT_MAX_STRING_LEN: usize = 8192;

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-goog-api-key",
    "x-api-key",
    "api-key",
    "cookie",
    "set-cookie",
    "x-auth-token",
];

const SENSITIVE_HEADER_FRAGMENTS: &[&str] = &["token", "secret", "cookie", "api-key"];

const SENSITIVE_KEYS: &[&str] = &[
    "authorization",
    "api_key",
    "apikey",
    "key",
    "token",
    "access_token",
    "refresh_token",
    "secret",
    "password",
    "x-goog-api-key",
];

static BEARER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bbearer\s+[^\s"',;]+"#).expect("bearer pattern"));

static QUERY_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([?&](?:api_key|token|key|auth|password)=)[^&#\s"']*"#)
        .expect("query pattern")
});

static LONG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]{40,}").expect("token pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sanitizer {
    pub max_string_len: usize,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

impl Sanitizer {
    pub fn new(max_string_len: usize) -> Self {
        Self { max_string_len }
    }

    pub fn text(&self, input: &str) -> String {
        let redacted = redact_text(input);
        truncate(&redacted, self.max_string_len)
    }

    pub fn value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.text(text)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.value(item)).collect())
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, value) in map {
                    let value = if is_sensitive_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.value(value)
                    };
                    out.insert(key.clone(), value);
                }
                Value::Object(out)
            }
            other => other.clone(),
        }
    }

    /// Header map as a JSON object; repeated headers are joined with `, `.
    pub fn headers(&self, headers: &HeaderMap) -> Value {
        let mut out = Map::new();
        for name in headers.keys() {
            let name = name.as_str();
            let value = if is_sensitive_header(name) {
                REDACTED.to_string()
            } else {
                let joined = headers
                    .get_all(name)
                    .iter()
                    .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.text(&joined)
            };
            out.insert(name.to_string(), Value::String(value));
        }
        Value::Object(out)
    }

    /// Parses `body` as JSON when possible, otherwise keeps it as text.
    pub fn body(&self, body: &[u8]) -> Value {
        if body.is_empty() {
            return Value::Null;
        }
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => self.value(&value),
            Err(_) => Value::String(self.text(&String::from_utf8_lossy(body))),
        }
    }
}

pub fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&name.as_str())
        || SENSITIVE_HEADER_FRAGMENTS
            .iter()
            .any(|fragment| name.contains(fragment))
}

pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.contains(&key.as_str())
}

/// Redacts bearer tokens, secret query parameters and long opaque tokens.
pub fn redact_text(input: &str) -> String {
    let out = BEARER.replace_all(input, "Bearer [REDACTED]");
    let out = QUERY_SECRET.replace_all(&out, "${1}[REDACTED]");
    let out = LONG_TOKEN.replace_all(&out, REDACTED_API_KEY);
    out.into_owned()
}

/// Cuts `input` so that the result, marker included, is exactly `limit` chars.
///
/// A cut that would split a redacted span (`Bearer [REDACTED]`,
/// `?key=[REDACTED]`, `[REDACTED_API_KEY]`) moves back to the start of that
/// span, so the result can be shorter than `limit` but never re-redacts.
pub fn truncate(input: &str, limit: usize) -> String {
    if input.chars().count() <= limit {
        return input.to_string();
    }
    let marker_len = TRUNCATED_MARKER.chars().count();
    if limit <= marker_len {
        return TRUNCATED_MARKER.chars().take(limit).collect();
    }
    let mut cut = input
        .char_indices()
        .nth(limit - marker_len)
        .map_or(input.len(), |(idx, _)| idx);

    let spans: Vec<(usize, usize)> = BEARER
        .find_iter(input)
        .chain(QUERY_SECRET.find_iter(input))
        .map(|found| (found.start(), found.end()))
        .chain(
            input
                .match_indices(REDACTED_API_KEY)
                .map(|(start, text)| (start, start + text.len())),
        )
        .collect();
    while let Some(&(start, _)) = spans
        .iter()
        .find(|(start, end)| *start < cut && cut < *end)
    {
        cut = start;
    }

    let mut out = String::with_capacity(cut + TRUNCATED_MARKER.len());
    out.push_str(&input[..cut]);
    out.push_str(TRUNCATED_MARKER);
    out
}
