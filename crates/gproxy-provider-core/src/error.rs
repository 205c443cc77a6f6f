use std::fmt;
use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::response::UpstreamPassthroughError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyErrorKind {
    RateLimit,
    InvalidKey,
    ServerError,
    NetworkError,
    ValidationError,
    Unknown,
}

impl ProxyErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyErrorKind::RateLimit => "rate_limit",
            ProxyErrorKind::InvalidKey => "invalid_key",
            ProxyErrorKind::ServerError => "server_error",
            ProxyErrorKind::NetworkError => "network_error",
            ProxyErrorKind::ValidationError => "validation_error",
            ProxyErrorKind::Unknown => "unknown",
        }
    }

    pub fn default_status(&self) -> StatusCode {
        match self {
            ProxyErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorKind::InvalidKey => StatusCode::UNAUTHORIZED,
            ProxyErrorKind::ServerError | ProxyErrorKind::NetworkError => StatusCode::BAD_GATEWAY,
            ProxyErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ProxyErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the next credential should be tried after this kind of failure.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ProxyErrorKind::RateLimit
                | ProxyErrorKind::InvalidKey
                | ProxyErrorKind::ServerError
                | ProxyErrorKind::NetworkError
        )
    }
}

impl fmt::Display for ProxyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a failed dispatch attempt, or of the whole request once the
/// retry loop gives up.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub kind: ProxyErrorKind,
    pub message: String,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub details: Option<Value>,
    pub passthrough: Option<UpstreamPassthroughError>,
}

impl ProxyError {
    pub fn new(kind: ProxyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: None,
            retryable: kind.default_retryable(),
            retry_after: None,
            details: None,
            passthrough: None,
        }
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::RateLimit, message)
    }

    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::InvalidKey, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::ServerError, message)
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::NetworkError, message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new(ProxyErrorKind::ValidationError, message)
    }

    /// The candidate list was empty before the first attempt.
    pub fn no_credentials() -> Self {
        Self::invalid_key("no upstream credentials available")
            .with_code("no_credentials_available")
            .with_status(StatusCode::SERVICE_UNAVAILABLE)
            .with_retryable(false)
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_passthrough(mut self, passthrough: UpstreamPassthroughError) -> Self {
        self.passthrough = Some(passthrough);
        self
    }

    /// Status the caller sees; an explicit status wins over the kind default.
    pub fn http_status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.kind.default_status())
    }

    pub fn code_or_kind(&self) -> &str {
        self.code.as_deref().unwrap_or(self.kind.as_str())
    }

    pub fn to_json(&self, request_id: &str) -> Value {
        let mut body = json!({
            "error": self.kind.as_str(),
            "message": self.message,
            "code": self.code_or_kind(),
            "gproxy_request_id": request_id,
        });
        if let (Some(details), Some(map)) = (&self.details, body.as_object_mut()) {
            map.insert("details".to_string(), details.clone());
        }
        body
    }

    /// Error summary persisted with the request log; never includes the raw body.
    pub fn summary(&self) -> Value {
        json!({
            "kind": self.kind.as_str(),
            "message": self.message,
            "status": self.status.map(|status| status.as_u16()),
            "code": self.code,
            "retryable": self.retryable,
            "retry_after_ms": self.retry_after.map(|delay| delay.as_millis() as u64),
            "details": self.details,
        })
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({}): {}", self.kind, status.as_u16(), self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProxyError {}
