use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use gproxy_protocol::{UsageMetadata, WireFormat};

use crate::error::{ProxyError, ProxyErrorKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptError {
    pub kind: ProxyErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&ProxyError> for AttemptError {
    fn from(err: &ProxyError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
            status: err.status.map(|status| status.as_u16()),
            code: err.code.clone(),
        }
    }
}

/// One forward-and-fetch try against one credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub attempt: u32,
    pub credential_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AttemptError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    pub duration_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Durable record of one inbound request. Snapshots are already sanitized.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLog {
    pub request_id: String,
    pub client_request_id: Option<String>,
    pub credential_id: Option<i64>,
    pub proxy_key_id: Option<i64>,
    pub user_id: Option<i64>,
    pub format: WireFormat,
    pub model: Option<String>,
    pub stream: bool,
    pub request: Value,
    pub response: Option<Value>,
    pub error: Option<Value>,
    pub success: bool,
    pub duration_ms: i64,
    pub attempts: i32,
    pub upstream_status: Option<i32>,
    pub usage: Option<UsageMetadata>,
    pub attempt_log: Vec<DispatchAttempt>,
    pub created_at: OffsetDateTime,
}

impl RequestLog {
    pub fn prompt_tokens(&self) -> Option<i64> {
        self.usage.as_ref().and_then(|usage| usage.prompt_tokens)
    }

    pub fn completion_tokens(&self) -> Option<i64> {
        self.usage.as_ref().and_then(|usage| usage.completion_tokens)
    }

    pub fn total_tokens(&self) -> Option<i64> {
        self.usage.as_ref().and_then(|usage| usage.total_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_serializes_with_rfc3339_timestamp() {
        let attempt = DispatchAttempt {
            attempt: 0,
            credential_id: 4,
            error: Some(AttemptError::from(&ProxyError::rate_limit("quota"))),
            upstream_status: Some(429),
            duration_ms: 12,
            at: OffsetDateTime::UNIX_EPOCH,
        };
        let value = serde_json::to_value(&attempt).unwrap();
        assert_eq!(value["at"], "1970-01-01T00:00:00Z");
        assert_eq!(value["error"]["kind"], "rate_limit");

        let back: DispatchAttempt = serde_json::from_value(value).unwrap();
        assert_eq!(back, attempt);
    }
}
