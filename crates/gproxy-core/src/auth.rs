use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use url::form_urlencoded;

use gproxy_protocol::WireFormat;
use gproxy_provider_core::KeyStore;

use crate::error::GatewayError;

/// Who is calling, once the proxy key checked out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: Option<i64>,
    pub proxy_key_id: Option<i64>,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// `Ok(None)` for unknown or disabled keys.
    async fn authenticate(&self, key: &str) -> Result<Option<AuthContext>, GatewayError>;
}

/// The proxy key presented by the caller. Native callers may use
/// `x-goog-api-key` or `?key=`; OpenAI-compatible callers use a bearer token.
pub fn extract_proxy_key(
    format: WireFormat,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Option<String> {
    match format {
        WireFormat::Gemini => headers
            .get("x-goog-api-key")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
            .or_else(|| {
                query.and_then(|query| {
                    form_urlencoded::parse(query.as_bytes())
                        .find(|(name, _)| name == "key")
                        .map(|(_, value)| value.into_owned())
                        .filter(|key| !key.is_empty())
                })
            }),
        WireFormat::OpenAI => headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                let (scheme, token) = value.trim().split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            })
            .filter(|key| !key.is_empty())
            .map(str::to_string),
    }
}

/// Fixed key table, built from configuration or by tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuth {
    keys: HashMap<String, AuthContext>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>, context: AuthContext) -> Self {
        self.keys.insert(key.into(), context);
        self
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn authenticate(&self, key: &str) -> Result<Option<AuthContext>, GatewayError> {
        Ok(self.keys.get(key).copied())
    }
}

/// Looks keys up in the `proxy_keys` table on every call.
#[derive(Clone)]
pub struct StoreAuth {
    store: Arc<dyn KeyStore>,
}

impl StoreAuth {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuthProvider for StoreAuth {
    async fn authenticate(&self, key: &str) -> Result<Option<AuthContext>, GatewayError> {
        let record = self.store.find_proxy_key(key).await?;
        Ok(record
            .filter(|record| record.enabled)
            .map(|record| AuthContext {
                user_id: record.user_id,
                proxy_key_id: Some(record.id),
            }))
    }
}

#[cfg(test)]
mod tests {
    use gproxy_provider_core::ProxyKeyRecord;
    use gproxy_storage::MemoryStore;
    use http::HeaderValue;

    use super::*;

    #[test]
    fn native_key_from_header_or_query() {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("from-header"));
        assert_eq!(
            extract_proxy_key(WireFormat::Gemini, &headers, Some("key=from-query")).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            extract_proxy_key(WireFormat::Gemini, &HeaderMap::new(), Some("alt=sse&key=from-query"))
                .as_deref(),
            Some("from-query")
        );
        assert!(extract_proxy_key(WireFormat::Gemini, &HeaderMap::new(), None).is_none());
    }

    #[test]
    fn openai_requires_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer gp-123"));
        assert_eq!(
            extract_proxy_key(WireFormat::OpenAI, &headers, None).as_deref(),
            Some("gp-123")
        );

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_proxy_key(WireFormat::OpenAI, &headers, Some("key=gp-123")).is_none());
    }

    #[tokio::test]
    async fn store_auth_rejects_disabled_keys() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_proxy_key(
                "live",
                ProxyKeyRecord {
                    id: 1,
                    user_id: Some(7),
                    enabled: true,
                },
            )
            .await;
        store
            .insert_proxy_key(
                "revoked",
                ProxyKeyRecord {
                    id: 2,
                    user_id: None,
                    enabled: false,
                },
            )
            .await;
        let auth = StoreAuth::new(store);

        let ctx = auth.authenticate("live").await.unwrap().unwrap();
        assert_eq!(ctx.user_id, Some(7));
        assert_eq!(ctx.proxy_key_id, Some(1));
        assert!(auth.authenticate("revoked").await.unwrap().is_none());
        assert!(auth.authenticate("unknown").await.unwrap().is_none());
    }
}
