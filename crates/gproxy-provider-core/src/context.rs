use crate::credential::CallerScope;

#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub request_id: String,
    /// Caller-supplied `x-request-id`; informational, never a log key.
    pub client_request_id: Option<String>,
    pub user_id: Option<i64>,
    pub proxy_key_id: Option<i64>,
}

impl CallContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn scope(&self) -> CallerScope {
        CallerScope {
            owner_id: self.user_id,
        }
    }
}
