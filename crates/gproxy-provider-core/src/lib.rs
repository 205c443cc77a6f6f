pub mod context;
pub mod credential;
pub mod error;
pub mod record;
pub mod request;
pub mod response;
pub mod sanitize;
pub mod store;

pub use context::CallContext;
pub use credential::{merge_usage_updates, CallerScope, Credential, CredentialUsageUpdate};
pub use error::{ProxyError, ProxyErrorKind};
pub use record::{AttemptError, DispatchAttempt, RequestLog};
pub use request::ProxyRequest;
pub use response::{BodyStream, ProxyResponse, StreamBody, UpstreamPassthroughError};
pub use sanitize::Sanitizer;
pub use store::{HistoryEntry, KeyStore, ProxyKeyRecord, StoreError};
