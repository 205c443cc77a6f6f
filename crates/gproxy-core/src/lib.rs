pub mod auth;
pub mod classify;
pub mod core;
pub mod error;
pub mod handler;
pub mod tuning;

pub use auth::{AuthContext, AuthProvider, MemoryAuth, StoreAuth};
pub use classify::{classify_request, UpstreamBases};
pub use core::{Core, CoreOptions, CoreState};
pub use error::GatewayError;
