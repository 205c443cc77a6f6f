use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{any, get};
use axum::Router;
use tower_http::trace::TraceLayer;

use gproxy_provider_impl::{DispatchEngine, DispatchPlan, KeySelector, SelectionPreferences};

use crate::auth::AuthProvider;
use crate::classify::UpstreamBases;
use crate::handler::{healthz, missing_format, proxy_handler};

pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Startup-time settings of the front end.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub upstream: UpstreamBases,
    /// Defaults that tuning headers may override per request.
    pub plan: DispatchPlan,
    pub preferences: SelectionPreferences,
    /// Caps the ranked candidate list; `None` keeps every credential.
    pub candidate_limit: Option<usize>,
    pub max_body_bytes: usize,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            upstream: UpstreamBases::default(),
            plan: DispatchPlan::default(),
            preferences: SelectionPreferences::default(),
            candidate_limit: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

pub struct CoreState {
    pub options: CoreOptions,
    pub selector: KeySelector,
    pub engine: DispatchEngine,
    pub auth: Arc<dyn AuthProvider>,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(
        options: CoreOptions,
        selector: KeySelector,
        engine: DispatchEngine,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            state: Arc::new(CoreState {
                options,
                selector,
                engine,
                auth,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/gproxy", any(missing_format))
            .route("/api/gproxy/", any(missing_format))
            .route("/api/gproxy/{*path}", any(proxy_handler))
            .route("/healthz", get(healthz))
            .layer(DefaultBodyLimit::max(self.state.options.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}
