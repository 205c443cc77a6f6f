pub mod client;
pub mod dispatch;
pub mod headers;
pub mod selector;
pub mod telemetry;
pub mod upstream;

pub use client::{build_client, ClientOptions};
pub use dispatch::{DispatchEngine, DispatchOptions, DispatchPlan};
pub use selector::{
    rank_candidates, CredentialStats, KeySelector, ScoredCredential, SelectionPreferences,
};
pub use telemetry::{PendingRequestLog, TelemetryConfig, TelemetryOp, TelemetrySink};
pub use upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse, WreqUpstream};
