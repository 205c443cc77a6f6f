//! Batched, non-blocking persistence of request logs and credential counters.
//!
//! Producers never await the store: operations go through a bounded channel
//! and are dropped with a warning when it is full.

mod pending;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use gproxy_provider_core::{CredentialUsageUpdate, KeyStore, Sanitizer};

pub use pending::PendingRequestLog;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub flush_interval: Duration,
    /// Ops queued for one request before that request is flushed early.
    pub max_batch: usize,
    pub queue_capacity: usize,
    pub sanitizer: Sanitizer,
    /// Drain after every request; for hosts that may freeze between requests.
    pub flush_on_complete: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            max_batch: 50,
            queue_capacity: 4096,
            sanitizer: Sanitizer::default(),
            flush_on_complete: false,
        }
    }
}

#[derive(Debug)]
pub enum TelemetryOp {
    Log(Box<PendingRequestLog>),
    Usage(CredentialUsageUpdate),
}

enum TelemetryMessage {
    Op { request_id: String, op: TelemetryOp },
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the telemetry worker.
#[derive(Clone)]
pub struct TelemetrySink {
    tx: mpsc::Sender<TelemetryMessage>,
    flush_on_complete: bool,
}

impl TelemetrySink {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(store: Arc<dyn KeyStore>, config: TelemetryConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let flush_on_complete = config.flush_on_complete;
        tokio::spawn(worker::run(rx, store, config));
        Self {
            tx,
            flush_on_complete,
        }
    }

    pub fn flush_on_complete(&self) -> bool {
        self.flush_on_complete
    }

    pub fn record_log(&self, log: PendingRequestLog) {
        let request_id = log.request_id.clone();
        self.enqueue(request_id, TelemetryOp::Log(Box::new(log)));
    }

    pub fn record_usage(&self, request_id: &str, update: CredentialUsageUpdate) {
        self.enqueue(request_id.to_string(), TelemetryOp::Usage(update));
    }

    fn enqueue(&self, request_id: String, op: TelemetryOp) {
        match self.tx.try_send(TelemetryMessage::Op { request_id, op }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(TelemetryMessage::Op { request_id, .. })) => {
                warn!(event = "telemetry_dropped", request_id = %request_id, reason = "queue_full");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event = "telemetry_dropped", reason = "worker_stopped");
            }
        }
    }

    /// Returns once everything queued before the call has been written.
    pub async fn flush_all(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(TelemetryMessage::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Final drain; the worker exits afterwards.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(TelemetryMessage::Shutdown(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}
