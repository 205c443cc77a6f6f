use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use gproxy_provider_core::{merge_usage_updates, KeyStore, RequestLog, Sanitizer};

use super::{TelemetryConfig, TelemetryMessage, TelemetryOp};

pub(super) async fn run(
    mut rx: mpsc::Receiver<TelemetryMessage>,
    store: Arc<dyn KeyStore>,
    config: TelemetryConfig,
) {
    let mut pending: HashMap<String, Vec<TelemetryOp>> = HashMap::new();
    let mut tick = tokio::time::interval(config.flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_batch = config.max_batch.max(1);

    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else {
                    flush(store.as_ref(), &config.sanitizer, drain(&mut pending)).await;
                    break;
                };
                match message {
                    TelemetryMessage::Op { request_id, op } => {
                        let queue = pending.entry(request_id.clone()).or_default();
                        queue.push(op);
                        if queue.len() >= max_batch {
                            let ops = pending.remove(&request_id).unwrap_or_default();
                            flush(store.as_ref(), &config.sanitizer, ops).await;
                        }
                    }
                    TelemetryMessage::Flush(done) => {
                        flush(store.as_ref(), &config.sanitizer, drain(&mut pending)).await;
                        let _ = done.send(());
                    }
                    TelemetryMessage::Shutdown(done) => {
                        flush(store.as_ref(), &config.sanitizer, drain(&mut pending)).await;
                        let _ = done.send(());
                        debug!(event = "telemetry_stopped");
                        break;
                    }
                }
            }
            _ = tick.tick() => {
                if !pending.is_empty() {
                    flush(store.as_ref(), &config.sanitizer, drain(&mut pending)).await;
                }
            }
        }
    }
}

fn drain(pending: &mut HashMap<String, Vec<TelemetryOp>>) -> Vec<TelemetryOp> {
    pending.drain().flat_map(|(_, ops)| ops).collect()
}

async fn flush(store: &dyn KeyStore, sanitizer: &Sanitizer, ops: Vec<TelemetryOp>) {
    if ops.is_empty() {
        return;
    }
    let started = Instant::now();

    let mut logs: BTreeMap<String, RequestLog> = BTreeMap::new();
    let mut updates = Vec::new();
    for op in ops {
        match op {
            TelemetryOp::Log(pending) => {
                let log = pending.into_request_log(sanitizer);
                logs.insert(log.request_id.clone(), log);
            }
            TelemetryOp::Usage(update) => updates.push(update),
        }
    }
    let logs: Vec<RequestLog> = logs.into_values().collect();
    let updates = merge_usage_updates(updates);

    if !logs.is_empty() {
        if let Err(err) = store.upsert_request_logs(&logs).await {
            warn!(event = "telemetry_flush_retry", logs = logs.len(), error = %err);
            if let Err(err) = store.upsert_request_logs(&logs).await {
                warn!(
                    event = "telemetry_flush_failed",
                    kind = "request_logs",
                    logs = logs.len(),
                    error = %err
                );
            }
        }
    }
    if !updates.is_empty() {
        if let Err(err) = store.apply_usage_updates(&updates).await {
            warn!(
                event = "telemetry_flush_failed",
                kind = "usage",
                updates = updates.len(),
                error = %err
            );
        }
    }

    debug!(
        event = "telemetry_flush",
        logs = logs.len(),
        usage_updates = updates.len(),
        elapsed_ms = started.elapsed().as_millis()
    );
}
