mod plan;
mod record;

pub use plan::DispatchPlan;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};

use gproxy_protocol::{parse_usage_bytes, UsageMetadata};
use gproxy_provider_core::{
    AttemptError, BodyStream, CallContext, Credential, CredentialUsageUpdate, DispatchAttempt,
    ProxyError, ProxyErrorKind, ProxyRequest, ProxyResponse, StreamBody,
};

use crate::headers::{build_upstream_headers, filter_response_headers};
use crate::telemetry::{PendingRequestLog, TelemetrySink};
use crate::upstream::{
    classify_status, collect_body, UpstreamClient, UpstreamRequest, UpstreamResponse,
};

use record::tee_stream;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Bytes of request and response body kept for the request log.
    pub max_capture_bytes: usize,
    /// Bytes of a failed upstream body kept for classification and passthrough.
    pub max_error_body_bytes: usize,
    /// Treat upstream 4xx validation failures as worth another credential.
    pub retry_validation_errors: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_capture_bytes: 1024 * 1024,
            max_error_body_bytes: 1024 * 1024,
            retry_validation_errors: false,
        }
    }
}

enum AttemptSuccess {
    Streaming {
        status: StatusCode,
        headers: HeaderMap,
        body: BodyStream,
    },
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        usage: Option<UsageMetadata>,
    },
}

impl AttemptSuccess {
    fn status(&self) -> StatusCode {
        match self {
            AttemptSuccess::Streaming { status, .. } | AttemptSuccess::Buffered { status, .. } => {
                *status
            }
        }
    }
}

/// Walks the ranked candidates until one attempt succeeds, a failure is not
/// worth retrying, or the attempt budget runs out. Every attempt is recorded.
#[derive(Clone)]
pub struct DispatchEngine {
    upstream: Arc<dyn UpstreamClient>,
    telemetry: TelemetrySink,
    options: DispatchOptions,
}

impl DispatchEngine {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        telemetry: TelemetrySink,
        options: DispatchOptions,
    ) -> Self {
        Self {
            upstream,
            telemetry,
            options,
        }
    }

    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    pub async fn dispatch(
        &self,
        request: ProxyRequest,
        candidates: &[Credential],
        plan: &DispatchPlan,
        ctx: &CallContext,
    ) -> Result<ProxyResponse, ProxyError> {
        let started_at = Instant::now();
        let mut record = PendingRequestLog::new(&request, ctx, self.options.max_capture_bytes);
        let allowed = plan.max_attempts(candidates.len());
        if allowed == 0 {
            let err = ProxyError::no_credentials();
            warn!(
                event = "dispatch_exhausted",
                request_id = %ctx.request_id,
                attempts = 0,
                code = err.code_or_kind()
            );
            self.finish_failure(record, err.clone(), started_at);
            return Err(err);
        }

        let mut last_error = None;
        for (attempt, credential) in candidates.iter().take(allowed).enumerate() {
            if let Some(delay) = plan.delay_before(attempt) {
                tokio::time::sleep(delay).await;
            }
            let at = OffsetDateTime::now_utc();
            let attempt_started = Instant::now();
            info!(
                event = "upstream_request",
                request_id = %ctx.request_id,
                format = %request.format,
                credential_id = credential.id,
                attempt = attempt,
                method = %request.method,
                path = %request.path,
                model = request.model.as_deref().unwrap_or(""),
                is_stream = request.stream
            );
            let outcome = self.attempt(&request, credential, plan).await;
            let elapsed_ms = attempt_started.elapsed().as_millis() as u64;
            record.credential_id = Some(credential.id);

            match outcome {
                Ok(success) => {
                    let status = success.status();
                    info!(
                        event = "upstream_response",
                        request_id = %ctx.request_id,
                        credential_id = credential.id,
                        attempt = attempt,
                        status = status.as_u16(),
                        elapsed_ms = elapsed_ms,
                        is_stream = request.stream
                    );
                    record.attempts.push(DispatchAttempt {
                        attempt: attempt as u32,
                        credential_id: credential.id,
                        error: None,
                        upstream_status: Some(status.as_u16()),
                        duration_ms: elapsed_ms,
                        at,
                    });
                    self.telemetry.record_usage(
                        &ctx.request_id,
                        CredentialUsageUpdate::success(credential.id, at),
                    );
                    return Ok(self.finish_success(record, success, request.stream, started_at));
                }
                Err(mut err) => {
                    if err.kind == ProxyErrorKind::ValidationError
                        && self.options.retry_validation_errors
                    {
                        err.retryable = true;
                    }
                    warn!(
                        event = "upstream_response",
                        request_id = %ctx.request_id,
                        credential_id = credential.id,
                        attempt = attempt,
                        status = err.status.map(|status| status.as_u16()),
                        kind = %err.kind,
                        code = err.code_or_kind(),
                        retryable = err.retryable,
                        elapsed_ms = elapsed_ms,
                        error = %err.message
                    );
                    record.attempts.push(DispatchAttempt {
                        attempt: attempt as u32,
                        credential_id: credential.id,
                        error: Some(AttemptError::from(&err)),
                        upstream_status: err.status.map(|status| status.as_u16()),
                        duration_ms: elapsed_ms,
                        at,
                    });
                    self.telemetry.record_usage(
                        &ctx.request_id,
                        CredentialUsageUpdate::failure(credential.id, at),
                    );

                    if !err.retryable {
                        warn!(
                            event = "dispatch_failed",
                            request_id = %ctx.request_id,
                            attempts = record.attempts.len(),
                            kind = %err.kind
                        );
                        self.finish_failure(record, err.clone(), started_at);
                        return Err(err);
                    }
                    if attempt + 1 < allowed {
                        info!(
                            event = "dispatch_retry",
                            request_id = %ctx.request_id,
                            failed_credential_id = credential.id,
                            next_attempt = attempt + 1,
                            kind = %err.kind
                        );
                    }
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(ProxyError::no_credentials);
        warn!(
            event = "dispatch_exhausted",
            request_id = %ctx.request_id,
            attempts = record.attempts.len(),
            kind = %err.kind,
            code = err.code_or_kind()
        );
        self.finish_failure(record, err.clone(), started_at);
        Err(err)
    }

    async fn attempt(
        &self,
        request: &ProxyRequest,
        credential: &Credential,
        plan: &DispatchPlan,
    ) -> Result<AttemptSuccess, ProxyError> {
        let headers = build_upstream_headers(request.format, &request.headers, &credential.secret)?;
        let UpstreamResponse {
            status,
            headers,
            body,
        } = self
            .upstream
            .send(UpstreamRequest {
                method: request.method.clone(),
                url: request.upstream_url.clone(),
                headers,
                body: request.body.clone(),
            })
            .await?;

        if !status.is_success() {
            let body = collect_body(body, self.options.max_error_body_bytes)
                .await
                .map_err(|err| {
                    ProxyError::network_error(err.to_string()).with_code("upstream_body_read")
                })?;
            return Err(classify_status(status, &headers, body));
        }

        if !(plan.retry_on_zero_completion_tokens && !request.stream) {
            return Ok(AttemptSuccess::Streaming {
                status,
                headers,
                body,
            });
        }

        // The whole body goes back to the caller, so it must not be capped.
        let body = collect_body(body, usize::MAX).await.map_err(|err| {
            ProxyError::network_error(err.to_string()).with_code("upstream_body_read")
        })?;
        let usage = parse_usage_bytes(&body, request.format);
        if usage.as_ref().and_then(|usage| usage.completion_tokens) == Some(0) {
            return Err(
                ProxyError::server_error("upstream returned zero completion tokens")
                    .with_code("zero_completion_tokens")
                    .with_details(json!({ "upstream_status": status.as_u16() })),
            );
        }
        Ok(AttemptSuccess::Buffered {
            status,
            headers,
            body,
            usage,
        })
    }

    fn finish_success(
        &self,
        mut record: PendingRequestLog,
        success: AttemptSuccess,
        is_stream: bool,
        started_at: Instant,
    ) -> ProxyResponse {
        record.success = true;
        match success {
            AttemptSuccess::Buffered {
                status,
                headers,
                body,
                usage,
            } => {
                let headers = filter_response_headers(&headers);
                let limit = self.options.max_capture_bytes;
                record.response_status = Some(status);
                record.response_headers = headers.clone();
                record.response_truncated = body.len() > limit;
                record.response_body = body.slice(..body.len().min(limit));
                record.usage = usage;
                record.duration_ms = started_at.elapsed().as_millis() as i64;
                self.telemetry.record_log(record);
                ProxyResponse::Json {
                    status,
                    headers,
                    body,
                }
            }
            AttemptSuccess::Streaming {
                status,
                headers,
                body,
            } => {
                let headers = filter_response_headers(&headers);
                record.response_status = Some(status);
                record.response_headers = headers.clone();
                let telemetry = self.telemetry.clone();
                let stream = tee_stream(body, self.options.max_capture_bytes, move |captured| {
                    async move {
                        record.response_body = captured.body;
                        record.response_truncated = captured.truncated;
                        if let Some(err) = captured.stream_error {
                            record.error = Some(
                                ProxyError::network_error(err).with_code("stream_interrupted"),
                            );
                        }
                        record.duration_ms = started_at.elapsed().as_millis() as i64;
                        telemetry.record_log(record);
                        if telemetry.flush_on_complete() {
                            telemetry.flush_all().await;
                        }
                    }
                });
                let content_type = if is_stream {
                    "text/event-stream"
                } else {
                    "application/json"
                };
                ProxyResponse::Stream {
                    status,
                    headers,
                    body: StreamBody {
                        content_type,
                        stream,
                    },
                }
            }
        }
    }

    fn finish_failure(&self, mut record: PendingRequestLog, err: ProxyError, started_at: Instant) {
        record.success = false;
        record.error = Some(err);
        record.duration_ms = started_at.elapsed().as_millis() as i64;
        self.telemetry.record_log(record);
    }
}
