use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, Uri};
use axum::response::Response;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use tracing::{info, warn};

use gproxy_provider_core::{CallContext, Credential, ProxyResponse};

use crate::auth::extract_proxy_key;
use crate::classify::classify_request;
use crate::core::CoreState;
use crate::error::{
    gateway_error_response, insert_header, proxy_error_response, GatewayError, REQUEST_ID_HEADER,
};
use crate::tuning::apply_tuning;

const MAX_CLIENT_REQUEST_ID_LEN: usize = 128;

pub async fn proxy_handler(
    State(state): State<Arc<CoreState>>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();
    let client_request_id = client_request_id(&headers);

    let request = match classify_request(
        &method,
        &path,
        uri.query(),
        &headers,
        body,
        &state.options.upstream,
    ) {
        Ok(req) => req,
        Err(err) => return gateway_error_response(&err, &request_id),
    };

    let Some(key) = extract_proxy_key(request.format, &headers, uri.query()) else {
        let err = GatewayError::Unauthorized("missing proxy key".to_string());
        return gateway_error_response(&err, &request_id);
    };
    let auth = match state.auth.authenticate(&key).await {
        Ok(Some(auth)) => auth,
        Ok(None) => {
            let err = GatewayError::Unauthorized("unknown proxy key".to_string());
            return gateway_error_response(&err, &request_id);
        }
        Err(err) => {
            warn!(event = "auth_failed", request_id = %request_id, error = %err);
            return gateway_error_response(&err, &request_id);
        }
    };

    let ctx = CallContext {
        request_id: request_id.clone(),
        client_request_id,
        user_id: auth.user_id,
        proxy_key_id: auth.proxy_key_id,
    };
    let (plan, prefs) = apply_tuning(&headers, &state.options.plan, &state.options.preferences);

    let ranked = match state
        .selector
        .select(&ctx.scope(), &prefs, state.options.candidate_limit)
        .await
    {
        Ok(ranked) => ranked,
        Err(err) => {
            warn!(event = "selection_failed", request_id = %request_id, error = %err);
            return gateway_error_response(&GatewayError::Store(err), &request_id);
        }
    };
    let candidates: Vec<Credential> = ranked.into_iter().map(|scored| scored.credential).collect();

    info!(
        event = "proxy_request",
        request_id = %request_id,
        client_request_id = ctx.client_request_id.as_deref().unwrap_or(""),
        format = %request.format,
        model = request.model.as_deref().unwrap_or(""),
        is_stream = request.stream,
        candidates = candidates.len()
    );

    let telemetry = state.engine.telemetry();
    match state.engine.dispatch(request, &candidates, &plan, &ctx).await {
        Ok(response) => {
            // Streams are flushed by their recorder once the caller is done.
            if telemetry.flush_on_complete() && matches!(response, ProxyResponse::Json { .. }) {
                telemetry.flush_all().await;
            }
            proxy_response(response, &request_id)
        }
        Err(err) => {
            if telemetry.flush_on_complete() {
                telemetry.flush_all().await;
            }
            proxy_error_response(&err, &request_id)
        }
    }
}

pub async fn missing_format() -> Response {
    let err = GatewayError::InvalidRequest("path must start with /gemini or /openai".to_string());
    gateway_error_response(&err, &new_request_id())
}

pub async fn healthz() -> &'static str {
    "ok"
}

fn proxy_response(response: ProxyResponse, request_id: &str) -> Response {
    let status = response.status();
    let mut resp = match response {
        ProxyResponse::Json { headers, body, .. } => {
            let mut resp = Response::new(Body::from(body));
            resp.headers_mut().extend(headers);
            resp
        }
        ProxyResponse::Stream { headers, body, .. } => {
            let mut resp = Response::new(Body::from_stream(body.stream));
            resp.headers_mut().extend(headers);
            if !resp.headers().contains_key(CONTENT_TYPE) {
                resp.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(body.content_type));
            }
            resp
        }
    };
    *resp.status_mut() = status;
    insert_header(resp.headers_mut(), REQUEST_ID_HEADER, request_id);
    resp
}

/// Log rows are keyed by this id, so it never comes from the caller.
fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn client_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.chars().take(MAX_CLIENT_REQUEST_ID_LEN).collect())
}
