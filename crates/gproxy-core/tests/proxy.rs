use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use time::OffsetDateTime;
use tower::ServiceExt;

use gproxy_core::{AuthContext, Core, CoreOptions, MemoryAuth};
use gproxy_provider_core::{Credential, ProxyError, RequestLog};
use gproxy_provider_impl::{
    DispatchEngine, DispatchOptions, KeySelector, TelemetryConfig, TelemetrySink, UpstreamClient,
    UpstreamRequest, UpstreamResponse,
};
use gproxy_storage::MemoryStore;

const PROXY_KEY: &str = "gp-test-key";

struct Canned {
    status: StatusCode,
    headers: Vec<(&'static str, &'static str)>,
    chunks: Vec<&'static str>,
}

/// Replays one canned reply for every call and keeps what it was sent.
struct FakeUpstream {
    reply: Canned,
    seen: Mutex<Vec<UpstreamRequest>>,
}

impl FakeUpstream {
    fn new(
        status: StatusCode,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<&'static str>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reply: Canned {
                status,
                headers,
                chunks,
            },
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<UpstreamRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamClient for FakeUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        self.seen.lock().unwrap().push(request);
        let mut headers = HeaderMap::new();
        for (name, value) in &self.reply.headers {
            headers.append(*name, HeaderValue::from_static(*value));
        }
        let chunks: Vec<Result<Bytes, io::Error>> = self
            .reply
            .chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Ok(UpstreamResponse {
            status: self.reply.status,
            headers,
            body: Box::pin(futures_util::stream::iter(chunks)),
        })
    }
}

struct Harness {
    router: Router,
    store: Arc<MemoryStore>,
    upstream: Arc<FakeUpstream>,
    telemetry: TelemetrySink,
}

fn harness(upstream: Arc<FakeUpstream>, credential_count: i64) -> Harness {
    let store = Arc::new(MemoryStore::with_credentials((1..=credential_count).map(|id| {
        Credential::new(id, format!("upstream-{id}"), OffsetDateTime::UNIX_EPOCH)
    })));
    let telemetry = TelemetrySink::spawn(store.clone(), TelemetryConfig::default());
    let engine = DispatchEngine::new(
        upstream.clone(),
        telemetry.clone(),
        DispatchOptions::default(),
    );
    let auth = MemoryAuth::new().with_key(
        PROXY_KEY,
        AuthContext {
            user_id: None,
            proxy_key_id: Some(11),
        },
    );
    let core = Core::new(
        CoreOptions::default(),
        KeySelector::new(store.clone()),
        engine,
        Arc::new(auth),
    );
    Harness {
        router: core.router(),
        store,
        upstream,
        telemetry,
    }
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn gproxy_request_id(response: &axum::response::Response) -> String {
    response
        .headers()
        .get("x-gproxy-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

async fn wait_for_log(h: &Harness, request_id: &str) -> RequestLog {
    for _ in 0..100 {
        h.telemetry.flush_all().await;
        if let Some(log) = h.store.request_log(request_id).await {
            return log;
        }
        tokio::task::yield_now().await;
    }
    panic!("request log {request_id} was never written");
}

fn gemini_request(uri: &str) -> http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
}

#[tokio::test]
async fn healthz_answers_ok() {
    let h = harness(FakeUpstream::new(StatusCode::OK, vec![], vec![]), 1);
    let response = h
        .router
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"ok");
}

#[tokio::test]
async fn unknown_format_segment_is_a_bad_request() {
    let h = harness(FakeUpstream::new(StatusCode::OK, vec![], vec![]), 1);
    let response = h
        .router
        .oneshot(
            gemini_request("/api/gproxy/v1beta/models/gemini-2.0-flash:generateContent")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().contains_key("x-gproxy-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid_request");
    assert!(body["message"].is_string());
    assert!(h.upstream.seen().is_empty());
}

#[tokio::test]
async fn missing_proxy_key_is_unauthorized() {
    let h = harness(FakeUpstream::new(StatusCode::OK, vec![], vec![]), 1);
    let response = h
        .router
        .oneshot(
            gemini_request("/api/gproxy/gemini/v1beta/models/gemini-2.0-flash:generateContent")
                .header("x-goog-api-key", "wrong")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "unauthorized");
}

#[tokio::test]
async fn gemini_call_is_forwarded_with_the_pooled_key() {
    let upstream = FakeUpstream::new(
        StatusCode::OK,
        vec![
            ("content-type", "application/json"),
            ("set-cookie", "tracking=1"),
            ("content-encoding", "gzip"),
        ],
        vec![concat!(
            r#"{"candidates":[],"usageMetadata":"#,
            r#"{"promptTokenCount":3,"candidatesTokenCount":4,"totalTokenCount":7}}"#
        )],
    );
    let h = harness(upstream, 1);

    let response = h
        .router
        .clone()
        .oneshot(
            gemini_request(&format!(
                "/api/gproxy/gemini/v1beta/models/gemini-2.0-flash:generateContent?key={PROXY_KEY}"
            ))
            .header("x-request-id", "req-gemini")
            .body(Body::from(r#"{"contents":[{"parts":[{"text":"hi"}]}]}"#))
            .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let request_id = gproxy_request_id(&response);
    assert_ne!(request_id, "req-gemini");
    let headers = response.headers().clone();
    assert!(headers.get("set-cookie").is_none());
    assert!(headers.get("content-encoding").is_none());
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    let body = body_json(response).await;
    assert_eq!(body["usageMetadata"]["totalTokenCount"], 7);

    let seen = h.upstream.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].url,
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
    );
    assert_eq!(seen[0].headers.get("x-goog-api-key").unwrap(), "upstream-1");

    let log = wait_for_log(&h, &request_id).await;
    assert!(log.success);
    assert_eq!(log.client_request_id.as_deref(), Some("req-gemini"));
    assert_eq!(log.proxy_key_id, Some(11));
    assert_eq!(log.usage.unwrap().completion_tokens, Some(4));
    let snapshot = log.request.to_string();
    assert!(!snapshot.contains(PROXY_KEY));
}

#[tokio::test]
async fn exhausted_pool_passes_the_upstream_failure_through() {
    let upstream = FakeUpstream::new(
        StatusCode::TOO_MANY_REQUESTS,
        vec![("content-type", "application/json"), ("retry-after", "7")],
        vec![r#"{"error":{"code":429,"message":"Resource has been exhausted"}}"#],
    );
    let h = harness(upstream, 3);

    let response = h
        .router
        .clone()
        .oneshot(
            gemini_request("/api/gproxy/gemini/v1beta/models/gemini-2.0-flash:generateContent")
                .header("x-goog-api-key", PROXY_KEY)
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers().clone();
    assert_eq!(headers.get("x-gproxy-error-type").unwrap(), "rate_limit");
    assert_eq!(
        headers.get("x-gproxy-error-message").unwrap(),
        "Resource has been exhausted"
    );
    assert!(headers.contains_key("x-gproxy-request-id"));
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], 429);
    assert_eq!(h.upstream.seen().len(), 3);
}

#[tokio::test]
async fn retry_header_limits_the_attempts() {
    let upstream = FakeUpstream::new(StatusCode::INTERNAL_SERVER_ERROR, vec![], vec!["{}"]);
    let h = harness(upstream, 4);

    let response = h
        .router
        .clone()
        .oneshot(
            gemini_request("/api/gproxy/gemini/v1beta/models/gemini-2.0-flash:generateContent")
                .header("x-goog-api-key", PROXY_KEY)
                .header("x-gproxy-retry-max", "1")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let seen = h.upstream.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|req| !req.headers.contains_key("x-gproxy-retry-max")));
}

#[tokio::test]
async fn openai_stream_is_relayed_chunk_for_chunk() {
    let upstream = FakeUpstream::new(
        StatusCode::OK,
        vec![("content-type", "text/event-stream")],
        vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"he\"}}]}\n\n",
            concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"},",
                "\"finish_reason\":\"stop\"}],",
                "\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5,\"total_tokens\":15}}\n\n"
            ),
            "data: [DONE]\n\n",
        ],
    );
    let h = harness(upstream, 2);

    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/gproxy/openai/v1/chat/completions")
                .header("authorization", format!("Bearer {PROXY_KEY}"))
                .header("x-request-id", "req-openai")
                .body(Body::from(
                    r#"{"model":"gemini-2.0-flash","stream":true,"messages":[]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let request_id = gproxy_request_id(&response);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(text.starts_with("data: {\"choices\""));
    assert!(text.ends_with("data: [DONE]\n\n"));

    let seen = h.upstream.seen();
    assert_eq!(
        seen[0].url,
        "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
    );
    assert_eq!(
        seen[0].headers.get("authorization").unwrap(),
        "Bearer upstream-1"
    );

    let usage = wait_for_log(&h, &request_id).await.usage.unwrap();
    assert_eq!(
        (usage.prompt_tokens, usage.completion_tokens, usage.total_tokens),
        (Some(10), Some(5), Some(15))
    );
}

#[tokio::test]
async fn empty_pool_is_service_unavailable() {
    let h = harness(FakeUpstream::new(StatusCode::OK, vec![], vec![]), 0);
    let response = h
        .router
        .oneshot(
            gemini_request("/api/gproxy/gemini/v1beta/models/gemini-2.0-flash:generateContent")
                .header("x-goog-api-key", PROXY_KEY)
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["code"], "no_credentials_available");
    assert!(body["gproxy_request_id"].is_string());
}

#[tokio::test]
async fn reused_client_request_id_does_not_merge_log_rows() {
    let upstream = FakeUpstream::new(
        StatusCode::OK,
        vec![("content-type", "application/json")],
        vec![r#"{"candidates":[]}"#],
    );
    let h = harness(upstream, 1);

    let mut ids = Vec::new();
    for _ in 0..2 {
        let response = h
            .router
            .clone()
            .oneshot(
                gemini_request("/api/gproxy/gemini/v1beta/models/gemini-2.0-flash:generateContent")
                    .header("x-goog-api-key", PROXY_KEY)
                    .header("x-request-id", "same")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        ids.push(gproxy_request_id(&response));
    }
    assert_ne!(ids[0], ids[1]);

    for id in &ids {
        let log = wait_for_log(&h, id).await;
        assert_eq!(log.client_request_id.as_deref(), Some("same"));
    }
    assert_eq!(h.store.request_logs().await.len(), 2);
}
