use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::format::WireFormat;
use crate::gemini::GenerateContentChunk;
use crate::openai::ChatCompletionChunk;
use crate::sse::{looks_like_sse, parse_events};

/// Token usage normalized across both wire formats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub model: Option<String>,
    pub response_id: Option<String>,
    /// The upstream usage object exactly as received.
    pub raw: Value,
}

/// Extracts usage from a complete response body. Returns `None` when no usage
/// object can be found or the body cannot be parsed; never fails.
pub fn parse_usage(body: &str, format: WireFormat) -> Option<UsageMetadata> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let sse = looks_like_sse(body);
    match (format, sse) {
        (WireFormat::Gemini, true) => gemini_from_sse(body),
        (WireFormat::Gemini, false) => gemini_from_document(body),
        (WireFormat::OpenAI, true) => openai_from_sse(body),
        (WireFormat::OpenAI, false) => openai_from_document(body),
    }
}

pub fn parse_usage_bytes(body: &[u8], format: WireFormat) -> Option<UsageMetadata> {
    let text = std::str::from_utf8(body).ok()?;
    parse_usage(text, format)
}

fn sse_json_chunks(body: &str) -> impl Iterator<Item = Value> + '_ {
    parse_events(body)
        .into_iter()
        .filter(|event| !event.data.is_empty() && event.data != "[DONE]")
        .filter_map(|event| serde_json::from_str::<Value>(&event.data).ok())
}

fn gemini_from_sse(body: &str) -> Option<UsageMetadata> {
    let mut finished = None;
    let mut last_seen = None;
    for value in sse_json_chunks(body) {
        let Some((usage, is_finished)) = gemini_chunk_usage(&value) else {
            continue;
        };
        if is_finished {
            finished = Some(usage.clone());
        }
        last_seen = Some(usage);
    }
    finished.or(last_seen)
}

fn gemini_from_document(body: &str) -> Option<UsageMetadata> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value {
        Value::Array(items) => items
            .iter()
            .rev()
            .find_map(|item| gemini_chunk_usage(item).map(|(usage, _)| usage)),
        other => gemini_chunk_usage(&other).map(|(usage, _)| usage),
    }
}

fn gemini_chunk_usage(value: &Value) -> Option<(UsageMetadata, bool)> {
    let raw = value.get("usageMetadata")?.clone();
    let chunk: GenerateContentChunk = serde_json::from_value(value.clone()).ok()?;
    let usage = chunk.usage_metadata.as_ref()?;
    let prompt_tokens = usage.prompt_token_count;
    let completion_tokens = usage.completion_tokens();
    let total_tokens = usage.total_token_count.or_else(|| sum(prompt_tokens, completion_tokens));
    let metadata = UsageMetadata {
        prompt_tokens,
        completion_tokens,
        total_tokens,
        model: chunk.model_version.clone(),
        response_id: chunk.response_id.clone(),
        raw,
    };
    Some((metadata, chunk.is_finished()))
}

fn openai_from_sse(body: &str) -> Option<UsageMetadata> {
    let mut stop_usage = None;
    let mut usage_only = None;
    for value in sse_json_chunks(body) {
        let Ok(chunk) = serde_json::from_value::<ChatCompletionChunk>(value.clone()) else {
            continue;
        };
        if chunk.finished_with_stop() {
            if let Some(usage) = openai_chunk_usage(&value, &chunk) {
                stop_usage = Some(usage);
            }
        } else if chunk.is_usage_only() {
            usage_only = openai_chunk_usage(&value, &chunk);
        }
    }
    stop_usage.or(usage_only)
}

fn openai_from_document(body: &str) -> Option<UsageMetadata> {
    let value: Value = serde_json::from_str(body).ok()?;
    let chunk: ChatCompletionChunk = serde_json::from_value(value.clone()).ok()?;
    openai_chunk_usage(&value, &chunk)
}

fn openai_chunk_usage(value: &Value, chunk: &ChatCompletionChunk) -> Option<UsageMetadata> {
    let usage = chunk.usage.as_ref()?;
    let raw = value.get("usage").cloned().unwrap_or(Value::Null);
    Some(UsageMetadata {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage
            .total_tokens
            .or_else(|| sum(usage.prompt_tokens, usage.completion_tokens)),
        model: chunk.model.clone(),
        response_id: chunk.id.clone(),
        raw,
    })
}

fn sum(left: Option<i64>, right: Option<i64>) -> Option<i64> {
    match (left, right) {
        (Some(left), Some(right)) => left.checked_add(right),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sse(chunks: &[Value]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str("data: ");
            body.push_str(&chunk.to_string());
            body.push_str("\n\n");
        }
        body
    }

    #[test]
    fn openai_stream_trusts_only_the_stop_chunk() {
        let body = sse(&[
            json!({
                "id": "chatcmpl-1",
                "model": "gemini-2.0-flash",
                "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}],
                "usage": {"prompt_tokens": 99, "completion_tokens": 1, "total_tokens": 100}
            }),
            json!({
                "id": "chatcmpl-1",
                "model": "gemini-2.0-flash",
                "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": null}],
                "usage": {"prompt_tokens": 99, "completion_tokens": 2, "total_tokens": 101}
            }),
            json!({
                "id": "chatcmpl-1",
                "model": "gemini-2.0-flash",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }),
        ]) + "data: [DONE]\n\n";

        let usage = parse_usage(&body, WireFormat::OpenAI).expect("usage");
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.completion_tokens, Some(5));
        assert_eq!(usage.total_tokens, Some(15));
        assert_eq!(usage.model.as_deref(), Some("gemini-2.0-flash"));
        assert_eq!(usage.response_id.as_deref(), Some("chatcmpl-1"));
    }

    #[test]
    fn openai_stream_without_stop_usage_is_none() {
        let body = sse(&[json!({
            "choices": [{"index": 0, "finish_reason": null}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        })]);
        assert_eq!(parse_usage(&body, WireFormat::OpenAI), None);
    }

    #[test]
    fn openai_stream_accepts_trailing_usage_chunk() {
        let body = sse(&[
            json!({"choices": [{"index": 0, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 2}}),
        ]);
        let usage = parse_usage(&body, WireFormat::OpenAI).expect("usage");
        assert_eq!(usage.prompt_tokens, Some(7));
        assert_eq!(usage.total_tokens, Some(9));
    }

    #[test]
    fn openai_document_usage() {
        let body = json!({
            "id": "chatcmpl-2",
            "choices": [{"index": 0, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 8, "total_tokens": 12}
        })
        .to_string();
        let usage = parse_usage(&body, WireFormat::OpenAI).expect("usage");
        assert_eq!(usage.total_tokens, Some(12));
        assert_eq!(usage.raw["completion_tokens"], json!(8));
    }

    #[test]
    fn gemini_stream_prefers_finished_chunk() {
        let body = sse(&[
            json!({
                "candidates": [{"content": {"parts": [{"text": "a"}]}}],
                "usageMetadata": {"promptTokenCount": 6, "totalTokenCount": 6},
                "modelVersion": "gemini-2.0-flash",
                "responseId": "resp-1"
            }),
            json!({
                "candidates": [{"content": {"parts": [{"text": "b"}]}, "finishReason": "STOP"}],
                "usageMetadata": {
                    "promptTokenCount": 6,
                    "candidatesTokenCount": 4,
                    "totalTokenCount": 10
                },
                "modelVersion": "gemini-2.0-flash",
                "responseId": "resp-1"
            }),
            json!({
                "usageMetadata": {
                    "promptTokenCount": 1,
                    "candidatesTokenCount": 1,
                    "totalTokenCount": 2
                }
            }),
        ]);
        let usage = parse_usage(&body, WireFormat::Gemini).expect("usage");
        assert_eq!(usage.prompt_tokens, Some(6));
        assert_eq!(usage.completion_tokens, Some(4));
        assert_eq!(usage.total_tokens, Some(10));
        assert_eq!(usage.response_id.as_deref(), Some("resp-1"));
    }

    #[test]
    fn gemini_stream_falls_back_to_last_seen_usage() {
        let body = sse(&[
            json!({"usageMetadata": {"promptTokenCount": 2, "totalTokenCount": 2}}),
            json!({
                "usageMetadata": {
                    "promptTokenCount": 2,
                    "candidatesTokenCount": 3,
                    "totalTokenCount": 5
                }
            }),
        ]);
        let usage = parse_usage(&body, WireFormat::Gemini).expect("usage");
        assert_eq!(usage.completion_tokens, Some(3));
        assert_eq!(usage.total_tokens, Some(5));
    }

    #[test]
    fn gemini_array_document_takes_last_usage() {
        let body = json!([
            {
                "usageMetadata": {
                    "promptTokenCount": 1,
                    "candidatesTokenCount": 1,
                    "totalTokenCount": 2
                }
            },
            {"usageMetadata": {"promptTokenCount": 5, "totalTokenCount": 9}},
            {"candidates": []}
        ])
        .to_string();
        let usage = parse_usage(&body, WireFormat::Gemini).expect("usage");
        assert_eq!(usage.prompt_tokens, Some(5));
        assert_eq!(usage.completion_tokens, Some(4));
    }

    #[test]
    fn overflowing_counts_leave_derived_fields_empty() {
        let body = json!({
            "choices": [{"index": 0, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": i64::MAX, "completion_tokens": 1}
        })
        .to_string();
        let usage = parse_usage(&body, WireFormat::OpenAI).expect("usage");
        assert_eq!(usage.prompt_tokens, Some(i64::MAX));
        assert_eq!(usage.total_tokens, None);

        let body = json!({
            "usageMetadata": {"promptTokenCount": i64::MAX, "totalTokenCount": i64::MIN}
        })
        .to_string();
        let usage = parse_usage(&body, WireFormat::Gemini).expect("usage");
        assert_eq!(usage.completion_tokens, None);
        assert_eq!(usage.total_tokens, Some(i64::MIN));
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_usage("not json", WireFormat::Gemini), None);
        assert_eq!(parse_usage("data: {broken\n\n", WireFormat::OpenAI), None);
        assert_eq!(parse_usage("", WireFormat::OpenAI), None);
        assert_eq!(parse_usage_bytes(&[0xff, 0xfe], WireFormat::Gemini), None);
    }
}
