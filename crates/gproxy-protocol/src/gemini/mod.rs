//! The subset of `generateContent` / `streamGenerateContent` response chunks
//! the gateway reads. Everything else in a chunk is ignored.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Candidate>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<GenerateContentUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates_token_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_content_token_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thoughts_token_count: Option<i64>,
}

impl Candidate {
    pub fn is_finished(&self) -> bool {
        matches!(
            self.finish_reason.as_deref(),
            Some(reason) if !reason.is_empty() && reason != "FINISH_REASON_UNSPECIFIED"
        )
    }
}

impl GenerateContentChunk {
    pub fn is_finished(&self) -> bool {
        self.candidates
            .as_deref()
            .is_some_and(|candidates| candidates.iter().any(Candidate::is_finished))
    }
}

impl GenerateContentUsage {
    /// Output tokens; derived from the total when the upstream omits the candidate count.
    pub fn completion_tokens(&self) -> Option<i64> {
        self.candidates_token_count.or_else(|| {
            match (self.total_token_count, self.prompt_token_count) {
                (Some(total), Some(prompt)) => total.checked_sub(prompt).map(|diff| diff.max(0)),
                _ => None,
            }
        })
    }
}
