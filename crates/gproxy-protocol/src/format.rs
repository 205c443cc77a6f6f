use std::fmt;

use serde::{Deserialize, Serialize};

/// The two request/response shapes the gateway forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Native Gemini API (`/v1beta/models/{model}:generateContent`).
    Gemini,
    /// OpenAI-compatible chat completions surface.
    OpenAI,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Gemini => "gemini",
            WireFormat::OpenAI => "openai",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "gemini" => Some(WireFormat::Gemini),
            "openai" => Some(WireFormat::OpenAI),
            _ => None,
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
