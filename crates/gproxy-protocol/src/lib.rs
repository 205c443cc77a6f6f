pub mod format;
pub mod gemini;
pub mod openai;
pub mod sse;
pub mod usage;

pub use format::WireFormat;
pub use sse::{SseEvent, SseParser};
pub use usage::{parse_usage, parse_usage_bytes, UsageMetadata};
