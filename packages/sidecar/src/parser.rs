//! Recovers the `{simple, technical}` payload from noisy model output.
//!
//! Responses arrive wrapped in prose, markdown fences, or trailing chatter.
//! The payload is taken to be the widest brace-delimited span: first `{`
//! through last `}`. Anything that span fails to decode as JSON is a parse
//! failure, not a partial result.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobContent, JobStatus};

/// Outcome of [`parse_response`]. `raw` is always the untouched input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<JobContent>,
    pub raw: String,
}

impl ParsedResponse {
    fn without_content(status: JobStatus, raw: &str) -> Self {
        Self {
            status,
            content: None,
            raw: raw.to_string(),
        }
    }
}

/// Fields are loosely typed so a wrong-typed field reads as missing
/// (`partial`) instead of failing the whole decode.
#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    simple: Option<Value>,
    #[serde(default)]
    technical: Option<Value>,
}

/// Parse a raw response into a job status and optional content.
///
/// Pure and deterministic.
pub fn parse_response(raw: &str) -> ParsedResponse {
    let Some(candidate) = payload_span(raw.trim()) else {
        return ParsedResponse::without_content(JobStatus::ParseFailed, raw);
    };

    let payload: Payload = match serde_json::from_str(candidate) {
        Ok(payload) => payload,
        Err(_) => return ParsedResponse::without_content(JobStatus::ParseFailed, raw),
    };

    match (non_empty(payload.simple), non_empty(payload.technical)) {
        (Some(simple), Some(technical)) => ParsedResponse {
            status: JobStatus::Ok,
            content: Some(JobContent { simple, technical }),
            raw: raw.to_string(),
        },
        _ => ParsedResponse::without_content(JobStatus::Partial, raw),
    }
}

/// First `{` through last `}`, inclusive.
fn payload_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

fn non_empty(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}
