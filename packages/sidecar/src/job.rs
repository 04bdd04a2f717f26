//! Job records and the status lifecycle.
//!
//! ```text
//! waiting ──► processing ──► ok | partial | parse_failed | timeout
//!    │                           ▲
//!    └───────────────────────────┘
//! ```
//!
//! Status only ever moves rightward. Terminal records may still be
//! overwritten by a late raw response (last-write-wins), but never pulled
//! back to a non-terminal status.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::parser::ParsedResponse;

/// Globally unique job identifier.
pub type JobId = Uuid;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Waiting,
    Processing,
    Ok,
    Partial,
    ParseFailed,
    Timeout,
}

impl JobStatus {
    /// Whether no further lifecycle transition may occur.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Waiting | JobStatus::Processing)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Waiting => 0,
            JobStatus::Processing => 1,
            _ => 2,
        }
    }

    /// Whether `next` is reachable from `self` without moving backward.
    ///
    /// Terminal statuses may replace each other (a late response after a
    /// timeout), but nothing leads back to `waiting` or `processing`.
    pub fn can_become(&self, next: JobStatus) -> bool {
        next.rank() >= self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Processing => "processing",
            JobStatus::Ok => "ok",
            JobStatus::Partial => "partial",
            JobStatus::ParseFailed => "parse_failed",
            JobStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Record
// ============================================================================

/// The structured payload a job is trying to extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContent {
    pub simple: String,
    pub technical: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: JobId,
    pub topic: String,
    pub prompt_version: i32,
    pub status: JobStatus,
    /// Present only when `status` is `ok`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<JobContent>,
    /// Last raw text observed, or an error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// A fresh `waiting` record with a new id.
    pub fn new(topic: impl Into<String>, prompt_version: i32) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            topic: topic.into(),
            prompt_version,
            status: JobStatus::Waiting,
            content: None,
            raw: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge `patch` into this record.
    ///
    /// Identity fields (`job_id`, `topic`, `prompt_version`, `created_at`)
    /// are never touched. `content` is dropped whenever the resulting status
    /// is not `ok`.
    pub fn apply(&mut self, patch: JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        patch.content.merge_into(&mut self.content);
        patch.raw.merge_into(&mut self.raw);

        if self.status != JobStatus::Ok {
            self.content = None;
        }
    }
}

// ============================================================================
// Patch
// ============================================================================

/// How a patch treats one optional field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PatchField<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> PatchField<T> {
    fn merge_into(self, slot: &mut Option<T>) {
        match self {
            PatchField::Keep => {}
            PatchField::Clear => *slot = None,
            PatchField::Set(value) => *slot = Some(value),
        }
    }
}

impl<T> From<Option<T>> for PatchField<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => PatchField::Set(value),
            None => PatchField::Clear,
        }
    }
}

/// A partial record, merged into a [`JobRecord`] in one atomic step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub content: PatchField<JobContent>,
    pub raw: PatchField<String>,
}

impl JobPatch {
    /// A patch that only changes status.
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Terminal failure with an error description in `raw`.
    pub fn failed(raw: impl Into<String>) -> Self {
        Self::status(JobStatus::ParseFailed).with_raw(raw)
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = PatchField::Set(raw.into());
        self
    }

    pub fn with_content(mut self, content: JobContent) -> Self {
        self.content = PatchField::Set(content);
        self
    }
}

impl From<ParsedResponse> for JobPatch {
    fn from(parsed: ParsedResponse) -> Self {
        Self {
            status: Some(parsed.status),
            content: parsed.content.into(),
            raw: PatchField::Set(parsed.raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> JobContent {
        JobContent {
            simple: "S".into(),
            technical: "T".into(),
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Ok.is_terminal());
        assert!(JobStatus::Partial.is_terminal());
        assert!(JobStatus::ParseFailed.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_status_order() {
        assert!(JobStatus::Waiting.can_become(JobStatus::Processing));
        assert!(JobStatus::Waiting.can_become(JobStatus::Timeout));
        assert!(JobStatus::Processing.can_become(JobStatus::Ok));
        assert!(JobStatus::Timeout.can_become(JobStatus::Ok));
        assert!(!JobStatus::Processing.can_become(JobStatus::Waiting));
        assert!(!JobStatus::Ok.can_become(JobStatus::Processing));
        assert!(!JobStatus::Timeout.can_become(JobStatus::Waiting));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::ParseFailed).unwrap();
        assert_eq!(json, "\"parse_failed\"");
        assert_eq!(JobStatus::ParseFailed.to_string(), "parse_failed");
    }

    #[test]
    fn test_new_record_is_waiting() {
        let record = JobRecord::new("Vector DB", 1);
        assert_eq!(record.status, JobStatus::Waiting);
        assert_eq!(record.topic, "Vector DB");
        assert!(record.content.is_none());
        assert!(record.raw.is_none());
    }

    #[test]
    fn test_apply_keeps_identity() {
        let mut record = JobRecord::new("Topic", 3);
        let before = record.clone();

        record.apply(JobPatch::status(JobStatus::Processing));

        assert_eq!(record.job_id, before.job_id);
        assert_eq!(record.topic, before.topic);
        assert_eq!(record.prompt_version, 3);
        assert_eq!(record.created_at, before.created_at);
        assert_eq!(record.status, JobStatus::Processing);
    }

    #[test]
    fn test_content_dropped_unless_ok() {
        let mut record = JobRecord::new("Topic", 1);
        record.apply(JobPatch::status(JobStatus::Ok).with_content(content()));
        assert_eq!(record.content, Some(content()));

        record.apply(JobPatch::status(JobStatus::Partial));
        assert!(record.content.is_none());

        // Content without ok status never sticks
        record.apply(JobPatch::status(JobStatus::Timeout).with_content(content()));
        assert!(record.content.is_none());
    }

    #[test]
    fn test_patch_keep_leaves_raw() {
        let mut record = JobRecord::new("Topic", 1);
        record.apply(JobPatch::failed("boom"));
        record.apply(JobPatch::status(JobStatus::Timeout));
        assert_eq!(record.raw.as_deref(), Some("boom"));
    }

    #[test]
    fn test_record_json_shape() {
        let record = JobRecord::new("Topic", 1);
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("jobId").is_some());
        assert!(value.get("promptVersion").is_some());
        assert!(value.get("createdAt").is_some());
        assert_eq!(value["status"], "waiting");
        assert!(value.get("content").is_none());
    }
}
