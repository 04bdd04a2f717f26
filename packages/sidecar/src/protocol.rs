//! Messages exchanged between the dispatcher and the executor.
//!
//! ```text
//! Dispatcher ── RUN_JOB { jobId, topic, promptVersion } ──► Executor
//!            ◄── { ok: true } | { ok: false, error } ──────
//!
//! Dispatcher ◄── JOB_RAW_RESULT { jobId, raw } ──────────── Executor   (fire-and-forget)
//! ```
//!
//! Messages travel as JSON objects tagged by `type`, so each agent decodes
//! what it receives at its own boundary. Anything that does not decode is
//! answered with a negative [`Ack`], never silently dropped.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::job::JobId;

/// Negative-ack text for messages an agent does not understand.
pub const UNKNOWN_MESSAGE: &str = "unknown message type";

/// Ask the executor to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJob {
    pub job_id: JobId,
    pub topic: String,
    pub prompt_version: i32,
}

/// Captured output (or a capture error description) for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRawResult {
    pub job_id: JobId,
    pub raw: String,
}

/// Requests the executor accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorRequest {
    RunJob(RunJob),
}

/// Events the dispatcher accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatcherEvent {
    JobRawResult(JobRawResult),
}

/// Acknowledgement of a request.
///
/// For `RUN_JOB` this reports whether the remote interaction was *initiated*,
/// not whether it finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }

    /// `Err` carries the error text, falling back to a generic description
    /// when the peer sent `ok: false` without one.
    pub fn into_result(self) -> Result<(), String> {
        if self.ok {
            Ok(())
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "executor reported failure".to_string()))
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!(self)
    }
}

/// A message family decodable at an agent boundary.
pub trait Inbound: DeserializeOwned {
    /// The `type` tags this family understands.
    const TYPES: &'static [&'static str];
}

impl Inbound for ExecutorRequest {
    const TYPES: &'static [&'static str] = &["RUN_JOB"];
}

impl Inbound for DispatcherEvent {
    const TYPES: &'static [&'static str] = &["JOB_RAW_RESULT"];
}

/// Decode an inbound message, telling unknown tags apart from bad payloads.
pub fn decode<M: Inbound>(body: Value) -> Result<M, ProtocolError> {
    let kind = match body.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(ProtocolError::MissingType),
    };

    if !M::TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(body).map_err(|source| ProtocolError::Malformed { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_run_job_wire_shape() {
        let id = Uuid::new_v4();
        let request = ExecutorRequest::RunJob(RunJob {
            job_id: id,
            topic: "Vector DB".into(),
            prompt_version: 1,
        });

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "RUN_JOB");
        assert_eq!(value["jobId"], id.to_string());
        assert_eq!(value["topic"], "Vector DB");
        assert_eq!(value["promptVersion"], 1);
    }

    #[test]
    fn test_raw_result_wire_shape() {
        let id = Uuid::new_v4();
        let value = json!({ "type": "JOB_RAW_RESULT", "jobId": id, "raw": "text" });

        let event: DispatcherEvent = decode(value).unwrap();
        assert_eq!(
            event,
            DispatcherEvent::JobRawResult(JobRawResult {
                job_id: id,
                raw: "text".into(),
            })
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = decode::<ExecutorRequest>(json!({ "type": "RUN_EXPAND_CONCEPT" })).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "RUN_EXPAND_CONCEPT"));
    }

    #[test]
    fn test_decode_wrong_family() {
        let value = json!({ "type": "JOB_RAW_RESULT", "jobId": Uuid::new_v4(), "raw": "" });
        let err = decode::<ExecutorRequest>(value).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(_)));
    }

    #[test]
    fn test_decode_missing_type() {
        let err = decode::<DispatcherEvent>(json!({ "raw": "text" })).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn test_decode_malformed() {
        let value = json!({ "type": "JOB_RAW_RESULT", "jobId": "not-a-uuid", "raw": "text" });
        let err = decode::<DispatcherEvent>(value).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
        assert!(err.to_string().contains("JOB_RAW_RESULT"));
    }

    #[test]
    fn test_ack_shapes() {
        assert_eq!(Ack::ok().to_value(), json!({ "ok": true }));
        assert_eq!(
            Ack::err("Injection failed").to_value(),
            json!({ "ok": false, "error": "Injection failed" })
        );
    }

    #[test]
    fn test_ack_into_result() {
        assert_eq!(Ack::ok().into_result(), Ok(()));
        assert_eq!(Ack::err("X").into_result(), Err("X".to_string()));

        let bare: Ack = serde_json::from_value(json!({ "ok": false })).unwrap();
        assert!(bare.into_result().is_err());
    }
}
