//! Typed errors for the sidecar library.
//!
//! Each concern owns its own enum. None of these ever cross the
//! dispatcher/executor boundary as a Rust error: every failure is folded into
//! either a negative [`Ack`](crate::protocol::Ack) or a terminal job status.

use std::time::Duration;

use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Errors raised by a [`JobStore`](crate::store::JobStore).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record exists for this job
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A record with this id already exists
    #[error("job already exists: {0}")]
    Duplicate(JobId),

    /// The patch would move a job backward in its lifecycle
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Errors raised while handing a job to the executor.
///
/// By the time the dispatcher returns one of these, the job has already been
/// recorded as `parse_failed`. The exceptions write nothing: the two
/// `Already*` variants and store failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No executor is listening
    #[error("executor unreachable: {0}")]
    Unreachable(String),

    /// The executor answered `{ ok: false }`
    #[error("executor rejected job: {0}")]
    Rejected(String),

    /// The executor never acknowledged the request
    #[error("executor did not acknowledge within {0:?}")]
    AckTimeout(Duration),

    /// The job reached a terminal state before it could be sent
    #[error("job already finished with status {0}")]
    AlreadyFinished(JobStatus),

    /// The job was handed to the executor once already
    #[error("job {0} was already dispatched")]
    AlreadyDispatched(JobId),

    /// Reading or writing the job record failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by [`ResponseCapture`](crate::capture::ResponseCapture).
///
/// The two timeouts are kept apart so "the surface never started answering"
/// and "the surface answered but never settled" stay distinguishable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// Phase 1: no new output unit appeared
    #[error("timed out after {0:?} waiting for a new output unit")]
    NoNewUnit(Duration),

    /// Phase 2: the output kept changing (or stayed empty)
    #[error("output did not stabilize within {0:?}")]
    NotStabilized(Duration),

    /// The enclosing operation was abandoned
    #[error("capture cancelled")]
    Cancelled,

    /// The event source went away mid-capture
    #[error("output source closed")]
    SourceClosed,
}

/// Errors raised by a [`Mailbox`](crate::mailbox::Mailbox).
#[derive(Debug, Error)]
pub enum MailboxError {
    /// The receiving agent is gone
    #[error("mailbox closed")]
    Closed,

    /// The receiving agent dropped the reply slot without answering
    #[error("no reply received")]
    NoReply,

    /// The request was not answered in time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised while decoding an inbound message at an agent boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The message carries a `type` this agent does not handle
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The message has no `type` tag
    #[error("message has no type")]
    MissingType,

    /// The message is tagged correctly but its fields do not decode
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}
