//! The executor agent.
//!
//! The executor owns the remote text surface. For each `RUN_JOB` it injects
//! the prompt, submits it, and acknowledges as soon as the interaction has
//! *started*. Capture then runs in the background and the outcome (the
//! settled text, or a description of why capture failed) goes back to the
//! dispatcher as a `JOB_RAW_RESULT` event.
//!
//! ```text
//! RUN_JOB ──► busy? ──► build prompt ──► begin capture ──► inject ──► submit ──► ack { ok: true }
//!                                                                      │
//!                                            capture task ◄────────────┘
//!                                                 └─► JOB_RAW_RESULT { jobId, raw }
//! ```
//!
//! One surface runs one job at a time. A second `RUN_JOB` arriving while a
//! capture is in flight is rejected rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureConfig, OutputSource, ResponseCapture};
use crate::error::ProtocolError;
use crate::job::JobId;
use crate::mailbox::{Envelope, Mailbox};
use crate::prompt::build_prompt;
use crate::protocol::{
    decode, Ack, DispatcherEvent, ExecutorRequest, JobRawResult, RunJob, UNKNOWN_MESSAGE,
};

pub const BUSY: &str = "executor is busy";

/// A remote text surface: somewhere a prompt can be typed and submitted,
/// and whose answers appear as output units.
#[async_trait]
pub trait Surface: Send + Sync {
    /// Place the prompt in the surface's input.
    async fn inject_prompt(&self, prompt: &str, job_id: JobId) -> Result<()>;

    /// Submit whatever is in the input.
    async fn submit(&self) -> Result<()>;

    /// The output units answers land in.
    fn output(&self) -> Arc<dyn OutputSource>;
}

/// Marks the executor busy until dropped.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Executor {
    surface: Arc<dyn Surface>,
    dispatcher: Mailbox,
    capture: CaptureConfig,
    busy: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Executor {
    /// `dispatcher` receives the `JOB_RAW_RESULT` events.
    pub fn new(surface: Arc<dyn Surface>, dispatcher: Mailbox, capture: CaptureConfig) -> Self {
        Self {
            surface,
            dispatcher,
            capture,
            busy: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Start one job. The ack reports whether the interaction was initiated.
    pub async fn handle_run_job(&self, request: RunJob) -> Ack {
        let job_id = request.job_id;

        let Some(guard) = BusyGuard::acquire(&self.busy) else {
            warn!(job_id = %job_id, "rejecting job, executor is busy");
            return Ack::err(BUSY);
        };

        let prompt = build_prompt(&request.topic, job_id, request.prompt_version);

        // Baseline must predate the submission
        let capture = ResponseCapture::begin(self.surface.output());

        if let Err(e) = self.start(&prompt, job_id).await {
            warn!(job_id = %job_id, error = %e, "failed to start job");
            return Ack::err(format!("{e:#}"));
        }

        info!(
            job_id = %job_id,
            baseline = capture.baseline(),
            "prompt submitted, capturing response"
        );

        let config = self.capture;
        let cancel = self.cancel.child_token();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let raw = match capture.wait(&config, &cancel).await {
                Ok(text) => {
                    debug!(job_id = %job_id, len = text.len(), "response captured");
                    text
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "capture failed");
                    e.to_string()
                }
            };
            drop(guard);

            let event = DispatcherEvent::JobRawResult(JobRawResult { job_id, raw });
            if let Err(e) = dispatcher.emit(&event).await {
                warn!(job_id = %job_id, error = %e, "failed to deliver raw result");
            }
        });

        Ack::ok()
    }

    async fn start(&self, prompt: &str, job_id: JobId) -> Result<()> {
        self.surface
            .inject_prompt(prompt, job_id)
            .await
            .context("prompt injection failed")?;
        self.surface.submit().await.context("submit failed")?;
        Ok(())
    }

    /// Decode one inbound message and act on it.
    pub async fn handle_message(&self, body: Value) -> Ack {
        match decode::<ExecutorRequest>(body) {
            Ok(ExecutorRequest::RunJob(request)) => self.handle_run_job(request).await,
            Err(e @ (ProtocolError::UnknownType(_) | ProtocolError::MissingType)) => {
                warn!(error = %e, "executor received unknown message");
                Ack::err(UNKNOWN_MESSAGE)
            }
            Err(e) => {
                warn!(error = %e, "executor received malformed message");
                Ack::err(e.to_string())
            }
        }
    }

    /// Process the inbox until it closes or `shutdown` fires. In-flight
    /// captures are cancelled on the way out.
    pub async fn run(self, mut inbox: mpsc::Receiver<Envelope>, shutdown: CancellationToken) {
        info!("executor starting");

        loop {
            let mut envelope = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = inbox.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            let body = std::mem::take(&mut envelope.body);
            let ack = self.handle_message(body).await;
            if envelope.expects_reply() {
                envelope.reply(ack.to_value());
            } else if !ack.ok {
                debug!(cid = %envelope.cid, error = ?ack.error, "dropped negative ack for event");
            }
        }

        self.cancel.cancel();
        info!("executor stopped");
    }
}
