//! The dispatcher agent.
//!
//! The dispatcher is the only writer of job lifecycle decisions. It creates
//! jobs, hands them to the executor, folds raw results back into the store,
//! and owns the watchdog.
//!
//! ```text
//! trigger(topic)
//!     ├─► create_job  ─► insert { waiting } ─► arm watchdog
//!     └─► dispatch    ─► waiting → processing ─► RUN_JOB ─► ack
//!                             ack failed? ─► parse_failed + disarm
//!
//! JOB_RAW_RESULT ─► on_raw_response ─► parse ─► ok | partial | parse_failed ─► disarm
//! deadline fires ─► (still open?) ─► timeout
//! ```
//!
//! Failure writes are guarded to non-terminal jobs so they never clobber a
//! result that already arrived. Raw results are last-write-wins: a response
//! that lands after a timeout is still recorded.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SidecarConfig;
use crate::error::{DispatchError, MailboxError, ProtocolError, StoreError};
use crate::job::{JobId, JobPatch, JobRecord, JobStatus};
use crate::mailbox::{Envelope, Mailbox};
use crate::parser::parse_response;
use crate::protocol::{
    decode, Ack, DispatcherEvent, ExecutorRequest, JobRawResult, RunJob, UNKNOWN_MESSAGE,
};
use crate::store::JobStore;
use crate::watchdog::TimeoutSupervisor;

pub struct Dispatcher<S> {
    store: Arc<S>,
    supervisor: TimeoutSupervisor<S>,
    executor: Mailbox,
    config: SidecarConfig,
}

impl<S: JobStore + 'static> Dispatcher<S> {
    /// `executor` is where `RUN_JOB` requests go.
    pub fn new(store: Arc<S>, executor: Mailbox, config: SidecarConfig) -> Self {
        Self {
            supervisor: TimeoutSupervisor::new(store.clone()),
            store,
            executor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn supervisor(&self) -> &TimeoutSupervisor<S> {
        &self.supervisor
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    /// Create and dispatch a job for `topic`.
    ///
    /// Blank topics are ignored and yield `None`. Once the job exists its id
    /// is returned even if dispatch failed, since the failure is already
    /// recorded on the job.
    pub async fn trigger(&self, topic: &str) -> Result<Option<JobId>, DispatchError> {
        let topic = topic.trim();
        if topic.is_empty() {
            debug!("ignoring empty topic");
            return Ok(None);
        }

        let prompt_version = self.config.prompt_version;
        let job_id = self.create_job(topic, prompt_version).await?;

        if let Err(e) = self.dispatch(job_id, topic, prompt_version).await {
            warn!(job_id = %job_id, error = %e, "dispatch failed");
        }
        Ok(Some(job_id))
    }

    /// Record a new `waiting` job and arm its watchdog.
    pub async fn create_job(&self, topic: &str, prompt_version: i32) -> Result<JobId, StoreError> {
        let record = JobRecord::new(topic, prompt_version);
        let job_id = record.job_id;

        self.store.insert(record).await?;
        self.supervisor
            .arm(job_id, self.config.watchdog_delay)
            .await;

        info!(job_id = %job_id, topic = %topic, "job created");
        Ok(job_id)
    }

    /// Hand a `waiting` job to the executor and wait for its acknowledgement.
    ///
    /// The job is marked `processing` before the request goes out. Any
    /// transport failure or negative acknowledgement marks it
    /// `parse_failed` with the error text in `raw`. Nothing is retried.
    pub async fn dispatch(
        &self,
        job_id: JobId,
        topic: &str,
        prompt_version: i32,
    ) -> Result<(), DispatchError> {
        let waiting = |record: &JobRecord| record.status == JobStatus::Waiting;
        let marked = self
            .store
            .update_if(job_id, &waiting, JobPatch::status(JobStatus::Processing))
            .await?;

        if marked.is_none() {
            let current = self
                .store
                .get(job_id)
                .await?
                .ok_or(StoreError::NotFound(job_id))?;
            return Err(if current.is_terminal() {
                DispatchError::AlreadyFinished(current.status)
            } else {
                DispatchError::AlreadyDispatched(job_id)
            });
        }

        let request = ExecutorRequest::RunJob(RunJob {
            job_id,
            topic: topic.to_string(),
            prompt_version,
        });
        debug!(job_id = %job_id, "sending job to executor");

        let outcome = match self
            .executor
            .request(&request, self.config.request_timeout)
            .await
        {
            Ok(answer) => match serde_json::from_value::<Ack>(answer) {
                Ok(ack) => ack.into_result().map_err(DispatchError::Rejected),
                Err(e) => Err(DispatchError::Rejected(format!(
                    "invalid acknowledgement: {e}"
                ))),
            },
            Err(MailboxError::Timeout(timeout)) => Err(DispatchError::AckTimeout(timeout)),
            Err(e) => Err(DispatchError::Unreachable(e.to_string())),
        };

        match &outcome {
            Ok(()) => info!(job_id = %job_id, "job accepted by executor"),
            Err(e) => self.mark_failed(job_id, &e.to_string()).await,
        }
        outcome
    }

    /// Fold a raw result into the job and disarm its watchdog.
    ///
    /// Returns `None` for unknown jobs, which are logged and otherwise
    /// ignored.
    pub async fn on_raw_response(
        &self,
        job_id: JobId,
        raw: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        let parsed = parse_response(raw);
        let status = parsed.status;

        match self.store.update(job_id, JobPatch::from(parsed)).await {
            Ok(record) => {
                self.supervisor.disarm(job_id).await;
                info!(job_id = %job_id, status = %status, "job finished");
                Ok(Some(record))
            }
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %job_id, "raw response for unknown job");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_failed(&self, job_id: JobId, raw: &str) {
        warn!(job_id = %job_id, error = %raw, "job failed");

        let still_open = |record: &JobRecord| !record.is_terminal();
        match self
            .store
            .update_if(job_id, &still_open, JobPatch::failed(raw))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(job_id = %job_id, "job already finished, failure not recorded"),
            Err(e) => error!(job_id = %job_id, error = %e, "failed to mark job as failed"),
        }
        self.supervisor.disarm(job_id).await;
    }

    /// Decode one inbound message and act on it.
    pub async fn handle_message(&self, body: Value) -> Ack {
        match decode::<DispatcherEvent>(body) {
            Ok(DispatcherEvent::JobRawResult(JobRawResult { job_id, raw })) => {
                debug!(job_id = %job_id, "raw response received");
                match self.on_raw_response(job_id, &raw).await {
                    Ok(_) => Ack::ok(),
                    Err(e) => {
                        error!(job_id = %job_id, error = %e, "raw response handling failed");
                        Ack::err(e.to_string())
                    }
                }
            }
            Err(e @ (ProtocolError::UnknownType(_) | ProtocolError::MissingType)) => {
                warn!(error = %e, "dispatcher received unknown message");
                Ack::err(UNKNOWN_MESSAGE)
            }
            Err(e) => {
                warn!(error = %e, "dispatcher received malformed message");
                Ack::err(e.to_string())
            }
        }
    }

    /// Process the inbox until it closes or `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Envelope>, shutdown: CancellationToken) {
        info!("dispatcher starting");

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
            envelope.reply(ack.to_value());
        }

        info!("dispatcher stopped");
    }
}
