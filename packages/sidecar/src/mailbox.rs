//! Agent-to-agent message passing.
//!
//! Each agent owns the receiving half of a bounded channel and processes
//! [`Envelope`]s one at a time. Other agents hold a cloneable [`Mailbox`].
//! Agents never share memory; a message body is plain JSON so the receiver
//! validates it at its own boundary.
//!
//! # Semantics
//!
//! - [`Mailbox::emit`] is fire-and-forget: no reply slot, no acknowledgement.
//! - [`Mailbox::request`] attaches a reply slot and waits for the answer,
//!   up to a timeout. A missing answer is an error, not a hang.
//! - Delivery is at-most-once. Nothing here retries.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::MailboxError;

/// Default inbox capacity.
const DEFAULT_CAPACITY: usize = 64;

/// Identifies one request/reply exchange in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound message.
#[derive(Debug)]
pub struct Envelope {
    pub cid: CorrelationId,
    pub body: Value,
    reply: Option<oneshot::Sender<Value>>,
}

impl Envelope {
    /// Whether the sender is waiting for an answer.
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answer the sender. A no-op for fire-and-forget messages or when the
    /// sender already gave up.
    pub fn reply(&mut self, answer: Value) {
        if let Some(slot) = self.reply.take() {
            if slot.send(answer).is_err() {
                tracing::debug!(cid = %self.cid, "requester went away before reply");
            }
        }
    }
}

/// Sending half of an agent's inbox.
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Envelope>,
}

impl Mailbox {
    /// Create a mailbox with default capacity and return its inbox.
    pub fn channel() -> (Self, mpsc::Receiver<Envelope>) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Send a message without waiting for an answer.
    pub async fn emit<M: Serialize>(&self, message: &M) -> Result<(), MailboxError> {
        let envelope = Envelope {
            cid: CorrelationId::new(),
            body: serde_json::to_value(message)?,
            reply: None,
        };
        self.sender
            .send(envelope)
            .await
            .map_err(|_| MailboxError::Closed)
    }

    /// Send a message and wait for the receiver's answer.
    pub async fn request<M: Serialize>(
        &self,
        message: &M,
        timeout: Duration,
    ) -> Result<Value, MailboxError> {
        self.request_raw(serde_json::to_value(message)?, timeout)
            .await
    }

    /// Like [`Mailbox::request`], for a body that is already JSON.
    pub async fn request_raw(&self, body: Value, timeout: Duration) -> Result<Value, MailboxError> {
        let cid = CorrelationId::new();
        let (reply, answer) = oneshot::channel();

        self.sender
            .send(Envelope {
                cid,
                body,
                reply: Some(reply),
            })
            .await
            .map_err(|_| MailboxError::Closed)?;

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(MailboxError::NoReply),
            Err(_) => {
                tracing::warn!(cid = %cid, timeout = ?timeout, "request timed out");
                Err(MailboxError::Timeout(timeout))
            }
        }
    }

    /// Whether the receiving agent has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("closed", &self.is_closed())
            .finish()
    }
}
