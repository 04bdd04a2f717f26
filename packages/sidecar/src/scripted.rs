//! A scripted surface for tests and local simulation.
//!
//! [`ScriptedOutput`] is an in-memory [`OutputSource`] whose units are edited
//! by hand. [`ScriptedSurface`] wraps one and, on submit, streams a canned
//! answer into a fresh unit chunk by chunk, the way a chat page would.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::capture::{OutputSource, Subscription, SurfaceEvent};
use crate::executor::Surface;
use crate::job::JobId;

const EVENT_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Output
// ============================================================================

/// Hand-driven output units.
#[derive(Debug)]
pub struct ScriptedOutput {
    units: Mutex<Vec<String>>,
    events: Mutex<Option<broadcast::Sender<SurfaceEvent>>>,
}

impl Default for ScriptedOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOutput {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            units: Mutex::new(Vec::new()),
            events: Mutex::new(Some(sender)),
        }
    }

    /// Append a unit and return its index.
    pub fn push_unit(&self, text: &str) -> usize {
        let index = {
            let mut units = lock(&self.units);
            units.push(text.to_string());
            units.len() - 1
        };
        self.notify(SurfaceEvent::UnitAppended { index });
        index
    }

    /// Replace the text of an existing unit. Unknown indexes are ignored.
    pub fn set_text(&self, index: usize, text: &str) {
        let updated = {
            let mut units = lock(&self.units);
            match units.get_mut(index) {
                Some(unit) => {
                    *unit = text.to_string();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify(SurfaceEvent::UnitChanged {
                index,
                text: text.to_string(),
            });
        }
    }

    /// Append to the text of an existing unit, as streaming output does.
    pub fn append_text(&self, index: usize, chunk: &str) {
        let current = {
            let mut units = lock(&self.units);
            match units.get_mut(index) {
                Some(unit) => {
                    unit.push_str(chunk);
                    Some(unit.clone())
                }
                None => None,
            }
        };
        if let Some(text) = current {
            self.notify(SurfaceEvent::UnitChanged { index, text });
        }
    }

    /// Drop the event sender; subscribers see the source close.
    pub fn close(&self) {
        lock(&self.events).take();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.events)
            .as_ref()
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn notify(&self, event: SurfaceEvent) {
        if let Some(sender) = lock(&self.events).as_ref() {
            // No subscribers is fine
            let _ = sender.send(event);
        }
    }
}

impl OutputSource for ScriptedOutput {
    fn unit_count(&self) -> usize {
        lock(&self.units).len()
    }

    fn unit_text(&self, index: usize) -> Option<String> {
        lock(&self.units).get(index).cloned()
    }

    fn subscribe(&self) -> Subscription {
        match lock(&self.events).as_ref() {
            Some(sender) => Subscription::new(sender.subscribe()),
            None => {
                // Already closed: hand out a feed that ends immediately
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                Subscription::new(receiver)
            }
        }
    }
}

// ============================================================================
// Surface
// ============================================================================

/// A surface that answers every submission with the same streamed text.
#[derive(Debug)]
pub struct ScriptedSurface {
    output: Arc<ScriptedOutput>,
    chunks: Vec<String>,
    respond: bool,
    start_delay: Duration,
    chunk_interval: Duration,
    inject_failure: Option<String>,
    submit_failure: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedSurface {
    /// Stream `answer` split into `chunk_count` roughly equal pieces.
    pub fn answering(answer: &str, chunk_count: usize) -> Self {
        Self::with_chunks(split_chunks(answer, chunk_count))
    }

    pub fn with_chunks(chunks: Vec<String>) -> Self {
        Self {
            output: Arc::new(ScriptedOutput::new()),
            chunks,
            respond: true,
            start_delay: Duration::from_millis(500),
            chunk_interval: Duration::from_millis(200),
            inject_failure: None,
            submit_failure: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Accepts submissions but never produces output.
    pub fn silent() -> Self {
        Self {
            respond: false,
            ..Self::with_chunks(Vec::new())
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn failing_injection(mut self, error: impl Into<String>) -> Self {
        self.inject_failure = Some(error.into());
        self
    }

    pub fn failing_submit(mut self, error: impl Into<String>) -> Self {
        self.submit_failure = Some(error.into());
        self
    }

    pub fn scripted_output(&self) -> &Arc<ScriptedOutput> {
        &self.output
    }

    /// Every prompt injected so far.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

#[async_trait]
impl Surface for ScriptedSurface {
    async fn inject_prompt(&self, prompt: &str, _job_id: JobId) -> Result<()> {
        if let Some(error) = &self.inject_failure {
            bail!("{}", error);
        }
        lock(&self.prompts).push(prompt.to_string());
        Ok(())
    }

    async fn submit(&self) -> Result<()> {
        if let Some(error) = &self.submit_failure {
            bail!("{}", error);
        }
        if !self.respond {
            return Ok(());
        }

        let output = self.output.clone();
        let chunks = self.chunks.clone();
        let start_delay = self.start_delay;
        let chunk_interval = self.chunk_interval;

        tokio::spawn(async move {
            tokio::time::sleep(start_delay).await;
            let index = output.push_unit("");
            for chunk in chunks {
                tokio::time::sleep(chunk_interval).await;
                output.append_text(index, &chunk);
            }
        });
        Ok(())
    }

    fn output(&self) -> Arc<dyn OutputSource> {
        self.output.clone()
    }
}

/// Split on char boundaries into at most `count` pieces.
fn split_chunks(text: &str, count: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let size = chars.len().div_ceil(count.max(1));
    chars
        .chunks(size)
        .map(|piece| piece.iter().collect())
        .collect()
}
