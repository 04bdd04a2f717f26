//! Capturing streamed output that never says it is done.
//!
//! The remote surface streams its answer into an "output unit" (a message
//! bubble, say) and gives no end-of-stream signal an outside observer can
//! rely on. Capture therefore runs in two phases:
//!
//! 1. **New unit.** Wait until the surface holds more units than it did at
//!    submission time. The newest unit is the answer.
//! 2. **Quiescence.** Watch that unit's text. Every change restarts a quiet
//!    window; once the window passes with no change and the text is non-empty,
//!    the trimmed text is the result.
//!
//! Each phase has its own timeout so "never started" and "never settled" stay
//! separate failures.
//!
//! The detectors only know [`OutputSource`]; nothing here depends on how the
//! surface is rendered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CaptureError;

// ============================================================================
// Event source
// ============================================================================

/// A change observed on the surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// A new output unit was added at `index`.
    UnitAppended { index: usize },
    /// The text of the unit at `index` is now `text`.
    UnitChanged { index: usize, text: String },
}

/// Something that holds output units and reports changes to them.
pub trait OutputSource: Send + Sync {
    /// Number of output units currently present.
    fn unit_count(&self) -> usize;

    /// Current text of the unit at `index`.
    fn unit_text(&self, index: usize) -> Option<String>;

    /// Start receiving change notifications.
    fn subscribe(&self) -> Subscription;
}

/// A live feed of [`SurfaceEvent`]s. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<SurfaceEvent>,
}

impl Subscription {
    pub fn new(receiver: broadcast::Receiver<SurfaceEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the source is gone.
    ///
    /// A lagging subscriber skips the oldest events; the newest are kept, so
    /// the latest text is never lost.
    pub async fn next(&mut self) -> Option<SurfaceEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "surface subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Explicitly stop receiving events.
    pub fn unsubscribe(self) {}
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Phase 1 budget.
    pub new_unit_timeout: Duration,
    /// Phase 2 budget, counted from the start of phase 2.
    pub stabilization_timeout: Duration,
    /// How long the text must stay unchanged to count as finished.
    pub quiet_window: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            new_unit_timeout: Duration::from_secs(30),
            stabilization_timeout: Duration::from_secs(90),
            quiet_window: Duration::from_millis(1200),
        }
    }
}

// ============================================================================
// Phase 2: quiescence
// ============================================================================

/// Resolves once a unit's text stops changing for a quiet window.
///
/// One event-driven loop with one clock-driven deadline: each change pushes
/// the quiet deadline out; the deadline only counts while text is non-empty.
#[derive(Debug, Clone, Copy)]
pub struct QuiescenceDetector {
    quiet_window: Duration,
    timeout: Duration,
}

impl QuiescenceDetector {
    pub fn new(quiet_window: Duration, timeout: Duration) -> Self {
        Self {
            quiet_window,
            timeout,
        }
    }

    /// Watch unit `index`, starting from `initial` text.
    pub async fn wait(
        &self,
        subscription: &mut Subscription,
        index: usize,
        initial: String,
        cancel: &CancellationToken,
    ) -> Result<String, CaptureError> {
        let deadline = Instant::now() + self.timeout;
        let mut text = initial;
        let mut last_changed = Instant::now();

        loop {
            let quiet_at = last_changed + self.quiet_window;
            let has_text = !text.trim().is_empty();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(CaptureError::Cancelled),

                event = subscription.next() => match event {
                    Some(SurfaceEvent::UnitChanged { index: changed, text: current })
                        if changed == index =>
                    {
                        if current != text {
                            text = current;
                            last_changed = Instant::now();
                        }
                    }
                    Some(_) => {}
                    None => return Err(CaptureError::SourceClosed),
                },

                _ = sleep_until(quiet_at), if has_text => {
                    debug!(index, chars = text.len(), "output settled");
                    return Ok(text.trim().to_string());
                }

                _ = sleep_until(deadline) => {
                    return Err(CaptureError::NotStabilized(self.timeout));
                }
            }
        }
    }
}

// ============================================================================
// Phase 1 + 2: response capture
// ============================================================================

/// A capture armed at submission time.
///
/// Call [`ResponseCapture::begin`] *before* submitting the prompt so the
/// baseline unit count and the subscription predate the answer.
pub struct ResponseCapture {
    source: Arc<dyn OutputSource>,
    subscription: Subscription,
    baseline: usize,
}

impl ResponseCapture {
    pub fn begin(source: Arc<dyn OutputSource>) -> Self {
        let subscription = source.subscribe();
        let baseline = source.unit_count();
        Self {
            source,
            subscription,
            baseline,
        }
    }

    /// Unit count recorded when the capture was armed.
    pub fn baseline(&self) -> usize {
        self.baseline
    }

    /// Run both phases and return the settled, trimmed text.
    ///
    /// Consumes the capture; the subscription is released on every exit path.
    pub async fn wait(
        mut self,
        config: &CaptureConfig,
        cancel: &CancellationToken,
    ) -> Result<String, CaptureError> {
        let index = self.wait_for_new_unit(config.new_unit_timeout, cancel).await?;
        debug!(index, baseline = self.baseline, "new output unit appeared");

        let initial = self.source.unit_text(index).unwrap_or_default();
        QuiescenceDetector::new(config.quiet_window, config.stabilization_timeout)
            .wait(&mut self.subscription, index, initial, cancel)
            .await
    }

    async fn wait_for_new_unit(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<usize, CaptureError> {
        let deadline = Instant::now() + timeout;

        loop {
            let count = self.source.unit_count();
            if count > self.baseline {
                return Ok(count - 1);
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(CaptureError::Cancelled),

                event = self.subscription.next() => {
                    if event.is_none() {
                        return Err(CaptureError::SourceClosed);
                    }
                }

                _ = sleep_until(deadline) => return Err(CaptureError::NoNewUnit(timeout)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedOutput;

    fn config() -> CaptureConfig {
        CaptureConfig {
            new_unit_timeout: Duration::from_secs(5),
            stabilization_timeout: Duration::from_secs(30),
            quiet_window: Duration::from_millis(1200),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_after_quiet_window() {
        let output = Arc::new(ScriptedOutput::new());
        let index = output.push_unit("");
        let mut subscription = output.subscribe();

        let writer = output.clone();
        tokio::spawn(async move {
            let mut text = String::new();
            for i in 0..10 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                text.push_str(&format!("chunk{} ", i));
                writer.set_text(index, &text);
            }
        });

        let start = Instant::now();
        let detector = QuiescenceDetector::new(Duration::from_millis(1200), Duration::from_secs(30));
        let result = detector
            .wait(&mut subscription, index, String::new(), &CancellationToken::new())
            .await
            .unwrap();

        // Last change lands at 2s; the quiet window must fully elapse after it
        let elapsed = start.elapsed();
        assert_eq!(result, "chunk0 chunk1 chunk2 chunk3 chunk4 chunk5 chunk6 chunk7 chunk8 chunk9");
        assert!(elapsed >= Duration::from_millis(3200), "resolved too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3500), "resolved too late: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_text_never_settles() {
        let output = Arc::new(ScriptedOutput::new());
        let index = output.push_unit("   ");
        let mut subscription = output.subscribe();

        let detector = QuiescenceDetector::new(Duration::from_millis(100), Duration::from_secs(2));
        let err = detector
            .wait(&mut subscription, index, "   ".into(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, CaptureError::NotStabilized(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_quiet_times_out() {
        let output = Arc::new(ScriptedOutput::new());
        let index = output.push_unit("a");
        let mut subscription = output.subscribe();

        let writer = output.clone();
        tokio::spawn(async move {
            let mut text = String::from("a");
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                text.push('a');
                writer.set_text(index, &text);
            }
        });

        let detector = QuiescenceDetector::new(Duration::from_millis(500), Duration::from_secs(3));
        let err = detector
            .wait(&mut subscription, index, "a".into(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::NotStabilized(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_to_other_units_ignored() {
        let output = Arc::new(ScriptedOutput::new());
        let other = output.push_unit("other");
        let index = output.push_unit("answer");
        let mut subscription = output.subscribe();

        let writer = output.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                writer.set_text(other, &format!("other {}", i));
            }
        });

        let start = Instant::now();
        let detector = QuiescenceDetector::new(Duration::from_millis(500), Duration::from_secs(30));
        let result = detector
            .wait(&mut subscription, index, "answer".into(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, "answer");
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_both_phases() {
        let output = Arc::new(ScriptedOutput::new());
        output.push_unit("previous answer");

        let capture = ResponseCapture::begin(output.clone());
        assert_eq!(capture.baseline(), 1);

        let writer = output.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let index = writer.push_unit("");
            for chunk in ["{\"simple\": ", "\"A\", ", "\"technical\": \"B\"}  "] {
                tokio::time::sleep(Duration::from_millis(150)).await;
                writer.append_text(index, chunk);
            }
        });

        let text = capture
            .wait(&config(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, r#"{"simple": "A", "technical": "B"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_new_unit_times_out() {
        let output = Arc::new(ScriptedOutput::new());
        output.push_unit("previous answer");

        let capture = ResponseCapture::begin(output.clone());

        // Changing an existing unit is not a new unit
        output.set_text(0, "previous answer, edited");

        let err = capture
            .wait(&config(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::NoNewUnit(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_budgets_are_independent() {
        let output = Arc::new(ScriptedOutput::new());
        let capture = ResponseCapture::begin(output.clone());

        let writer = output.clone();
        tokio::spawn(async move {
            // Most of the phase 1 budget is spent before the unit appears
            tokio::time::sleep(Duration::from_millis(4500)).await;
            let index = writer.push_unit("");
            tokio::time::sleep(Duration::from_secs(3)).await;
            writer.set_text(index, "complete");
        });

        let text = capture
            .wait(&config(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "complete");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_capture() {
        let output = Arc::new(ScriptedOutput::new());
        let capture = ResponseCapture::begin(output.clone());
        assert_eq!(output.subscriber_count(), 1);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = capture.wait(&config(), &cancel).await.unwrap_err();
        assert_eq!(err, CaptureError::Cancelled);
        assert_eq!(output.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_source() {
        let output = Arc::new(ScriptedOutput::new());
        let capture = ResponseCapture::begin(output.clone());

        output.close();

        let err = capture
            .wait(&config(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, CaptureError::SourceClosed);
    }
}
