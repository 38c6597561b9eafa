use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::FailureKind;
use crate::filter::FilterReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Pair,
    Episode,
    Parse,
    Match,
    Filter,
    Define,
    Extract,
    Assemble,
    Commit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Started,
    Ok,
    Filtered(FilterReason),
    Duplicate,
    Failed(FailureKind),
}

/// One step of progress, ordered as emitted by the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub stage: Stage,
    /// Mining unit index for unit-level stages
    pub unit_id: Option<usize>,
    pub outcome: Outcome,
}

impl PipelineEvent {
    pub fn stage(stage: Stage, outcome: Outcome) -> Self {
        Self {
            stage,
            unit_id: None,
            outcome,
        }
    }

    pub fn unit(stage: Stage, unit_id: usize, outcome: Outcome) -> Self {
        Self {
            stage,
            unit_id: Some(unit_id),
            outcome,
        }
    }
}

/// Receiver of pipeline progress; implementations must not block
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Discards all events
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Logs events at debug level, failures at warn
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match &event.outcome {
            Outcome::Failed(kind) => warn!("{:?} unit {:?} failed: {}", event.stage, event.unit_id, kind),
            outcome => debug!("{:?} unit {:?}: {:?}", event.stage, event.unit_id, outcome),
        }
    }
}

impl EventSink for mpsc::UnboundedSender<PipelineEvent> {
    fn emit(&self, event: PipelineEvent) {
        // A dropped receiver just means nobody is listening
        let _ = self.send(event);
    }
}

/// Cooperative cancellation shared between a caller and a running pipeline
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
