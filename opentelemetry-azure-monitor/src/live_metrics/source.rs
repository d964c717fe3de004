use super::model::{LiveMetric, LiveMetricDocument};
use crate::Envelope;
use opentelemetry::otel_warn;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum number of envelopes held between two posts.
pub(crate) const DOCUMENT_QUEUE_CAPACITY: usize = 1000;

/// Supplies the metric values published on every live metrics post.
///
/// Called from the post loop thread once per interval, so implementations
/// should return quickly.
pub trait MetricsSnapshotSource: Debug + Send + Sync {
    /// Current values of all live metrics.
    fn collect(&self) -> Vec<LiveMetric>;
}

/// Envelopes waiting to be shown in the live stream.
///
/// Accepts items only while a viewer is attached; anything pushed while the
/// manager is probing is ignored, and switching back to probing clears it.
/// Once full, new items are dropped.
#[derive(Clone, Debug, Default)]
pub struct DocumentQueue {
    inner: Arc<DocumentQueueInner>,
}

#[derive(Debug, Default)]
struct DocumentQueueInner {
    /// Only written while `items` is locked.
    collecting: AtomicBool,
    items: Mutex<VecDeque<Envelope>>,
}

impl DocumentQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Offer an envelope. Returns `true` if it was queued.
    pub fn push(&self, envelope: Envelope) -> bool {
        if !self.is_collecting() {
            return false;
        }
        let mut items = self
            .inner
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // collection may have stopped while waiting for the lock
        if !self.is_collecting() || items.len() >= DOCUMENT_QUEUE_CAPACITY {
            return false;
        }
        items.push_back(envelope);
        true
    }

    /// Whether envelopes are currently accepted.
    pub fn is_collecting(&self) -> bool {
        self.inner.collecting.load(Ordering::Acquire)
    }

    pub(crate) fn set_collecting(&self, collecting: bool) {
        let mut items = self
            .inner
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.inner.collecting.store(collecting, Ordering::Release);
        if !collecting {
            items.clear();
        }
    }

    /// Take every queued envelope and turn it into a live document.
    pub(crate) fn drain(&self) -> Vec<LiveMetricDocument> {
        let items: Vec<Envelope> = self
            .inner
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();

        items
            .iter()
            .filter_map(|envelope| {
                let document = LiveMetricDocument::from_envelope(envelope);
                if document.is_none() {
                    otel_warn!(
                        name: "LiveMetrics.DocumentSkipped",
                        message = "Envelope has no known base type.",
                        envelope = envelope.name.clone()
                    );
                }
                document
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
