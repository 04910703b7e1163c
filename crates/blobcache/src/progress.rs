//! Fire-and-forget progress notifications, one per finished sub-range.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Final state of one planned sub-range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeProgress {
    pub start: u64,
    pub end: u64,
    pub status: RangeStatus,
    /// Where the bytes came from: `cache`, `origin`, `peer` or `fallback-origin`
    pub source: &'static str,
}

/// Receives progress notifications. Implementations must not block.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: RangeProgress);
}

/// Logs every notification and nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressReporter;

impl ProgressReporter for TracingProgressReporter {
    fn report(&self, progress: RangeProgress) {
        debug!(
            start = progress.start,
            end = progress.end,
            status = ?progress.status,
            source = progress.source,
            "Range finished"
        );
    }
}

/// Forwards notifications over a bounded channel, logging locally when the
/// channel is full.
#[derive(Debug, Clone)]
pub struct ChannelProgressReporter {
    tx: mpsc::Sender<RangeProgress>,
}

impl ChannelProgressReporter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RangeProgress>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn report(&self, progress: RangeProgress) {
        match self.tx.try_send(progress) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(progress)) => {
                warn!(
                    start = progress.start,
                    end = progress.end,
                    status = ?progress.status,
                    source = progress.source,
                    "Progress channel full, range finished"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Progress receiver dropped");
            }
        }
    }
}
