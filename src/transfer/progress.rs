//! Aggregate progress for a transfer task.
//!
//! Parts report their own byte counts; the tracker keeps a high-water mark
//! per part so a retried part is never counted twice, and only ever
//! publishes a cumulative value that is larger than the last one.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;

/// A snapshot of transfer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Bytes transferred so far, including parts reused from an earlier session.
    pub bytes_transferred: u64,
    /// Total bytes the transfer will move.
    pub total_bytes: u64,
}

impl Progress {
    /// Whether every byte has been transferred.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.total_bytes
    }

    /// Completion ratio in `[0.0, 1.0]`; an empty transfer counts as complete.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_transferred as f64 / self.total_bytes as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    baseline: u64,
    per_part: HashMap<u32, u64>,
    cumulative: u64,
    published: u64,
    announced: bool,
}

/// Monotonic progress aggregator shared by all parts of one task.
#[derive(Debug)]
pub struct ProgressTracker {
    counters: Mutex<Counters>,
    watch_tx: watch::Sender<Progress>,
    listener: Option<UnboundedSender<Progress>>,
}

impl ProgressTracker {
    /// Creates a tracker that also forwards every update to `listener`.
    #[must_use]
    pub fn new(listener: Option<UnboundedSender<Progress>>) -> Self {
        let (watch_tx, _) = watch::channel(Progress::default());
        Self {
            counters: Mutex::new(Counters::default()),
            watch_tx,
            listener,
        }
    }

    /// New receiver observing the latest snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.watch_tx.subscribe()
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Progress {
        *self.watch_tx.borrow()
    }

    /// Starts a (re)planned run of `total` bytes of which `already_done` need no transfer.
    ///
    /// Part marks from a previous run are discarded; the published value
    /// never goes backwards even if fewer bytes are reused this time.
    pub fn begin(&self, total: u64, already_done: u64) {
        let mut counters = self.lock();
        counters.total = total;
        counters.baseline = already_done.min(total);
        counters.per_part.clear();
        counters.cumulative = counters.baseline;
        counters.published = counters.published.min(total);
        let value = counters.cumulative.max(counters.published);
        if value == total && counters.announced {
            return;
        }
        counters.published = value;
        counters.announced = value == total;
        drop(counters);
        self.publish(Progress {
            bytes_transferred: value,
            total_bytes: total,
        });
    }

    /// Records that part `index` has moved `bytes` bytes in its current attempt.
    pub fn record(&self, index: u32, bytes: u64) {
        let mut counters = self.lock();
        let mark = counters.per_part.entry(index).or_insert(0);
        if bytes <= *mark {
            return;
        }
        let delta = bytes - *mark;
        *mark = bytes;
        counters.cumulative = counters.cumulative.saturating_add(delta);

        let value = counters.cumulative.min(counters.total);
        if value <= counters.published || counters.announced {
            return;
        }
        counters.published = value;
        counters.announced = value == counters.total;
        let total = counters.total;
        drop(counters);
        self.publish(Progress {
            bytes_transferred: value,
            total_bytes: total,
        });
    }

    /// Publishes `(total, total)` unless it was already published.
    pub fn complete(&self) {
        let mut counters = self.lock();
        if counters.announced {
            return;
        }
        counters.announced = true;
        counters.published = counters.total;
        let total = counters.total;
        drop(counters);
        self.publish(Progress {
            bytes_transferred: total,
            total_bytes: total,
        });
    }

    fn publish(&self, progress: Progress) {
        self.watch_tx.send_replace(progress);
        if let Some(listener) = &self.listener {
            // A dropped receiver only means nobody is listening any more.
            let _ = listener.send(progress);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
