//! Bounded FIFO queues connecting pipeline stages (spec §5).
//!
//! Write is non-blocking: on a full queue the item is dropped and a warning
//! logged — periodically, not per-drop, so a sustained backlog doesn't spam
//! the log. Read is non-blocking and returns [`ReadResult::Empty`] rather
//! than parking; callers sleep `poll_interval` and retry, the same
//! `try_send`/`try_recv` + sleep loop the teacher's `pipeline.rs` worker
//! uses for its completed-track channel, generalized to every arrow in the
//! dataflow graph.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// How often a sustained overflow is allowed to log, so a busy queue logs
/// once per window instead of once per dropped item.
const OVERFLOW_LOG_EVERY: u64 = 200;

pub enum ReadResult<T> {
    Item(T),
    Empty,
}

struct QueueState {
    name: String,
    dropped: AtomicU64,
}

/// The write half of a stage-to-stage queue.
#[derive(Clone)]
pub struct QueueWriter<T> {
    tx: flume::Sender<T>,
    state: Arc<QueueState>,
}

/// The read half of a stage-to-stage queue.
#[derive(Clone)]
pub struct QueueReader<T> {
    rx: flume::Receiver<T>,
    poll_interval: Duration,
}

/// Create a bounded queue of the given capacity, named for log messages.
pub fn bounded<T>(name: impl Into<String>, capacity: usize, poll_interval_ms: u64) -> (QueueWriter<T>, QueueReader<T>) {
    let (tx, rx) = flume::bounded(capacity);
    let state = Arc::new(QueueState { name: name.into(), dropped: AtomicU64::new(0) });
    (
        QueueWriter { tx, state },
        QueueReader { rx, poll_interval: Duration::from_millis(poll_interval_ms) },
    )
}

impl<T> QueueWriter<T> {
    /// Non-blocking write. On a full queue the item is dropped; returns
    /// `false` in that case so callers can count drops if they want to.
    pub fn try_write(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(_full_or_disconnected) => {
                let total = self.state.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total % OVERFLOW_LOG_EVERY == 1 {
                    warn!(queue = %self.state.name, total_dropped = total, "queue full, dropping write");
                }
                false
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl<T> QueueReader<T> {
    /// Non-blocking read: returns immediately with `Empty` if nothing is
    /// queued. Callers own the retry/sleep loop via [`QueueReader::poll_interval`].
    pub fn try_read(&self) -> ReadResult<T> {
        match self.rx.try_recv() {
            Ok(item) => ReadResult::Item(item),
            Err(_empty_or_disconnected) => ReadResult::Empty,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Async convenience: poll until an item arrives or `running` clears.
    pub async fn recv_or_sleep(&self, running: &tokio::sync::watch::Receiver<bool>) -> Option<T> {
        loop {
            match self.try_read() {
                ReadResult::Item(item) => return Some(item),
                ReadResult::Empty => {
                    if !*running.borrow() {
                        return None;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_on_full_queue() {
        let (w, r) = bounded::<u32>("test", 2, 10);
        assert!(w.try_write(1));
        assert!(w.try_write(2));
        assert!(!w.try_write(3)); // dropped — queue full
        assert_eq!(w.dropped_count(), 1);

        match r.try_read() {
            ReadResult::Item(v) => assert_eq!(v, 1),
            ReadResult::Empty => panic!("expected an item"),
        }
    }

    #[test]
    fn read_returns_empty_sentinel() {
        let (_w, r) = bounded::<u32>("test", 4, 10);
        match r.try_read() {
            ReadResult::Empty => {}
            ReadResult::Item(_) => panic!("expected empty"),
        }
    }

    /// Scenario S6 (spec §8): 200 writes into a size-64 queue whose consumer
    /// never drains — only the first 64 survive, a contiguous prefix.
    #[test]
    fn scenario_s6_queue_drop_prefix() {
        let (w, r) = bounded::<u32>("s6", 64, 10);
        let mut accepted = 0;
        for i in 0..200u32 {
            if w.try_write(i) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 64);
        assert_eq!(w.dropped_count(), 136);

        let mut observed = Vec::new();
        while let ReadResult::Item(v) = r.try_read() {
            observed.push(v);
        }
        assert_eq!(observed, (0..64).collect::<Vec<_>>());
    }
}
