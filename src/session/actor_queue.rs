//! Session Actor Queue (§4.1): serializes operations per session key while
//! letting distinct keys run fully in parallel.
//!
//! Implemented as one [`tokio::sync::Mutex`] per actor key rather than the
//! literal tail-future chain the contract describes: a `tokio::sync::Mutex`
//! already grants its waiters the lock in FIFO enqueue order and never
//! poisons on a panicking holder, which is exactly P1's two guarantees
//! ("FIFO per key" and "failures do not poison the lane"). A small pending
//! counter sits alongside each lane for exact backpressure reporting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::instrument;

/// One serialization lane for a single actor key.
struct Lane {
    mutex: Mutex<()>,
    pending: AtomicUsize,
}

/// Serializes async operations keyed by an arbitrary string (typically a
/// normalized session key).
#[derive(Default)]
pub struct ActorQueue {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

impl ActorQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    async fn lane_for(&self, actor_key: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(actor_key.to_owned())
            .or_insert_with(|| {
                Arc::new(Lane {
                    mutex: Mutex::new(()),
                    pending: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Run `operation` under the lane for `actor_key`. Operations submitted
    /// under the same key execute strictly in enqueue order with no
    /// overlap; operations under distinct keys run concurrently.
    #[instrument(skip(self, operation))]
    pub async fn run<F, Fut, T>(&self, actor_key: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lane = self.lane_for(actor_key).await;
        lane.pending.fetch_add(1, Ordering::SeqCst);
        let _guard = lane.mutex.lock().await;
        let result = operation().await;
        lane.pending.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Number of operations currently enqueued or executing for a key
    /// (exposed for observability / backpressure reporting).
    pub async fn pending_count(&self, actor_key: &str) -> usize {
        let lanes = self.lanes.lock().await;
        lanes
            .get(actor_key)
            .map_or(0, |lane| lane.pending.load(Ordering::SeqCst))
    }

    /// Total pending count across every known lane.
    pub async fn total_pending(&self) -> usize {
        let lanes = self.lanes.lock().await;
        lanes
            .values()
            .map(|lane| lane.pending.load(Ordering::SeqCst))
            .sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_operations_serialize() {
        let queue = Arc::new(ActorQueue::new());
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let queue = Arc::clone(&queue);
            let max_in_flight = Arc::clone(&max_in_flight);
            let in_flight = Arc::clone(&in_flight);
            handles.push(tokio::spawn(async move {
                queue
                    .run("agent:codex:acp:s1", || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let queue = Arc::new(ActorQueue::new());
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in ["agent:codex:acp:a", "agent:codex:acp:b"] {
            let queue = Arc::clone(&queue);
            let max_in_flight = Arc::clone(&max_in_flight);
            let in_flight = Arc::clone(&in_flight);
            handles.push(tokio::spawn(async move {
                queue
                    .run(key, || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_in_flight.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_panicking_operation_does_not_poison_the_lane() {
        let queue = Arc::new(ActorQueue::new());
        let counter = Arc::new(AtomicU32::new(0));

        let q = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            q.run("agent:codex:acp:s1", || async {
                panic!("boom");
            })
            .await;
        });
        let _ = handle.await;

        let c = Arc::clone(&counter);
        queue
            .run("agent:codex:acp:s1", || async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
