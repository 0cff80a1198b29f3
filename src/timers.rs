// =============================================================================
// Timer Wheel — id-keyed single-shot and periodic timers
// =============================================================================
//
// Each armed timer is a spawned task that sleeps and then delivers its
// payload into the owner's mailbox. The registry is keyed by an opaque
// string id:
//
//   - Arming an id that is already armed returns the existing ref; no
//     duplicate timer is created.
//   - Cancel is idempotent and guarantees no fire after it returns: firing
//     and cancellation race on the same registry lock, and a fire that lost
//     the race is suppressed by its generation.
//   - Firing a single-shot timer removes the id before delivery.
//
// Owners that re-arm ids should compare `TimerFired::generation` against the
// ref they hold to ignore a stale fire already in their mailbox.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::now_ms;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Handle describing an armed timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRef {
    pub id: String,
    pub generation: u64,
    pub armed_at_ms: i64,
    pub deadline_ms: i64,
    pub periodic: bool,
}

/// Message delivered to the owner when a timer fires.
#[derive(Debug, Clone)]
pub struct TimerFired<P> {
    pub id: String,
    pub generation: u64,
    pub payload: P,
}

struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
    timer_ref: TimerRef,
}

/// Id-keyed timer registry delivering fires into a single owner mailbox.
pub struct TimerWheel<P: Clone + Send + 'static> {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    generations: AtomicU64,
    tx: mpsc::Sender<TimerFired<P>>,
}

impl<P: Clone + Send + 'static> TimerWheel<P> {
    /// Create a wheel that delivers fires to `tx` (the owner's mailbox).
    pub fn new(tx: mpsc::Sender<TimerFired<P>>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(1),
            tx,
        }
    }

    /// Arm a single-shot timer. If `id` is already armed the existing ref is
    /// returned and no new timer is created.
    pub fn arm(&self, id: &str, after_ms: u64, payload: P) -> TimerRef {
        self.arm_inner(id, after_ms, payload, false)
    }

    /// Arm a periodic timer firing every `every_ms` until cancelled. Arming
    /// an already-armed id returns the existing ref.
    pub fn arm_periodic(&self, id: &str, every_ms: u64, payload: P) -> TimerRef {
        self.arm_inner(id, every_ms, payload, true)
    }

    fn arm_inner(&self, id: &str, after_ms: u64, payload: P, periodic: bool) -> TimerRef {
        let mut entries = self.entries.lock();

        if let Some(existing) = entries.get(id) {
            debug!(id, "timer already armed — returning existing ref");
            return existing.timer_ref.clone();
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let timer_ref = TimerRef {
            id: id.to_string(),
            generation,
            armed_at_ms: now_ms(),
            deadline_ms: now_ms() + after_ms as i64,
            periodic,
        };

        let registry = Arc::clone(&self.entries);
        let tx = self.tx.clone();
        let task_id = id.to_string();

        let handle = tokio::spawn(async move {
            if periodic {
                let mut ticker =
                    tokio::time::interval(tokio::time::Duration::from_millis(after_ms.max(1)));
                // The first interval tick completes immediately; skip it so the
                // first fire lands one period from now.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    // Fire only while still registered with our generation.
                    let live = registry
                        .lock()
                        .get(&task_id)
                        .is_some_and(|e| e.generation == generation);
                    if !live {
                        return;
                    }
                    let fired = TimerFired {
                        id: task_id.clone(),
                        generation,
                        payload: payload.clone(),
                    };
                    if tx.send(fired).await.is_err() {
                        warn!(id = %task_id, "timer owner mailbox closed — stopping periodic timer");
                        registry.lock().remove(&task_id);
                        return;
                    }
                }
            } else {
                tokio::time::sleep(tokio::time::Duration::from_millis(after_ms)).await;
                // Deregister before delivery; a concurrent cancel that removed
                // the entry first wins and suppresses the fire.
                let still_armed = {
                    let mut map = registry.lock();
                    match map.get(&task_id) {
                        Some(e) if e.generation == generation => {
                            map.remove(&task_id);
                            true
                        }
                        _ => false,
                    }
                };
                if !still_armed {
                    return;
                }
                let fired = TimerFired {
                    id: task_id.clone(),
                    generation,
                    payload,
                };
                if tx.send(fired).await.is_err() {
                    warn!(id = %task_id, "timer owner mailbox closed — fire dropped");
                }
            }
        });

        entries.insert(
            id.to_string(),
            Entry {
                generation,
                handle,
                timer_ref: timer_ref.clone(),
            },
        );

        debug!(id, after_ms, periodic, "timer armed");
        timer_ref
    }

    /// Cancel a timer. Unknown ids are a no-op. After this returns, the
    /// timer's fire is guaranteed not to be *sent* (a fire already queued in
    /// the owner's mailbox must be filtered by generation).
    pub fn cancel(&self, id: &str) {
        let removed = self.entries.lock().remove(id);
        if let Some(entry) = removed {
            entry.handle.abort();
            debug!(id, "timer cancelled");
        }
    }

    /// True if `id` currently has an armed timer.
    pub fn is_armed(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    /// Number of currently armed timers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cancel every armed timer (shutdown path).
    pub fn cancel_all(&self) {
        let mut map = self.entries.lock();
        for (_, entry) in map.drain() {
            entry.handle.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_shot_fires_and_deregisters() {
        let (tx, mut rx) = mpsc::channel(8);
        let wheel: TimerWheel<&'static str> = TimerWheel::new(tx);

        wheel.arm("t1", 10, "payload");
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.id, "t1");
        assert_eq!(fired.payload, "payload");
        assert!(!wheel.is_armed("t1"));
    }

    #[tokio::test]
    async fn arm_is_idempotent_while_armed() {
        let (tx, _rx) = mpsc::channel(8);
        let wheel: TimerWheel<u32> = TimerWheel::new(tx);

        let first = wheel.arm("t1", 60_000, 1);
        let second = wheel.arm("t1", 5, 2);
        assert_eq!(first, second);
        assert_eq!(wheel.len(), 1);
    }

    #[tokio::test]
    async fn cancel_suppresses_fire() {
        let (tx, mut rx) = mpsc::channel(8);
        let wheel: TimerWheel<u32> = TimerWheel::new(tx);

        wheel.arm("t1", 20, 1);
        wheel.cancel("t1");
        // Cancel again: idempotent.
        wheel.cancel("t1");

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(wheel.is_empty());
    }

    #[tokio::test]
    async fn rearm_after_fire_gets_new_generation() {
        let (tx, mut rx) = mpsc::channel(8);
        let wheel: TimerWheel<u32> = TimerWheel::new(tx);

        let first = wheel.arm("t1", 5, 1);
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.generation, first.generation);

        let second = wheel.arm("t1", 5, 2);
        assert!(second.generation > first.generation);
        let fired2 = rx.recv().await.unwrap();
        assert_eq!(fired2.generation, second.generation);
        assert_eq!(fired2.payload, 2);
    }

    #[tokio::test]
    async fn periodic_fires_until_cancelled() {
        let (tx, mut rx) = mpsc::channel(32);
        let wheel: TimerWheel<&'static str> = TimerWheel::new(tx);

        wheel.arm_periodic("tick", 10, "tick");
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.id, "tick");
        assert_eq!(a.generation, b.generation);
        assert!(wheel.is_armed("tick"));

        wheel.cancel("tick");
        assert!(!wheel.is_armed("tick"));
    }
}
