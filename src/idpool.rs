// =============================================================================
// Correlation-ID Pool — pre-generated short ids with async refill
// =============================================================================
//
// Tagging every bus envelope with a fresh id is on the hot path, so ids are
// pre-generated into a bounded pool. `take` is O(1); when the pool drains to
// the low-water mark a background refill tops it back up, and an empty pool
// falls back to inline generation. Ids are for correlation tagging only and
// carry no security properties.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Pool capacity after a refill.
const POOL_CAPACITY: usize = 100;
/// Refill triggers once the pool drains to this size.
const LOW_WATER: usize = 20;
/// Length of a generated id in hex chars.
const ID_LEN: usize = 8;

struct PoolInner {
    ids: VecDeque<String>,
    /// Mirror of `ids` for O(1) duplicate checks during refill.
    live: HashSet<String>,
}

/// Bounded pool of pre-generated short correlation ids.
pub struct CorrelationIdPool {
    inner: Arc<Mutex<PoolInner>>,
    refilling: Arc<AtomicBool>,
}

impl CorrelationIdPool {
    /// Create a pool pre-filled to capacity.
    pub fn new() -> Self {
        let mut ids = VecDeque::with_capacity(POOL_CAPACITY);
        let mut live = HashSet::with_capacity(POOL_CAPACITY);
        while ids.len() < POOL_CAPACITY {
            let id = generate_short_id();
            if live.insert(id.clone()) {
                ids.push_back(id);
            }
        }
        Self {
            inner: Arc::new(Mutex::new(PoolInner { ids, live })),
            refilling: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Take one id in O(1). Falls back to inline generation when the pool is
    /// empty. Dropping to the low-water mark schedules an async refill.
    pub fn take(&self) -> String {
        let (id, remaining) = {
            let mut inner = self.inner.lock();
            match inner.ids.pop_front() {
                Some(id) => {
                    inner.live.remove(&id);
                    (id, inner.ids.len())
                }
                None => (generate_short_id(), 0),
            }
        };

        if remaining <= LOW_WATER {
            self.schedule_refill();
        }
        id
    }

    /// Current pool size (diagnostics).
    pub fn size(&self) -> usize {
        self.inner.lock().ids.len()
    }

    fn schedule_refill(&self) {
        // One refill in flight at a time.
        if self
            .refilling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let refilling = Arc::clone(&self.refilling);

        let refill = move || {
            let mut added = 0usize;
            loop {
                let id = generate_short_id();
                let mut pool = inner.lock();
                if pool.ids.len() >= POOL_CAPACITY {
                    break;
                }
                if pool.live.insert(id.clone()) {
                    pool.ids.push_back(id);
                    added += 1;
                }
            }
            refilling.store(false, Ordering::Release);
            debug!(added, "correlation id pool refilled");
        };

        // Outside a runtime (unit tests, early startup) refill inline.
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(async move { refill() });
        } else {
            refill();
        }
    }
}

impl Default for CorrelationIdPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate one short lowercase-hex id.
fn generate_short_id() -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(ID_LEN);
    s
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_full_of_unique_ids() {
        let pool = CorrelationIdPool::new();
        assert_eq!(pool.size(), POOL_CAPACITY);

        let inner = pool.inner.lock();
        assert_eq!(inner.live.len(), inner.ids.len());
        for id in &inner.ids {
            assert_eq!(id.len(), ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[tokio::test]
    async fn take_is_nonempty_even_when_drained() {
        let pool = CorrelationIdPool::new();
        let mut seen = HashSet::new();
        // Drain well past capacity; the inline fallback keeps producing.
        for _ in 0..(POOL_CAPACITY + 50) {
            let id = pool.take();
            assert_eq!(id.len(), ID_LEN);
            seen.insert(id);
        }
        assert!(seen.len() > POOL_CAPACITY);
    }

    #[tokio::test]
    async fn refill_restores_capacity() {
        let pool = CorrelationIdPool::new();
        for _ in 0..(POOL_CAPACITY - LOW_WATER) {
            pool.take();
        }
        assert!(pool.size() <= LOW_WATER);

        // Let the spawned refill run.
        for _ in 0..20 {
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
            if pool.size() == POOL_CAPACITY {
                break;
            }
        }
        assert_eq!(pool.size(), POOL_CAPACITY);
    }
}
