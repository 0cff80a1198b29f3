// =============================================================================
// Aggregator data structures — emote counters, follower ring, daily stats
// =============================================================================
//
// All three live under the aggregator actor's exclusive ownership; mutation
// happens only on the actor task, so plain read-modify-write cannot lose
// updates.
//
// EmoteTable invariant: today <= all_time for every row. Daily reset zeroes
// `today` and preserves `all_time`.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Emote counters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmoteKind {
    Regular,
    Native,
}

impl std::fmt::Display for EmoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regular => write!(f, "regular"),
            Self::Native => write!(f, "native"),
        }
    }
}

/// Counter row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EmoteKey {
    pub name: String,
    pub kind: EmoteKind,
}

/// Pair-valued counter row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteCount {
    pub today: u64,
    pub all_time: u64,
}

/// One row of the top-N ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmoteStat {
    pub name: String,
    pub kind: EmoteKind,
    pub count: u64,
}

struct EmoteRow {
    count: EmoteCount,
    /// Insertion sequence, used to break eviction ties (later rows go first).
    seq: u64,
}

/// Bounded emote counter table.
pub struct EmoteTable {
    rows: HashMap<EmoteKey, EmoteRow>,
    next_seq: u64,
    max_entries: usize,
}

impl EmoteTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            rows: HashMap::new(),
            next_seq: 0,
            max_entries,
        }
    }

    /// Increment both counters for an emote, inserting `(1, 1)` on absence.
    pub fn increment(&mut self, name: &str, kind: EmoteKind) {
        let key = EmoteKey {
            name: name.to_string(),
            kind,
        };
        match self.rows.get_mut(&key) {
            Some(row) => {
                row.count.today += 1;
                row.count.all_time += 1;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.rows.insert(
                    key,
                    EmoteRow {
                        count: EmoteCount {
                            today: 1,
                            all_time: 1,
                        },
                        seq,
                    },
                );
                self.enforce_cap();
            }
        }
    }

    /// Direct row write (restore and test seeding).
    pub fn set(&mut self, name: &str, kind: EmoteKind, count: EmoteCount) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rows.insert(
            EmoteKey {
                name: name.to_string(),
                kind,
            },
            EmoteRow { count, seq },
        );
        self.enforce_cap();
    }

    /// Zero every `today` counter, preserving `all_time`.
    pub fn reset_today(&mut self) {
        for row in self.rows.values_mut() {
            row.count.today = 0;
        }
    }

    /// Drop the lowest `all_time` rows until the cap holds; ties drop the
    /// later-inserted row first.
    pub fn enforce_cap(&mut self) {
        if self.rows.len() <= self.max_entries {
            return;
        }
        let excess = self.rows.len() - self.max_entries;

        let mut victims: Vec<(EmoteKey, u64, u64)> = self
            .rows
            .iter()
            .map(|(k, r)| (k.clone(), r.count.all_time, r.seq))
            .collect();
        victims.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));

        for (key, _, _) in victims.into_iter().take(excess) {
            self.rows.remove(&key);
        }
        debug!(dropped = excess, remaining = self.rows.len(), "emote table cap enforced");
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, name: &str, kind: EmoteKind) -> Option<EmoteCount> {
        self.rows
            .get(&EmoteKey {
                name: name.to_string(),
                kind,
            })
            .map(|r| r.count)
    }

    /// All rows of one kind, keyed by emote name.
    pub fn by_kind(&self, kind: EmoteKind) -> HashMap<String, EmoteCount> {
        self.rows
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(k, r)| (k.name.clone(), r.count))
            .collect()
    }

    fn top_by<F>(&self, limit: usize, value: F) -> Vec<EmoteStat>
    where
        F: Fn(&EmoteCount) -> u64,
    {
        let mut stats: Vec<EmoteStat> = self
            .rows
            .iter()
            .map(|(k, r)| EmoteStat {
                name: k.name.clone(),
                kind: k.kind,
                count: value(&r.count),
            })
            .filter(|s| s.count > 0)
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then(a.name.cmp(&b.name)));
        stats.truncate(limit);
        stats
    }

    /// Top rows by today's count: count descending, ties alphabetical.
    pub fn top_today(&self, limit: usize) -> Vec<EmoteStat> {
        self.top_by(limit, |c| c.today)
    }

    /// Top rows by all-time count: count descending, ties alphabetical.
    pub fn top_all_time(&self, limit: usize) -> Vec<EmoteStat> {
        self.top_by(limit, |c| c.all_time)
    }

    /// Invariant check used by tests: today never exceeds all_time.
    #[cfg(test)]
    pub fn invariant_holds(&self) -> bool {
        self.rows
            .values()
            .all(|r| r.count.today <= r.count.all_time)
    }
}

// ---------------------------------------------------------------------------
// Follower ring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerEntry {
    pub timestamp_ms: i64,
    pub user_name: String,
}

/// Ordered-by-timestamp bounded set of recent followers.
pub struct FollowerRing {
    entries: VecDeque<FollowerEntry>,
    max_size: usize,
}

impl FollowerRing {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Insert keeping timestamp order; duplicate timestamps are permitted.
    /// Evicts the oldest entry when over the cap.
    pub fn insert(&mut self, entry: FollowerEntry) {
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.timestamp_ms <= entry.timestamp_ms)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.entries.insert(pos, entry);
        self.enforce_cap();
    }

    pub fn enforce_cap(&mut self) {
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }

    /// Most recent first, limited.
    pub fn recent(&self, limit: usize) -> Vec<FollowerEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest-first contents (tests).
    #[cfg(test)]
    pub fn oldest_first(&self) -> Vec<FollowerEntry> {
        self.entries.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Daily counters
// ---------------------------------------------------------------------------

/// Per-day running totals, reset at UTC midnight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DailyCounters {
    pub total_messages: u64,
    pub total_follows: u64,
    pub started_at_ms: i64,
}

impl DailyCounters {
    pub fn new(now_ms: i64) -> Self {
        Self {
            total_messages: 0,
            total_follows: 0,
            started_at_ms: now_ms,
        }
    }

    pub fn reset(&mut self, now_ms: i64) {
        *self = Self::new(now_ms);
    }
}
