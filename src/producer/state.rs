// =============================================================================
// Producer state — interrupts, stack, active content, persisted snapshot
// =============================================================================
//
// The interrupt stack is kept sorted by priority descending, ties broken by
// started_at ascending (older first). Active content is always derived,
// never authoritative: the stack head when non-empty, else the ticker slot.
//
// The persisted snapshot carries everything except live timers; restore
// re-arms timers from each interrupt's remaining duration.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::ProducerError;
use crate::types::Show;

// ---------------------------------------------------------------------------
// Interrupt kinds
// ---------------------------------------------------------------------------

/// Interrupt type. Known kinds carry their default priority and duration;
/// anything else falls into `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InterruptKind {
    Alert,
    SubTrain,
    ManualOverride,
    Custom(String),
}

impl From<String> for InterruptKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "alert" => Self::Alert,
            "sub_train" => Self::SubTrain,
            "manual_override" => Self::ManualOverride,
            _ => Self::Custom(s),
        }
    }
}

impl From<InterruptKind> for String {
    fn from(kind: InterruptKind) -> Self {
        kind.to_string()
    }
}

impl std::fmt::Display for InterruptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alert => write!(f, "alert"),
            Self::SubTrain => write!(f, "sub_train"),
            Self::ManualOverride => write!(f, "manual_override"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

impl InterruptKind {
    pub fn default_priority(&self) -> u8 {
        match self {
            Self::Alert | Self::ManualOverride => 100,
            Self::SubTrain => 50,
            Self::Custom(_) => 10,
        }
    }

    pub fn default_duration_ms(&self) -> u64 {
        match self {
            Self::Alert => 10_000,
            Self::SubTrain => 300_000,
            Self::ManualOverride => 30_000,
            Self::Custom(_) => 15_000,
        }
    }
}

/// New interrupt id: 8 random bytes, lowercase hex.
pub fn new_interrupt_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    hex::encode(&uuid.as_bytes()[..8])
}

// ---------------------------------------------------------------------------
// Interrupt and stack
// ---------------------------------------------------------------------------

/// A time-bounded, priority-tagged item that preempts the ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: String,
    pub kind: InterruptKind,
    pub priority: u8,
    pub data: serde_json::Value,
    pub duration_ms: u64,
    pub started_at_ms: i64,
}

impl Interrupt {
    /// Wall-clock instant this interrupt expires.
    pub fn expires_at_ms(&self) -> i64 {
        self.started_at_ms + self.duration_ms as i64
    }
}

/// Priority-ordered interrupt stack with overflow truncation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterruptStack {
    items: Vec<Interrupt>,
}

impl InterruptStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn sort(&mut self) {
        self.items
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.started_at_ms.cmp(&b.started_at_ms)));
    }

    /// Insert maintaining priority order. When the stack exceeds `max_size`,
    /// only the top `keep_count` by priority survive; the dropped interrupts
    /// are returned so the caller can cancel their timers.
    pub fn insert(&mut self, interrupt: Interrupt, max_size: usize, keep_count: usize) -> Vec<Interrupt> {
        self.items.push(interrupt);
        self.sort();
        if self.items.len() > max_size {
            let dropped = self.items.split_off(keep_count);
            warn!(
                dropped = dropped.len(),
                kept = self.items.len(),
                "interrupt stack overflow — truncated to top priorities"
            );
            dropped
        } else {
            Vec::new()
        }
    }

    /// Truncate to the top `keep_count` (periodic cleanup). Returns dropped.
    pub fn truncate_to(&mut self, keep_count: usize) -> Vec<Interrupt> {
        if self.items.len() <= keep_count {
            return Vec::new();
        }
        self.items.split_off(keep_count)
    }

    pub fn remove(&mut self, id: &str) -> Option<Interrupt> {
        let pos = self.items.iter().position(|i| i.id == id)?;
        Some(self.items.remove(pos))
    }

    /// Highest-priority interrupt (ties: oldest).
    pub fn head(&self) -> Option<&Interrupt> {
        self.items.first()
    }

    pub fn find_kind_mut(&mut self, kind: &InterruptKind) -> Option<&mut Interrupt> {
        self.items.iter_mut().find(|i| i.kind == *kind)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|i| i.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interrupt> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ids of the oldest interrupts by `started_at` (timer-limit enforcement).
    pub fn oldest_ids(&self, count: usize) -> Vec<String> {
        let mut by_age: Vec<&Interrupt> = self.items.iter().collect();
        by_age.sort_by_key(|i| i.started_at_ms);
        by_age.into_iter().take(count).map(|i| i.id.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Active content
// ---------------------------------------------------------------------------

/// The single content item the overlay is currently showing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub data: serde_json::Value,
    pub priority: u8,
    pub started_at_ms: i64,
}

impl ActiveContent {
    pub fn from_interrupt(interrupt: &Interrupt) -> Self {
        Self {
            content_type: interrupt.kind.to_string(),
            data: interrupt.data.clone(),
            priority: interrupt.priority,
            started_at_ms: interrupt.started_at_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted snapshot
// ---------------------------------------------------------------------------

/// Snapshot metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub last_updated_ms: i64,
    pub state_version: u64,
}

/// Everything the producer persists — all state except live timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSnapshot {
    pub current_show: Show,
    pub active_content: Option<ActiveContent>,
    pub interrupt_stack: InterruptStack,
    pub ticker_rotation: Vec<String>,
    pub ticker_index: usize,
    pub version: u64,
    pub metadata: SnapshotMetadata,
}

impl ProducerSnapshot {
    /// Write atomically (tmp + rename) to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise producer snapshot")?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;
        Ok(())
    }

    /// Load and validate a snapshot. `Ok(None)` when no file exists;
    /// `Err(StateCorrupt)` when a file exists but cannot be trusted.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>, ProducerError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ProducerError::StateCorrupt {
                    reason: format!("unreadable snapshot: {e}"),
                })
            }
        };

        let raw: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| ProducerError::StateCorrupt {
                reason: format!("invalid JSON: {e}"),
            })?;

        // A restorable snapshot must carry at least the show and version.
        if raw.get("current_show").is_none() || raw.get("version").is_none() {
            return Err(ProducerError::StateCorrupt {
                reason: "missing current_show or version".to_string(),
            });
        }

        let snapshot: Self =
            serde_json::from_value(raw).map_err(|e| ProducerError::StateCorrupt {
                reason: format!("schema mismatch: {e}"),
            })?;

        info!(
            path = %path.display(),
            version = snapshot.version,
            interrupts = snapshot.interrupt_stack.len(),
            "producer snapshot loaded"
        );
        Ok(Some(snapshot))
    }
}

/// Remaining lifetime for a restored interrupt.
///
/// Clock-went-backwards (`now < started_at`) restores the full duration and
/// logs; fully elapsed interrupts return `None` and are dropped.
pub fn remaining_duration_ms(interrupt: &Interrupt, now_ms: i64) -> Option<u64> {
    if now_ms < interrupt.started_at_ms {
        warn!(
            id = %interrupt.id,
            started_at_ms = interrupt.started_at_ms,
            now_ms,
            "clock went backwards — restoring full interrupt duration"
        );
        return Some(interrupt.duration_ms);
    }
    let elapsed = now_ms - interrupt.started_at_ms;
    let remaining = interrupt.duration_ms as i64 - elapsed;
    if remaining <= 0 {
        None
    } else {
        Some(remaining.max(1000) as u64)
    }
}

/// Fresh default data payload for a new sub-train.
pub fn sub_train_data(subscriber: &str, tier: &str) -> serde_json::Value {
    json!({
        "count": 1,
        "first_subscriber": subscriber,
        "latest_subscriber": subscriber,
        "latest_tier": tier,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn interrupt(id: &str, kind: InterruptKind, priority: u8, started_at: i64) -> Interrupt {
        Interrupt {
            id: id.to_string(),
            priority,
            duration_ms: kind.default_duration_ms(),
            kind,
            data: json!({}),
            started_at_ms: started_at,
        }
    }

    #[test]
    fn interrupt_ids_are_short_hex() {
        let id = new_interrupt_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(new_interrupt_id(), id);
    }

    #[test]
    fn kind_round_trips_through_serde_strings() {
        let kinds = [
            InterruptKind::Alert,
            InterruptKind::SubTrain,
            InterruptKind::ManualOverride,
            InterruptKind::Custom("raid_spotlight".into()),
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            let back: InterruptKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
        assert_eq!(
            serde_json::to_string(&InterruptKind::SubTrain).unwrap(),
            "\"sub_train\""
        );
    }

    #[test]
    fn defaults_match_kind_table() {
        assert_eq!(InterruptKind::Alert.default_priority(), 100);
        assert_eq!(InterruptKind::ManualOverride.default_priority(), 100);
        assert_eq!(InterruptKind::SubTrain.default_priority(), 50);
        assert_eq!(InterruptKind::Custom("x".into()).default_priority(), 10);

        assert_eq!(InterruptKind::Alert.default_duration_ms(), 10_000);
        assert_eq!(InterruptKind::SubTrain.default_duration_ms(), 300_000);
        assert_eq!(InterruptKind::ManualOverride.default_duration_ms(), 30_000);
        assert_eq!(InterruptKind::Custom("x".into()).default_duration_ms(), 15_000);
    }

    #[test]
    fn stack_orders_by_priority_then_age() {
        let mut stack = InterruptStack::new();
        stack.insert(interrupt("low", InterruptKind::Custom("c".into()), 10, 100), 50, 25);
        stack.insert(interrupt("alert_new", InterruptKind::Alert, 100, 300), 50, 25);
        stack.insert(interrupt("alert_old", InterruptKind::Alert, 100, 200), 50, 25);
        stack.insert(interrupt("train", InterruptKind::SubTrain, 50, 150), 50, 25);

        let order: Vec<&str> = stack.iter().map(|i| i.id.as_str()).collect();
        // Equal priority 100: older started_at wins the head.
        assert_eq!(order, vec!["alert_old", "alert_new", "train", "low"]);
        assert_eq!(stack.head().unwrap().id, "alert_old");
    }

    #[test]
    fn stack_overflow_keeps_top_priorities() {
        let mut stack = InterruptStack::new();
        let mut dropped_total = 0;
        for i in 0..6 {
            let dropped = stack.insert(
                interrupt(&format!("i{i}"), InterruptKind::Custom("c".into()), i as u8, i as i64),
                5,
                3,
            );
            dropped_total += dropped.len();
        }
        assert_eq!(stack.len(), 3);
        assert_eq!(dropped_total, 3);
        // Highest priorities survive.
        assert_eq!(stack.head().unwrap().id, "i5");
    }

    #[test]
    fn remaining_duration_handles_edges() {
        let mut i = interrupt("x", InterruptKind::Alert, 100, 10_000);
        i.duration_ms = 10_000;

        // Partially elapsed.
        assert_eq!(remaining_duration_ms(&i, 15_000), Some(5_000));
        // Nearly elapsed: floored at 1000.
        assert_eq!(remaining_duration_ms(&i, 19_900), Some(1_000));
        // Fully elapsed: dropped.
        assert_eq!(remaining_duration_ms(&i, 20_000), None);
        assert_eq!(remaining_duration_ms(&i, 99_999), None);
        // Clock went backwards: full duration.
        assert_eq!(remaining_duration_ms(&i, 5_000), Some(10_000));
    }

    #[test]
    fn snapshot_round_trips_and_validates() {
        let dir = std::env::temp_dir().join(format!("lumen-snap-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let mut stack = InterruptStack::new();
        stack.insert(interrupt("a", InterruptKind::Alert, 100, 1000), 50, 25);

        let snapshot = ProducerSnapshot {
            current_show: Show::Ironmon,
            active_content: Some(ActiveContent::from_interrupt(stack.head().unwrap())),
            interrupt_stack: stack,
            ticker_rotation: vec!["emote_stats".into()],
            ticker_index: 0,
            version: 42,
            metadata: SnapshotMetadata {
                last_updated_ms: 1000,
                state_version: 42,
            },
        };
        snapshot.save(&path).unwrap();

        let loaded = ProducerSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded.current_show, Show::Ironmon);
        assert_eq!(loaded.version, 42);
        assert_eq!(loaded.interrupt_stack.len(), 1);

        // Missing file is not an error.
        assert!(ProducerSnapshot::load(dir.join("absent.json")).unwrap().is_none());

        // Corrupt file is state_corrupt.
        std::fs::write(&path, "{\"version\": 1}").unwrap();
        assert!(matches!(
            ProducerSnapshot::load(&path),
            Err(ProducerError::StateCorrupt { .. })
        ));

        std::fs::remove_dir_all(&dir).ok();
    }
}
