// =============================================================================
// Runtime Configuration — engine tunables with atomic save
// =============================================================================
//
// Central configuration hub for the Lumen control plane. Every tunable lives
// here so the engine can be reconfigured without code changes.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
//
// Daily rollover note: all calendar-based resets (aggregator daily stats)
// fire at UTC midnight, matching the timestamps used on the wire.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Show;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_ticker_interval_ms() -> u64 {
    15_000
}

fn default_sub_train_duration_ms() -> u64 {
    300_000
}

fn default_cleanup_interval_ms() -> u64 {
    600_000
}

fn default_max_timers() -> usize {
    100
}

fn default_max_interrupt_stack_size() -> usize {
    50
}

fn default_interrupt_stack_keep_count() -> usize {
    25
}

fn default_max_followers() -> usize {
    100
}

fn default_max_emote_entries() -> usize {
    1000
}

fn default_correlation_delay_min_ms() -> i64 {
    3000
}

fn default_correlation_delay_max_ms() -> i64 {
    7000
}

fn default_transcription_window_ms() -> i64 {
    30_000
}

fn default_chat_window_ms() -> i64 {
    30_000
}

fn default_fingerprint_retention_ms() -> i64 {
    300_000
}

fn default_buffer_max_size() -> usize {
    100
}

fn default_max_active_correlations() -> usize {
    50
}

fn default_refresh_buffer_ms() -> u64 {
    300_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_mailbox_capacity() -> usize {
    256
}

fn default_producer_state_path() -> String {
    "producer_state.json".to_string()
}

fn default_token_store_path() -> String {
    "oauth_tokens.json".to_string()
}

fn default_show_categories() -> HashMap<String, Show> {
    // Twitch category ids: IronMON runs under the Pokémon FireRed/LeafGreen
    // category; coding streams under Software and Game Development.
    let mut map = HashMap::new();
    map.insert("490100".to_string(), Show::Ironmon);
    map.insert("1469308723".to_string(), Show::Coding);
    map.insert("509658".to_string(), Show::Variety);
    map
}

// =============================================================================
// Sections
// =============================================================================

/// Producer (priority state machine) tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Milliseconds between ticker rotation advances.
    #[serde(default = "default_ticker_interval_ms")]
    pub ticker_interval_ms: u64,

    /// Lifetime of a sub-train interrupt; re-armed on every coalesced sub.
    #[serde(default = "default_sub_train_duration_ms")]
    pub sub_train_duration_ms: u64,

    /// Milliseconds between periodic cleanup sweeps.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Hard cap on concurrently armed interrupt timers.
    #[serde(default = "default_max_timers")]
    pub max_timers: usize,

    /// Hard cap on interrupt stack length.
    #[serde(default = "default_max_interrupt_stack_size")]
    pub max_interrupt_stack_size: usize,

    /// How many interrupts survive an overflow truncation.
    #[serde(default = "default_interrupt_stack_keep_count")]
    pub interrupt_stack_keep_count: usize,

    /// Durable path for the minimal producer snapshot.
    #[serde(default = "default_producer_state_path")]
    pub state_path: String,

    /// Category-id → show mapping checked before the substring fallback.
    #[serde(default = "default_show_categories")]
    pub show_categories: HashMap<String, Show>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            ticker_interval_ms: default_ticker_interval_ms(),
            sub_train_duration_ms: default_sub_train_duration_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            max_timers: default_max_timers(),
            max_interrupt_stack_size: default_max_interrupt_stack_size(),
            interrupt_stack_keep_count: default_interrupt_stack_keep_count(),
            state_path: default_producer_state_path(),
            show_categories: default_show_categories(),
        }
    }
}

/// Aggregator (stats) tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Maximum entries retained in the follower ring.
    #[serde(default = "default_max_followers")]
    pub max_followers: usize,

    /// Maximum distinct emote counter rows before eviction.
    #[serde(default = "default_max_emote_entries")]
    pub max_emote_entries: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_followers: default_max_followers(),
            max_emote_entries: default_max_emote_entries(),
        }
    }
}

/// Correlation engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// Lower bound of the speech→chat lookback window.
    #[serde(default = "default_correlation_delay_min_ms")]
    pub delay_min_ms: i64,

    /// Upper bound of the speech→chat lookback window.
    #[serde(default = "default_correlation_delay_max_ms")]
    pub delay_max_ms: i64,

    /// Age cap for the transcription sliding buffer.
    #[serde(default = "default_transcription_window_ms")]
    pub transcription_window_ms: i64,

    /// Age cap for the chat sliding buffer.
    #[serde(default = "default_chat_window_ms")]
    pub chat_window_ms: i64,

    /// How long a fingerprint suppresses duplicate correlations.
    #[serde(default = "default_fingerprint_retention_ms")]
    pub fingerprint_retention_ms: i64,

    /// Size cap for both sliding buffers.
    #[serde(default = "default_buffer_max_size")]
    pub buffer_max_size: usize,

    /// Cap on retained recent correlations.
    #[serde(default = "default_max_active_correlations")]
    pub max_active_correlations: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            delay_min_ms: default_correlation_delay_min_ms(),
            delay_max_ms: default_correlation_delay_max_ms(),
            transcription_window_ms: default_transcription_window_ms(),
            chat_window_ms: default_chat_window_ms(),
            fingerprint_retention_ms: default_fingerprint_retention_ms(),
            buffer_max_size: default_buffer_max_size(),
            max_active_correlations: default_max_active_correlations(),
        }
    }
}

/// OAuth token lifecycle tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Refresh is attempted once `now + refresh_buffer_ms >= expires_at`.
    #[serde(default = "default_refresh_buffer_ms")]
    pub refresh_buffer_ms: u64,

    /// Primary token store path (a `.bak` recovery copy sits next to it).
    #[serde(default = "default_token_store_path")]
    pub token_store_path: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_ms: default_refresh_buffer_ms(),
            token_store_path: default_token_store_path(),
        }
    }
}

/// Circuit breaker tunables, applied per service name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Milliseconds an open breaker waits before admitting a probe.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// Retry executor defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_factor")]
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            factor: default_retry_factor(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Lumen control plane.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialise correctly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub producer: ProducerConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub oauth: OAuthConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-subscriber bus mailbox capacity. Messages beyond this are dropped
    /// (and logged) rather than stalling the publisher.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            ticker_interval_ms = config.producer.ticker_interval_ms,
            max_followers = config.aggregator.max_followers,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.producer.ticker_interval_ms, 15_000);
        assert_eq!(cfg.producer.sub_train_duration_ms, 300_000);
        assert_eq!(cfg.producer.cleanup_interval_ms, 600_000);
        assert_eq!(cfg.producer.max_timers, 100);
        assert_eq!(cfg.producer.max_interrupt_stack_size, 50);
        assert_eq!(cfg.producer.interrupt_stack_keep_count, 25);
        assert_eq!(cfg.aggregator.max_followers, 100);
        assert_eq!(cfg.aggregator.max_emote_entries, 1000);
        assert_eq!(cfg.correlation.delay_min_ms, 3000);
        assert_eq!(cfg.correlation.delay_max_ms, 7000);
        assert_eq!(cfg.correlation.fingerprint_retention_ms, 300_000);
        assert_eq!(cfg.oauth.refresh_buffer_ms, 300_000);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.cooldown_ms, 30_000);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!((cfg.retry.factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.producer.ticker_interval_ms, 15_000);
        assert_eq!(cfg.correlation.transcription_window_ms, 30_000);
        assert_eq!(cfg.mailbox_capacity, 256);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "producer": { "ticker_interval_ms": 5000 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.producer.ticker_interval_ms, 5000);
        assert_eq!(cfg.producer.max_timers, 100);
        assert_eq!(cfg.aggregator.max_followers, 100);
    }

    #[test]
    fn category_map_round_trips_shows() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.producer.show_categories.get("490100"), Some(&Show::Ironmon));
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            cfg2.producer.show_categories.get("509658"),
            Some(&Show::Variety)
        );
    }
}
