// =============================================================================
// Correlation Engine — speech↔chat matching actor
// =============================================================================
//
// Consumes `transcription:live` and `events` (chat). Holds two sliding
// buffers (30 s window, 100 items); every chat arrival is scored against the
// transcriptions spoken 3–7 s earlier. Winning candidates above the 0.4
// confidence floor are deduplicated by fingerprint
// (`transcription:chat:pattern`, 5 min retention), published on
// `correlation:insights`, and written to the correlation store off the hot
// path (retry + circuit breaker).
//
// Session lifecycle: `stream.started` opens a store session and resets the
// buffers; `stream.stopped` closes it. A failed session start degrades to
// session-less correlations rather than stopping the engine.
// =============================================================================

pub mod scoring;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{Envelope, EventBus};
use crate::config::CorrelationConfig;
use crate::idpool::CorrelationIdPool;
use crate::resilience::{default_retryable, retry, BreakerRegistry, RetryOptions};
use crate::service::{ServiceHealth, ServiceStatus};
use crate::stores::CorrelationStore;
use crate::types::{kinds, now_ms, topics, ChatMessage, TranscriptionSnippet};
use crate::window::{SlidingBuffer, Timestamped};

pub use scoring::{score_correlation, CorrelationPattern};

/// Breaker service name for correlation store calls.
const STORE_SERVICE: &str = "correlation_store";

impl Timestamped for ChatMessage {
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

impl Timestamped for TranscriptionSnippet {
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

// ---------------------------------------------------------------------------
// Correlation record
// ---------------------------------------------------------------------------

/// A matched speech→chat pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub id: String,
    pub transcription_id: String,
    pub transcription_text: String,
    pub chat_message_id: String,
    pub chat_user: String,
    pub chat_text: String,
    pub pattern: CorrelationPattern,
    pub confidence: f64,
    pub time_offset_ms: i64,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Correlation {
    /// Deduplication fingerprint.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.transcription_id, &self.chat_message_id, self.pattern)
    }

    /// Compact human-readable form published next to the structured record.
    pub fn formatted(&self) -> String {
        format!(
            "[{}] {:.0}% \"{}\" → {}: \"{}\" (+{}ms)",
            self.pattern,
            self.confidence * 100.0,
            self.transcription_text,
            self.chat_user,
            self.chat_text,
            self.time_offset_ms
        )
    }
}

fn fingerprint_of(transcription_id: &str, chat_message_id: &str, pattern: CorrelationPattern) -> String {
    format!("{transcription_id}:{chat_message_id}:{pattern}")
}

// ---------------------------------------------------------------------------
// Core (synchronous, actor-owned)
// ---------------------------------------------------------------------------

/// Minimum confidence for a correlation to be emitted.
const CONFIDENCE_FLOOR: f64 = 0.4;
/// Offset the tie-break centers on.
const IDEAL_OFFSET_MS: i64 = 5000;

struct CorrelatorCore {
    config: CorrelationConfig,
    transcriptions: SlidingBuffer<TranscriptionSnippet>,
    chat: SlidingBuffer<ChatMessage>,
    /// fingerprint → first-seen wall clock.
    fingerprints: HashMap<String, i64>,
    active: VecDeque<Correlation>,
    session_id: Option<String>,
    ids: Arc<CorrelationIdPool>,
    emitted: u64,
    deduped: u64,
}

impl CorrelatorCore {
    fn new(config: CorrelationConfig, ids: Arc<CorrelationIdPool>) -> Self {
        Self {
            transcriptions: SlidingBuffer::new(config.transcription_window_ms, config.buffer_max_size),
            chat: SlidingBuffer::new(config.chat_window_ms, config.buffer_max_size),
            fingerprints: HashMap::new(),
            active: VecDeque::new(),
            session_id: None,
            ids,
            emitted: 0,
            deduped: 0,
            config,
        }
    }

    fn handle_transcription(&mut self, snippet: TranscriptionSnippet) {
        self.transcriptions.add(snippet);
    }

    /// Score a chat message against the lookback window. Returns the winning
    /// correlation, if any survived the floor and dedup.
    fn handle_chat(&mut self, msg: ChatMessage, now: i64) -> Option<Correlation> {
        let lo = msg.timestamp_ms - self.config.delay_max_ms;
        let hi = msg.timestamp_ms - self.config.delay_min_ms;

        let mut best: Option<(scoring::ScoredCandidate, TranscriptionSnippet)> = None;
        for candidate in self.transcriptions.range(lo, hi) {
            let Some(scored) = score_correlation(
                candidate,
                &msg,
                self.config.delay_min_ms,
                self.config.delay_max_ms,
            ) else {
                continue;
            };
            if scored.confidence <= CONFIDENCE_FLOOR {
                continue;
            }

            let better = match &best {
                None => true,
                Some((current, _)) => {
                    scored.confidence > current.confidence
                        || (scored.confidence == current.confidence
                            && (scored.time_offset_ms - IDEAL_OFFSET_MS).abs()
                                < (current.time_offset_ms - IDEAL_OFFSET_MS).abs())
                }
            };
            if better {
                best = Some((scored, candidate.clone()));
            }
        }

        self.chat.add(msg.clone());

        let (scored, transcription) = best?;

        let fp = fingerprint_of(&transcription.id, &msg.id, scored.pattern);
        if let Some(seen_at) = self.fingerprints.get(&fp) {
            if now - seen_at < self.config.fingerprint_retention_ms {
                self.deduped += 1;
                debug!(fingerprint = %fp, "duplicate correlation suppressed");
                return None;
            }
        }
        self.fingerprints.insert(fp, now);

        let correlation = Correlation {
            id: self.ids.take(),
            transcription_id: transcription.id,
            transcription_text: transcription.text,
            chat_message_id: msg.id,
            chat_user: msg.user,
            chat_text: msg.text,
            pattern: scored.pattern,
            confidence: scored.confidence,
            time_offset_ms: scored.time_offset_ms,
            timestamp_ms: now,
            session_id: self.session_id.clone(),
        };

        self.active.push_back(correlation.clone());
        while self.active.len() > self.config.max_active_correlations {
            self.active.pop_front();
        }

        self.emitted += 1;
        Some(correlation)
    }

    /// Periodic sweep: prune both buffers and expired fingerprints.
    fn prune(&mut self, now: i64) {
        self.transcriptions.prune(now);
        self.chat.prune(now);
        let retention = self.config.fingerprint_retention_ms;
        self.fingerprints.retain(|_, seen| now - *seen < retention);
    }

    /// Stream start: fresh buffers and a new (possibly absent) session.
    fn begin_session(&mut self, session_id: Option<String>) {
        self.transcriptions.clear();
        self.chat.clear();
        self.fingerprints.clear();
        self.session_id = session_id;
    }

    fn end_session(&mut self) -> Option<String> {
        self.session_id.take()
    }

    fn recent(&self, limit: usize) -> Vec<Correlation> {
        self.active.iter().rev().take(limit).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Handle and actor
// ---------------------------------------------------------------------------

enum CorrMsg {
    GetRecent(usize, oneshot::Sender<Vec<Correlation>>),
    GetStatus(oneshot::Sender<ServiceStatus>),
}

/// Cloneable handle to the correlation engine actor.
#[derive(Clone)]
pub struct CorrelationHandle {
    tx: mpsc::Sender<CorrMsg>,
}

impl CorrelationHandle {
    pub async fn get_recent(&self, limit: usize) -> anyhow::Result<Vec<Correlation>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CorrMsg::GetRecent(limit, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get_status(&self) -> anyhow::Result<ServiceStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CorrMsg::GetStatus(reply)).await?;
        Ok(rx.await?)
    }
}

/// Spawn the correlation engine actor.
pub fn spawn<S: CorrelationStore>(
    config: CorrelationConfig,
    bus: &Arc<EventBus>,
    store: Arc<S>,
    breakers: Arc<BreakerRegistry>,
    retry_opts: RetryOptions,
    ids: Arc<CorrelationIdPool>,
) -> CorrelationHandle {
    let (tx, mut rx) = mpsc::channel::<CorrMsg>(64);

    let (_trans_sub, mut trans_rx) = bus.subscribe(topics::TRANSCRIPTION_LIVE, "correlator");
    let (_events_sub, mut events_rx) = bus.subscribe(topics::EVENTS, "correlator");

    let handle = CorrelationHandle { tx };
    let bus = Arc::clone(bus);
    let mut core = CorrelatorCore::new(config, ids);

    tokio::spawn(async move {
        let mut prune_tick = tokio::time::interval(std::time::Duration::from_secs(1));
        info!("correlation engine started");

        loop {
            tokio::select! {
                Some(envelope) = trans_rx.recv() => {
                    match TranscriptionSnippet::from_payload(&envelope.payload) {
                        Ok(snippet) => core.handle_transcription(snippet),
                        Err(e) => warn!(
                            correlation_id = ?envelope.correlation_id,
                            error = %e,
                            "malformed transcription dropped"
                        ),
                    }
                }
                Some(envelope) = events_rx.recv() => {
                    handle_event(&mut core, &bus, &store, &breakers, &retry_opts, envelope).await;
                }
                _ = prune_tick.tick() => {
                    core.prune(now_ms());
                }
                msg = rx.recv() => match msg {
                    Some(CorrMsg::GetRecent(limit, reply)) => {
                        let _ = reply.send(core.recent(limit));
                    }
                    Some(CorrMsg::GetStatus(reply)) => {
                        let _ = reply.send(ServiceStatus {
                            name: "correlator".into(),
                            health: ServiceHealth::Healthy,
                            detail: format!(
                                "emitted={} deduped={} session={}",
                                core.emitted,
                                core.deduped,
                                core.session_id.as_deref().unwrap_or("none")
                            ),
                        });
                    }
                    None => break,
                },
                else => break,
            }
        }

        info!("correlation engine stopped");
    });

    handle
}

async fn handle_event<S: CorrelationStore>(
    core: &mut CorrelatorCore,
    bus: &Arc<EventBus>,
    store: &Arc<S>,
    breakers: &Arc<BreakerRegistry>,
    retry_opts: &RetryOptions,
    envelope: Envelope,
) {
    match envelope.kind.as_str() {
        kinds::CHAT_MESSAGE => {
            let msg = match ChatMessage::from_payload(&envelope.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(
                        correlation_id = ?envelope.correlation_id,
                        error = %e,
                        "malformed chat event dropped"
                    );
                    return;
                }
            };

            if let Some(correlation) = core.handle_chat(msg, now_ms()) {
                publish_insight(bus, &correlation);
                store_async(store, breakers, retry_opts, correlation);
            }
        }
        kinds::STREAM_STARTED => {
            let breaker = breakers.get(STORE_SERVICE);
            let result = breaker
                .call(retry("start_session", retry_opts, default_retryable, || {
                    store.start_session()
                }))
                .await;

            match result {
                Ok(session_id) => {
                    info!(session_id = %session_id, "correlation session started");
                    core.begin_session(Some(session_id));
                }
                Err(e) => {
                    let err = crate::error::CorrelationError::SessionStartFailed {
                        reason: format!("{e:#}"),
                    };
                    warn!(error = %err, "continuing session-less");
                    core.begin_session(None);
                }
            }
        }
        kinds::STREAM_STOPPED => {
            if let Some(session_id) = core.end_session() {
                let breaker = breakers.get(STORE_SERVICE);
                let result = breaker
                    .call(retry("end_session", retry_opts, default_retryable, || {
                        store.end_session(session_id.clone())
                    }))
                    .await;
                match result {
                    Ok(()) => info!(session_id = %session_id, "correlation session ended"),
                    Err(e) => warn!(error = %e, "session end failed"),
                }
            }
        }
        other => {
            debug!(kind = other, "correlator ignoring event kind");
        }
    }
}

fn publish_insight(bus: &Arc<EventBus>, correlation: &Correlation) {
    let envelope = Envelope::new(
        topics::CORRELATION_INSIGHTS,
        kinds::NEW_CORRELATION,
        json!({
            "correlation": correlation,
            "formatted_correlation": correlation.formatted(),
        }),
    )
    .with_correlation_id(correlation.id.clone());
    bus.publish(envelope);
}

/// Fire-and-forget store write wrapped in retry + breaker. Final failures
/// are logged and the row is dropped.
fn store_async<S: CorrelationStore>(
    store: &Arc<S>,
    breakers: &Arc<BreakerRegistry>,
    retry_opts: &RetryOptions,
    correlation: Correlation,
) {
    let store = Arc::clone(store);
    let breaker = breakers.get(STORE_SERVICE);
    let retry_opts = retry_opts.clone();

    tokio::spawn(async move {
        let id = correlation.id.clone();
        let result = breaker
            .call(retry("store_correlation", &retry_opts, default_retryable, || {
                store.store(correlation.clone())
            }))
            .await;
        if let Err(e) = result {
            let err = crate::error::CorrelationError::StoreFailed {
                reason: format!("{e:#}"),
            };
            warn!(correlation_id = %id, error = %err, "correlation dropped");
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::stores::MemoryCorrelationStore;

    fn core() -> CorrelatorCore {
        CorrelatorCore::new(CorrelationConfig::default(), Arc::new(CorrelationIdPool::new()))
    }

    fn transcription(id: &str, text: &str, ts: i64) -> TranscriptionSnippet {
        TranscriptionSnippet {
            id: id.to_string(),
            text: text.to_string(),
            timestamp_ms: ts,
        }
    }

    fn chat(id: &str, text: &str, ts: i64) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            user: "viewer".into(),
            user_name: "viewer".into(),
            text: text.to_string(),
            emotes: Vec::new(),
            native_emotes: Vec::new(),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn direct_quote_end_to_end() {
        let mut core = core();
        core.handle_transcription(transcription("t1", "obvious mistake there", 1000));

        let correlation = core
            .handle_chat(chat("c1", "obvious mistake there lol", 5500), 5500)
            .expect("correlation expected");

        assert_eq!(correlation.pattern, CorrelationPattern::DirectQuote);
        assert_eq!(correlation.time_offset_ms, 4500);
        assert!((correlation.confidence - 0.8325).abs() < 1e-9);
        assert_eq!(correlation.transcription_id, "t1");
        assert_eq!(correlation.chat_message_id, "c1");
        assert!(correlation.session_id.is_none());
    }

    #[test]
    fn fingerprint_dedup_within_retention() {
        let mut core = core();
        core.handle_transcription(transcription("t1", "obvious mistake there", 1000));

        let first = core
            .handle_chat(chat("c1", "obvious mistake there", 5500), 5500)
            .unwrap();
        assert!(core.fingerprints.contains_key(&first.fingerprint()));
        // Same triple again inside the 5 min window: suppressed.
        assert!(core
            .handle_chat(chat("c1", "obvious mistake there", 6000), 6000)
            .is_none());
        assert_eq!(core.deduped, 1);

        // After retention expires the pair may correlate again.
        let later = 5500 + 300_000;
        core.handle_transcription(transcription("t1", "obvious mistake there", later - 4500));
        assert!(core
            .handle_chat(chat("c1", "obvious mistake there", later), later)
            .is_some());
    }

    #[test]
    fn best_candidate_wins() {
        let mut core = core();
        // Quote candidate (0.9 base) and an unrelated one.
        core.handle_transcription(transcription("t1", "completely unrelated words", 1000));
        core.handle_transcription(transcription("t2", "obvious mistake there", 1500));

        let correlation = core
            .handle_chat(chat("c1", "obvious mistake there", 6000), 6000)
            .unwrap();
        assert_eq!(correlation.transcription_id, "t2");
        assert_eq!(correlation.pattern, CorrelationPattern::DirectQuote);
    }

    #[test]
    fn low_confidence_candidates_are_discarded() {
        let mut core = core();
        core.handle_transcription(transcription("t1", "completely different topic", 1000));
        // temporal_only base 0.3 can never clear the 0.4 floor.
        assert!(core
            .handle_chat(chat("c1", "something unrelated entirely", 5000), 5000)
            .is_none());
    }

    #[test]
    fn out_of_window_transcriptions_are_ignored() {
        let mut core = core();
        core.handle_transcription(transcription("t1", "obvious mistake there", 1000));
        // Only 2 s after speech: below the 3 s minimum.
        assert!(core
            .handle_chat(chat("c1", "obvious mistake there", 3000), 3000)
            .is_none());
    }

    #[test]
    fn emitted_confidence_and_offset_stay_in_bounds() {
        let mut core = core();
        for i in 0..50 {
            let ts = i * 1000;
            core.handle_transcription(transcription(
                &format!("t{i}"),
                "garchomp sweep looks scary tonight",
                ts,
            ));
            if let Some(c) = core.handle_chat(
                chat(&format!("c{i}"), "garchomp sweep kappa", ts + 3000 + (i % 5) * 1000),
                ts + 3000 + (i % 5) * 1000,
            ) {
                assert!(c.confidence > 0.4);
                assert!((3000..=7000).contains(&c.time_offset_ms));
            }
        }
    }

    #[test]
    fn active_list_is_capped() {
        let mut core = core();
        for i in 0..60 {
            let ts = i * 10_000;
            core.handle_transcription(transcription(
                &format!("t{i}"),
                "obvious mistake there",
                ts,
            ));
            core.handle_chat(chat(&format!("c{i}"), "obvious mistake there", ts + 5000), ts + 5000);
        }
        assert_eq!(core.active.len(), core.config.max_active_correlations);
        // Most recent first from `recent`.
        let recent = core.recent(5);
        assert_eq!(recent[0].transcription_id, "t59");
    }

    #[test]
    fn prune_expires_fingerprints_and_buffers() {
        let mut core = core();
        core.handle_transcription(transcription("t1", "obvious mistake there", 1000));
        core.handle_chat(chat("c1", "obvious mistake there", 5500), 5500);
        assert_eq!(core.fingerprints.len(), 1);

        core.prune(5500 + 400_000);
        assert!(core.fingerprints.is_empty());
        assert_eq!(core.transcriptions.size(), 0);
        assert_eq!(core.chat.size(), 0);
    }

    #[test]
    fn session_reset_clears_state() {
        let mut core = core();
        core.handle_transcription(transcription("t1", "obvious mistake there", 1000));
        core.handle_chat(chat("c1", "obvious mistake there", 5500), 5500);

        core.begin_session(Some("session-1".into()));
        assert_eq!(core.transcriptions.size(), 0);
        assert!(core.fingerprints.is_empty());

        core.handle_transcription(transcription("t2", "obvious mistake there", 10_000));
        let c = core
            .handle_chat(chat("c2", "obvious mistake there", 14_500), 14_500)
            .unwrap();
        assert_eq!(c.session_id.as_deref(), Some("session-1"));

        assert_eq!(core.end_session().as_deref(), Some("session-1"));
        assert!(core.session_id.is_none());
    }

    #[tokio::test]
    async fn actor_publishes_insight_and_stores() {
        let bus = Arc::new(EventBus::new(64));
        let store = Arc::new(MemoryCorrelationStore::new());
        let handle = spawn(
            CorrelationConfig::default(),
            &bus,
            Arc::clone(&store),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            RetryOptions::default(),
            Arc::new(CorrelationIdPool::new()),
        );

        let (_sub, mut insights_rx) = bus.subscribe(topics::CORRELATION_INSIGHTS, "test");

        let base = now_ms() - 5500;
        bus.publish(Envelope::new(
            topics::TRANSCRIPTION_LIVE,
            kinds::TRANSCRIPTION_SNIPPET,
            json!({ "id": "t1", "text": "obvious mistake there", "timestamp_ms": base }),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.publish(Envelope::new(
            topics::EVENTS,
            kinds::CHAT_MESSAGE,
            json!({
                "id": "c1",
                "user": "viewer",
                "text": "obvious mistake there lol",
                "timestamp_ms": base + 4500
            }),
        ));

        let insight = insights_rx.recv().await.unwrap();
        assert_eq!(insight.kind, kinds::NEW_CORRELATION);
        assert_eq!(insight.payload["correlation"]["pattern"], "direct_quote");
        assert!(insight.payload["formatted_correlation"]
            .as_str()
            .unwrap()
            .contains("direct_quote"));

        // The async store write lands shortly after.
        for _ in 0..50 {
            if !store.stored().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.stored().len(), 1);

        let recent = handle.get_recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
    }
}
