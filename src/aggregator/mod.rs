// =============================================================================
// Content Aggregator — chat/follower statistics actor
// =============================================================================
//
// Consumes `chat` and `followers` from the bus and owns all counter state:
// emote counts (today + all-time), the recent-follower ring, and daily
// totals. Queries run through the actor mailbox and reply over oneshot
// channels, so readers always observe a consistent snapshot.
//
// Daily reset fires at the next UTC midnight (matching the wire timestamps),
// re-arming itself each day. An hourly cleanup sweep re-enforces the
// follower and emote caps. A malformed event is logged and dropped; it never
// takes the actor down.
// =============================================================================

pub mod stats;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{Envelope, EventBus};
use crate::config::AggregatorConfig;
use crate::service::{ServiceHealth, ServiceStatus};
use crate::timers::{TimerFired, TimerWheel};
use crate::types::{now_ms, topics, ChatMessage, FollowEvent};

pub use stats::{DailyCounters, EmoteCount, EmoteKind, EmoteStat, FollowerEntry};
use stats::{EmoteTable, FollowerRing};

// ---------------------------------------------------------------------------
// Query payloads
// ---------------------------------------------------------------------------

/// Full emote statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EmoteStats {
    pub regular_emotes: std::collections::HashMap<String, EmoteCount>,
    pub native_emotes: std::collections::HashMap<String, EmoteCount>,
    pub top_today: Vec<EmoteStat>,
    pub top_alltime: Vec<EmoteStat>,
}

/// Daily totals snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DailyStats {
    pub total_messages: u64,
    pub total_follows: u64,
    pub started_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggTimer {
    DailyReset,
    HourlyCleanup,
}

enum AggMsg {
    RecordEmoteUsage {
        emotes: Vec<String>,
        native_emotes: Vec<String>,
        user: String,
    },
    RecordFollower {
        user_name: String,
        timestamp_ms: i64,
    },
    GetEmoteStats(oneshot::Sender<EmoteStats>),
    GetRecentFollowers(usize, oneshot::Sender<Vec<FollowerEntry>>),
    GetDailyStats(oneshot::Sender<DailyStats>),
    GetStatus(oneshot::Sender<ServiceStatus>),
}

// ---------------------------------------------------------------------------
// Core (synchronous, actor-owned)
// ---------------------------------------------------------------------------

/// Number of rows returned by the top-N rankings.
const TOP_N: usize = 10;
/// Hourly cap-enforcement sweep.
const CLEANUP_INTERVAL_MS: u64 = 3_600_000;

struct AggregatorCore {
    emotes: EmoteTable,
    followers: FollowerRing,
    daily: DailyCounters,
    events_seen: u64,
    events_dropped: u64,
}

impl AggregatorCore {
    fn new(config: &AggregatorConfig) -> Self {
        Self {
            emotes: EmoteTable::new(config.max_emote_entries),
            followers: FollowerRing::new(config.max_followers),
            daily: DailyCounters::new(now_ms()),
            events_seen: 0,
            events_dropped: 0,
        }
    }

    fn record_emote_usage(&mut self, emotes: &[String], native_emotes: &[String], user: &str) {
        for name in emotes {
            self.emotes.increment(name, EmoteKind::Regular);
        }
        for name in native_emotes {
            self.emotes.increment(name, EmoteKind::Native);
        }
        debug!(
            user,
            regular = emotes.len(),
            native = native_emotes.len(),
            "emote usage recorded"
        );
    }

    fn record_follower(&mut self, user_name: String, timestamp_ms: i64) {
        self.followers.insert(FollowerEntry {
            timestamp_ms,
            user_name,
        });
        self.daily.total_follows += 1;
    }

    fn handle_chat(&mut self, msg: &ChatMessage) {
        self.daily.total_messages += 1;
        self.record_emote_usage(&msg.emotes, &msg.native_emotes, &msg.user);
    }

    fn handle_bus(&mut self, envelope: &Envelope) {
        self.events_seen += 1;
        match envelope.topic.as_str() {
            topics::CHAT => match ChatMessage::from_payload(&envelope.payload) {
                Ok(msg) => self.handle_chat(&msg),
                Err(e) => {
                    self.events_dropped += 1;
                    warn!(
                        topic = %envelope.topic,
                        correlation_id = ?envelope.correlation_id,
                        error = %e,
                        "malformed chat event dropped"
                    );
                }
            },
            topics::FOLLOWERS => match FollowEvent::from_payload(&envelope.payload) {
                Ok(follow) => self.record_follower(follow.user_name, follow.timestamp_ms),
                Err(e) => {
                    self.events_dropped += 1;
                    warn!(
                        topic = %envelope.topic,
                        correlation_id = ?envelope.correlation_id,
                        error = %e,
                        "malformed follower event dropped"
                    );
                }
            },
            other => {
                debug!(topic = other, "aggregator ignoring unrelated topic");
            }
        }
    }

    fn reset_daily(&mut self, now: i64) {
        self.emotes.reset_today();
        self.daily.reset(now);
        info!("daily aggregator counters reset");
    }

    fn cleanup(&mut self) {
        self.followers.enforce_cap();
        self.emotes.enforce_cap();
        debug!(
            emote_rows = self.emotes.len(),
            followers = self.followers.len(),
            "aggregator cleanup sweep"
        );
    }

    fn emote_stats(&self) -> EmoteStats {
        EmoteStats {
            regular_emotes: self.emotes.by_kind(EmoteKind::Regular),
            native_emotes: self.emotes.by_kind(EmoteKind::Native),
            top_today: self.emotes.top_today(TOP_N),
            top_alltime: self.emotes.top_all_time(TOP_N),
        }
    }

    fn daily_stats(&self) -> DailyStats {
        DailyStats {
            total_messages: self.daily.total_messages,
            total_follows: self.daily.total_follows,
            started_at_ms: self.daily.started_at_ms,
        }
    }
}

/// Milliseconds from `now` until the next UTC midnight.
fn ms_until_next_utc_midnight(now_ms: i64) -> u64 {
    let now = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(Utc::now);
    let next_midnight = (now.date_naive() + chrono::Days::new(1))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    (next_midnight - now).num_milliseconds().max(1) as u64
}

// ---------------------------------------------------------------------------
// Handle and actor
// ---------------------------------------------------------------------------

/// Cloneable handle to the aggregator actor.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<AggMsg>,
}

impl AggregatorHandle {
    /// Asynchronous ingest: count emote usage for one message.
    pub fn record_emote_usage(&self, emotes: Vec<String>, native_emotes: Vec<String>, user: String) {
        let _ = self.tx.try_send(AggMsg::RecordEmoteUsage {
            emotes,
            native_emotes,
            user,
        });
    }

    /// Asynchronous ingest: record one follower.
    pub fn record_follower(&self, user_name: String, timestamp_ms: i64) {
        let _ = self.tx.try_send(AggMsg::RecordFollower {
            user_name,
            timestamp_ms,
        });
    }

    pub async fn get_emote_stats(&self) -> anyhow::Result<EmoteStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AggMsg::GetEmoteStats(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get_recent_followers(&self, limit: usize) -> anyhow::Result<Vec<FollowerEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AggMsg::GetRecentFollowers(limit, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get_daily_stats(&self) -> anyhow::Result<DailyStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AggMsg::GetDailyStats(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get_status(&self) -> anyhow::Result<ServiceStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AggMsg::GetStatus(reply)).await?;
        Ok(rx.await?)
    }
}

/// Spawn the aggregator actor, subscribed to `chat` and `followers`.
pub fn spawn(config: AggregatorConfig, bus: &Arc<EventBus>) -> AggregatorHandle {
    let (tx, mut rx) = mpsc::channel::<AggMsg>(256);
    let (timer_tx, mut timer_rx) = mpsc::channel::<TimerFired<AggTimer>>(16);

    let (_chat_sub, mut chat_rx) = bus.subscribe(topics::CHAT, "aggregator");
    let (_follow_sub, mut follow_rx) = bus.subscribe(topics::FOLLOWERS, "aggregator");

    let handle = AggregatorHandle { tx };
    let mut core = AggregatorCore::new(&config);

    tokio::spawn(async move {
        let wheel = TimerWheel::new(timer_tx);
        wheel.arm("daily_reset", ms_until_next_utc_midnight(now_ms()), AggTimer::DailyReset);
        wheel.arm_periodic("hourly_cleanup", CLEANUP_INTERVAL_MS, AggTimer::HourlyCleanup);
        info!("content aggregator started");

        loop {
            tokio::select! {
                Some(envelope) = chat_rx.recv() => core.handle_bus(&envelope),
                Some(envelope) = follow_rx.recv() => core.handle_bus(&envelope),
                Some(fired) = timer_rx.recv() => match fired.payload {
                    AggTimer::DailyReset => {
                        core.reset_daily(now_ms());
                        wheel.arm(
                            "daily_reset",
                            ms_until_next_utc_midnight(now_ms()),
                            AggTimer::DailyReset,
                        );
                    }
                    AggTimer::HourlyCleanup => core.cleanup(),
                },
                msg = rx.recv() => match msg {
                    Some(AggMsg::RecordEmoteUsage { emotes, native_emotes, user }) => {
                        core.record_emote_usage(&emotes, &native_emotes, &user);
                    }
                    Some(AggMsg::RecordFollower { user_name, timestamp_ms }) => {
                        core.record_follower(user_name, timestamp_ms);
                    }
                    Some(AggMsg::GetEmoteStats(reply)) => {
                        let _ = reply.send(core.emote_stats());
                    }
                    Some(AggMsg::GetRecentFollowers(limit, reply)) => {
                        let _ = reply.send(core.followers.recent(limit));
                    }
                    Some(AggMsg::GetDailyStats(reply)) => {
                        let _ = reply.send(core.daily_stats());
                    }
                    Some(AggMsg::GetStatus(reply)) => {
                        let _ = reply.send(ServiceStatus {
                            name: "aggregator".into(),
                            health: ServiceHealth::Healthy,
                            detail: format!(
                                "events={} dropped={} emotes={} followers={}",
                                core.events_seen,
                                core.events_dropped,
                                core.emotes.len(),
                                core.followers.len()
                            ),
                        });
                    }
                    None => break,
                },
                else => break,
            }
        }

        wheel.cancel_all();
        info!("content aggregator stopped");
    });

    handle
}
