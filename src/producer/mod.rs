// =============================================================================
// Stream Producer — priority-preemption state machine
// =============================================================================
//
// The central actor deciding what the overlay shows. An interrupt stack
// (priority desc, older first on ties) preempts a rotating ticker; the
// derived `active_content` is broadcast on `stream:updates` after every
// mutation, together with a persisted snapshot so show and interrupt
// identity survive restarts (live timers do not — they are re-armed from
// each interrupt's remaining duration).
//
// All mutations flow through the actor mailbox: bus events, timer fires, and
// commands interleave in arrival order, which makes every arm/cancel atomic
// with its stack mutation.
// =============================================================================

pub mod content;
pub mod state;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{Envelope, EventBus};
use crate::config::ProducerConfig;
use crate::service::{ServiceHealth, ServiceStatus};
use crate::timers::{TimerFired, TimerRef, TimerWheel};
use crate::types::{
    kinds, now_ms, topics, ChannelUpdate, Show, SubscriptionEvent,
};
use crate::aggregator::AggregatorHandle;

pub use state::{
    ActiveContent, Interrupt, InterruptKind, InterruptStack, ProducerSnapshot, SnapshotMetadata,
};
use state::{new_interrupt_id, remaining_duration_ms, sub_train_data};

// ---------------------------------------------------------------------------
// Mailbox types
// ---------------------------------------------------------------------------

/// Options for `add_interrupt`; omitted fields use the kind's defaults.
#[derive(Debug, Clone, Default)]
pub struct InterruptOptions {
    pub priority: Option<u8>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProducerTimer {
    InterruptExpired(String),
    TickerTick,
    Cleanup,
}

enum ProducerCmd {
    GetState(oneshot::Sender<ProducerSnapshot>),
    ChangeShow {
        show: Show,
        meta: Value,
    },
    AddInterrupt {
        kind: InterruptKind,
        data: Value,
        opts: InterruptOptions,
        reply: Option<oneshot::Sender<String>>,
    },
    RemoveInterrupt {
        id: String,
    },
    UpdateTicker {
        rotation: Vec<String>,
    },
    GetStatus(oneshot::Sender<ServiceStatus>),
}

/// Wheel ids for the producer's own periodic timers.
const TICKER_TIMER: &str = "ticker";
const CLEANUP_TIMER: &str = "cleanup";

// ---------------------------------------------------------------------------
// Core (synchronous, actor-owned)
// ---------------------------------------------------------------------------

/// What the derivation rule selected; ticker slots still need enrichment.
#[derive(Debug, Clone, PartialEq)]
enum Derived {
    FromInterrupt(ActiveContent),
    TickerSlot(String),
    Empty,
}

struct ProducerCore {
    config: ProducerConfig,
    current_show: Show,
    active_content: Option<ActiveContent>,
    stack: InterruptStack,
    rotation: Vec<String>,
    ticker_index: usize,
    version: u64,
    /// Interrupt id → armed timer ref. Invariant after cleanup: every key
    /// appears in the stack, and `len <= max_timers`.
    timers: HashMap<String, TimerRef>,
    /// Creator goal state cached from channel.goal.* events.
    goals: Value,
    last_updated_ms: i64,
    events_seen: u64,
}

impl ProducerCore {
    fn new(config: ProducerConfig) -> Self {
        let rotation = content::default_rotation(Show::Variety);
        Self {
            config,
            current_show: Show::Variety,
            active_content: None,
            stack: InterruptStack::new(),
            rotation,
            ticker_index: 0,
            version: 1,
            timers: HashMap::new(),
            goals: Value::Null,
            last_updated_ms: now_ms(),
            events_seen: 0,
        }
    }

    /// Adopt a persisted snapshot, dropping interrupts whose lifetime fully
    /// elapsed while the process was down. Returns `(id, remaining_ms)` for
    /// the survivors so the actor can re-arm their timers.
    fn restore(&mut self, snapshot: ProducerSnapshot, now: i64) -> Vec<(String, u64)> {
        self.current_show = snapshot.current_show;
        self.rotation = snapshot.ticker_rotation;
        self.ticker_index = if self.rotation.is_empty() {
            0
        } else {
            snapshot.ticker_index % self.rotation.len()
        };
        self.version = snapshot.version;

        let mut rearm = Vec::new();
        for interrupt in snapshot.interrupt_stack.iter() {
            match remaining_duration_ms(interrupt, now) {
                Some(remaining) => {
                    self.stack.insert(
                        interrupt.clone(),
                        self.config.max_interrupt_stack_size,
                        self.config.interrupt_stack_keep_count,
                    );
                    rearm.push((interrupt.id.clone(), remaining));
                }
                None => {
                    debug!(id = %interrupt.id, "restored interrupt already expired — dropped");
                }
            }
        }

        info!(
            show = %self.current_show,
            version = self.version,
            restored = rearm.len(),
            "producer state restored"
        );
        rearm
    }

    /// Derivation rule: stack head, else ticker slot, else nothing.
    fn derive(&self) -> Derived {
        if let Some(head) = self.stack.head() {
            return Derived::FromInterrupt(ActiveContent::from_interrupt(head));
        }
        match self.rotation.get(self.ticker_index) {
            Some(slot) => Derived::TickerSlot(slot.clone()),
            None => Derived::Empty,
        }
    }

    fn advance_ticker(&mut self) {
        if !self.rotation.is_empty() {
            self.ticker_index = (self.ticker_index + 1) % self.rotation.len();
        }
    }

    fn detect_show(&self, update: &ChannelUpdate) -> Option<Show> {
        if let Some(show) = self.config.show_categories.get(&update.category_id) {
            return Some(*show);
        }
        Show::from_game_name(&update.category_name)
    }

    fn snapshot(&self) -> ProducerSnapshot {
        ProducerSnapshot {
            current_show: self.current_show,
            active_content: self.active_content.clone(),
            interrupt_stack: self.stack.clone(),
            ticker_rotation: self.rotation.clone(),
            ticker_index: self.ticker_index,
            version: self.version,
            metadata: SnapshotMetadata {
                last_updated_ms: self.last_updated_ms,
                state_version: self.version,
            },
        }
    }

    /// Coalesce a subscription into an existing live sub-train, or report
    /// that a new one is needed.
    fn coalesce_sub_train(&mut self, sub: &SubscriptionEvent, now: i64) -> Option<String> {
        let duration = self.config.sub_train_duration_ms;
        let train = self.stack.find_kind_mut(&InterruptKind::SubTrain)?;
        if now >= train.expires_at_ms() {
            return None;
        }

        let count = train.data["count"].as_u64().unwrap_or(0) + 1;
        train.data["count"] = json!(count);
        train.data["latest_subscriber"] = json!(sub.user_name);
        train.data["latest_tier"] = json!(sub.tier);
        // Keep started_at (priority ordering) but stretch the lifetime so a
        // restart re-arms from the extended expiry.
        train.duration_ms = (now - train.started_at_ms).max(0) as u64 + duration;

        Some(train.id.clone())
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the producer actor.
#[derive(Clone)]
pub struct ProducerHandle {
    tx: mpsc::Sender<ProducerCmd>,
}

impl ProducerHandle {
    pub async fn get_state(&self) -> anyhow::Result<ProducerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ProducerCmd::GetState(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn change_show(&self, show: Show, meta: Value) -> anyhow::Result<()> {
        self.tx.send(ProducerCmd::ChangeShow { show, meta }).await?;
        Ok(())
    }

    pub async fn add_interrupt(
        &self,
        kind: InterruptKind,
        data: Value,
        opts: InterruptOptions,
    ) -> anyhow::Result<String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ProducerCmd::AddInterrupt {
                kind,
                data,
                opts,
                reply: Some(reply),
            })
            .await?;
        Ok(rx.await?)
    }

    pub async fn remove_interrupt(&self, id: impl Into<String>) -> anyhow::Result<()> {
        self.tx
            .send(ProducerCmd::RemoveInterrupt { id: id.into() })
            .await?;
        Ok(())
    }

    pub async fn update_ticker_content(&self, rotation: Vec<String>) -> anyhow::Result<()> {
        self.tx.send(ProducerCmd::UpdateTicker { rotation }).await?;
        Ok(())
    }

    /// Pin content on screen: a manual-override interrupt wrapping the
    /// payload.
    pub async fn force_content(
        &self,
        content_type: impl Into<String>,
        data: Value,
        duration_ms: Option<u64>,
    ) -> anyhow::Result<String> {
        self.add_interrupt(
            InterruptKind::ManualOverride,
            json!({ "type": content_type.into(), "data": data }),
            InterruptOptions {
                priority: None,
                duration_ms,
            },
        )
        .await
    }

    pub async fn get_status(&self) -> anyhow::Result<ServiceStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ProducerCmd::GetStatus(reply)).await?;
        Ok(rx.await?)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct ProducerActor {
    core: ProducerCore,
    wheel: TimerWheel<ProducerTimer>,
    bus: Arc<EventBus>,
    aggregator: AggregatorHandle,
}

/// Spawn the producer actor, restoring persisted state when present.
pub fn spawn(
    config: ProducerConfig,
    bus: &Arc<EventBus>,
    aggregator: AggregatorHandle,
) -> ProducerHandle {
    let (tx, mut rx) = mpsc::channel::<ProducerCmd>(64);
    let (timer_tx, mut timer_rx) = mpsc::channel::<TimerFired<ProducerTimer>>(64);

    let (_chat_sub, mut chat_rx) = bus.subscribe(topics::CHAT, "producer");
    let (_follow_sub, mut follow_rx) = bus.subscribe(topics::FOLLOWERS, "producer");
    let (_subs_sub, mut subs_rx) = bus.subscribe(topics::SUBSCRIPTIONS, "producer");
    let (_cheers_sub, mut cheers_rx) = bus.subscribe(topics::CHEERS, "producer");
    let (_twitch_sub, mut twitch_rx) = bus.subscribe(topics::TWITCH_EVENTS, "producer");
    let (_channel_sub, mut channel_rx) = bus.subscribe(topics::CHANNEL_UPDATES, "producer");

    let handle = ProducerHandle { tx };
    let bus = Arc::clone(bus);

    tokio::spawn(async move {
        let mut actor = ProducerActor {
            core: ProducerCore::new(config.clone()),
            wheel: TimerWheel::new(timer_tx),
            bus,
            aggregator,
        };

        // ── Restore persisted state ─────────────────────────────────────
        match ProducerSnapshot::load(&config.state_path) {
            Ok(Some(snapshot)) => {
                let rearm = actor.core.restore(snapshot, now_ms());
                for (id, remaining) in rearm {
                    let timer_ref = actor
                        .wheel
                        .arm(&id, remaining, ProducerTimer::InterruptExpired(id.clone()));
                    actor.core.timers.insert(id, timer_ref);
                }
            }
            Ok(None) => {
                info!("no producer snapshot — starting with variety defaults");
            }
            Err(e) => {
                warn!(error = %e, "producer snapshot corrupt — starting fresh");
            }
        }

        actor.wheel.arm_periodic(
            TICKER_TIMER,
            config.ticker_interval_ms,
            ProducerTimer::TickerTick,
        );
        actor.wheel.arm_periodic(
            CLEANUP_TIMER,
            config.cleanup_interval_ms,
            ProducerTimer::Cleanup,
        );

        actor.rederive_and_broadcast().await;
        info!(show = %actor.core.current_show, "stream producer started");

        loop {
            tokio::select! {
                Some(fired) = timer_rx.recv() => actor.handle_timer(fired).await,
                Some(envelope) = subs_rx.recv() => actor.handle_subscription_event(envelope).await,
                Some(envelope) = channel_rx.recv() => actor.handle_channel_update(envelope).await,
                Some(envelope) = twitch_rx.recv() => actor.handle_twitch_event(envelope).await,
                Some(envelope) = chat_rx.recv() => actor.note_event(envelope),
                Some(envelope) = follow_rx.recv() => actor.note_event(envelope),
                Some(envelope) = cheers_rx.recv() => actor.note_event(envelope),
                cmd = rx.recv() => match cmd {
                    Some(cmd) => actor.handle_command(cmd).await,
                    None => break,
                },
                else => break,
            }
        }

        actor.wheel.cancel_all();
        actor.persist();
        info!("stream producer stopped");
    });

    handle
}

impl ProducerActor {
    // -------------------------------------------------------------------------
    // Derivation + broadcast
    // -------------------------------------------------------------------------

    async fn resolve_active(&mut self) {
        let derived = self.core.derive();
        self.core.active_content = match derived {
            Derived::FromInterrupt(active) => Some(active),
            Derived::TickerSlot(slot) => {
                let data =
                    content::fetch_ticker_data(&self.aggregator, &slot, &self.core.goals).await;
                Some(ActiveContent {
                    content_type: slot,
                    data,
                    priority: content::TICKER_PRIORITY,
                    started_at_ms: now_ms(),
                })
            }
            Derived::Empty => None,
        };
    }

    fn persist(&self) {
        if let Err(e) = self.core.snapshot().save(&self.core.config.state_path) {
            warn!(error = %e, "failed to persist producer snapshot");
        }
    }

    /// Bump the version, persist, emit the advisory metric, and publish the
    /// full state on `stream:updates`.
    async fn broadcast(&mut self) {
        self.core.version += 1;
        self.core.last_updated_ms = now_ms();

        debug!(
            interrupt_count = self.core.stack.len(),
            timer_count = self.core.timers.len(),
            version = self.core.version,
            "producer broadcast"
        );

        self.persist();

        let snapshot = self.core.snapshot();
        self.bus.publish(Envelope::new(
            topics::STREAM_UPDATES,
            kinds::STREAM_UPDATE,
            json!({ "state": snapshot }),
        ));
    }

    async fn rederive_and_broadcast(&mut self) {
        let before = self.core.active_content.clone();
        self.resolve_active().await;
        let changed = match (&before, &self.core.active_content) {
            (Some(a), Some(b)) => a.content_type != b.content_type,
            (None, None) => false,
            _ => true,
        };
        if changed {
            if let Some(active) = &self.core.active_content {
                self.bus.publish(Envelope::new(
                    topics::STREAM_UPDATES,
                    kinds::CONTENT_UPDATE,
                    json!({
                        "type": active.content_type,
                        "data": active.data,
                        "timestamp": now_ms(),
                    }),
                ));
            }
        }
        self.broadcast().await;
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: ProducerCmd) {
        match cmd {
            ProducerCmd::GetState(reply) => {
                let _ = reply.send(self.core.snapshot());
            }
            ProducerCmd::ChangeShow { show, meta } => {
                self.change_show(show, meta).await;
            }
            ProducerCmd::AddInterrupt {
                kind,
                data,
                opts,
                reply,
            } => {
                let id = self.add_interrupt(kind, data, opts).await;
                if let (Some(reply), Some(id)) = (reply, id) {
                    let _ = reply.send(id);
                }
            }
            ProducerCmd::RemoveInterrupt { id } => {
                self.remove_interrupt(&id).await;
            }
            ProducerCmd::UpdateTicker { rotation } => {
                self.core.rotation = rotation;
                self.core.ticker_index = 0;
                info!(slots = self.core.rotation.len(), "ticker rotation replaced");
                self.rederive_and_broadcast().await;
            }
            ProducerCmd::GetStatus(reply) => {
                let _ = reply.send(ServiceStatus {
                    name: "producer".into(),
                    health: ServiceHealth::Healthy,
                    detail: format!(
                        "show={} interrupts={} timers={} version={}",
                        self.core.current_show,
                        self.core.stack.len(),
                        self.core.timers.len(),
                        self.core.version
                    ),
                });
            }
        }
    }

    async fn change_show(&mut self, show: Show, meta: Value) {
        self.core.current_show = show;
        self.core.rotation = content::default_rotation(show);
        self.core.ticker_index = 0;
        info!(show = %show, "show changed");

        self.bus.publish(Envelope::new(
            topics::STREAM_UPDATES,
            kinds::SHOW_CHANGE,
            json!({
                "show": show,
                "game": meta.get("game").cloned().unwrap_or(Value::Null),
                "changed_at": now_ms(),
            }),
        ));
        self.rederive_and_broadcast().await;
    }

    async fn add_interrupt(
        &mut self,
        kind: InterruptKind,
        data: Value,
        opts: InterruptOptions,
    ) -> Option<String> {
        let duration_ms = opts.duration_ms.unwrap_or_else(|| kind.default_duration_ms());
        if duration_ms == 0 {
            let err = crate::error::ProducerError::InvalidInterrupt {
                reason: "zero duration".to_string(),
            };
            warn!(kind = %kind, error = %err, "interrupt ignored");
            return None;
        }

        let interrupt = Interrupt {
            id: new_interrupt_id(),
            priority: opts.priority.unwrap_or_else(|| kind.default_priority()),
            duration_ms,
            kind,
            data,
            started_at_ms: now_ms(),
        };
        let id = interrupt.id.clone();

        info!(
            id = %id,
            kind = %interrupt.kind,
            priority = interrupt.priority,
            duration_ms,
            "interrupt added"
        );

        let dropped = self.core.stack.insert(
            interrupt,
            self.core.config.max_interrupt_stack_size,
            self.core.config.interrupt_stack_keep_count,
        );
        self.drop_interrupt_timers(&dropped);

        // The new interrupt may itself have been truncated away.
        if self.core.stack.contains(&id) {
            let timer_ref = self
                .wheel
                .arm(&id, duration_ms, ProducerTimer::InterruptExpired(id.clone()));
            self.core.timers.insert(id.clone(), timer_ref);
            self.enforce_timer_limit();
        }

        self.rederive_and_broadcast().await;
        Some(id)
    }

    async fn remove_interrupt(&mut self, id: &str) {
        self.wheel.cancel(id);
        self.core.timers.remove(id);
        match self.core.stack.remove(id) {
            Some(interrupt) => {
                info!(id = %id, kind = %interrupt.kind, "interrupt removed");
                self.rederive_and_broadcast().await;
            }
            None => {
                debug!(id = %id, "remove for unknown interrupt — ignored");
            }
        }
    }

    fn drop_interrupt_timers(&mut self, dropped: &[Interrupt]) {
        for interrupt in dropped {
            self.wheel.cancel(&interrupt.id);
            self.core.timers.remove(&interrupt.id);
        }
    }

    /// Enforce `max_timers`: the oldest interrupts (by started_at) lose
    /// their timers and leave the stack until the cap holds.
    fn enforce_timer_limit(&mut self) {
        let max = self.core.config.max_timers;
        if self.core.timers.len() <= max {
            return;
        }
        let excess = self.core.timers.len() - max;
        let victims: Vec<String> = self
            .core
            .stack
            .oldest_ids(self.core.stack.len())
            .into_iter()
            .filter(|id| self.core.timers.contains_key(id))
            .take(excess)
            .collect();
        warn!(excess, "timer limit exceeded — dropping oldest interrupts");
        for id in victims {
            self.wheel.cancel(&id);
            self.core.timers.remove(&id);
            self.core.stack.remove(&id);
        }
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    async fn handle_timer(&mut self, fired: TimerFired<ProducerTimer>) {
        match fired.payload {
            ProducerTimer::InterruptExpired(id) => {
                // A fire queued before a cancel/re-arm carries a stale
                // generation; the live ref wins.
                let live = self
                    .core
                    .timers
                    .get(&id)
                    .is_some_and(|r| r.generation == fired.generation);
                if !live {
                    debug!(id = %id, "stale interrupt expiry ignored");
                    return;
                }
                self.core.timers.remove(&id);
                if self.core.stack.remove(&id).is_some() {
                    info!(id = %id, "interrupt expired");
                    self.rederive_and_broadcast().await;
                }
            }
            ProducerTimer::TickerTick => {
                self.core.advance_ticker();
                if self.core.stack.is_empty() {
                    self.rederive_and_broadcast().await;
                }
            }
            ProducerTimer::Cleanup => self.cleanup().await,
        }
    }

    /// Periodic sweep: orphan timers cancelled, stack truncated to cap,
    /// version bumped and state persisted.
    async fn cleanup(&mut self) {
        let orphaned: Vec<String> = self
            .core
            .timers
            .keys()
            .filter(|id| !self.core.stack.contains(id))
            .cloned()
            .collect();
        for id in &orphaned {
            self.wheel.cancel(id);
            self.core.timers.remove(id);
        }

        let dropped = if self.core.stack.len() > self.core.config.max_interrupt_stack_size {
            self.core
                .stack
                .truncate_to(self.core.config.interrupt_stack_keep_count)
        } else {
            Vec::new()
        };
        self.drop_interrupt_timers(&dropped);

        if !orphaned.is_empty() || !dropped.is_empty() {
            warn!(
                orphaned = orphaned.len(),
                truncated = dropped.len(),
                "producer cleanup corrected state"
            );
        } else {
            debug!("producer cleanup — nothing to do");
        }

        self.core.version += 1;
        self.core.last_updated_ms = now_ms();
        self.persist();
    }

    // -------------------------------------------------------------------------
    // Bus events
    // -------------------------------------------------------------------------

    fn note_event(&mut self, envelope: Envelope) {
        self.core.events_seen += 1;
        debug!(topic = %envelope.topic, kind = %envelope.kind, "producer observed event");
    }

    async fn handle_subscription_event(&mut self, envelope: Envelope) {
        self.core.events_seen += 1;
        let sub = match SubscriptionEvent::from_payload(&envelope.payload) {
            Ok(sub) => sub,
            Err(e) => {
                warn!(
                    correlation_id = ?envelope.correlation_id,
                    error = %e,
                    "malformed subscription event dropped"
                );
                return;
            }
        };

        let now = now_ms();
        if let Some(id) = self.core.coalesce_sub_train(&sub, now) {
            // Atomic extension: cancel the old timer, then re-arm for the
            // full train duration under the same mailbox turn.
            self.wheel.cancel(&id);
            let timer_ref = self.wheel.arm(
                &id,
                self.core.config.sub_train_duration_ms,
                ProducerTimer::InterruptExpired(id.clone()),
            );
            self.core.timers.insert(id.clone(), timer_ref);
            info!(id = %id, subscriber = %sub.user_name, "sub train extended");
            self.rederive_and_broadcast().await;
        } else {
            let duration = self.core.config.sub_train_duration_ms;
            self.add_interrupt(
                InterruptKind::SubTrain,
                sub_train_data(&sub.user_name, &sub.tier),
                InterruptOptions {
                    priority: None,
                    duration_ms: Some(duration),
                },
            )
            .await;
        }
    }

    async fn handle_channel_update(&mut self, envelope: Envelope) {
        self.core.events_seen += 1;
        let update = match ChannelUpdate::from_payload(&envelope.payload) {
            Ok(update) => update,
            Err(e) => {
                warn!(
                    correlation_id = ?envelope.correlation_id,
                    error = %e,
                    "malformed channel update dropped"
                );
                return;
            }
        };

        match self.core.detect_show(&update) {
            Some(show) if show != self.core.current_show => {
                info!(
                    category = %update.category_name,
                    from = %self.core.current_show,
                    to = %show,
                    "show detected from channel update"
                );
                self.change_show(show, json!({ "game": update.category_name })).await;
            }
            Some(_) => {
                debug!(category = %update.category_name, "channel update — show unchanged");
            }
            None => {
                debug!(category = %update.category_name, "channel update — no show mapping");
            }
        }
    }

    async fn handle_twitch_event(&mut self, envelope: Envelope) {
        self.core.events_seen += 1;
        if envelope.kind.starts_with("channel.goal") {
            self.core.goals = envelope
                .payload
                .get("data")
                .cloned()
                .unwrap_or_else(|| envelope.payload.clone());
            debug!("creator goals cached from goal event");
        } else {
            debug!(kind = %envelope.kind, "producer observed twitch event");
        }
    }
}
