// =============================================================================
// Circuit Breaker — per-service closed/open/half-open gate
// =============================================================================
//
// State machine per service name:
//   closed    — requests pass; failures count up. At failure_threshold the
//               breaker opens and records opened_at.
//   open      — requests fail fast. After cooldown_ms the next request is
//               admitted as the half-open probe.
//   half_open — exactly one probe in flight; success closes and resets,
//               failure reopens with a fresh opened_at.
//
// All transitions are serialized on the breaker's internal lock.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::CircuitError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of a single breaker for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub open_for_ms: Option<u64>,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-service circuit breaker.
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            service: service.into(),
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_millis(config.cooldown_ms),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Admit or reject a request. Must be paired with `record_success` /
    /// `record_failure` when admitted.
    pub fn try_acquire(&self) -> Result<(), CircuitError> {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = s
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.cooldown);
                if cooled {
                    s.state = BreakerState::HalfOpen;
                    s.probe_in_flight = true;
                    info!(service = %self.service, "circuit half-open — admitting probe");
                    Ok(())
                } else {
                    Err(CircuitError::CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if s.probe_in_flight {
                    Err(CircuitError::CircuitOpen {
                        service: self.service.clone(),
                    })
                } else {
                    s.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::HalfOpen => {
                s.state = BreakerState::Closed;
                s.failure_count = 0;
                s.opened_at = None;
                s.probe_in_flight = false;
                info!(service = %self.service, "circuit closed after successful probe");
            }
            BreakerState::Closed => {
                s.failure_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut s = self.inner.lock();
        match s.state {
            BreakerState::Closed => {
                s.failure_count += 1;
                debug!(
                    service = %self.service,
                    failures = s.failure_count,
                    threshold = self.failure_threshold,
                    "circuit failure recorded"
                );
                if s.failure_count >= self.failure_threshold {
                    s.state = BreakerState::Open;
                    s.opened_at = Some(Instant::now());
                    warn!(
                        service = %self.service,
                        failures = s.failure_count,
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "circuit opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                s.state = BreakerState::Open;
                s.opened_at = Some(Instant::now());
                s.probe_in_flight = false;
                warn!(service = %self.service, "probe failed — circuit reopened");
            }
            BreakerState::Open => {}
        }
    }

    /// Run `op` through the breaker: fail fast when open, otherwise record
    /// the outcome.
    pub async fn call<T, Fut>(&self, op: Fut) -> anyhow::Result<T>
    where
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        self.try_acquire().map_err(anyhow::Error::new)?;
        match op.await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.inner.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: s.state,
            failure_count: s.failure_count,
            open_for_ms: s.opened_at.map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Lazily creates one breaker per service name, all sharing a config.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().get(service) {
            return Arc::clone(b);
        }
        let mut map = self.breakers.write();
        Arc::clone(
            map.entry(service.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(service, &self.config))),
        )
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .read()
            .values()
            .map(|b| b.snapshot())
            .collect()
    }
}
