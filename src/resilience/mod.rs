// =============================================================================
// Resilience Module
// =============================================================================
//
// Wrappers applied to every external call the core makes:
// - Circuit breaker: per-service closed/open/half-open gate.
// - Retry executor: bounded attempts with exponential backoff and jitter.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use retry::{default_retryable, retry, RetryOptions};
