// =============================================================================
// Error taxonomy — discriminated error values surfaced by the core
// =============================================================================
//
// External call failures (HTTP, sockets, store writes) are converted into
// these variants at the call site. Actor internals never let an error escape
// to the mailbox loop; handlers log with the correlation id and drop the
// message.
// =============================================================================

use thiserror::Error;

/// OAuth token lifecycle failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OAuthError {
    #[error("no token available")]
    NoTokenAvailable,
    #[error("no refresh token")]
    NoRefreshToken,
    #[error("refresh failed: {reason}")]
    RefreshFailed { reason: String },
    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },
    #[error("service not registered: {service}")]
    ServiceNotRegistered { service: String },
}

/// Circuit breaker short-circuit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CircuitError {
    #[error("circuit open for {service}")]
    CircuitOpen { service: String },
}

/// WebSocket connection failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WsError {
    #[error("not connected")]
    NotConnected,
    #[error("upgrade failed with status {status}")]
    UpgradeFailed { status: u16 },
    #[error("network error: {0}")]
    Network(String),
}

/// Correlation engine failures. Both are soft: the engine continues.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("session start failed: {reason}")]
    SessionStartFailed { reason: String },
    #[error("store failed: {reason}")]
    StoreFailed { reason: String },
}

/// Producer state restore failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProducerError {
    #[error("invalid interrupt: {reason}")]
    InvalidInterrupt { reason: String },
    #[error("persisted state corrupt: {reason}")]
    StateCorrupt { reason: String },
}
