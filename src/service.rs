// =============================================================================
// Service contract — uniform status surface for long-lived components
// =============================================================================
//
// Lifecycle is handled by construction (`spawn`) and task teardown; what the
// components share is a status/health answer for the periodic health line.
// Actor-backed components answer through their handles (`get_status` on the
// handle); lock-backed components implement [`Service`] directly.
// =============================================================================

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One component's status line.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub health: ServiceHealth,
    pub detail: String,
}

/// Implemented by components that can answer synchronously.
pub trait Service {
    fn name(&self) -> &str;
    fn get_status(&self) -> ServiceStatus;

    fn get_health(&self) -> ServiceHealth {
        self.get_status().health
    }

    fn get_info(&self) -> serde_json::Value {
        serde_json::to_value(self.get_status()).unwrap_or(serde_json::Value::Null)
    }
}

impl Service for crate::wsconn::WsHandle {
    fn name(&self) -> &str {
        "websocket"
    }

    fn get_status(&self) -> ServiceStatus {
        let state = self.state();
        let health = match state {
            crate::wsconn::WsState::Connected => ServiceHealth::Healthy,
            crate::wsconn::WsState::Connecting | crate::wsconn::WsState::Reconnecting => {
                ServiceHealth::Degraded
            }
            crate::wsconn::WsState::Disconnected => ServiceHealth::Unhealthy,
        };
        ServiceStatus {
            name: self.name().to_string(),
            health,
            detail: state.to_string(),
        }
    }
}
