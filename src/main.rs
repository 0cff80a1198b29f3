// =============================================================================
// Lumen — Overlay Control Plane Entry Point
// =============================================================================
//
// Wires the event bus, the three core actors (aggregator, correlation
// engine, producer), the OAuth token manager, and the upstream WebSocket
// ingress, then runs until Ctrl+C. Producer state is persisted on every
// broadcast, so shutdown only needs to close the correlation session and
// drop the connections.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod bus;
mod config;
mod correlation;
mod error;
mod idpool;
mod oauth;
mod producer;
mod resilience;
mod service;
mod stores;
mod timers;
mod types;
mod window;
mod wsconn;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bus::{Envelope, EventBus};
use crate::config::RuntimeConfig;
use crate::idpool::CorrelationIdPool;
use crate::oauth::{HttpTokenProvider, ServiceConfig, TokenManager};
use crate::resilience::{BreakerRegistry, RetryOptions};
use crate::service::Service;
use crate::stores::{FileTokenStore, MemoryCorrelationStore};
use crate::types::{kinds, topics};
use crate::wsconn::{ReconnectPolicy, WsNotice};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Lumen Overlay Nexus — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("LUMEN_CONFIG").unwrap_or_else(|_| "lumen_config.json".into());
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // ── 2. Shared infrastructure ─────────────────────────────────────────
    let bus = Arc::new(EventBus::new(config.mailbox_capacity));
    let ids = Arc::new(CorrelationIdPool::new());
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let retry_opts = RetryOptions::from(&config.retry);

    // ── 3. Core actors ───────────────────────────────────────────────────
    let aggregator = aggregator::spawn(config.aggregator.clone(), &bus);

    let correlation_store = Arc::new(MemoryCorrelationStore::new());
    let correlator = correlation::spawn(
        config.correlation.clone(),
        &bus,
        Arc::clone(&correlation_store),
        Arc::clone(&breakers),
        retry_opts.clone(),
        Arc::clone(&ids),
    );

    let producer = producer::spawn(config.producer.clone(), &bus, aggregator.clone());
    info!("core actors running (aggregator, correlator, producer)");

    // ── 4. OAuth token lifecycle ─────────────────────────────────────────
    let token_store = Arc::new(FileTokenStore::open(&config.oauth.token_store_path));
    let token_manager = Arc::new(TokenManager::new(
        token_store,
        Arc::new(HttpTokenProvider::new()),
        Arc::clone(&breakers),
        retry_opts.clone(),
        config.oauth.refresh_buffer_ms,
    ));

    let twitch_client_id = std::env::var("TWITCH_CLIENT_ID").unwrap_or_default();
    let twitch_client_secret = std::env::var("TWITCH_CLIENT_SECRET").unwrap_or_default();
    if twitch_client_id.is_empty() {
        warn!("TWITCH_CLIENT_ID not set — token lifecycle disabled");
    } else {
        token_manager.register(ServiceConfig {
            service: "twitch".into(),
            client_id: twitch_client_id,
            client_secret: twitch_client_secret,
            token_url: std::env::var("TWITCH_TOKEN_URL")
                .unwrap_or_else(|_| "https://id.twitch.tv/oauth2/token".into()),
            validate_url: Some(
                std::env::var("TWITCH_VALIDATE_URL")
                    .unwrap_or_else(|_| "https://id.twitch.tv/oauth2/validate".into()),
            ),
        })?;
        let _auto_refresh = token_manager.start_auto_refresh("twitch");
    }

    // ── 5. Upstream WebSocket ingress ────────────────────────────────────
    //
    // Upstream adapters (Twitch EventSub bridge, transcriber, IronMON)
    // deliver `{topic, type, payload}` frames; each is re-published onto
    // the bus tagged with a pooled correlation id.
    let ws_handle = match std::env::var("LUMEN_UPSTREAM_WS_URL") {
        Ok(url) if !url.is_empty() => {
            let (owner_tx, mut owner_rx) = tokio::sync::mpsc::channel::<WsNotice>(256);
            let handle = wsconn::connect(url, owner_tx, ReconnectPolicy::default());

            let ingress_bus = Arc::clone(&bus);
            let ingress_ids = Arc::clone(&ids);
            tokio::spawn(async move {
                while let Some(notice) = owner_rx.recv().await {
                    match notice {
                        WsNotice::TextFrame(text) => {
                            ingest_frame(&ingress_bus, &ingress_ids, &text);
                        }
                        WsNotice::StateChanged { state, attempt } => {
                            info!(state = %state, attempt, "upstream websocket state");
                        }
                        WsNotice::ConnectFailed { error, attempt } => {
                            warn!(error = %error, attempt, "upstream websocket connect failed");
                        }
                        WsNotice::BinaryFrame(_) => {}
                    }
                }
            });
            Some(handle)
        }
        _ => {
            warn!("LUMEN_UPSTREAM_WS_URL not set — no upstream ingress");
            None
        }
    };

    // ── 6. Periodic health line ──────────────────────────────────────────
    {
        let aggregator = aggregator.clone();
        let correlator = correlator.clone();
        let producer = producer.clone();
        let breakers = Arc::clone(&breakers);
        let ws = ws_handle.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            tick.tick().await;
            loop {
                tick.tick().await;
                for status in [
                    aggregator.get_status().await.ok(),
                    correlator.get_status().await.ok(),
                    producer.get_status().await.ok(),
                    ws.as_ref().map(|w| w.get_status()),
                ]
                .into_iter()
                .flatten()
                {
                    info!(
                        service = %status.name,
                        health = %status.health,
                        detail = %status.detail,
                        "health"
                    );
                }
                for breaker in breakers.snapshots() {
                    info!(
                        service = %breaker.service,
                        state = %breaker.state,
                        failures = breaker.failure_count,
                        "breaker"
                    );
                }
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Close any open correlation session and let the actors drain.
    bus.publish(Envelope::new(
        topics::EVENTS,
        kinds::STREAM_STOPPED,
        serde_json::json!({}),
    ));
    if let Some(ws) = ws_handle {
        ws.close();
    }
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    info!("Lumen shut down complete.");
    Ok(())
}

/// Parse one upstream frame and publish it onto the bus.
///
/// Frames are `{topic, type, payload}`; anything else is logged and dropped.
fn ingest_frame(bus: &Arc<EventBus>, ids: &Arc<CorrelationIdPool>, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "unparseable upstream frame dropped");
            return;
        }
    };

    let (Some(topic), Some(kind)) = (
        value.get("topic").and_then(|v| v.as_str()),
        value.get("type").and_then(|v| v.as_str()),
    ) else {
        warn!("upstream frame missing topic/type — dropped");
        return;
    };

    let payload = value.get("payload").cloned().unwrap_or(serde_json::Value::Null);
    let envelope = Envelope::new(topic, kind, payload).with_correlation_id(ids.take());
    bus.publish(envelope);
}
