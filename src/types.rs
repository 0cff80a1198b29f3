// =============================================================================
// Shared types used across the Lumen overlay control plane
// =============================================================================
//
// Upstream adapters publish loosely-shaped JSON payloads onto the bus. The
// records here are the normalized forms the core actors consume; extraction
// from `serde_json::Value` is tolerant of the two chat shapes we receive
// (flat records on `chat`, Twitch-style envelopes on `events`/`twitch:events`).
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Bus topics and event kinds
// ---------------------------------------------------------------------------

/// Topic names used by the core. Adapters and subscribers agree on these
/// strings; publishing to a topic nobody registered is logged and ignored.
pub mod topics {
    pub const CHAT: &str = "chat";
    pub const FOLLOWERS: &str = "followers";
    pub const SUBSCRIPTIONS: &str = "subscriptions";
    pub const CHEERS: &str = "cheers";
    pub const TWITCH_EVENTS: &str = "twitch:events";
    pub const CHANNEL_UPDATES: &str = "channel:updates";
    pub const TRANSCRIPTION_LIVE: &str = "transcription:live";
    pub const EVENTS: &str = "events";
    pub const STREAM_UPDATES: &str = "stream:updates";
    pub const CORRELATION_INSIGHTS: &str = "correlation:insights";
}

/// Event kinds — the closed set of `Envelope::kind` values.
pub mod kinds {
    pub const CHAT_MESSAGE: &str = "chat.message";
    pub const CHANNEL_FOLLOW: &str = "channel.follow";
    pub const CHANNEL_SUBSCRIBE: &str = "channel.subscribe";
    pub const CHANNEL_UPDATE: &str = "channel.update";
    pub const CHANNEL_GOAL_PROGRESS: &str = "channel.goal.progress";
    pub const TRANSCRIPTION_SNIPPET: &str = "transcription.snippet";
    pub const STREAM_STARTED: &str = "stream.started";
    pub const STREAM_STOPPED: &str = "stream.stopped";
    pub const STREAM_UPDATE: &str = "stream_update";
    pub const SHOW_CHANGE: &str = "show_change";
    pub const CONTENT_UPDATE: &str = "content_update";
    pub const NEW_CORRELATION: &str = "new_correlation";
}

// ---------------------------------------------------------------------------
// Shows
// ---------------------------------------------------------------------------

/// The show currently on air. Drives the default ticker rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Show {
    Variety,
    Ironmon,
    Coding,
}

impl Default for Show {
    fn default() -> Self {
        Self::Variety
    }
}

impl std::fmt::Display for Show {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Variety => write!(f, "variety"),
            Self::Ironmon => write!(f, "ironmon"),
            Self::Coding => write!(f, "coding"),
        }
    }
}

impl Show {
    /// Best-effort show detection from a Twitch game/category name.
    ///
    /// Used as the fallback when the category id has no configured mapping.
    pub fn from_game_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.contains("pokemon") && lower.contains("fire") {
            Some(Self::Ironmon)
        } else if lower.contains("software") || lower.contains("development") {
            Some(Self::Coding)
        } else if lower.contains("just chatting") {
            Some(Self::Variety)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized upstream event records
// ---------------------------------------------------------------------------

/// A chat message, normalized from either bus shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id (empty when the flat shape omits it).
    #[serde(default)]
    pub id: String,
    pub user: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub emotes: Vec<String>,
    #[serde(default)]
    pub native_emotes: Vec<String>,
    pub timestamp_ms: i64,
}

/// A new follower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowEvent {
    pub user_name: String,
    pub timestamp_ms: i64,
}

/// A new or resubscribing subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub user_name: String,
    /// Twitch tier string: "1000", "2000", or "3000".
    pub tier: String,
    #[serde(default)]
    pub cumulative_months: u32,
    pub timestamp_ms: i64,
}

/// A channel category/title update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelUpdate {
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub category_name: String,
    #[serde(default)]
    pub title: String,
}

/// A live transcription snippet from the speech pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSnippet {
    pub id: String,
    pub text: String,
    pub timestamp_ms: i64,
}

// ---------------------------------------------------------------------------
// Payload extraction
// ---------------------------------------------------------------------------

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn str_field(v: &serde_json::Value, name: &str) -> Result<String> {
    v.get(name)
        .and_then(|x| x.as_str())
        .map(str::to_string)
        .with_context(|| format!("missing field {name}"))
}

fn str_field_or_default(v: &serde_json::Value, name: &str) -> String {
    v.get(name)
        .and_then(|x| x.as_str())
        .unwrap_or_default()
        .to_string()
}

fn string_list(v: &serde_json::Value, name: &str) -> Vec<String> {
    v.get(name)
        .and_then(|x| x.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn ts_field(v: &serde_json::Value, name: &str) -> i64 {
    v.get(name).and_then(|x| x.as_i64()).unwrap_or_else(now_ms)
}

impl ChatMessage {
    /// Parse the flat shape published on `chat`:
    /// `{user, user_name, emotes: [..], native_emotes: [..], timestamp_ms}`.
    pub fn from_flat(payload: &serde_json::Value) -> Result<Self> {
        let user = str_field(payload, "user")?;
        Ok(Self {
            id: str_field_or_default(payload, "id"),
            user_name: {
                let name = str_field_or_default(payload, "user_name");
                if name.is_empty() { user.clone() } else { name }
            },
            user,
            text: str_field_or_default(payload, "text"),
            emotes: string_list(payload, "emotes"),
            native_emotes: string_list(payload, "native_emotes"),
            timestamp_ms: ts_field(payload, "timestamp_ms"),
        })
    }

    /// Parse the Twitch-style envelope published on `events`/`twitch:events`:
    /// `{type, data: {message_id, chatter_user_name, message: {text, emotes}}}`.
    pub fn from_twitch_envelope(payload: &serde_json::Value) -> Result<Self> {
        let data = payload.get("data").context("missing field data")?;
        let user = str_field(data, "chatter_user_name")?;
        let message = data.get("message").context("missing field data.message")?;
        Ok(Self {
            id: str_field_or_default(data, "message_id"),
            user_name: user.clone(),
            user,
            text: str_field_or_default(message, "text"),
            emotes: string_list(message, "emotes"),
            native_emotes: string_list(message, "native_emotes"),
            timestamp_ms: ts_field(data, "timestamp_ms"),
        })
    }

    /// Parse either chat shape, trying the envelope first when `data` exists.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        if payload.get("data").is_some() {
            Self::from_twitch_envelope(payload)
        } else {
            Self::from_flat(payload)
        }
    }
}

impl FollowEvent {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            user_name: str_field(payload, "user_name")?,
            timestamp_ms: ts_field(payload, "timestamp_ms"),
        })
    }
}

impl SubscriptionEvent {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            user_name: str_field(payload, "user_name")?,
            tier: {
                let tier = str_field_or_default(payload, "tier");
                if tier.is_empty() { "1000".to_string() } else { tier }
            },
            cumulative_months: payload
                .get("cumulative_months")
                .and_then(|x| x.as_u64())
                .unwrap_or(0) as u32,
            timestamp_ms: ts_field(payload, "timestamp_ms"),
        })
    }
}

impl ChannelUpdate {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        if payload.get("category_id").is_none() && payload.get("category_name").is_none() {
            anyhow::bail!("missing both category_id and category_name");
        }
        Ok(Self {
            category_id: str_field_or_default(payload, "category_id"),
            category_name: str_field_or_default(payload, "category_name"),
            title: str_field_or_default(payload, "title"),
        })
    }
}

impl TranscriptionSnippet {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            id: str_field(payload, "id")?,
            text: str_field(payload, "text")?,
            timestamp_ms: ts_field(payload, "timestamp_ms"),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn show_display_and_default() {
        assert_eq!(Show::default(), Show::Variety);
        assert_eq!(Show::Ironmon.to_string(), "ironmon");
        assert_eq!(Show::Coding.to_string(), "coding");
    }

    #[test]
    fn show_detection_from_game_name() {
        assert_eq!(
            Show::from_game_name("Pokemon FireRed/LeafGreen"),
            Some(Show::Ironmon)
        );
        assert_eq!(
            Show::from_game_name("Software and Game Development"),
            Some(Show::Coding)
        );
        assert_eq!(Show::from_game_name("Just Chatting"), Some(Show::Variety));
        assert_eq!(Show::from_game_name("Slay the Spire"), None);
    }

    #[test]
    fn chat_from_flat_shape() {
        let payload = json!({
            "user": "avalonstar",
            "user_name": "Avalonstar",
            "emotes": ["Kappa", "PogChamp"],
            "native_emotes": ["avalonHYPE"],
            "timestamp_ms": 1_700_000_000_000_i64
        });
        let msg = ChatMessage::from_flat(&payload).unwrap();
        assert_eq!(msg.user, "avalonstar");
        assert_eq!(msg.user_name, "Avalonstar");
        assert_eq!(msg.emotes, vec!["Kappa", "PogChamp"]);
        assert_eq!(msg.native_emotes, vec!["avalonHYPE"]);
        assert_eq!(msg.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn chat_from_twitch_envelope() {
        let payload = json!({
            "type": "chat.message",
            "data": {
                "message_id": "m-1",
                "chatter_user_name": "viewer",
                "timestamp_ms": 42,
                "message": { "text": "hello there", "emotes": ["Kappa"] }
            }
        });
        let msg = ChatMessage::from_payload(&payload).unwrap();
        assert_eq!(msg.id, "m-1");
        assert_eq!(msg.user, "viewer");
        assert_eq!(msg.text, "hello there");
        assert_eq!(msg.emotes, vec!["Kappa"]);
        assert_eq!(msg.timestamp_ms, 42);
    }

    #[test]
    fn chat_missing_user_is_an_error() {
        let payload = json!({ "emotes": [] });
        assert!(ChatMessage::from_flat(&payload).is_err());
    }

    #[test]
    fn follow_defaults_timestamp_when_missing() {
        let payload = json!({ "user_name": "newfriend" });
        let follow = FollowEvent::from_payload(&payload).unwrap();
        assert_eq!(follow.user_name, "newfriend");
        assert!(follow.timestamp_ms > 0);
    }

    #[test]
    fn subscription_defaults_tier() {
        let payload = json!({ "user_name": "sub", "timestamp_ms": 5 });
        let sub = SubscriptionEvent::from_payload(&payload).unwrap();
        assert_eq!(sub.tier, "1000");
        assert_eq!(sub.cumulative_months, 0);
    }

    #[test]
    fn channel_update_requires_some_category() {
        assert!(ChannelUpdate::from_payload(&json!({ "title": "x" })).is_err());
        let upd = ChannelUpdate::from_payload(&json!({
            "category_id": "509658",
            "category_name": "Just Chatting",
            "title": "chilling"
        }))
        .unwrap();
        assert_eq!(upd.category_id, "509658");
    }
}
