// =============================================================================
// Correlation scoring — speech→chat pattern classification
// =============================================================================
//
// Patterns are evaluated top-down; the first match wins:
//
//   direct_quote      0.9   chat contains the full transcription (len > 5)
//   keyword_echo      0.7   shared-keyword overlap
//   emote_reaction    0.6   chat carries emotes or a reaction word
//   question_response 0.5   question words + '?' + keyword overlap
//   temporal_only     0.3   fallback
//
// The base confidence is then scaled by time proximity:
//   confidence = base * (1 - ((offset - 3000) / 4000) * 0.2)
// Offsets outside [3000, 7000] ms are never scored at all.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, TranscriptionSnippet};

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationPattern {
    DirectQuote,
    KeywordEcho,
    EmoteReaction,
    QuestionResponse,
    TemporalOnly,
}

impl std::fmt::Display for CorrelationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DirectQuote => write!(f, "direct_quote"),
            Self::KeywordEcho => write!(f, "keyword_echo"),
            Self::EmoteReaction => write!(f, "emote_reaction"),
            Self::QuestionResponse => write!(f, "question_response"),
            Self::TemporalOnly => write!(f, "temporal_only"),
        }
    }
}

impl CorrelationPattern {
    pub fn base_confidence(self) -> f64 {
        match self {
            Self::DirectQuote => 0.9,
            Self::KeywordEcho => 0.7,
            Self::EmoteReaction => 0.6,
            Self::QuestionResponse => 0.5,
            Self::TemporalOnly => 0.3,
        }
    }
}

// ---------------------------------------------------------------------------
// Keyword overlap
// ---------------------------------------------------------------------------

const STOPWORDS: &[&str] = &[
    "the", "and", "but", "for", "with", "are", "was", "were", "been", "have", "has", "had", "is",
    "it", "to", "of", "in", "a", "an",
];

const REACTION_WORDS: &[&str] = &[
    "lol", "lmao", "rofl", "haha", "kek", "true", "facts", "based", "poggers", "pog", "kappa",
    "omegalul", "pepega", "monkas", "wut", "wat", "bruh", "no", "yes", "yep",
];

const QUESTION_WORDS: &[&str] = &["what", "why", "how"];

/// Tokenize: whitespace split, lowercase, keep length > 2, drop stopwords.
fn keywords(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Shared-keyword overlap: intersection >= 2, or
/// intersection / min(|A|, |B|) >= 0.5.
pub fn keyword_overlap(a: &str, b: &str) -> bool {
    let ka = keywords(a);
    let kb = keywords(b);
    if ka.is_empty() || kb.is_empty() {
        return false;
    }

    let set_a: std::collections::HashSet<&str> = ka.iter().map(String::as_str).collect();
    let set_b: std::collections::HashSet<&str> = kb.iter().map(String::as_str).collect();
    let intersection = set_a.intersection(&set_b).count();

    if intersection >= 2 {
        return true;
    }
    let min_len = set_a.len().min(set_b.len());
    intersection as f64 / min_len as f64 >= 0.5
}

// ---------------------------------------------------------------------------
// Classification and scoring
// ---------------------------------------------------------------------------

/// Classify the relation between a transcription and a chat message.
pub fn classify(transcription: &TranscriptionSnippet, chat: &ChatMessage) -> CorrelationPattern {
    let trans_lower = transcription.text.to_lowercase();
    let chat_lower = chat.text.to_lowercase();

    if transcription.text.len() > 5 && !trans_lower.is_empty() && chat_lower.contains(&trans_lower)
    {
        return CorrelationPattern::DirectQuote;
    }

    if keyword_overlap(&transcription.text, &chat.text) {
        return CorrelationPattern::KeywordEcho;
    }

    let has_emote = !chat.emotes.is_empty() || !chat.native_emotes.is_empty();
    if has_emote || REACTION_WORDS.iter().any(|w| chat_lower.contains(w)) {
        return CorrelationPattern::EmoteReaction;
    }

    if chat_lower.contains('?')
        && QUESTION_WORDS.iter().any(|w| chat_lower.contains(w))
        && keyword_overlap(&transcription.text, &chat.text)
    {
        return CorrelationPattern::QuestionResponse;
    }

    CorrelationPattern::TemporalOnly
}

/// Time-proximity factor for an offset in [3000, 7000] ms.
pub fn time_factor(offset_ms: i64) -> f64 {
    1.0 - ((offset_ms - 3000) as f64 / 4000.0) * 0.2
}

/// A classified candidate: pattern plus proximity-adjusted confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredCandidate {
    pub pattern: CorrelationPattern,
    pub confidence: f64,
    pub time_offset_ms: i64,
}

/// Score one transcription candidate against a chat message. Returns `None`
/// when the offset is outside the lookback window.
pub fn score_correlation(
    transcription: &TranscriptionSnippet,
    chat: &ChatMessage,
    delay_min_ms: i64,
    delay_max_ms: i64,
) -> Option<ScoredCandidate> {
    let offset = chat.timestamp_ms - transcription.timestamp_ms;
    if !(delay_min_ms..=delay_max_ms).contains(&offset) {
        return None;
    }

    let pattern = classify(transcription, chat);
    let confidence = pattern.base_confidence() * time_factor(offset);
    Some(ScoredCandidate {
        pattern,
        confidence,
        time_offset_ms: offset,
    })
}
