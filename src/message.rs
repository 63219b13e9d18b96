//! Finalized chat messages handed to subscribers.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sender name used for protocol error messages.
pub const SYSTEM_SENDER: &str = "System";

/// Extra fields carried by a customer-service `response` frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
    #[serde(default)]
    pub transfer_to_human: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_topic: Option<String>,
}

/// One complete message. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `<epoch ms>-<random>`; unique per process.
    pub id: String,
    pub sender: String,
    pub content: String,
    pub is_user: bool,
    pub is_error: bool,
    /// Interview round this message belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
    pub timestamp_ms: u64,
}

impl Message {
    fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        let timestamp_ms = now_ms();
        Self {
            id: new_message_id(timestamp_ms),
            sender: sender.into(),
            content: content.into(),
            is_user: false,
            is_error: false,
            round: None,
            metadata: None,
            timestamp_ms,
        }
    }

    /// A message typed by the local user.
    pub fn user(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self { is_user: true, ..Self::new(sender, content) }
    }

    /// A completed turn from a remote sender.
    pub fn remote(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(sender, content)
    }

    /// An error surfaced by the backend, attributed to [`SYSTEM_SENDER`].
    pub fn error(content: impl Into<String>) -> Self {
        Self { is_error: true, ..Self::new(SYSTEM_SENDER, content) }
    }

    pub fn with_round(mut self, round: Option<u32>) -> Self {
        self.round = round;
        self
    }

    pub fn with_metadata(mut self, metadata: ResponseMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn new_message_id(timestamp_ms: u64) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{timestamp_ms}-{}", &random[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<String> = (0..500).map(|_| Message::remote("A", "x").id).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn id_starts_with_timestamp() {
        let m = Message::remote("A", "x");
        let (ts, rest) = m.id.split_once('-').unwrap();
        assert_eq!(ts.parse::<u64>().unwrap(), m.timestamp_ms);
        assert_eq!(rest.len(), 12);
    }

    #[test]
    fn user_message_flags() {
        let m = Message::user("你", "hello");
        assert!(m.is_user);
        assert!(!m.is_error);
    }

    #[test]
    fn error_message_is_from_system() {
        let m = Message::error("boom");
        assert!(m.is_error);
        assert!(!m.is_user);
        assert_eq!(m.sender, SYSTEM_SENDER);
    }

    #[test]
    fn optional_fields_skipped_in_json() {
        let json = serde_json::to_string(&Message::remote("A", "x")).unwrap();
        assert!(!json.contains("round"), "{json}");
        assert!(!json.contains("metadata"), "{json}");
    }

    #[test]
    fn now_ms_is_reasonable() {
        assert!(now_ms() > 1_700_000_000_000);
    }
}
