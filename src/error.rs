//! Crate-level error type.
//!
//! Transport failures are absorbed by the supervisor and surface only as
//! state changes; [`LinkError`] is what caller-facing operations return.

use std::time::Duration;

/// Errors returned by [`crate::client::LinkClient`] operations, config loading
/// and session storage.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The connection is not open and the send policy rejects the payload.
    #[error("not connected")]
    NotConnected,

    /// The offline send queue is full.
    #[error("send queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The driver task has exited; the handle is no longer usable.
    #[error("connection driver has shut down")]
    DriverGone,

    /// The WebSocket layer reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A connection attempt did not complete in time.
    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),

    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Durable session storage could not be read or written.
    #[error("session storage error for key '{key}': {detail}")]
    Storage { key: String, detail: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        LinkError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_display_mentions_capacity() {
        let err = LinkError::QueueFull { capacity: 16 };
        assert!(err.to_string().contains("16"), "{err}");
    }

    #[test]
    fn storage_display_has_key_and_detail() {
        let err = LinkError::Storage {
            key: "customer_service_session_id".into(),
            detail: "permission denied".into(),
        };
        let s = err.to_string();
        assert!(s.contains("customer_service_session_id"), "{s}");
        assert!(s.contains("permission denied"), "{s}");
    }

    #[test]
    fn json_error_converts() {
        let bad = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: LinkError = bad.into();
        assert!(matches!(err, LinkError::Json(_)));
    }

    #[test]
    fn tungstenite_error_becomes_transport() {
        let err: LinkError = tokio_tungstenite::tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(err, LinkError::Transport(_)));
    }

    #[test]
    fn link_error_is_std_error() {
        fn assert_error<E: std::error::Error + Send + Sync + 'static>(_: &E) {}
        assert_error(&LinkError::NotConnected);
    }
}
