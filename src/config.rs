//! Product profiles and TOML configuration.
//!
//! Every product connects through the same supervisor; what differs is the
//! endpoint path, the retry budget, the chunk policy, the heartbeat and
//! whether the session id is persisted. [`ProductProfile::preset`] holds the
//! built-in values, and a [`LinkConfig`] file can override any of them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{LinkError, Result};
use crate::frame::Outbound;
use crate::reassembler::ChunkPolicy;

pub const DEFAULT_HOST: &str = "localhost:8000";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Placeholder in the interview path replaced by the interview session id.
const SESSION_PLACEHOLDER: &str = "{session}";

// ---------------------------------------------------------------------------
// Product
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    GroupChat,
    Celebrity,
    CustomerService,
    DigitalCustomer,
    Interview,
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Product::GroupChat       => "group_chat",
            Product::Celebrity       => "celebrity",
            Product::CustomerService => "customer_service",
            Product::DigitalCustomer => "digital_customer",
            Product::Interview       => "interview",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Send policy
// ---------------------------------------------------------------------------

/// What `send` does while the connection is not open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendPolicy {
    /// Fail with [`LinkError::NotConnected`].
    #[default]
    Reject,
    /// Hold up to `capacity` payloads and flush them on the next open.
    Queue { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPolicyKind {
    Reject,
    Queue,
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Everything one supervisor needs, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub url: String,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    /// `None` disables the keep-alive ping.
    pub heartbeat: Option<Duration>,
    pub chunk_policy: ChunkPolicy,
    pub send_policy: SendPolicy,
    /// Storage key for the resumable session id; `None` disables resume.
    pub session_key: Option<String>,
}

impl ConnectionSettings {
    /// Settings for `url` with generic defaults and no product extensions.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat: None,
            chunk_policy: ChunkPolicy::Append,
            send_policy: SendPolicy::Reject,
            session_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Product profile
// ---------------------------------------------------------------------------

/// Per-product preset.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductProfile {
    pub product: Product,
    /// Endpoint path; the interview path contains `{session}`.
    pub path: String,
    pub retry: RetryPolicy,
    pub heartbeat: Option<Duration>,
    pub chunk_policy: ChunkPolicy,
    pub session_key: Option<String>,
    /// Display name for messages typed by the local user.
    pub user_sender: String,
    /// JSON field naming the recipients of a broadcast send.
    pub recipients_field: Option<String>,
}

impl ProductProfile {
    pub fn preset(product: Product) -> Self {
        let generic = RetryPolicy::default();
        match product {
            Product::GroupChat => Self {
                product,
                path: "/api/chat/ws".into(),
                retry: generic,
                heartbeat: None,
                chunk_policy: ChunkPolicy::Append,
                session_key: None,
                user_sender: "你".into(),
                recipients_field: None,
            },
            Product::Celebrity => Self {
                product,
                path: "/api/celebrity/ws".into(),
                retry: generic,
                heartbeat: None,
                chunk_policy: ChunkPolicy::Append,
                session_key: None,
                user_sender: "你".into(),
                recipients_field: Some("celebrity_ids".into()),
            },
            Product::CustomerService => Self {
                product,
                path: "/api/customer-service/ws".into(),
                retry: RetryPolicy {
                    max_retries: 5,
                    base_delay: Duration::from_millis(1_000),
                    ..generic
                },
                heartbeat: Some(Duration::from_secs(30)),
                chunk_policy: ChunkPolicy::Append,
                session_key: Some("customer_service_session_id".into()),
                user_sender: "user".into(),
                recipients_field: None,
            },
            // This backend is not streaming: each chunk is the whole answer.
            Product::DigitalCustomer => Self {
                product,
                path: "/api/digital-customer/ws".into(),
                retry: generic,
                heartbeat: None,
                chunk_policy: ChunkPolicy::ReplaceLatest,
                session_key: None,
                user_sender: "销售人员".into(),
                recipients_field: Some("customer_ids".into()),
            },
            // A dropped interview is not resumed server-side, so it stays down.
            Product::Interview => Self {
                product,
                path: format!("/api/digital-interviewer/training/ws/{SESSION_PLACEHOLDER}"),
                retry: RetryPolicy { max_retries: 0, ..generic },
                heartbeat: None,
                chunk_policy: ChunkPolicy::Append,
                session_key: None,
                user_sender: "candidate".into(),
                recipients_field: None,
            },
        }
    }

    /// Build the product's usual request for a line of user text.
    ///
    /// `recipients` and `mode` are only used by broadcast products.
    pub fn user_request(&self, text: &str, recipients: &[String], mode: &str) -> Outbound {
        match self.product {
            Product::GroupChat => Outbound::Raw(text.to_string()),
            Product::Celebrity | Product::DigitalCustomer => Outbound::Broadcast {
                message: text.to_string(),
                recipients_field: self
                    .recipients_field
                    .clone()
                    .unwrap_or_else(|| "recipient_ids".into()),
                recipients: recipients.to_vec(),
                mode: mode.to_string(),
            },
            Product::CustomerService => Outbound::Query { message: text.to_string(), stream: false },
            Product::Interview => Outbound::Answer { content: text.to_string() },
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint URL
// ---------------------------------------------------------------------------

/// `wss` for pages served over https, `ws` otherwise.
pub fn ws_scheme(page_protocol: &str) -> &'static str {
    let proto = page_protocol.trim_end_matches(':');
    if proto.eq_ignore_ascii_case("https") {
        "wss"
    } else {
        "ws"
    }
}

/// `{scheme}://{host}{path}`.
pub fn endpoint_url(host: &str, secure: bool, path: &str) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
    format!("{scheme}://{}{path}", host.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// LinkConfig (TOML)
// ---------------------------------------------------------------------------

/// On-disk overrides. Every field is optional; absent fields fall back to the
/// product preset.
///
/// ```toml
/// host = "chat.example.com"
/// secure = true
/// max_retries = 5
/// chunk_policy = "replace_latest"
/// send_policy = "queue"
/// session_file = "/var/lib/vivid/sessions.json"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    pub host: Option<String>,
    /// Alternative to `secure`: the page protocol (`"https"` → `wss`).
    pub page_protocol: Option<String>,
    pub secure: Option<bool>,
    pub path: Option<String>,
    /// Interview session id substituted into the interview path.
    pub interview_session: Option<String>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    /// `0` disables the heartbeat.
    pub heartbeat_secs: Option<u64>,
    pub chunk_policy: Option<ChunkPolicy>,
    pub send_policy: Option<SendPolicyKind>,
    pub queue_capacity: Option<usize>,
    pub session_key: Option<String>,
    pub session_file: Option<PathBuf>,
}

impl LinkConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Merge these overrides onto `product`'s preset.
    pub fn resolve(&self, product: Product) -> Result<ConnectionSettings> {
        let profile = ProductProfile::preset(product);

        let host = self.host.as_deref().unwrap_or(DEFAULT_HOST);
        if host.trim().is_empty() {
            return Err(LinkError::Config("host must not be empty".into()));
        }
        let secure = match (self.secure, self.page_protocol.as_deref()) {
            (Some(secure), _) => secure,
            (None, Some(proto)) => ws_scheme(proto) == "wss",
            (None, None) => false,
        };

        let mut path = self.path.clone().unwrap_or(profile.path);
        if path.contains(SESSION_PLACEHOLDER) {
            let session = self.interview_session.as_deref().ok_or_else(|| {
                LinkError::Config(format!("{product} endpoint needs interview_session"))
            })?;
            path = path.replace(SESSION_PLACEHOLDER, session);
        }

        let mut retry = profile.retry;
        if let Some(n) = self.max_retries {
            retry.max_retries = n;
        }
        if let Some(ms) = self.base_delay_ms {
            retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.jitter_ms {
            retry.jitter = Duration::from_millis(ms);
        }
        if retry.max_delay < retry.base_delay {
            return Err(LinkError::Config(format!(
                "max_delay_ms ({:?}) is below base_delay_ms ({:?})",
                retry.max_delay, retry.base_delay
            )));
        }

        let heartbeat = match self.heartbeat_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => profile.heartbeat,
        };

        let send_policy = match self.send_policy {
            None | Some(SendPolicyKind::Reject) => SendPolicy::Reject,
            Some(SendPolicyKind::Queue) => {
                let capacity = self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
                if capacity == 0 {
                    return Err(LinkError::Config("queue_capacity must be at least 1".into()));
                }
                SendPolicy::Queue { capacity }
            }
        };

        Ok(ConnectionSettings {
            url: endpoint_url(host, secure, &path),
            retry,
            connect_timeout: self
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            heartbeat,
            chunk_policy: self.chunk_policy.unwrap_or(profile.chunk_policy),
            send_policy,
            session_key: self.session_key.clone().or(profile.session_key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https:", "wss")]
    #[case("https", "wss")]
    #[case("HTTPS:", "wss")]
    #[case("http:", "ws")]
    #[case("file:", "ws")]
    fn scheme_follows_page_protocol(#[case] proto: &str, #[case] expected: &str) {
        assert_eq!(ws_scheme(proto), expected);
    }

    #[test]
    fn endpoint_url_joins_parts() {
        assert_eq!(endpoint_url("localhost:8000/", false, "api/chat/ws"), "ws://localhost:8000/api/chat/ws");
        assert_eq!(endpoint_url("example.com", true, "/ws"), "wss://example.com/ws");
    }

    #[test]
    fn customer_service_preset() {
        let s = LinkConfig::default().resolve(Product::CustomerService).unwrap();
        assert_eq!(s.url, "ws://localhost:8000/api/customer-service/ws");
        assert_eq!(s.retry.max_retries, 5);
        assert_eq!(s.retry.base_delay, Duration::from_secs(1));
        assert_eq!(s.heartbeat, Some(Duration::from_secs(30)));
        assert_eq!(s.session_key.as_deref(), Some("customer_service_session_id"));
        assert_eq!(s.send_policy, SendPolicy::Reject);
    }

    #[test]
    fn digital_customer_replaces_chunks() {
        let s = LinkConfig::default().resolve(Product::DigitalCustomer).unwrap();
        assert_eq!(s.chunk_policy, ChunkPolicy::ReplaceLatest);
        assert_eq!(s.retry.max_retries, 3);
    }

    #[test]
    fn interview_requires_session() {
        let err = LinkConfig::default().resolve(Product::Interview).unwrap_err();
        assert!(matches!(err, LinkError::Config(_)), "{err}");

        let cfg = LinkConfig { interview_session: Some("s-42".into()), ..Default::default() };
        let s = cfg.resolve(Product::Interview).unwrap();
        assert_eq!(s.url, "ws://localhost:8000/api/digital-interviewer/training/ws/s-42");
    }

    #[test]
    fn interview_does_not_reconnect_unless_configured() {
        let cfg = LinkConfig { interview_session: Some("s-42".into()), ..Default::default() };
        assert_eq!(cfg.resolve(Product::Interview).unwrap().retry.max_retries, 0);

        let cfg = LinkConfig { max_retries: Some(2), ..cfg };
        assert_eq!(cfg.resolve(Product::Interview).unwrap().retry.max_retries, 2);
    }

    #[test]
    fn toml_overrides_apply() {
        let cfg = LinkConfig::from_toml_str(
            r#"
            host = "chat.example.com"
            page_protocol = "https:"
            max_retries = 7
            base_delay_ms = 250
            heartbeat_secs = 0
            chunk_policy = "replace_latest"
            send_policy = "queue"
            queue_capacity = 4
            "#,
        )
        .unwrap();
        let s = cfg.resolve(Product::CustomerService).unwrap();
        assert_eq!(s.url, "wss://chat.example.com/api/customer-service/ws");
        assert_eq!(s.retry.max_retries, 7);
        assert_eq!(s.retry.base_delay, Duration::from_millis(250));
        assert_eq!(s.heartbeat, None);
        assert_eq!(s.chunk_policy, ChunkPolicy::ReplaceLatest);
        assert_eq!(s.send_policy, SendPolicy::Queue { capacity: 4 });
    }

    #[test]
    fn unknown_toml_key_rejected() {
        let err = LinkConfig::from_toml_str("max_retry = 3").unwrap_err();
        assert!(matches!(err, LinkError::Toml(_)), "{err}");
    }

    #[test]
    fn inverted_delays_rejected() {
        let cfg = LinkConfig { base_delay_ms: Some(10_000), max_delay_ms: Some(100), ..Default::default() };
        assert!(cfg.resolve(Product::GroupChat).is_err());
    }

    #[test]
    fn zero_queue_capacity_rejected() {
        let cfg = LinkConfig {
            send_policy: Some(SendPolicyKind::Queue),
            queue_capacity: Some(0),
            ..Default::default()
        };
        assert!(cfg.resolve(Product::GroupChat).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.toml");
        std::fs::write(&path, "host = \"10.0.0.2:9000\"\n").unwrap();
        let s = LinkConfig::load(&path).unwrap().resolve(Product::GroupChat).unwrap();
        assert_eq!(s.url, "ws://10.0.0.2:9000/api/chat/ws");
    }

    #[test]
    fn user_request_per_product() {
        let ids = vec!["7".to_string()];
        assert_eq!(
            ProductProfile::preset(Product::GroupChat).user_request("hi", &ids, "group"),
            Outbound::Raw("hi".into())
        );
        assert_eq!(
            ProductProfile::preset(Product::CustomerService).user_request("hi", &ids, "group"),
            Outbound::Query { message: "hi".into(), stream: false }
        );
        match ProductProfile::preset(Product::DigitalCustomer).user_request("hi", &ids, "private") {
            Outbound::Broadcast { recipients_field, recipients, mode, .. } => {
                assert_eq!(recipients_field, "customer_ids");
                assert_eq!(recipients, ids);
                assert_eq!(mode, "private");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn product_display_is_snake_case() {
        assert_eq!(Product::CustomerService.to_string(), "customer_service");
    }
}
