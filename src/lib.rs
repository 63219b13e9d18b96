//! # vivid-link
//!
//! Resilient real-time connection layer for the VividCrowd products (group
//! chat, celebrity chat, customer service, digital customer, digital
//! interviewer).
//!
//! One connection engine serves every product:
//!
//! - [`supervisor`]: connect, detect close, reconnect with capped exponential
//!   backoff and jitter, give up after `max_retries`, heartbeat, session resume.
//! - [`reassembler`]: folds `stream_start` / `stream_chunk` / `stream_end`
//!   frames into one finished [`Message`] per sender.
//! - [`session`]: durable session-id storage.
//! - [`client`]: the tokio driver and the cloneable [`LinkClient`] handle.
//!
//! Product differences live in [`ProductProfile`] presets and optional
//! [`LinkConfig`] overrides.

pub mod backoff;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod message;
pub mod reassembler;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use backoff::RetryPolicy;
pub use client::LinkClient;
pub use config::{ConnectionSettings, LinkConfig, Product, ProductProfile, SendPolicy};
pub use error::{LinkError, Result};
pub use frame::{InboundFrame, Outbound};
pub use message::{Message, ResponseMetadata};
pub use reassembler::{ChunkPolicy, FrameReassembler, StreamEvent};
pub use session::{FileSessionStore, MemorySessionStore, SessionStore};
pub use supervisor::{Action, CloseReason, ConnectionState, LinkEvent, Phase, Supervisor};
pub use transport::{Connector, TungsteniteConnector};
