//! # Connection Supervisor
//!
//! ## Responsibility
//! Owns the lifecycle of one logical connection: connect, detect close,
//! reconnect with capped exponential backoff, give up after `max_retries`,
//! resume the backend session, keep the link alive with a heartbeat, and route
//! inbound frames to the [`FrameReassembler`].
//!
//! ## Design
//! The supervisor performs no I/O. Callers feed it events (`handle_open`,
//! `handle_close`, `handle_text`, timer expiry, heartbeat tick) and drain the
//! [`Action`]s it queues. The tokio driver in [`crate::client`] executes those
//! actions against a real socket; tests execute them by hand.
//!
//! Every connection attempt gets a fresh [`ConnId`]. Events carrying an older
//! id come from a superseded socket and are ignored, so tearing down the old
//! socket inside `connect()` never schedules a reconnect. Likewise a retry
//! timer is identified by a [`TimerId`] and only the latest one may fire.
//!
//! ## Guarantees
//! - At most one live or pending connection.
//! - At most one pending retry timer.
//! - `retry_count` resets to 0 on every successful open.
//! - No event ever escapes as a panic or error; malformed frames are logged
//!   and dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ConnectionSettings, SendPolicy};
use crate::error::{LinkError, Result};
use crate::frame::{InboundFrame, Outbound};
use crate::message::{Message, ResponseMetadata};
use crate::reassembler::{FrameReassembler, StreamEvent, ANONYMOUS_SENDER};
use crate::session::{MemorySessionStore, SessionResume, SessionStore};

/// Identifies one connection attempt.
pub type ConnId = u64;
/// Identifies one scheduled retry.
pub type TimerId = u64;

/// Sender name for interviewer questions.
pub const INTERVIEWER_SENDER: &str = "interviewer";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Connecting   => "connecting",
            Phase::Open         => "open",
            Phase::Reconnecting => "reconnecting",
            Phase::Closed       => "closed",
        };
        write!(f, "{s}")
    }
}

/// Why the connection is in [`Phase::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `connect()` has not been called yet.
    NotStarted,
    /// `disconnect()` was called.
    Manual,
    /// Every reconnect attempt failed; only `reconnect()` leaves this state.
    RetriesExhausted,
    /// The owner tore the connection down for good.
    Shutdown,
}

/// Snapshot of the supervisor's connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub phase: Phase,
    pub retry_count: u32,
    pub max_retries: u32,
    pub session_id: Option<String>,
    /// Set only while `phase == Closed`.
    pub closed_reason: Option<CloseReason>,
    pub last_error: Option<String>,
}

impl ConnectionState {
    fn initial(max_retries: u32, session_id: Option<String>) -> Self {
        Self {
            phase: Phase::Closed,
            retry_count: 0,
            max_retries,
            session_id,
            closed_reason: Some(CloseReason::NotStarted),
            last_error: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Open
    }

    pub fn is_reconnecting(&self) -> bool {
        self.phase == Phase::Reconnecting
    }

    /// Closed after running out of retries.
    pub fn gave_up(&self) -> bool {
        self.closed_reason == Some(CloseReason::RetriesExhausted)
    }
}

// ---------------------------------------------------------------------------
// Events and actions
// ---------------------------------------------------------------------------

/// Everything a subscriber can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    /// Reconnect attempt `attempt` (1-based) will start after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted; a manual `reconnect()` is required.
    GaveUp { attempts: u32 },
    Typing { sender: String },
    TypingCleared { sender: String },
    /// In-flight text of a streaming turn. Carries the full buffer, not the
    /// delta; see [`crate::client::EVENT_CHANNEL_CAP`] about slow subscribers.
    Partial { sender: String, content: String },
    Message(Message),
    /// The backend created (`resumed == false`) or resumed a session.
    Session { session_id: String, resumed: bool },
    /// A product frame with no generic meaning (interview progress and the like).
    Frame(InboundFrame),
}

impl From<StreamEvent> for LinkEvent {
    fn from(ev: StreamEvent) -> Self {
        match ev {
            StreamEvent::Typing { sender } => LinkEvent::Typing { sender },
            StreamEvent::Partial { sender, content } => LinkEvent::Partial { sender, content },
            StreamEvent::TypingCleared { sender } => LinkEvent::TypingCleared { sender },
            StreamEvent::Finished(message) => LinkEvent::Message(message),
        }
    }
}

/// Work the driver must carry out, in queue order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Start connection attempt `conn`.
    Open { conn: ConnId, url: String },
    /// Close (or abandon, if still pending) connection `conn`.
    Close { conn: ConnId },
    /// Write one text frame on `conn`.
    Transmit { conn: ConnId, text: String },
    /// Call [`Supervisor::handle_timer`] with `timer` after `delay`.
    ScheduleRetry { timer: TimerId, delay: Duration },
    /// Forget the pending retry timer.
    CancelRetry,
    /// Call [`Supervisor::handle_heartbeat`] every `every`.
    StartHeartbeat { every: Duration },
    StopHeartbeat,
    Emit(LinkEvent),
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    settings: ConnectionSettings,
    state: ConnectionState,
    /// Set by `disconnect()` so the resulting close does not reconnect.
    intentional_close: bool,
    current: Option<ConnId>,
    next_conn: ConnId,
    retry_timer: Option<TimerId>,
    next_timer: TimerId,
    heartbeat_running: bool,
    reassembler: FrameReassembler,
    resume: Option<SessionResume>,
    outbox: VecDeque<Outbound>,
    actions: VecDeque<Action>,
    rng: StdRng,
}

impl Supervisor {
    /// Build a supervisor. When the settings name a session key and no store
    /// is given, session ids are kept in a process-local store.
    pub fn new(settings: ConnectionSettings, store: Option<Arc<dyn SessionStore>>) -> Self {
        let resume = settings.session_key.as_ref().map(|key| {
            let store = store.unwrap_or_else(|| Arc::new(MemorySessionStore::new()));
            SessionResume::new(key.clone(), store)
        });
        let session_id = resume.as_ref().and_then(SessionResume::persisted);
        Self {
            state: ConnectionState::initial(settings.retry.max_retries, session_id),
            reassembler: FrameReassembler::new(settings.chunk_policy),
            settings,
            intentional_close: false,
            current: None,
            next_conn: 1,
            retry_timer: None,
            next_timer: 1,
            heartbeat_running: false,
            resume,
            outbox: VecDeque::new(),
            actions: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn reassembler(&self) -> &FrameReassembler {
        &self.reassembler
    }

    /// Payloads waiting for the next open (queue policy only).
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Next queued action, if any.
    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Caller operations
    // -----------------------------------------------------------------------

    /// Open a new connection, closing any previous one first.
    pub fn connect(&mut self) {
        if let Some(old) = self.current.take() {
            debug!(conn = old, "superseding previous connection");
            self.actions.push_back(Action::Close { conn: old });
            self.abandon_streams();
        }
        self.stop_heartbeat();
        self.cancel_retry();
        self.intentional_close = false;

        let conn = self.next_conn;
        self.next_conn += 1;
        self.current = Some(conn);
        self.state.phase = Phase::Connecting;
        self.state.closed_reason = None;
        info!(conn, url = %self.settings.url, retry = self.state.retry_count, "connecting");
        self.actions.push_back(Action::Open { conn, url: self.settings.url.clone() });
        self.publish_state();
    }

    /// Close on purpose. No reconnect follows until [`reconnect`](Self::reconnect).
    pub fn disconnect(&mut self) {
        self.close_for_good(CloseReason::Manual);
    }

    /// User-triggered retry: resets the budget and connects immediately.
    pub fn reconnect(&mut self) {
        self.state.retry_count = 0;
        self.connect();
    }

    /// Final teardown. Drops queued sends and open stream buffers.
    pub fn shutdown(&mut self) {
        self.close_for_good(CloseReason::Shutdown);
        self.outbox.clear();
        self.reassembler.clear();
    }

    /// Transmit `payload` if open; otherwise apply the send policy.
    pub fn send(&mut self, payload: Outbound) -> Result<()> {
        if let (Phase::Open, Some(conn)) = (self.state.phase, self.current) {
            self.transmit(conn, &payload);
            return Ok(());
        }
        match self.settings.send_policy {
            SendPolicy::Reject => {
                debug!(kind = payload.kind(), phase = %self.state.phase, "send rejected, not connected");
                Err(LinkError::NotConnected)
            }
            SendPolicy::Queue { capacity } => {
                if self.outbox.len() >= capacity {
                    return Err(LinkError::QueueFull { capacity });
                }
                debug!(kind = payload.kind(), queued = self.outbox.len() + 1, "queued until open");
                self.outbox.push_back(payload);
                Ok(())
            }
        }
    }

    /// [`send`](Self::send) a user-authored payload and, if it was accepted,
    /// publish the user's own message.
    pub fn send_user(&mut self, payload: Outbound, message: Message) -> Result<()> {
        self.send(payload)?;
        self.emit(LinkEvent::Message(message));
        Ok(())
    }

    /// Forget the resumable session, both live and persisted.
    pub fn clear_session(&mut self) {
        if let Some(resume) = &self.resume {
            resume.forget();
        }
        if self.state.session_id.take().is_some() {
            self.publish_state();
        }
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub fn handle_open(&mut self, conn: ConnId) {
        if !self.is_current(conn) {
            return;
        }
        info!(conn, url = %self.settings.url, "connected");
        self.cancel_retry();
        self.state.phase = Phase::Open;
        self.state.retry_count = 0;
        self.state.closed_reason = None;
        self.state.last_error = None;

        // Resume goes out before anything else on this connection.
        if let Some(session_id) = self.resume.as_ref().and_then(SessionResume::persisted) {
            debug!(conn, session_id = %session_id, "requesting session resume");
            self.transmit(conn, &Outbound::ResumeSession { session_id });
        }
        while let Some(payload) = self.outbox.pop_front() {
            self.transmit(conn, &payload);
        }
        self.start_heartbeat();
        self.publish_state();
    }

    /// The transport reported an error. Logged only; the close that follows
    /// drives reconnection.
    pub fn handle_error(&mut self, conn: ConnId, error: &str) {
        if !self.is_current(conn) {
            return;
        }
        warn!(conn, error, "connection error");
        self.state.last_error = Some(error.to_string());
        self.publish_state();
    }

    pub fn handle_close(&mut self, conn: ConnId) {
        if !self.is_current(conn) {
            debug!(conn, "close from superseded connection ignored");
            return;
        }
        self.current = None;
        self.stop_heartbeat();
        self.abandon_streams();

        if self.intentional_close {
            self.state.phase = Phase::Closed;
            self.state.closed_reason = Some(CloseReason::Manual);
            self.publish_state();
            return;
        }

        let policy = &self.settings.retry;
        if policy.exhausted(self.state.retry_count) {
            warn!(
                attempts = self.state.retry_count,
                max_retries = policy.max_retries,
                "max retries reached, giving up"
            );
            self.state.phase = Phase::Closed;
            self.state.closed_reason = Some(CloseReason::RetriesExhausted);
            self.emit(LinkEvent::GaveUp { attempts: self.state.retry_count });
            self.publish_state();
            return;
        }

        let delay = policy.delay_for(self.state.retry_count, &mut self.rng);
        let timer = self.next_timer;
        self.next_timer += 1;
        self.retry_timer = Some(timer);
        self.actions.push_back(Action::ScheduleRetry { timer, delay });
        self.state.retry_count += 1;
        self.state.phase = Phase::Reconnecting;
        info!(
            attempt = self.state.retry_count,
            max_retries = self.state.max_retries,
            delay_ms = delay.as_millis() as u64,
            "connection lost, scheduling reconnect"
        );
        self.emit(LinkEvent::Reconnecting { attempt: self.state.retry_count, delay });
        self.publish_state();
    }

    /// Writing `text` on `conn` failed. Under the queue policy that frame and
    /// every write still pending for `conn` go back to the front of the queue,
    /// in order, for the next open. Heartbeats and the resume frame are
    /// regenerated on open and are not requeued. The connection is then
    /// treated as closed.
    pub fn handle_write_failure(&mut self, conn: ConnId, text: String, error: &str) {
        if !self.is_current(conn) {
            return;
        }
        let mut unsent = vec![text];
        let mut rest = VecDeque::with_capacity(self.actions.len());
        for action in self.actions.drain(..) {
            match action {
                Action::Transmit { conn: on, text } if on == conn => unsent.push(text),
                other => rest.push_back(other),
            }
        }
        self.actions = rest;

        if let SendPolicy::Queue { .. } = self.settings.send_policy {
            let ping = Outbound::Ping.to_wire();
            let resume = self
                .resume
                .as_ref()
                .and_then(SessionResume::persisted)
                .map(|session_id| Outbound::ResumeSession { session_id }.to_wire());
            let requeued: Vec<Outbound> = unsent
                .into_iter()
                .filter(|t| *t != ping && Some(t) != resume.as_ref())
                .map(Outbound::Raw)
                .collect();
            debug!(conn, requeued = requeued.len(), "write failed, payloads requeued");
            for payload in requeued.into_iter().rev() {
                self.outbox.push_front(payload);
            }
        } else {
            warn!(conn, dropped = unsent.len(), "write failed, unsent frames dropped");
        }

        self.handle_error(conn, error);
        self.handle_close(conn);
    }

    /// A retry timer fired.
    pub fn handle_timer(&mut self, timer: TimerId) {
        if self.retry_timer != Some(timer) {
            debug!(timer, "stale retry timer ignored");
            return;
        }
        self.retry_timer = None;
        if self.intentional_close {
            return;
        }
        self.connect();
    }

    /// Heartbeat interval elapsed.
    pub fn handle_heartbeat(&mut self) {
        if let (Phase::Open, Some(conn), true) = (self.state.phase, self.current, self.heartbeat_running) {
            self.transmit(conn, &Outbound::Ping);
        }
    }

    /// One inbound text payload.
    pub fn handle_text(&mut self, conn: ConnId, text: &str) {
        if !self.is_current(conn) {
            return;
        }
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                let preview: String = text.chars().take(80).collect();
                warn!(conn, error = %e, payload = %preview, "dropping malformed frame");
                return;
            }
        };
        self.handle_frame(frame);
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        if FrameReassembler::handles(&frame) {
            for ev in self.reassembler.feed(&frame) {
                self.emit(ev.into());
            }
            return;
        }

        match frame {
            InboundFrame::SessionCreated { session_id } => {
                info!(session_id = %session_id, "session created");
                if let Some(resume) = &self.resume {
                    resume.persist(&session_id);
                }
                self.adopt_session(session_id, false);
            }
            InboundFrame::SessionResumed { session_id } => {
                info!(session_id = %session_id, "session resumed");
                if let Some(resume) = &self.resume {
                    if resume.persisted().as_deref() != Some(session_id.as_str()) {
                        resume.persist(&session_id);
                    }
                }
                self.adopt_session(session_id, true);
            }
            InboundFrame::Response { response, confidence, match_type, transfer_to_human, matched_topic } => {
                let metadata = ResponseMetadata {
                    confidence,
                    match_type,
                    transfer_to_human: transfer_to_human.unwrap_or(false),
                    matched_topic,
                };
                let message = Message::remote(ANONYMOUS_SENDER, response).with_metadata(metadata);
                self.emit(LinkEvent::Message(message));
            }
            InboundFrame::Question { content, round_number, .. } => {
                let message = Message::remote(INTERVIEWER_SENDER, content).with_round(round_number);
                self.emit(LinkEvent::Message(message));
            }
            InboundFrame::Metadata { fields } => {
                debug!(fields = %serde_json::Value::Object(fields), "metadata frame");
            }
            InboundFrame::Pong => debug!("heartbeat acknowledged"),
            InboundFrame::Unknown => debug!("unknown frame type dropped"),
            other @ (InboundFrame::Ready { .. }
            | InboundFrame::Evaluation { .. }
            | InboundFrame::VideoState { .. }
            | InboundFrame::InterviewEnd { .. }) => {
                self.emit(LinkEvent::Frame(other));
            }
            // Stream frames were routed to the reassembler above.
            other => debug!(kind = other.kind(), "frame not handled"),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn is_current(&self, conn: ConnId) -> bool {
        self.current == Some(conn)
    }

    fn close_for_good(&mut self, reason: CloseReason) {
        self.intentional_close = true;
        self.cancel_retry();
        self.stop_heartbeat();
        if let Some(conn) = self.current.take() {
            info!(conn, ?reason, "closing connection");
            self.actions.push_back(Action::Close { conn });
            self.abandon_streams();
        }
        self.state.retry_count = 0;
        self.state.phase = Phase::Closed;
        self.state.closed_reason = Some(reason);
        self.publish_state();
    }

    /// Turns cut off with their connection never complete.
    fn abandon_streams(&mut self) {
        for ev in self.reassembler.abandon() {
            self.emit(ev.into());
        }
    }

    fn adopt_session(&mut self, session_id: String, resumed: bool) {
        if self.state.session_id.as_deref() != Some(session_id.as_str()) {
            self.state.session_id = Some(session_id.clone());
            self.publish_state();
        }
        self.emit(LinkEvent::Session { session_id, resumed });
    }

    fn transmit(&mut self, conn: ConnId, payload: &Outbound) {
        self.actions.push_back(Action::Transmit { conn, text: payload.to_wire() });
    }

    fn cancel_retry(&mut self) {
        if self.retry_timer.take().is_some() {
            self.actions.push_back(Action::CancelRetry);
        }
    }

    fn start_heartbeat(&mut self) {
        if let Some(every) = self.settings.heartbeat {
            if !self.heartbeat_running {
                self.heartbeat_running = true;
                self.actions.push_back(Action::StartHeartbeat { every });
            }
        }
    }

    fn stop_heartbeat(&mut self) {
        if self.heartbeat_running {
            self.heartbeat_running = false;
            self.actions.push_back(Action::StopHeartbeat);
        }
    }

    fn emit(&mut self, event: LinkEvent) {
        self.actions.push_back(Action::Emit(event));
    }

    fn publish_state(&mut self) {
        self.emit(LinkEvent::StateChanged(self.state.clone()));
    }
}
