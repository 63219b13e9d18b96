//! # Client handle and driver task
//!
//! [`LinkClient::spawn`] starts one driver task that owns the socket, the
//! retry timer and the heartbeat, and runs the [`Supervisor`]. The task is the
//! only place any of that state is touched, so nothing is locked; handles talk
//! to it through channels:
//!
//! - commands: `mpsc` (send, disconnect, reconnect, clear session, shutdown)
//! - events: `broadcast` of [`LinkEvent`]; drop the receiver to unsubscribe
//! - state: `watch` of the latest [`ConnectionState`]
//!
//! The driver exits on `shutdown()` or when every handle has been dropped;
//! either way the socket and timers are released before it returns.
//!
//! ```rust,ignore
//! let settings = LinkConfig::default().resolve(Product::CustomerService)?;
//! let (client, mut events) = LinkClient::spawn(settings, TungsteniteConnector, None);
//! client.send(Outbound::Query { message: "你好".into(), stream: false }).await?;
//! while let Ok(ev) = events.recv().await {
//!     if let LinkEvent::Message(m) = ev { println!("{}: {}", m.sender, m.content); }
//! }
//! ```

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::error::{LinkError, Result};
use crate::frame::Outbound;
use crate::message::Message;
use crate::session::SessionStore;
use crate::supervisor::{Action, ConnId, ConnectionState, LinkEvent, Supervisor, TimerId};
use crate::transport::{Connector, TungsteniteConnector};

/// Events buffered per subscriber before the slowest one starts lagging.
///
/// Every streamed chunk produces a [`LinkEvent::Partial`] carrying the whole
/// buffer so far, so a long turn can fill this quickly. A subscriber that falls
/// behind gets `RecvError::Lagged(n)` and loses the `n` oldest events, which
/// may include finished messages. Receivers should treat `Lagged` as a gap and
/// keep reading; [`ConnectionState`] is always recoverable via
/// [`LinkClient::state`].
pub const EVENT_CHANNEL_CAP: usize = 256;

enum Command {
    Send {
        payload: Outbound,
        user_message: Option<Message>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect,
    Reconnect,
    ClearSession,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// LinkClient
// ---------------------------------------------------------------------------

/// Cloneable handle to one resilient connection.
#[derive(Clone)]
pub struct LinkClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<LinkEvent>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl LinkClient {
    /// Spawn the driver on the current tokio runtime and start connecting.
    ///
    /// The returned receiver is subscribed before the first connect attempt,
    /// so it sees every event.
    pub fn spawn<C: Connector>(
        settings: ConnectionSettings,
        connector: C,
        store: Option<Arc<dyn SessionStore>>,
    ) -> (Self, broadcast::Receiver<LinkEvent>) {
        let connect_timeout = settings.connect_timeout;
        let supervisor = Supervisor::new(settings, store);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, first_rx) = broadcast::channel(EVENT_CHANNEL_CAP);
        let (state_tx, state_rx) = watch::channel(supervisor.state().clone());

        let driver = Driver {
            connector,
            supervisor,
            cmd_rx,
            events: events.clone(),
            state_tx,
            connect_timeout,
            pending: None,
            socket: None,
            retry: None,
            heartbeat: None,
            shutdown_waiters: Vec::new(),
            finished: false,
        };
        tokio::spawn(driver.run());

        (Self { cmd_tx, events, state_rx }, first_rx)
    }

    /// [`spawn`](Self::spawn) with the tungstenite connector.
    pub fn connect(
        settings: ConnectionSettings,
        store: Option<Arc<dyn SessionStore>>,
    ) -> (Self, broadcast::Receiver<LinkEvent>) {
        Self::spawn(settings, TungsteniteConnector, store)
    }

    /// Send a request. Fails with [`LinkError::NotConnected`] or
    /// [`LinkError::QueueFull`] depending on the send policy.
    pub async fn send(&self, payload: Outbound) -> Result<()> {
        self.request(payload, None).await
    }

    /// Send a user-authored request and publish `message` to subscribers once
    /// it has been accepted.
    pub async fn send_user(&self, payload: Outbound, message: Message) -> Result<()> {
        self.request(payload, Some(message)).await
    }

    async fn request(&self, payload: Outbound, user_message: Option<Message>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { payload, user_message, reply })?;
        rx.await.map_err(|_| LinkError::DriverGone)?
    }

    /// Close on purpose; no automatic reconnect follows.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    /// Reset the retry budget and connect now.
    pub fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect)
    }

    /// Forget the persisted session id.
    pub fn clear_session(&self) -> Result<()> {
        self.command(Command::ClearSession)
    }

    /// Tear the connection down and wait for the driver to release it.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.command(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Latest connection state.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Events as a `Stream`. Lagged items are reported as errors.
    pub fn events(&self) -> BroadcastStream<LinkEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F) -> Result<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state_rx.clone();
        let state = rx.wait_for(pred).await.map_err(|_| LinkError::DriverGone)?;
        Ok(state.clone())
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| LinkError::DriverGone)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct PendingConnect<T> {
    conn: ConnId,
    fut: BoxFuture<'static, Result<T>>,
}

struct Driver<C: Connector> {
    connector: C,
    supervisor: Supervisor,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<LinkEvent>,
    state_tx: watch::Sender<ConnectionState>,
    connect_timeout: Duration,
    pending: Option<PendingConnect<C::Conn>>,
    socket: Option<(ConnId, C::Conn)>,
    retry: Option<(TimerId, Pin<Box<Sleep>>)>,
    heartbeat: Option<Interval>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    finished: bool,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        self.supervisor.connect();
        loop {
            self.apply_actions().await;
            if self.finished {
                break;
            }

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("all client handles dropped, shutting down");
                        self.supervisor.shutdown();
                        self.finished = true;
                    }
                },

                (conn, result) = next_connect(&mut self.pending) => {
                    self.pending = None;
                    match result {
                        Ok(stream) => {
                            self.socket = Some((conn, stream));
                            self.supervisor.handle_open(conn);
                        }
                        Err(e) => {
                            self.supervisor.handle_error(conn, &e.to_string());
                            self.supervisor.handle_close(conn);
                        }
                    }
                }

                (conn, frame) = next_frame(&mut self.socket) => {
                    self.handle_frame(conn, frame);
                }

                timer = next_retry(&mut self.retry) => {
                    self.retry = None;
                    self.supervisor.handle_timer(timer);
                }

                _ = next_tick(&mut self.heartbeat) => {
                    self.supervisor.handle_heartbeat();
                }
            }
        }

        self.pending = None;
        self.socket = None;
        self.retry = None;
        self.heartbeat = None;
        for done in self.shutdown_waiters.drain(..) {
            let _ = done.send(());
        }
        info!("connection driver stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { payload, user_message, reply } => {
                let result = match user_message {
                    Some(message) => self.supervisor.send_user(payload, message),
                    None => self.supervisor.send(payload),
                };
                let _ = reply.send(result);
            }
            Command::Disconnect => self.supervisor.disconnect(),
            Command::Reconnect => self.supervisor.reconnect(),
            Command::ClearSession => self.supervisor.clear_session(),
            Command::Shutdown { done } => {
                self.supervisor.shutdown();
                self.shutdown_waiters.push(done);
                self.finished = true;
            }
        }
    }

    fn handle_frame(&mut self, conn: ConnId, frame: Option<std::result::Result<WsMessage, WsError>>) {
        match frame {
            Some(Ok(WsMessage::Text(text))) => self.supervisor.handle_text(conn, &text),
            Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => self.supervisor.handle_text(conn, &text),
                Err(e) => warn!(conn, error = %e, "dropping non-utf8 binary frame"),
            },
            // tungstenite answers pings itself.
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
            Some(Ok(WsMessage::Close(frame))) => {
                debug!(conn, ?frame, "server closed connection");
                self.socket = None;
                self.supervisor.handle_close(conn);
            }
            Some(Err(e)) => {
                self.socket = None;
                self.supervisor.handle_error(conn, &e.to_string());
                self.supervisor.handle_close(conn);
            }
            None => {
                self.socket = None;
                self.supervisor.handle_close(conn);
            }
        }
    }

    async fn apply_actions(&mut self) {
        while let Some(action) = self.supervisor.poll_action() {
            match action {
                Action::Open { conn, url } => {
                    let attempt = self.connector.connect(&url);
                    let limit = self.connect_timeout;
                    let fut: BoxFuture<'static, Result<C::Conn>> = Box::pin(async move {
                        match tokio::time::timeout(limit, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(LinkError::ConnectTimeout(limit)),
                        }
                    });
                    self.pending = Some(PendingConnect { conn, fut });
                }
                Action::Close { conn } => {
                    if self.pending.as_ref().is_some_and(|p| p.conn == conn) {
                        self.pending = None;
                    }
                    if self.socket.as_ref().is_some_and(|(id, _)| *id == conn) {
                        if let Some((_, mut stream)) = self.socket.take() {
                            if let Err(e) = stream.close().await {
                                debug!(conn, error = %e, "error while closing socket");
                            }
                        }
                    }
                }
                Action::Transmit { conn, text } => {
                    let Some((id, stream)) = self.socket.as_mut() else {
                        debug!(conn, "no socket, frame dropped");
                        continue;
                    };
                    if *id != conn {
                        debug!(conn, "frame for superseded connection dropped");
                        continue;
                    }
                    let sent = stream.send(WsMessage::Text(text.clone())).await;
                    if let Err(e) = sent {
                        self.socket = None;
                        self.supervisor.handle_write_failure(conn, text, &e.to_string());
                    }
                }
                Action::ScheduleRetry { timer, delay } => {
                    self.retry = Some((timer, Box::pin(tokio::time::sleep(delay))));
                }
                Action::CancelRetry => self.retry = None,
                Action::StartHeartbeat { every } => {
                    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.heartbeat = Some(interval);
                }
                Action::StopHeartbeat => self.heartbeat = None,
                Action::Emit(event) => {
                    if let LinkEvent::StateChanged(state) = &event {
                        self.state_tx.send_replace(state.clone());
                    }
                    // No subscribers is fine.
                    let _ = self.events.send(event);
                }
            }
        }
    }
}

// Each helper pends forever when its slot is empty, which disables the
// corresponding `select!` branch.

async fn next_connect<T>(slot: &mut Option<PendingConnect<T>>) -> (ConnId, Result<T>) {
    match slot {
        Some(p) => {
            let result = (&mut p.fut).await;
            (p.conn, result)
        }
        None => pending().await,
    }
}

async fn next_frame<S>(slot: &mut Option<(ConnId, S)>) -> (ConnId, Option<S::Item>)
where
    S: futures_util::Stream + Unpin,
{
    match slot {
        Some((conn, stream)) => {
            let item = stream.next().await;
            (*conn, item)
        }
        None => pending().await,
    }
}

async fn next_retry(slot: &mut Option<(TimerId, Pin<Box<Sleep>>)>) -> TimerId {
    match slot {
        Some((timer, sleep)) => {
            sleep.as_mut().await;
            *timer
        }
        None => pending().await,
    }
}

async fn next_tick(slot: &mut Option<Interval>) {
    match slot {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use crate::supervisor::CloseReason;
    use tokio::net::TcpStream;
    use tokio_tungstenite::WebSocketStream;

    /// Every attempt fails immediately.
    struct Refused;

    impl Connector for Refused {
        type Conn = WebSocketStream<TcpStream>;

        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Self::Conn>> {
            Box::pin(async { Err(LinkError::Transport("refused".into())) })
        }
    }

    fn settings(max_retries: u32) -> ConnectionSettings {
        let mut s = ConnectionSettings::new("ws://unreachable/ws");
        s.retry = RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
        };
        s
    }

    #[test]
    fn test_refused_connector_gives_up() {
        tokio_test::block_on(async {
            let (client, _events) = LinkClient::spawn(settings(2), Refused, None);
            let state = client.wait_for(|s| s.gave_up()).await;
            let state = tokio_test::assert_ok!(state);
            assert_eq!(state.last_error.as_deref(), Some("transport error: refused"));
            assert_eq!(state.retry_count, 2);
            client.shutdown().await;
        });
    }

    #[test]
    fn test_send_before_open_is_rejected() {
        tokio_test::block_on(async {
            let (client, _events) = LinkClient::spawn(settings(5), Refused, None);
            let err = tokio_test::assert_err!(client.send(Outbound::Ping).await);
            assert!(matches!(err, LinkError::NotConnected));
            client.shutdown().await;
        });
    }

    #[test]
    fn test_first_receiver_sees_initial_transition() {
        tokio_test::block_on(async {
            let (client, mut events) = LinkClient::spawn(settings(0), Refused, None);
            match events.recv().await {
                Ok(LinkEvent::StateChanged(state)) => assert_eq!(state.phase, crate::supervisor::Phase::Connecting),
                other => panic!("unexpected {other:?}"),
            }
            client.shutdown().await;
            assert_eq!(client.state().closed_reason, Some(CloseReason::Shutdown));
        });
    }
}
