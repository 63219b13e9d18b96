//! Connection factory used by the driver.
//!
//! The driver only needs something that yields WebSocket messages and accepts
//! them back, so tests and alternative transports can plug in a different
//! [`Connector`].

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::Result;

/// Opens duplex connections on demand; called for every connect attempt.
pub trait Connector: Send + Sync + 'static {
    type Conn: Stream<Item = std::result::Result<WsMessage, WsError>>
        + Sink<WsMessage, Error = WsError>
        + Send
        + Unpin
        + 'static;

    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Self::Conn>>;
}

/// Plain `tokio-tungstenite` client. `wss://` needs the `tls` feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    type Conn = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Self::Conn>> {
        let url = url.to_string();
        Box::pin(async move {
            let (stream, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
            debug!(url = %url, status = %response.status(), "websocket handshake complete");
            Ok(stream)
        })
    }
}
