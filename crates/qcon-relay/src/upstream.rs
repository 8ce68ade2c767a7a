use std::{future, path::Path, sync::Arc, time::Duration};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue},
        Error as WsError, Message,
    },
    Connector, MaybeTlsStream, WebSocketStream,
};

use crate::{tls, Frame, Payload, RelayError};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the WebSocket servers that run next to an emulator on this host.
#[derive(Clone)]
pub struct UpstreamConnector {
    tls: Option<Arc<rustls::ClientConfig>>,
    connect_timeout: Duration,
}

impl UpstreamConnector {
    /// Plain `ws://` to the loopback address.
    pub fn plain() -> Self {
        Self {
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// `wss://localhost` trusting the given CA bundle.
    pub fn with_ca_bundle(ca_bundle: &Path) -> Result<Self, RelayError> {
        let config = tls::client_config(ca_bundle)?;
        Ok(Self {
            tls: Some(Arc::new(config)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn url(&self, port: u16) -> String {
        if self.is_tls() {
            format!("wss://localhost:{port}/")
        } else {
            format!("ws://127.0.0.1:{port}/")
        }
    }

    /// Opens the upstream side of a tunnel.
    ///
    /// Any failure here is an [`RelayError::UpstreamUnreachable`] or
    /// [`RelayError::UpstreamTimeout`]; nothing has been sent to the client yet, so callers can
    /// still answer the upgrade request with an error status.
    pub async fn connect(
        &self,
        port: u16,
        subprotocol: Option<&'static str>,
    ) -> Result<UpstreamSocket, RelayError> {
        let url = self.url(port);
        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|source| RelayError::UpstreamUnreachable {
                    url: url.clone(),
                    source: Box::new(source),
                })?;
        if let Some(subprotocol) = subprotocol {
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(subprotocol));
        }

        let connector = self
            .tls
            .as_ref()
            .map(|config| Connector::Rustls(Arc::clone(config)));
        let connect =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);

        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(source)) => Err(RelayError::UpstreamUnreachable {
                url,
                source: Box::new(source),
            }),
            Err(_) => Err(RelayError::UpstreamTimeout {
                url,
                timeout: self.connect_timeout,
            }),
        }
    }
}

/// Splits an upstream socket into the halves [`crate::relay`] expects.
///
/// Payloads going upstream are always sent as binary messages; upstream text messages keep their
/// type on the way back.
pub fn split_upstream(
    socket: UpstreamSocket,
) -> (
    impl Stream<Item = Result<Frame, WsError>> + Unpin,
    impl Sink<Payload, Error = WsError> + Unpin,
) {
    let (tx, rx) = socket.split();
    let rx = rx.map(|msg| msg.map(upstream_frame));
    let tx = tx.with(|payload: Payload| {
        future::ready(Ok::<_, WsError>(Message::Binary(payload.into_bytes())))
    });
    (rx, tx)
}

fn upstream_frame(msg: Message) -> Frame {
    match msg {
        Message::Binary(payload) => Frame::Data(Payload::Binary(payload)),
        Message::Text(text) => Frame::Data(Payload::Text(text.as_str().to_owned())),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Frame::Control,
        Message::Close(_) => Frame::Close,
    }
}
