use std::{future, sync::Arc};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use qcon_relay::{relay, split_upstream, Frame, Payload, UpstreamSocket, VNC_SUBPROTOCOL};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{alloc::Ports, metrics::Metrics, Controller, ControllerError};

/// The two internal WebSocket servers of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Companion runtime protocol socket.
    Phone,
    /// Firmware emulator VNC socket.
    Vnc,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Vnc => "vnc",
        }
    }

    pub fn port(self, ports: &Ports) -> u16 {
        match self {
            Self::Phone => ports.companion_ws,
            Self::Vnc => ports.vnc_ws,
        }
    }

    pub fn subprotocol(self) -> Option<&'static str> {
        match self {
            Self::Phone => None,
            Self::Vnc => Some(VNC_SUBPROTOCOL),
        }
    }
}

/// Answers a tunnel upgrade request.
///
/// The upstream side is dialled first so an unreachable endpoint is reported as `502` instead of
/// an upgraded socket that closes immediately.
pub async fn upgrade(
    controller: Arc<Controller>,
    id: Uuid,
    channel: Channel,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(instance) = controller.instance(id).await else {
        return ControllerError::UnknownInstance.into_response();
    };

    let port = channel.port(&instance.ports());
    let upstream = match controller
        .connector()
        .connect(port, channel.subprotocol())
        .await
    {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::warn!(instance = %id, channel = channel.as_str(), "{err}");
            controller.metrics().relay_upstream_failed();
            return (StatusCode::BAD_GATEWAY, err.to_string()).into_response();
        }
    };

    let ws = match channel.subprotocol() {
        Some(subprotocol) => ws.protocols([subprotocol]),
        None => ws,
    };
    let metrics = controller.metrics().clone();
    let alive = instance.relay_token();
    ws.on_upgrade(move |socket| {
        instance.track_relay(run(socket, upstream, alive, metrics, id, channel))
    })
}

async fn run(
    socket: WebSocket,
    upstream: UpstreamSocket,
    alive: CancellationToken,
    metrics: Metrics,
    id: Uuid,
    channel: Channel,
) {
    metrics.relay_opened();
    tracing::debug!(instance = %id, channel = channel.as_str(), "tunnel open");

    let (client_tx, client_rx) = socket.split();
    let client_rx = client_rx.map(|msg| msg.map(client_frame));
    let client_tx = client_tx.with(|payload: Payload| {
        future::ready(Ok::<_, axum::Error>(client_message(payload)))
    });
    let (upstream_rx, upstream_tx) = split_upstream(upstream);

    let stats = relay(client_rx, client_tx, upstream_rx, upstream_tx, alive).await;

    metrics.relay_closed(stats);
    tracing::debug!(
        instance = %id,
        channel = channel.as_str(),
        client_to_upstream = stats.client_to_upstream,
        upstream_to_client = stats.upstream_to_client,
        "tunnel closed"
    );
}

fn client_frame(msg: Message) -> Frame {
    match msg {
        Message::Binary(payload) => Frame::Data(Payload::Binary(Bytes::from(payload))),
        Message::Text(text) => Frame::Data(Payload::Text(text)),
        Message::Ping(_) | Message::Pong(_) => Frame::Control,
        Message::Close(_) => Frame::Close,
    }
}

fn client_message(payload: Payload) -> Message {
    match payload {
        Payload::Binary(bytes) => Message::Binary(bytes.to_vec()),
        Payload::Text(text) => Message::Text(text),
    }
}
