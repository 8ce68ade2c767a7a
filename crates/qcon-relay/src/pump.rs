use std::{fmt::Display, time::Duration};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// How long a pump waits for its outbound side to flush a close before giving up on it.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A data message, tagged with the WebSocket message type it arrived as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Bytes),
    Text(String),
}

impl Payload {
    /// The raw bytes, whatever the message type.
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Binary(bytes) => bytes,
            Self::Text(text) => Bytes::from(text),
        }
    }
}

/// One unit received from either side of a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload to forward to the opposite side. Each outbound sink decides how to encode it.
    Data(Payload),
    /// Transport chatter (ping/pong) that is answered locally and never forwarded.
    Control,
    /// The peer closed its side of the stream.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToUpstream => "client_to_upstream",
            Self::UpstreamToClient => "upstream_to_client",
        }
    }
}

/// Frames forwarded per direction over the lifetime of one relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

/// Pumps frames between a client stream and an upstream stream until either side fails or
/// closes.
///
/// `alive` is the shared liveness flag of the two pump loops: whichever loop stops first cancels
/// it, and the sibling exits as soon as it observes the cancellation (it does not need to wait
/// for its own peer to produce another frame). Cancelling `alive` from outside tears the relay
/// down the same way. Both outbound sides are closed on the way out.
///
/// Returns once both loops have exited.
pub async fn relay<CR, CW, UR, UW, CRE, CWE, URE, UWE>(
    client_rx: CR,
    client_tx: CW,
    upstream_rx: UR,
    upstream_tx: UW,
    alive: CancellationToken,
) -> RelayStats
where
    CR: Stream<Item = Result<Frame, CRE>> + Unpin,
    CW: Sink<Payload, Error = CWE> + Unpin,
    UR: Stream<Item = Result<Frame, URE>> + Unpin,
    UW: Sink<Payload, Error = UWE> + Unpin,
    CRE: Display,
    CWE: Display,
    URE: Display,
    UWE: Display,
{
    let (client_to_upstream, upstream_to_client) = tokio::join!(
        pump(client_rx, upstream_tx, &alive, Direction::ClientToUpstream),
        pump(upstream_rx, client_tx, &alive, Direction::UpstreamToClient),
    );

    RelayStats {
        client_to_upstream,
        upstream_to_client,
    }
}

async fn pump<R, W, RE, WE>(
    mut rx: R,
    mut tx: W,
    alive: &CancellationToken,
    direction: Direction,
) -> u64
where
    R: Stream<Item = Result<Frame, RE>> + Unpin,
    W: Sink<Payload, Error = WE> + Unpin,
    RE: Display,
    WE: Display,
{
    let mut forwarded = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = alive.cancelled() => break,
            next = rx.next() => next,
        };

        let payload = match next {
            Some(Ok(Frame::Data(payload))) => payload,
            Some(Ok(Frame::Control)) => continue,
            Some(Ok(Frame::Close)) | None => {
                tracing::debug!(direction = direction.as_str(), "relay peer closed");
                break;
            }
            Some(Err(err)) => {
                tracing::debug!(direction = direction.as_str(), "relay receive failed: {err}");
                break;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = alive.cancelled() => break,
            sent = tx.send(payload) => sent,
        };
        if let Err(err) = sent {
            tracing::debug!(direction = direction.as_str(), "relay send failed: {err}");
            break;
        }
        forwarded += 1;
    }

    alive.cancel();
    if let Ok(Err(err)) = tokio::time::timeout(CLOSE_GRACE, tx.close()).await {
        tracing::debug!(direction = direction.as_str(), "relay close failed: {err}");
    }

    forwarded
}

#[cfg(test)]
mod tests {
    use super::Direction;

    #[test]
    fn direction_labels_are_stable() {
        assert_eq!(Direction::ClientToUpstream.as_str(), "client_to_upstream");
        assert_eq!(Direction::UpstreamToClient.as_str(), "upstream_to_client");
    }
}
