#![forbid(unsafe_code)]

//! WebSocket tunnels between browser clients and emulator-side endpoints.
//!
//! Every running emulator exposes two internal WebSocket servers: the companion runtime's
//! protocol socket and the firmware emulator's VNC socket. Clients never talk to those directly;
//! the controller accepts their upgrade, dials the internal endpoint with [`UpstreamConnector`]
//! and then hands both sides to [`relay`], which pumps frames in both directions until either
//! side goes away.

mod error;
mod pump;
mod tls;
mod upstream;

pub use error::RelayError;
pub use pump::{relay, Direction, Frame, Payload, RelayStats};
pub use upstream::{split_upstream, UpstreamConnector, UpstreamSocket};

/// Subprotocol spoken by the firmware emulator's VNC WebSocket.
pub const VNC_SUBPROTOCOL: &str = "binary";
