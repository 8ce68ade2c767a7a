//! Ephemeral port and VNC display allocation.
//!
//! Nothing is tracked: a port is free at the moment the OS hands it out, the listener is then
//! dropped and the number is passed to the emulator, which binds it itself. Another process can
//! claim the port in between. Closing that window would mean keeping the listener open and
//! passing the socket to the child instead of a number.

use std::{io, net::Ipv4Addr};

use serde::Serialize;
use tokio::net::TcpListener;

use crate::InstanceError;

/// VNC display `N` listens on TCP port `5900 + N`.
pub const VNC_BASE_PORT: u16 = 5900;

/// The VNC display served on `port`.
pub fn display_for(port: u16) -> Result<u16, InstanceError> {
    port.checked_sub(VNC_BASE_PORT)
        .ok_or(InstanceError::DisplayOutOfRange(port))
}

/// Binds an ephemeral loopback port. The port is free again once the listener is dropped.
async fn bind_ephemeral() -> io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Every port one instance needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ports {
    /// Firmware console serial line.
    pub console: u16,
    /// Serial line carrying the companion runtime's link to the firmware.
    pub companion_link: u16,
    /// WebSocket served by the companion runtime.
    pub companion_ws: u16,
    pub vnc_display: u16,
    /// WebSocket served by the emulator's VNC server.
    pub vnc_ws: u16,
    pub gdb: Option<u16>,
}

impl Ports {
    /// Allocates every port of one instance.
    ///
    /// All listeners stay bound until the last one is allocated so the numbers are mutually
    /// distinct; they are released together on return.
    pub async fn allocate(with_gdb: bool) -> Result<Self, InstanceError> {
        let mut held = Vec::with_capacity(6);

        let console = hold_port(&mut held).await?;
        let companion_link = hold_port(&mut held).await?;
        let companion_ws = hold_port(&mut held).await?;
        let vnc_port = hold_port(&mut held).await?;
        let vnc_display = display_for(vnc_port)?;
        let vnc_ws = hold_port(&mut held).await?;
        let gdb = if with_gdb {
            Some(hold_port(&mut held).await?)
        } else {
            None
        };

        Ok(Self {
            console,
            companion_link,
            companion_ws,
            vnc_display,
            vnc_ws,
            gdb,
        })
    }
}

/// Allocates a port and keeps its listener in `held` until the caller drops it.
async fn hold_port(held: &mut Vec<TcpListener>) -> Result<u16, InstanceError> {
    let (listener, port) = bind_ephemeral()
        .await
        .map_err(InstanceError::PortAllocation)?;
    held.push(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn released_port_can_be_bound_again() {
        let (listener, port) = bind_ephemeral().await.unwrap();
        assert_ne!(port, 0);
        drop(listener);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    }

    #[test]
    fn display_is_offset_from_vnc_base() {
        assert_eq!(display_for(5901).unwrap(), 1);
        assert_eq!(display_for(VNC_BASE_PORT).unwrap(), 0);
        assert!(matches!(
            display_for(5899),
            Err(InstanceError::DisplayOutOfRange(5899))
        ));
    }

    #[tokio::test]
    async fn gdb_port_only_when_requested() {
        let ports = Ports::allocate(false).await.unwrap();
        assert!(ports.gdb.is_none());
        let ports = Ports::allocate(true).await.unwrap();
        assert!(ports.gdb.is_some());
    }

    #[tokio::test]
    async fn instance_ports_are_distinct() {
        let ports = Ports::allocate(true).await.unwrap();
        let mut all = vec![
            ports.console,
            ports.companion_link,
            ports.companion_ws,
            ports.vnc_display + VNC_BASE_PORT,
            ports.vnc_ws,
            ports.gdb.unwrap(),
        ];
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 6);
    }
}
