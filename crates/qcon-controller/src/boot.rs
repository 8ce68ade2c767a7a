use std::{io, net::Ipv4Addr, time::Duration};

use tokio::net::TcpStream;

use crate::InstanceError;

/// Console output known to mean the firmware finished booting.
///
/// Firmware variants differ in what they print, so the list is configurable.
pub const DEFAULT_READY_BANNERS: [&str; 3] = ["<SDK Home>", "<Launcher>", "Ready for communication"];

/// Retry budgets for detecting that a freshly spawned emulator has booted.
#[derive(Debug, Clone)]
pub struct BootWait {
    pub connect_attempts: u32,
    pub connect_interval: Duration,
    pub read_attempts: u32,
    pub read_interval: Duration,
    pub banners: Vec<String>,
}

impl Default for BootWait {
    fn default() -> Self {
        Self {
            connect_attempts: 20,
            connect_interval: Duration::from_millis(200),
            read_attempts: 150,
            read_interval: Duration::from_millis(200),
            banners: DEFAULT_READY_BANNERS.map(str::to_string).to_vec(),
        }
    }
}

impl BootWait {
    /// Connects to the console port and reads until a ready banner shows up.
    ///
    /// The emulator does not start the guest until a client is attached to the console, so the
    /// connection made here is also what lets the boot proceed. It is closed on return.
    pub async fn wait(&self, console_port: u16) -> Result<(), InstanceError> {
        let console = self.connect(console_port).await?;

        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        for _ in 0..self.read_attempts {
            tokio::time::sleep(self.read_interval).await;

            loop {
                match console.try_read(&mut buf) {
                    Ok(0) => {
                        return Err(InstanceError::LaunchTimeout(
                            "console closed before the firmware was ready",
                        ))
                    }
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::warn!(console_port, "console read failed: {err}");
                        return Err(InstanceError::LaunchTimeout("console read failed"));
                    }
                }
            }

            if self.is_ready(&received) {
                return Ok(());
            }
        }

        Err(InstanceError::LaunchTimeout(
            "firmware never reported it was ready",
        ))
    }

    async fn connect(&self, console_port: u16) -> Result<TcpStream, InstanceError> {
        for _ in 0..self.connect_attempts {
            tokio::time::sleep(self.connect_interval).await;
            match TcpStream::connect((Ipv4Addr::LOCALHOST, console_port)).await {
                Ok(stream) => return Ok(stream),
                Err(err) => tracing::trace!(console_port, "console not up yet: {err}"),
            }
        }
        Err(InstanceError::LaunchTimeout(
            "console port never accepted a connection",
        ))
    }

    fn is_ready(&self, received: &[u8]) -> bool {
        let text = String::from_utf8_lossy(received);
        self.banners.iter().any(|banner| text.contains(banner.as_str()))
    }
}
