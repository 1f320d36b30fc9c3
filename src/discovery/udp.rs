//! Fronius data manager discovery by UDP broadcast

use crate::error::Result;
use crate::logging::get_logger;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Data managers answer on this port
pub const LISTEN_PORT: u16 = 50050;

/// Data managers listen for the query on this port
pub const QUERY_PORT: u16 = 50049;

pub const QUERY: &[u8] = br#"{"GetFroniusLoggerInfo":"all"}"#;

/// Broadcast query and response collection window
#[derive(Debug, Clone)]
pub struct UdpProbe {
    pub bind: SocketAddr,
    pub target: SocketAddr,
    pub window: Duration,
}

impl Default for UdpProbe {
    fn default() -> Self {
        Self {
            bind: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, LISTEN_PORT)),
            target: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, QUERY_PORT)),
            window: Duration::from_secs(5),
        }
    }
}

impl UdpProbe {
    /// Send the query and forward each distinct responder until the window closes.
    /// Returns the number of hosts found.
    pub async fn run(&self, found: mpsc::UnboundedSender<String>) -> Result<usize> {
        let logger = get_logger("udp_discovery");
        let socket = UdpSocket::bind(self.bind).await?;
        socket.set_broadcast(true)?;
        socket.send_to(QUERY, self.target).await?;
        logger.debug(&format!("Sent logger info query to {}", self.target));

        let mut seen = HashSet::new();
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + self.window;
        loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok((_, sender))) => {
                    // Only the address matters, not the payload
                    let host = sender.ip().to_string();
                    if seen.insert(host.clone()) {
                        logger.info(&format!("Data manager answered from {}", host));
                        if found.send(host).is_err() {
                            break;
                        }
                    }
                }
                Ok(Err(e)) => {
                    logger.debug(&format!("UDP receive failed: {}", e));
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(seen.len())
    }
}
