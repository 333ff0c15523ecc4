//! Wake-on-LAN magic packets

use crate::error::WakeError;
use async_trait::async_trait;
use mac_address::MacAddress;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::debug;

/// Conventional discard port used when the broadcast address has none
pub const DEFAULT_WOL_PORT: u16 = 9;

const HEADER_SIZE_BYTES: usize = 6;
const MAC_REPETITIONS: usize = 16;
pub const MAGIC_PACKET_SIZE: usize = HEADER_SIZE_BYTES + MAC_REPETITIONS * 6;

/// Transmits a wake signal to a hardware address
#[async_trait]
pub trait WakeSignaler: Send + Sync {
    async fn send_wake_signal(&self, mac_address: &str, broadcast_address: &str) -> Result<(), WakeError>;
}

pub fn parse_mac(mac_address: &str) -> Result<[u8; 6], WakeError> {
    mac_address
        .trim()
        .parse::<MacAddress>()
        .map(|mac| mac.bytes())
        .map_err(|e| WakeError::InvalidMac {
            address: mac_address.to_string(),
            reason: e.to_string(),
        })
}

/// Six 0xFF bytes followed by sixteen copies of the target MAC
pub fn magic_packet(mac: [u8; 6]) -> [u8; MAGIC_PACKET_SIZE] {
    let mut packet = [0xFF; MAGIC_PACKET_SIZE];
    for chunk in packet[HEADER_SIZE_BYTES..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    packet
}

async fn resolve_broadcast(broadcast_address: &str) -> Result<SocketAddr, WakeError> {
    let trimmed = broadcast_address.trim();
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_WOL_PORT));
    }
    tokio::net::lookup_host(trimmed)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| WakeError::InvalidBroadcast(broadcast_address.to_string()))
}

/// Sends magic packets over UDP broadcast
#[derive(Debug, Clone, Default)]
pub struct MagicPacketSignaler;

impl MagicPacketSignaler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WakeSignaler for MagicPacketSignaler {
    async fn send_wake_signal(&self, mac_address: &str, broadcast_address: &str) -> Result<(), WakeError> {
        let mac = parse_mac(mac_address)?;
        let target = resolve_broadcast(broadcast_address).await?;

        let bind_addr = match target {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(WakeError::Socket)?;
        socket.set_broadcast(true).map_err(WakeError::Socket)?;

        let packet = magic_packet(mac);
        let sent = socket.send_to(&packet, target).await.map_err(WakeError::Send)?;
        debug!(%target, bytes = sent, "Magic packet written");

        Ok(())
    }
}
