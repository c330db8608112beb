use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::WgError;
use crate::keys::PeerKey;
use crate::keys::PresharedKey;

/// Point-in-time WireGuard stats for one peer (spec.md §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct WgStats {
    pub last_handshake: Option<Instant>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// The WireGuard kernel/user-space interface, consumed by this engine
/// (spec.md §6). Implemented by the caller; this core only ever updates,
/// removes, and reads stats for the one peer it owns.
#[async_trait]
pub trait WgInterface: Send + Sync {
    async fn update_peer(
        &self,
        pubkey: &PeerKey,
        allowed_ips: ipnet::IpNet,
        keepalive: Duration,
        endpoint: SocketAddr,
        psk: Option<&PresharedKey>,
    ) -> Result<(), WgError>;

    async fn remove_peer(&self, pubkey: &PeerKey) -> Result<(), WgError>;

    async fn get_stats(&self, pubkey: &PeerKey) -> Result<WgStats, WgError>;
}
