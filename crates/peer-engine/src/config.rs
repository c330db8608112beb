use std::time::Duration;

use ipnet::IpNet;

use crate::error::ConnError;
use crate::keys::PeerKey;
use crate::keys::PresharedKey;

/// Fixed WireGuard keepalive interval (spec.md §3).
pub const WG_KEEPALIVE: Duration = Duration::from_secs(25);

/// Relay liveness poll cadence (spec.md §4.4, §5).
pub const WG_HANDSHAKE_PERIOD: Duration = Duration::from_secs(2 * 60);
pub const WG_HANDSHAKE_OVERTIME: Duration = Duration::from_secs(30);

/// Reconnect loop timing (spec.md §4.7, §5, §9).
pub const RECONNECT_DISCONNECT_INTERVAL: Duration = Duration::from_secs(10);
pub const RECONNECT_JITTER_MIN: Duration = Duration::from_millis(500);
pub const RECONNECT_JITTER_MAX: Duration = Duration::from_millis(2000);

/// Signaling dial timeout (spec.md §5).
pub const SIGNALING_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// WireGuard-facing configuration for a single peer connection.
#[derive(Debug, Clone)]
pub struct WgConfig {
    pub wg_listen_port: u16,
    pub remote_key: PeerKey,
    pub allowed_ips: IpNet,
    pub preshared_key: Option<PresharedKey>,
}

/// Everything needed to construct a [`crate::peer_conn::PeerConnActor`]
/// (spec.md §3 "Config").
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub local_key: PeerKey,
    pub remote_key: PeerKey,
    /// Base reconnect ticker period while neither transport is connected.
    pub reconnect_timeout: Duration,
    pub wg_config: WgConfig,
    pub rosenpass_pubkey: Option<Vec<u8>>,
    pub rosenpass_addr: Option<std::net::SocketAddr>,
}

impl ConnConfig {
    /// Parses `allowed_ips` from its CIDR string form (spec.md §3 "exactly
    /// one" allowed-IPs entry), matching `NewConn`'s `net.ParseCIDR` call.
    pub fn parse_allowed_ips(raw: &str) -> Result<IpNet, ConnError> {
        raw.parse()
            .map_err(|source| ConnError::InvalidAllowedIps {
                raw: raw.to_string(),
                source,
            })
    }

    /// The peer whose key compares lexicographically greater owns the
    /// reconnect clock (spec.md §4.7, §9).
    pub fn is_controller(&self) -> bool {
        self.local_key > self.remote_key
    }
}
