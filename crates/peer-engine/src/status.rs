/// Connection status of one transport (ICE or relay), or of the peer as a
/// whole (spec.md §3). Declaration order is the ranking order used by
/// `evalStatus`-style comparisons: `Disconnected < Connecting < Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Priority of an installed transport (spec.md §4.7). `Relay` and `IceTurn`
/// share the same numeric priority: a TURN-relayed ICE candidate is no
/// better than the dedicated relay transport, only `IceP2P` outranks both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ConnPriority(u8);

impl ConnPriority {
    pub const NONE: ConnPriority = ConnPriority(0);
    pub const RELAY: ConnPriority = ConnPriority(1);
    pub const ICE_TURN: ConnPriority = ConnPriority(1);
    pub const ICE_P2P: ConnPriority = ConnPriority(2);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// ICE candidate metadata published alongside a connected peer state
/// (spec.md §4.7 step 8 "Publish connected peer-state with ICE candidate
/// metadata"). `None` for a relay-only connection.
#[derive(Debug, Clone, Default)]
pub struct IceCandidateMeta {
    pub local_candidate_type: Option<crate::ice::CandidateType>,
    pub remote_candidate_type: Option<crate::ice::CandidateType>,
    pub local_candidate_endpoint: Option<std::net::SocketAddr>,
    pub remote_candidate_endpoint: Option<std::net::SocketAddr>,
    pub direct: bool,
    pub relayed: bool,
}

/// The externally-observable state of one peer (spec.md §6, the "Status
/// recorder" mentioned as an external collaborator). Left deliberately
/// narrow: this engine only ever reports its own peer's state, never reads
/// anyone else's.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub remote_key: crate::keys::PeerKey,
    pub status: ConnStatus,
    pub ice: IceCandidateMeta,
    pub rosenpass_enabled: bool,
    pub rosenpass_pubkey: Option<Vec<u8>>,
    pub rosenpass_addr: Option<std::net::SocketAddr>,
}

impl PeerState {
    pub fn disconnected(remote_key: crate::keys::PeerKey) -> Self {
        Self {
            remote_key,
            status: ConnStatus::Disconnected,
            ice: IceCandidateMeta::default(),
            rosenpass_enabled: false,
            rosenpass_pubkey: None,
            rosenpass_addr: None,
        }
    }
}

/// Narrow sink for peer-state publication and WireGuard stats resets
/// (spec.md §6 "Status recorder"). The management/observability surface
/// that actually persists or displays this state is out of this core's
/// scope (spec.md §1 "Out of scope").
pub trait StatusSink: Send + Sync {
    fn update_peer_state(&self, state: PeerState);
    fn reset_wireguard_stats(&self, remote_key: &crate::keys::PeerKey);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ladder_matches_spec() {
        assert!(ConnPriority::NONE < ConnPriority::RELAY);
        assert_eq!(ConnPriority::RELAY, ConnPriority::ICE_TURN);
        assert!(ConnPriority::ICE_TURN < ConnPriority::ICE_P2P);
    }

    #[test]
    fn status_ladder_matches_spec() {
        assert!(ConnStatus::Disconnected < ConnStatus::Connecting);
        assert!(ConnStatus::Connecting < ConnStatus::Connected);
    }
}
