use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("invalid allowed-ips CIDR {raw:?}: {source}")]
    InvalidAllowedIps {
        raw: String,
        #[source]
        source: ipnet::AddrParseError,
    },
}

#[derive(Debug, Error)]
pub enum WgError {
    #[error("failed to update wireguard peer: {0}")]
    UpdatePeer(String),
    #[error("failed to remove wireguard peer: {0}")]
    RemovePeer(String),
    #[error("failed to read wireguard peer stats: {0}")]
    Stats(String),
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaler is not ready")]
    NotReady,
    #[error("failed to send signaling message: {0}")]
    Send(String),
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("a relay connection to this peer already exists")]
    AlreadyExists,
    #[error("no relay address configured locally")]
    Unsupported,
    #[error("failed to open relay connection: {0}")]
    Open(String),
}

#[derive(Debug, Error)]
#[error("ICE negotiation failed: {0}")]
pub struct IceError(pub String);

#[derive(Debug, Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);
