//! Per-peer connection establishment and lifecycle engine.
//!
//! [`peer_conn::spawn`] is the entry point: it wires an [`ice::IceAgent`]
//! and a [`relay::RelayManager`] into a pair of worker actors, races them
//! against each other for one remote peer, and arbitrates which transport's
//! endpoint gets installed into WireGuard through a [`wg::WgInterface`].
//! Liveness loss reconverges without ever tearing down the logical peer;
//! only [`peer_conn::Close`] does that.

pub mod config;
pub mod conn_id;
pub mod error;
pub mod hooks;
pub mod ice;
pub mod keys;
pub mod peer_conn;
pub mod relay;
pub mod signaling;
pub mod status;
pub mod wg;
pub mod wg_proxy;

pub use conn_id::ConnId;
pub use config::ConnConfig;
pub use config::WgConfig;
pub use keys::PeerKey;
pub use keys::PresharedKey;
pub use peer_conn::spawn;
pub use peer_conn::PeerConnActor;
pub use peer_conn::PeerConnHandle;
pub use status::ConnPriority;
pub use status::ConnStatus;
pub use status::PeerState;
pub use status::StatusSink;
