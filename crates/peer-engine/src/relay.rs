use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use xtra::prelude::*;

use crate::config::WG_HANDSHAKE_OVERTIME;
use crate::config::WG_HANDSHAKE_PERIOD;
use crate::error::RelayError;
use crate::keys::PeerKey;
use crate::signaling::OfferAnswer;
use crate::signaling::OnNewOfferAnswer;
use crate::wg::WgInterface;
use crate::wg_proxy::TurnStream;

/// Opened relay-backed transport, as handed back by [`RelayManager::open_conn`]
/// (spec.md §6 `OpenConn`). `disconnected` resolves when the relay library
/// itself tears the session down (distinct from the WG-handshake liveness
/// check this worker also runs, spec.md §4.4).
pub struct RelayConn {
    pub stream: Box<dyn TurnStream>,
    pub disconnected: BoxFuture<'static, ()>,
}

/// The relay fallback transport, an external collaborator (spec.md §1, §6).
#[async_trait]
pub trait RelayManager: Send + Sync {
    /// Whether the local client has any relay server configured at all
    /// (spec.md §4.4 "If the local client has no relay, the worker
    /// declares relay unsupported and no-ops").
    fn has_relay_address(&self) -> bool;

    /// The local client's preferred relay server address.
    async fn relay_instance_address(&self) -> Result<String, RelayError>;

    /// Opens a relay session with the remote peer through `server`.
    /// Implementations MUST return [`RelayError::AlreadyExists`] if a
    /// session to this peer is already open, which this worker treats as
    /// success-noop (spec.md §4.4 "Only one relay transport per peer").
    async fn open_conn(&self, server: &str, remote_key: &PeerKey) -> Result<RelayConn, RelayError>;
}

/// Sent to the owning `PeerConnActor` once a relay session is open
/// (spec.md §4.7 `RelayConnReady`).
pub struct RelayConnReady {
    pub stream: Box<dyn TurnStream>,
    pub rosenpass_pubkey: Option<Vec<u8>>,
    pub rosenpass_addr: Option<SocketAddr>,
}

/// Sent to the owning `PeerConnActor` on relay liveness loss, whether the
/// relay session itself dropped or the WG handshake clock timed out
/// (spec.md §4.4, §4.7).
pub struct RelayDisconnected;

struct ActiveRelay {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ActiveRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Opens and monitors the relay-backed transport for one peer (spec.md
/// §4.4). Grounded almost verbatim on
/// `original_source/client/internal/peer/worker_relay.go`: the controller
/// picks its own relay server, the non-controller uses the remote's
/// advertised address, and liveness is judged purely by the WG handshake
/// clock rather than anything relay-protocol-specific.
pub struct RelayWorkerActor<P> {
    local_key: PeerKey,
    remote_key: PeerKey,
    relay_manager: Arc<dyn RelayManager>,
    wg: Arc<dyn WgInterface>,
    owner: Address<P>,
    active: Option<ActiveRelay>,
}

impl<P> RelayWorkerActor<P>
where
    P: Handler<RelayConnReady, Return = ()> + Handler<RelayDisconnected, Return = ()>,
{
    pub fn new(
        local_key: PeerKey,
        remote_key: PeerKey,
        relay_manager: Arc<dyn RelayManager>,
        wg: Arc<dyn WgInterface>,
        owner: Address<P>,
    ) -> Self {
        Self {
            local_key,
            remote_key,
            relay_manager,
            wg,
            owner,
            active: None,
        }
    }

    /// Whether this peer is the lexicographically-greater-key "controller"
    /// (spec.md §4.4, §4.7, §9).
    pub fn is_controller(&self) -> bool {
        self.local_key > self.remote_key
    }

    pub fn relay_is_supported_locally(&self) -> bool {
        self.relay_manager.has_relay_address()
    }

    pub async fn relay_instance_address(&self) -> Result<String, RelayError> {
        self.relay_manager.relay_instance_address().await
    }

    fn is_relay_supported(&self, answer: &OfferAnswer) -> bool {
        self.relay_manager.has_relay_address() && answer.relay_server_address.is_some()
    }

    async fn preferred_relay_server(&self, remote_address: &str) -> Option<String> {
        if self.is_controller() {
            match self.relay_manager.relay_instance_address().await {
                Ok(addr) => Some(addr),
                Err(err) => {
                    tracing::warn!(%err, "failed to handle new offer");
                    None
                }
            }
        } else {
            Some(remote_address.to_string())
        }
    }

    async fn on_new_offer_answer(&mut self, msg: &OfferAnswer) {
        if !self.is_relay_supported(msg) {
            tracing::info!("relay is not supported by remote peer");
            return;
        }

        let remote_address = msg
            .relay_server_address
            .clone()
            .expect("checked by is_relay_supported");
        let Some(server) = self.preferred_relay_server(&remote_address).await else {
            return;
        };

        let relay_manager = self.relay_manager.clone();
        let wg = self.wg.clone();
        let remote_key = self.remote_key.clone();
        let owner = self.owner.clone();
        let rosenpass_pubkey = msg.rosenpass_pubkey.clone();
        let rosenpass_addr = msg.rosenpass_addr;

        let task = tokio::spawn(async move {
            let conn = match relay_manager.open_conn(&server, &remote_key).await {
                Ok(conn) => conn,
                Err(RelayError::AlreadyExists) => {
                    tracing::info!("relay connection to this peer already exists, no-op");
                    return;
                }
                Err(err) => {
                    tracing::warn!(%err, "failed to open connection via relay");
                    return;
                }
            };

            tracing::debug!(server, "relay connection established");

            let ready = RelayConnReady {
                stream: conn.stream,
                rosenpass_pubkey,
                rosenpass_addr,
            };
            if owner.send(ready).await.is_err() {
                return;
            }

            tokio::select! {
                _ = conn.disconnected => {}
                _ = monitor_wg_handshake_liveness(wg, remote_key) => {}
            }

            let _ = owner.send(RelayDisconnected).await;
        });

        self.active = Some(ActiveRelay { task });
    }
}

/// Polls the WG handshake clock and resolves once it has gone stale
/// (spec.md §4.4): poll no more often than `wgHandshakeOvertime` after the
/// transport opened, then reschedule at
/// `lastHandshake + wgHandshakePeriod + wgHandshakeOvertime − now` each
/// time the peer is still alive. A peer with no handshake on record yet is
/// treated as maximally stale, matching the zero-value `time.Time` the Go
/// implementation reads before the first handshake completes.
async fn monitor_wg_handshake_liveness(wg: Arc<dyn WgInterface>, remote_key: PeerKey) {
    let mut delay = WG_HANDSHAKE_OVERTIME;
    loop {
        tokio::time::sleep(delay).await;

        let stats = match wg.get_stats(&remote_key).await {
            Ok(stats) => stats,
            Err(err) => {
                tracing::warn!(%err, "failed to read wg stats");
                delay = WG_HANDSHAKE_OVERTIME;
                continue;
            }
        };

        let elapsed = stats
            .last_handshake
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);

        if elapsed > WG_HANDSHAKE_PERIOD {
            tracing::info!("wireguard handshake timed out, closing relay connection");
            return;
        }

        delay = (WG_HANDSHAKE_PERIOD + WG_HANDSHAKE_OVERTIME).saturating_sub(elapsed);
    }
}

pub struct GetRelayAddress;

#[async_trait]
impl<P> Actor for RelayWorkerActor<P>
where
    P: Handler<RelayConnReady, Return = ()> + Handler<RelayDisconnected, Return = ()> + 'static,
{
    type Stop = ();

    async fn stopped(self) -> Self::Stop {}
}

#[async_trait]
impl<P> Handler<OnNewOfferAnswer> for RelayWorkerActor<P>
where
    P: Handler<RelayConnReady, Return = ()> + Handler<RelayDisconnected, Return = ()> + 'static,
{
    type Return = ();

    async fn handle(&mut self, msg: OnNewOfferAnswer, _: &mut Context<Self>) -> Self::Return {
        self.on_new_offer_answer(&msg.0).await;
    }
}

#[async_trait]
impl<P> Handler<GetRelayAddress> for RelayWorkerActor<P>
where
    P: Handler<RelayConnReady, Return = ()> + Handler<RelayDisconnected, Return = ()> + 'static,
{
    type Return = Option<String>;

    async fn handle(&mut self, _: GetRelayAddress, _: &mut Context<Self>) -> Self::Return {
        self.relay_instance_address().await.ok()
    }
}
