use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use xtra::prelude::*;
use xtras::SendAsyncSafe;

use crate::config::ConnConfig;
use crate::config::RECONNECT_DISCONNECT_INTERVAL;
use crate::config::RECONNECT_JITTER_MAX;
use crate::config::RECONNECT_JITTER_MIN;
use crate::config::WG_KEEPALIVE;
use crate::conn_id::ConnId;
use crate::hooks::AfterRemovePeerHook;
use crate::hooks::BeforeAddPeerHook;
use crate::hooks::Hooks;
use crate::ice::GetLocalUserCredentials;
use crate::ice::IceAgent;
use crate::ice::IceCandidate;
use crate::ice::IceConnReady;
use crate::ice::IceEndpoint;
use crate::ice::IceStatusChanged;
use crate::ice::IceWorkerActor;
use crate::ice::OnRemoteCandidate;
use crate::keys::PeerKey;
use crate::relay::GetRelayAddress;
use crate::relay::RelayConnReady;
use crate::relay::RelayDisconnected;
use crate::relay::RelayManager;
use crate::relay::RelayWorkerActor;
use crate::signaling::spawn_offer_answer_listener;
use crate::signaling::HandshakeArgs;
use crate::signaling::Handshaker;
use crate::signaling::OfferAnswer;
use crate::signaling::Signaler;
use crate::status::ConnPriority;
use crate::status::ConnStatus;
use crate::status::IceCandidateMeta;
use crate::status::PeerState;
use crate::status::StatusSink;
use crate::wg::WgInterface;
use crate::wg_proxy::WgProxy;
use crate::wg_proxy::WgProxyFactory;

/// Fired once a transport install completes (spec.md §4.7 step 8, mirroring
/// `Conn.SetOnConnected`'s callback shape).
#[derive(Debug, Clone)]
pub struct ConnectedEvent {
    pub remote_key: PeerKey,
    pub remote_rosenpass_pubkey: Option<Vec<u8>>,
    pub wireguard_ip: IpAddr,
    pub remote_rosenpass_addr: Option<SocketAddr>,
}

pub type OnConnectedHandler = Arc<dyn Fn(ConnectedEvent) + Send + Sync>;
pub type OnDisconnectedHandler = Arc<dyn Fn(PeerKey) + Send + Sync>;

/// Owns the two transport workers for one remote peer, arbitrates which
/// transport's endpoint is installed into WireGuard, and reconverges after
/// liveness loss without ever dropping the logical peer (spec.md §4.7).
///
/// The actor's mailbox *is* the "serialized critical section" spec.md §5
/// requires: every handler below runs to completion before the next is
/// dequeued, so the invariants in spec.md §3 only need to be true at the
/// end of each handler, not at every intermediate step.
pub struct PeerConnActor {
    config: ConnConfig,
    wg: Arc<dyn WgInterface>,
    wg_proxy_factory: Arc<dyn WgProxyFactory>,
    status_sink: Arc<dyn StatusSink>,
    handshaker: Arc<Handshaker>,
    ice_worker: Address<IceWorkerActor<PeerConnActor>>,
    relay_worker: Address<RelayWorkerActor<PeerConnActor>>,
    hooks: Hooks,

    status_ice: ConnStatus,
    status_relay: ConnStatus,
    current_priority: ConnPriority,
    conn_id: Option<ConnId>,
    wg_proxy_ice: Option<Box<dyn WgProxy>>,
    wg_proxy_relay: Option<Box<dyn WgProxy>>,
    endpoint_relay: Option<SocketAddr>,

    reconnect_notify: Arc<Notify>,
    cancellation: CancellationToken,

    on_connected: Option<OnConnectedHandler>,
    on_disconnected: Option<OnDisconnectedHandler>,
}

impl PeerConnActor {
    fn eval_status(&self) -> ConnStatus {
        if self.status_relay == ConnStatus::Connected || self.status_ice == ConnStatus::Connected {
            ConnStatus::Connected
        } else if self.status_relay == ConnStatus::Connecting
            || self.status_ice == ConnStatus::Connecting
        {
            ConnStatus::Connecting
        } else {
            ConnStatus::Disconnected
        }
    }

    async fn configure_wg_endpoint(&self, endpoint: SocketAddr) -> Result<(), crate::error::WgError> {
        self.wg
            .update_peer(
                &self.config.remote_key,
                self.config.wg_config.allowed_ips,
                WG_KEEPALIVE,
                endpoint,
                self.config.wg_config.preshared_key.as_ref(),
            )
            .await
    }

    /// Marks that the reconnect loop should send a fresh offer as soon as
    /// it next wakes. `Notify::notify_one` already coalesces any number of
    /// calls made before the loop consumes the permit into a single wakeup
    /// (spec.md §9 open question: "a single pending 'needs re-offer' bit is
    /// sufficient").
    fn signal_reconnect(&self) {
        self.reconnect_notify.notify_one();
    }

    fn publish_ice_connected(
        &self,
        ice: IceCandidateMeta,
        rosenpass_pubkey: Option<Vec<u8>>,
        rosenpass_addr: Option<SocketAddr>,
    ) {
        let state = PeerState {
            remote_key: self.config.remote_key.clone(),
            status: ConnStatus::Connected,
            ice,
            rosenpass_enabled: rosenpass_pubkey.is_some(),
            rosenpass_pubkey: rosenpass_pubkey.clone(),
            rosenpass_addr,
        };
        self.status_sink.update_peer_state(state);

        if let Some(cb) = &self.on_connected {
            cb(ConnectedEvent {
                remote_key: self.config.remote_key.clone(),
                remote_rosenpass_pubkey: rosenpass_pubkey,
                wireguard_ip: self.config.wg_config.allowed_ips.addr(),
                remote_rosenpass_addr: rosenpass_addr,
            });
        }
    }

    fn publish_relay_connected(&self, rosenpass_pubkey: Option<Vec<u8>>, rosenpass_addr: Option<SocketAddr>) {
        let state = PeerState {
            remote_key: self.config.remote_key.clone(),
            status: ConnStatus::Connected,
            ice: IceCandidateMeta {
                direct: false,
                relayed: true,
                ..IceCandidateMeta::default()
            },
            rosenpass_enabled: rosenpass_pubkey.is_some(),
            rosenpass_pubkey: rosenpass_pubkey.clone(),
            rosenpass_addr,
        };
        self.status_sink.update_peer_state(state);

        if let Some(cb) = &self.on_connected {
            cb(ConnectedEvent {
                remote_key: self.config.remote_key.clone(),
                remote_rosenpass_pubkey: rosenpass_pubkey,
                wireguard_ip: self.config.wg_config.allowed_ips.addr(),
                remote_rosenpass_addr: rosenpass_addr,
            });
        }
    }

    fn publish_disconnected(&self) {
        self.status_sink
            .update_peer_state(PeerState::disconnected(self.config.remote_key.clone()));
        if let Some(cb) = &self.on_disconnected {
            cb(self.config.remote_key.clone());
        }
    }

    async fn on_ice_conn_ready(&mut self, msg: IceConnReady) {
        if self.cancellation.is_cancelled() {
            return;
        }

        self.status_ice = ConnStatus::Connected;

        if !self.current_priority.is_none() && msg.priority <= self.current_priority {
            tracing::debug!("dropping lower/equal priority ICE candidate, keeping current transport");
            return;
        }

        let relayed_on_local = msg.info.relayed_on_local;
        let ice_meta = IceCandidateMeta {
            local_candidate_type: Some(msg.info.local_candidate_type),
            remote_candidate_type: Some(msg.info.remote_candidate_type),
            local_candidate_endpoint: msg.info.local_candidate_endpoint,
            remote_candidate_endpoint: msg.info.remote_candidate_endpoint,
            direct: msg.info.direct,
            relayed: msg.info.relayed,
        };
        let rosenpass_pubkey = msg.info.rosenpass_pubkey.clone();
        let rosenpass_addr = msg.info.rosenpass_addr;

        let (endpoint, new_proxy) = match msg.info.endpoint {
            IceEndpoint::Turn(stream) => {
                debug_assert!(relayed_on_local);
                let mut proxy = self.wg_proxy_factory.new_proxy();
                match proxy.add_turn_conn(stream).await {
                    Ok(addr) => (addr, Some(proxy)),
                    Err(err) => {
                        tracing::warn!(%err, "failed to add turn net.Conn to local proxy");
                        return;
                    }
                }
            }
            IceEndpoint::Direct(addr) => (addr, None),
        };

        let conn_id = ConnId::generate();
        self.hooks.run_before_add(conn_id, endpoint.ip());

        if let Err(err) = self
            .wg
            .update_peer(
                &self.config.remote_key,
                self.config.wg_config.allowed_ips,
                WG_KEEPALIVE,
                endpoint,
                self.config.wg_config.preshared_key.as_ref(),
            )
            .await
        {
            if let Some(mut proxy) = new_proxy {
                let _ = proxy.close_conn().await;
            }
            tracing::warn!(%err, "failed to update wg peer configuration");
            return;
        }

        if let Some(mut old) = self.wg_proxy_ice.take() {
            if let Err(err) = old.close_conn().await {
                tracing::warn!(%err, "failed to close deprecated wg proxy conn");
            }
        }
        self.wg_proxy_ice = new_proxy;
        self.conn_id = Some(conn_id);
        self.current_priority = msg.priority;

        self.publish_ice_connected(ice_meta, rosenpass_pubkey, rosenpass_addr);
    }

    async fn on_ice_status_changed(&mut self, msg: IceStatusChanged) {
        let IceStatusChanged(new_status) = msg;

        if let Some(relay_endpoint) = self.endpoint_relay {
            if self.status_relay == ConnStatus::Connected {
                tracing::debug!("ICE disconnected, falling back to relay endpoint");
                if let Err(err) = self.configure_wg_endpoint(relay_endpoint).await {
                    tracing::warn!(%err, "failed to switch back to relay conn");
                }
                self.current_priority = ConnPriority::RELAY;
                self.status_ice = new_status;
                return;
            }
        }

        if self.status_relay == ConnStatus::Connected {
            self.status_ice = new_status;
            return;
        }

        let previous = self.eval_status();
        self.status_ice = new_status;
        if self.eval_status() < previous {
            self.publish_disconnected();
        }
        self.signal_reconnect();
    }

    async fn on_relay_conn_ready(&mut self, msg: RelayConnReady) {
        if self.cancellation.is_cancelled() {
            return;
        }

        self.status_relay = ConnStatus::Connected;

        let mut proxy = self.wg_proxy_factory.new_proxy();
        let endpoint = match proxy.add_turn_conn(msg.stream).await {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(%err, "failed to add relayed net.Conn to local proxy");
                return;
            }
        };
        self.endpoint_relay = Some(endpoint);

        let ice_already_preferred =
            self.current_priority > ConnPriority::RELAY && self.status_ice == ConnStatus::Connected;

        if ice_already_preferred {
            tracing::debug!(
                priority = ?self.current_priority,
                "do not switch to relay, ICE already active at a higher priority"
            );
            if let Some(mut old) = self.wg_proxy_relay.replace(proxy) {
                let _ = old.close_conn().await;
            }
            return;
        }

        let conn_id = ConnId::generate();
        self.hooks.run_before_add(conn_id, endpoint.ip());

        if let Err(err) = self.configure_wg_endpoint(endpoint).await {
            let _ = proxy.close_conn().await;
            tracing::warn!(%err, "failed to update wg peer configuration");
            return;
        }

        if let Some(mut old) = self.wg_proxy_relay.replace(proxy) {
            let _ = old.close_conn().await;
        }
        self.conn_id = Some(conn_id);
        self.current_priority = ConnPriority::RELAY;

        self.publish_relay_connected(msg.rosenpass_pubkey, msg.rosenpass_addr);
    }

    async fn on_relay_disconnected(&mut self) {
        if let Some(mut proxy) = self.wg_proxy_relay.take() {
            self.endpoint_relay = None;
            let _ = proxy.close_conn().await;
        }

        if self.status_ice == ConnStatus::Connected {
            self.status_relay = ConnStatus::Disconnected;
            return;
        }

        let previous = self.eval_status();
        self.status_relay = ConnStatus::Disconnected;
        if self.eval_status() < previous {
            self.publish_disconnected();
        }
        self.signal_reconnect();
    }

    async fn on_close(&mut self) {
        self.cancellation.cancel();

        if let Some(mut proxy) = self.wg_proxy_relay.take() {
            if let Err(err) = proxy.close_conn().await {
                tracing::warn!(%err, "failed to close wg proxy for relay");
            }
        }
        if let Some(mut proxy) = self.wg_proxy_ice.take() {
            if let Err(err) = proxy.close_conn().await {
                tracing::warn!(%err, "failed to close wg proxy for ice");
            }
        }

        if let Err(err) = self.wg.remove_peer(&self.config.remote_key).await {
            tracing::warn!(%err, "failed to remove wg endpoint");
        }

        if let Some(conn_id) = self.conn_id.take() {
            self.hooks.run_after_remove(conn_id);
        }

        let was_connected = self.eval_status() == ConnStatus::Connected;

        self.status_relay = ConnStatus::Disconnected;
        self.status_ice = ConnStatus::Disconnected;
        self.endpoint_relay = None;

        self.status_sink
            .update_peer_state(PeerState::disconnected(self.config.remote_key.clone()));
        if was_connected {
            if let Some(cb) = &self.on_disconnected {
                cb(self.config.remote_key.clone());
            }
        }
        self.status_sink
            .reset_wireguard_stats(&self.config.remote_key);
    }
}

#[async_trait]
impl Actor for PeerConnActor {
    type Stop = ();

    async fn stopped(self) -> Self::Stop {}
}

/// Policy on `ICEConnReady` (spec.md §4.7).
#[async_trait]
impl Handler<IceConnReady> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, msg: IceConnReady, _: &mut Context<Self>) -> Self::Return {
        self.on_ice_conn_ready(msg).await;
    }
}

/// Policy on `ICEDisconnected` (spec.md §4.7). Unlike the Go original's
/// unconditional channel signal in a deferred closure, the fail-back branch
/// below deliberately does **not** wake the reconnect loop: scenario 5 in
/// spec.md §8 requires that recovering to the cached relay endpoint sends
/// no fresh offer, which only holds if this branch treats itself as a
/// full recovery rather than a disconnect (see DESIGN.md).
#[async_trait]
impl Handler<IceStatusChanged> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, msg: IceStatusChanged, _: &mut Context<Self>) -> Self::Return {
        self.on_ice_status_changed(msg).await;
    }
}

/// Policy on `RelayConnReady` (spec.md §4.7). The new proxy is always kept
/// alive in `wg_proxy_relay`, even when a higher-priority ICE transport is
/// already installed and the WG endpoint update is skipped: spec.md §8
/// scenario 5 requires ICE-to-relay fail-back with "no offer exchange",
/// which is only possible if the relay forwarder is still running when
/// that fail-back happens (see DESIGN.md for why this departs from the Go
/// original, which drops the proxy on the floor in that branch).
#[async_trait]
impl Handler<RelayConnReady> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, msg: RelayConnReady, _: &mut Context<Self>) -> Self::Return {
        self.on_relay_conn_ready(msg).await;
    }
}

/// Policy on `RelayDisconnected` (spec.md §4.7).
#[async_trait]
impl Handler<RelayDisconnected> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, _: RelayDisconnected, _: &mut Context<Self>) -> Self::Return {
        self.on_relay_disconnected().await;
    }
}

/// Closes this peer connection (spec.md §4.7 "Close"). Idempotent: every
/// step tolerates already-torn-down state, so calling it twice has the
/// same observable effect as once (spec.md §8).
pub struct Close;

#[async_trait]
impl Handler<Close> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, _: Close, ctx: &mut Context<Self>) -> Self::Return {
        self.on_close().await;
        ctx.stop_self();
    }
}

/// Handles an inbound offer (spec.md §4.5, §6). Non-blocking; discards if
/// this peer isn't in a state to accept it.
pub struct OnRemoteOffer(pub OfferAnswer);

#[async_trait]
impl Handler<OnRemoteOffer> for PeerConnActor {
    type Return = bool;

    async fn handle(&mut self, msg: OnRemoteOffer, _: &mut Context<Self>) -> Self::Return {
        if self.cancellation.is_cancelled() {
            return false;
        }
        self.handshaker.on_remote_offer(msg.0)
    }
}

/// Handles an inbound answer (spec.md §4.5, §6).
pub struct OnRemoteAnswer(pub OfferAnswer);

#[async_trait]
impl Handler<OnRemoteAnswer> for PeerConnActor {
    type Return = bool;

    async fn handle(&mut self, msg: OnRemoteAnswer, _: &mut Context<Self>) -> Self::Return {
        if self.cancellation.is_cancelled() {
            return false;
        }
        self.handshaker.on_remote_answer(msg.0)
    }
}

/// Forwards a remote ICE candidate straight to the ICE worker (spec.md §6
/// `OnRemoteCandidate`).
pub struct OnRemoteCandidateMsg(pub IceCandidate);

#[async_trait]
impl Handler<OnRemoteCandidateMsg> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, msg: OnRemoteCandidateMsg, _: &mut Context<Self>) -> Self::Return {
        let _ = self
            .ice_worker
            .send_async_safe(OnRemoteCandidate(msg.0))
            .await;
    }
}

/// Registers a firewall/route hook (spec.md §6 external hook surface).
pub struct AddBeforeAddPeerHookMsg(pub BeforeAddPeerHook);
pub struct AddAfterRemovePeerHookMsg(pub AfterRemovePeerHook);

#[async_trait]
impl Handler<AddBeforeAddPeerHookMsg> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, msg: AddBeforeAddPeerHookMsg, _: &mut Context<Self>) -> Self::Return {
        self.hooks.add_before_add_peer_hook(msg.0);
    }
}

#[async_trait]
impl Handler<AddAfterRemovePeerHookMsg> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, msg: AddAfterRemovePeerHookMsg, _: &mut Context<Self>) -> Self::Return {
        self.hooks.add_after_remove_peer_hook(msg.0);
    }
}

pub struct SetOnConnected(pub OnConnectedHandler);
pub struct SetOnDisconnected(pub OnDisconnectedHandler);

#[async_trait]
impl Handler<SetOnConnected> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, msg: SetOnConnected, _: &mut Context<Self>) -> Self::Return {
        self.on_connected = Some(msg.0);
    }
}

#[async_trait]
impl Handler<SetOnDisconnected> for PeerConnActor {
    type Return = ();

    async fn handle(&mut self, msg: SetOnDisconnected, _: &mut Context<Self>) -> Self::Return {
        self.on_disconnected = Some(msg.0);
    }
}

/// Reports the peer's overall status (spec.md §4.7 `Status()`).
pub struct GetStatus;

#[async_trait]
impl Handler<GetStatus> for PeerConnActor {
    type Return = ConnStatus;

    async fn handle(&mut self, _: GetStatus, _: &mut Context<Self>) -> Self::Return {
        self.eval_status()
    }
}

/// Asked by the reconnect loop on every tick; kept inside the actor's
/// critical section so the read of both transport statuses is atomic with
/// respect to the handlers above (spec.md §5 "no I/O that can block
/// indefinitely may occur" inside the section — this is a plain read).
pub(crate) struct ShouldSkipReconnectTick;

#[async_trait]
impl Handler<ShouldSkipReconnectTick> for PeerConnActor {
    type Return = bool;

    async fn handle(&mut self, _: ShouldSkipReconnectTick, _: &mut Context<Self>) -> Self::Return {
        self.status_relay == ConnStatus::Connected && self.status_ice == ConnStatus::Connected
    }
}

/// Spawns the actor, its two workers, and the reconnect loop for one
/// remote peer (spec.md §4.7 `NewConn` + `Open`). Returns a lightweight
/// handle through which the caller drives signaling input and shuts the
/// peer down.
pub struct PeerConnHandle {
    address: Address<PeerConnActor>,
}

impl PeerConnHandle {
    pub fn address(&self) -> Address<PeerConnActor> {
        self.address.clone()
    }

    pub async fn close(&self) {
        let _ = self.address.send(Close).await;
    }

    pub async fn on_remote_offer(&self, offer: OfferAnswer) -> bool {
        self.address
            .send(OnRemoteOffer(offer))
            .await
            .unwrap_or(false)
    }

    pub async fn on_remote_answer(&self, answer: OfferAnswer) -> bool {
        self.address
            .send(OnRemoteAnswer(answer))
            .await
            .unwrap_or(false)
    }

    pub async fn on_remote_candidate(&self, candidate: IceCandidate) {
        let _ = self
            .address
            .send_async_safe(OnRemoteCandidateMsg(candidate))
            .await;
    }

    pub async fn status(&self) -> ConnStatus {
        self.address
            .send(GetStatus)
            .await
            .unwrap_or(ConnStatus::Disconnected)
    }

    pub async fn add_before_add_peer_hook(&self, hook: BeforeAddPeerHook) {
        let _ = self.address.send(AddBeforeAddPeerHookMsg(hook)).await;
    }

    pub async fn add_after_remove_peer_hook(&self, hook: AfterRemovePeerHook) {
        let _ = self.address.send(AddAfterRemovePeerHookMsg(hook)).await;
    }

    pub async fn set_on_connected(&self, handler: OnConnectedHandler) {
        let _ = self.address.send(SetOnConnected(handler)).await;
    }

    pub async fn set_on_disconnected(&self, handler: OnDisconnectedHandler) {
        let _ = self.address.send(SetOnDisconnected(handler)).await;
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn spawn(
    config: ConnConfig,
    wg: Arc<dyn WgInterface>,
    wg_proxy_factory: Arc<dyn WgProxyFactory>,
    signaler: Arc<dyn Signaler>,
    relay_manager: Arc<dyn RelayManager>,
    ice_agent: Arc<dyn IceAgent>,
    status_sink: Arc<dyn StatusSink>,
) -> PeerConnHandle {
    let (peer_address, peer_mailbox) = Mailbox::unbounded();

    let (ice_address, ice_mailbox) = Mailbox::unbounded();
    tokio::spawn(xtra::run(
        ice_mailbox,
        IceWorkerActor::new(ice_agent, peer_address.clone()),
    ));

    let (relay_address, relay_mailbox) = Mailbox::unbounded();
    tokio::spawn(xtra::run(
        relay_mailbox,
        RelayWorkerActor::new(
            config.local_key.clone(),
            config.remote_key.clone(),
            relay_manager,
            wg.clone(),
            peer_address.clone(),
        ),
    ));

    let handshaker = Arc::new(Handshaker::new(
        config.local_key.clone(),
        config.remote_key.clone(),
        signaler,
    ));
    spawn_offer_answer_listener(handshaker.subscribe(), ice_address.clone());
    spawn_offer_answer_listener(handshaker.subscribe(), relay_address.clone());

    let reconnect_notify = Arc::new(Notify::new());
    let cancellation = CancellationToken::new();
    let is_controller = config.is_controller();
    let base_timeout = config.reconnect_timeout;
    let local_wg_pubkey = config.local_key.clone();
    let rosenpass_pubkey = config.rosenpass_pubkey.clone();
    let rosenpass_addr = config.rosenpass_addr;

    let actor = PeerConnActor {
        config,
        wg,
        wg_proxy_factory,
        status_sink,
        handshaker: handshaker.clone(),
        ice_worker: ice_address.clone(),
        relay_worker: relay_address.clone(),
        hooks: Hooks::default(),
        status_ice: ConnStatus::Disconnected,
        status_relay: ConnStatus::Disconnected,
        current_priority: ConnPriority::NONE,
        conn_id: None,
        wg_proxy_ice: None,
        wg_proxy_relay: None,
        endpoint_relay: None,
        reconnect_notify: reconnect_notify.clone(),
        cancellation: cancellation.clone(),
        on_connected: None,
        on_disconnected: None,
    };
    tokio::spawn(xtra::run(peer_mailbox, actor));

    tokio::spawn(
        ReconnectLoop {
            is_controller,
            base_timeout,
            ice_worker: ice_address,
            relay_worker: relay_address,
            handshaker,
            peer: peer_address.clone(),
            reconnect_notify,
            cancellation: cancellation.clone(),
            local_wg_pubkey,
            rosenpass_pubkey,
            rosenpass_addr,
        }
        .run(),
    );

    PeerConnHandle {
        address: peer_address,
    }
}

/// Drives offer (re)sending for one peer (spec.md §4.7 "Reconnect loop").
/// Only the controller (lexicographically greater local key) runs the
/// ticker at all; the non-controller only ever responds to inbound offers
/// (spec.md §9).
struct ReconnectLoop {
    is_controller: bool,
    base_timeout: Duration,
    ice_worker: Address<IceWorkerActor<PeerConnActor>>,
    relay_worker: Address<RelayWorkerActor<PeerConnActor>>,
    handshaker: Arc<Handshaker>,
    peer: Address<PeerConnActor>,
    reconnect_notify: Arc<Notify>,
    cancellation: CancellationToken,
    local_wg_pubkey: PeerKey,
    rosenpass_pubkey: Option<Vec<u8>>,
    rosenpass_addr: Option<SocketAddr>,
}

impl ReconnectLoop {
    async fn run(self) {
        if !self.is_controller {
            self.cancellation.cancelled().await;
            return;
        }

        self.jitter_sleep().await;
        if let Err(err) = self.do_handshake().await {
            tracing::error!(%err, "failed to send offer");
        }

        let mut interval = tokio::time::interval(self.base_timeout);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.peer.send(ShouldSkipReconnectTick).await {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(_) => return,
                    }
                }
                _ = self.reconnect_notify.notified() => {
                    tracing::debug!("connection disconnected, scheduling a new offer");
                    interval = tokio::time::interval(RECONNECT_DISCONNECT_INTERVAL);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                }
                _ = self.cancellation.cancelled() => return,
            }

            self.jitter_sleep().await;
            if let Err(err) = self.do_handshake().await {
                tracing::error!(%err, "failed to do handshake");
            }
        }
    }

    async fn jitter_sleep(&self) {
        let millis = rand::thread_rng()
            .gen_range(RECONNECT_JITTER_MIN.as_millis()..=RECONNECT_JITTER_MAX.as_millis());
        tokio::select! {
            _ = tokio_extras::time::sleep(Duration::from_millis(millis as u64)) => {}
            _ = self.cancellation.cancelled() => {}
        }
    }

    /// spec.md §4.7 `doHandshake`: reads fresh local ICE credentials and
    /// the current relay address, then sends a single offer carrying the
    /// local WG public key and (if configured) the Rosenpass public key and
    /// address (spec.md §4.5 `SendOffer`).
    async fn do_handshake(&self) -> Result<(), crate::error::SignalError> {
        let credentials = self
            .ice_worker
            .send(GetLocalUserCredentials)
            .await
            .map_err(|_| crate::error::SignalError::NotReady)?;
        let relay_addr = self.relay_worker.send(GetRelayAddress).await.ok().flatten();

        self.handshaker
            .send_offer(HandshakeArgs {
                ice_ufrag: credentials.ufrag,
                ice_pwd: credentials.pwd,
                relay_addr,
                wg_pubkey: self.local_wg_pubkey.clone(),
                rosenpass_pubkey: self.rosenpass_pubkey.clone(),
                rosenpass_addr: self.rosenpass_addr,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use crate::error::IceError;
    use crate::error::RelayError;
    use crate::error::SignalError;
    use crate::error::WgError;
    use crate::ice::CandidateType;
    use crate::ice::IceCandidate;
    use crate::ice::IceConnInfo;
    use crate::ice::IceCredentials;
    use crate::ice::IceSession;
    use crate::relay::RelayConn;
    use crate::wg::WgStats;
    use crate::wg_proxy::LoopbackWgProxyFactory;

    use super::*;

    struct FakeWg {
        updates: Mutex<Vec<(PeerKey, SocketAddr)>>,
        removed: Mutex<Vec<PeerKey>>,
    }

    impl FakeWg {
        fn new() -> Self {
            Self {
                updates: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WgInterface for FakeWg {
        async fn update_peer(
            &self,
            pubkey: &PeerKey,
            _allowed_ips: ipnet::IpNet,
            _keepalive: Duration,
            endpoint: SocketAddr,
            _psk: Option<&crate::keys::PresharedKey>,
        ) -> Result<(), WgError> {
            self.updates.lock().unwrap().push((pubkey.clone(), endpoint));
            Ok(())
        }

        async fn remove_peer(&self, pubkey: &PeerKey) -> Result<(), WgError> {
            self.removed.lock().unwrap().push(pubkey.clone());
            Ok(())
        }

        async fn get_stats(&self, _pubkey: &PeerKey) -> Result<WgStats, WgError> {
            Ok(WgStats::default())
        }
    }

    #[derive(Default)]
    struct FakeStatusSink {
        states: Mutex<Vec<PeerState>>,
        resets: Mutex<Vec<PeerKey>>,
    }

    impl StatusSink for FakeStatusSink {
        fn update_peer_state(&self, state: PeerState) {
            self.states.lock().unwrap().push(state);
        }

        fn reset_wireguard_stats(&self, remote_key: &PeerKey) {
            self.resets.lock().unwrap().push(remote_key.clone());
        }
    }

    struct FakeSignaler;

    #[async_trait]
    impl Signaler for FakeSignaler {
        fn ready(&self) -> bool {
            true
        }

        async fn send_offer(&self, _remote: &PeerKey, _args: HandshakeArgs) -> Result<(), SignalError> {
            Ok(())
        }
    }

    struct FakeIceAgent;

    #[async_trait]
    impl IceAgent for FakeIceAgent {
        fn local_user_credentials(&self) -> IceCredentials {
            IceCredentials {
                ufrag: "ufrag".into(),
                pwd: "pwd".into(),
            }
        }

        async fn connect(
            &self,
            _remote: IceCredentials,
            _candidates: mpsc::Receiver<IceCandidate>,
        ) -> Result<IceSession, IceError> {
            Err(IceError("unused in this harness".into()))
        }
    }

    struct FakeRelayManager;

    #[async_trait]
    impl RelayManager for FakeRelayManager {
        fn has_relay_address(&self) -> bool {
            false
        }

        async fn relay_instance_address(&self) -> Result<String, RelayError> {
            Err(RelayError::Unsupported)
        }

        async fn open_conn(&self, _server: &str, _remote_key: &PeerKey) -> Result<RelayConn, RelayError> {
            Err(RelayError::Unsupported)
        }
    }

    fn allowed_ips() -> ipnet::IpNet {
        "10.10.0.2/32".parse().unwrap()
    }

    fn ice_ready(priority: ConnPriority, endpoint: SocketAddr) -> IceConnReady {
        IceConnReady {
            priority,
            info: IceConnInfo {
                endpoint: IceEndpoint::Direct(endpoint),
                relayed_on_local: false,
                local_candidate_type: CandidateType::Host,
                remote_candidate_type: CandidateType::Host,
                local_candidate_endpoint: Some(endpoint),
                remote_candidate_endpoint: Some(endpoint),
                direct: true,
                relayed: false,
                rosenpass_pubkey: None,
                rosenpass_addr: None,
            },
        }
    }

    struct Harness {
        actor: PeerConnActor,
        wg: Arc<FakeWg>,
        status_sink: Arc<FakeStatusSink>,
    }

    /// Builds a `PeerConnActor` directly, bypassing `spawn`'s mailbox wiring,
    /// so tests can drive its inherent `on_*` methods without a real
    /// `xtra::Context`. The worker addresses still have to point at live
    /// actors (an `Address` can't be conjured out of thin air), but those
    /// workers are never sent anything in these tests.
    async fn build_harness() -> Harness {
        let wg = Arc::new(FakeWg::new());
        let status_sink = Arc::new(FakeStatusSink::default());
        let local_key = PeerKey::new(vec![9, 9]);
        let remote_key = PeerKey::new(vec![1, 1]);

        let signaler: Arc<dyn Signaler> = Arc::new(FakeSignaler);
        let handshaker = Arc::new(Handshaker::new(local_key.clone(), remote_key.clone(), signaler));

        let (peer_address, _peer_mailbox) = Mailbox::unbounded();

        let (ice_address, ice_mailbox) = Mailbox::unbounded();
        tokio::spawn(xtra::run(
            ice_mailbox,
            IceWorkerActor::new(Arc::new(FakeIceAgent), peer_address.clone()),
        ));

        let (relay_address, relay_mailbox) = Mailbox::unbounded();
        tokio::spawn(xtra::run(
            relay_mailbox,
            RelayWorkerActor::new(
                local_key.clone(),
                remote_key.clone(),
                Arc::new(FakeRelayManager),
                wg.clone(),
                peer_address,
            ),
        ));

        let wg_config = crate::config::WgConfig {
            wg_listen_port: 51820,
            remote_key: remote_key.clone(),
            allowed_ips: allowed_ips(),
            preshared_key: None,
        };
        let config = ConnConfig {
            local_key,
            remote_key,
            reconnect_timeout: Duration::from_secs(30),
            wg_config,
            rosenpass_pubkey: None,
            rosenpass_addr: None,
        };

        let actor = PeerConnActor {
            config,
            wg: wg.clone(),
            wg_proxy_factory: Arc::new(LoopbackWgProxyFactory { wg_listen_port: 51820 }),
            status_sink: status_sink.clone(),
            handshaker,
            ice_worker: ice_address,
            relay_worker: relay_address,
            hooks: Hooks::default(),
            status_ice: ConnStatus::Disconnected,
            status_relay: ConnStatus::Disconnected,
            current_priority: ConnPriority::NONE,
            conn_id: None,
            wg_proxy_ice: None,
            wg_proxy_relay: None,
            endpoint_relay: None,
            reconnect_notify: Arc::new(Notify::new()),
            cancellation: CancellationToken::new(),
            on_connected: None,
            on_disconnected: None,
        };

        Harness { actor, wg, status_sink }
    }

    #[tokio::test]
    async fn ice_p2p_installs_wg_endpoint_and_publishes_connected() {
        let mut h = build_harness().await;
        let remote_key = h.actor.config.remote_key.clone();
        let endpoint: SocketAddr = "203.0.113.5:51000".parse().unwrap();

        h.actor
            .on_ice_conn_ready(ice_ready(ConnPriority::ICE_P2P, endpoint))
            .await;

        assert_eq!(h.actor.current_priority, ConnPriority::ICE_P2P);
        assert_eq!(h.actor.eval_status(), ConnStatus::Connected);

        let updates = h.wg.updates.lock().unwrap();
        assert_eq!(*updates, vec![(remote_key, endpoint)]);
        drop(updates);

        let states = h.status_sink.states.lock().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, ConnStatus::Connected);
        assert!(states[0].ice.direct);
    }

    #[tokio::test]
    async fn ice_p2p_supersedes_installed_relay() {
        let mut h = build_harness().await;

        let (relay_stream, _peer_side) = tokio::io::duplex(64);
        h.actor
            .on_relay_conn_ready(RelayConnReady {
                stream: Box::new(relay_stream),
                rosenpass_pubkey: None,
                rosenpass_addr: None,
            })
            .await;
        assert_eq!(h.actor.current_priority, ConnPriority::RELAY);
        assert_eq!(h.wg.updates.lock().unwrap().len(), 1);

        let ice_endpoint: SocketAddr = "203.0.113.9:6000".parse().unwrap();
        h.actor
            .on_ice_conn_ready(ice_ready(ConnPriority::ICE_P2P, ice_endpoint))
            .await;

        assert_eq!(h.actor.current_priority, ConnPriority::ICE_P2P);
        let updates = h.wg.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].1, ice_endpoint);
        drop(updates);
        assert!(
            h.actor.wg_proxy_relay.is_some(),
            "relay proxy must be retained for fail-back even though it lost arbitration"
        );
    }

    #[tokio::test]
    async fn lower_priority_ice_candidate_does_not_preempt_installed_transport() {
        let mut h = build_harness().await;
        let first: SocketAddr = "203.0.113.9:6000".parse().unwrap();
        h.actor
            .on_ice_conn_ready(ice_ready(ConnPriority::ICE_P2P, first))
            .await;

        let second: SocketAddr = "203.0.113.9:7000".parse().unwrap();
        h.actor
            .on_ice_conn_ready(ice_ready(ConnPriority::ICE_TURN, second))
            .await;

        assert_eq!(h.actor.current_priority, ConnPriority::ICE_P2P);
        assert_eq!(h.wg.updates.lock().unwrap().len(), 1, "second candidate must be dropped");
    }

    #[tokio::test]
    async fn ice_loss_falls_back_to_cached_relay_without_republishing_disconnect() {
        let mut h = build_harness().await;

        let (relay_stream, _peer_side) = tokio::io::duplex(64);
        h.actor
            .on_relay_conn_ready(RelayConnReady {
                stream: Box::new(relay_stream),
                rosenpass_pubkey: None,
                rosenpass_addr: None,
            })
            .await;
        let relay_endpoint = h.actor.endpoint_relay.expect("relay endpoint recorded");

        let ice_endpoint: SocketAddr = "203.0.113.9:6000".parse().unwrap();
        h.actor
            .on_ice_conn_ready(ice_ready(ConnPriority::ICE_P2P, ice_endpoint))
            .await;
        assert_eq!(h.actor.current_priority, ConnPriority::ICE_P2P);

        let states_before = h.status_sink.states.lock().unwrap().len();

        h.actor
            .on_ice_status_changed(IceStatusChanged(ConnStatus::Disconnected))
            .await;

        assert_eq!(h.actor.current_priority, ConnPriority::RELAY);
        let updates = h.wg.updates.lock().unwrap();
        assert_eq!(
            *updates.last().unwrap(),
            (h.actor.config.remote_key.clone(), relay_endpoint)
        );
        drop(updates);
        assert_eq!(
            h.status_sink.states.lock().unwrap().len(),
            states_before,
            "falling back to a still-connected relay must not republish a disconnected state"
        );
    }

    #[tokio::test]
    async fn relay_loss_while_ice_connected_does_not_signal_reconnect() {
        let mut h = build_harness().await;
        let endpoint: SocketAddr = "203.0.113.9:6000".parse().unwrap();
        h.actor
            .on_ice_conn_ready(ice_ready(ConnPriority::ICE_P2P, endpoint))
            .await;

        let (relay_stream, _peer_side) = tokio::io::duplex(64);
        h.actor
            .on_relay_conn_ready(RelayConnReady {
                stream: Box::new(relay_stream),
                rosenpass_pubkey: None,
                rosenpass_addr: None,
            })
            .await;
        assert_eq!(h.actor.current_priority, ConnPriority::ICE_P2P);

        h.actor.on_relay_disconnected().await;

        assert_eq!(h.actor.status_relay, ConnStatus::Disconnected);
        assert_eq!(h.actor.eval_status(), ConnStatus::Connected);
        assert!(h.actor.wg_proxy_relay.is_none());
    }

    #[tokio::test]
    async fn close_pairs_every_before_add_hook_with_an_after_remove_hook_exactly_once() {
        let mut h = build_harness().await;
        let seen_before = Arc::new(Mutex::new(Vec::new()));
        let seen_after = Arc::new(Mutex::new(Vec::new()));

        {
            let seen_before = seen_before.clone();
            h.actor
                .hooks
                .add_before_add_peer_hook(Arc::new(move |conn_id, _ip| {
                    seen_before.lock().unwrap().push(conn_id);
                    Ok(())
                }));
        }
        {
            let seen_after = seen_after.clone();
            h.actor
                .hooks
                .add_after_remove_peer_hook(Arc::new(move |conn_id| {
                    seen_after.lock().unwrap().push(conn_id);
                    Ok(())
                }));
        }

        let endpoint: SocketAddr = "203.0.113.5:51000".parse().unwrap();
        h.actor
            .on_ice_conn_ready(ice_ready(ConnPriority::ICE_P2P, endpoint))
            .await;

        h.actor.on_close().await;
        h.actor.on_close().await;

        let before = seen_before.lock().unwrap();
        let after = seen_after.lock().unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 1);
        assert_eq!(before[0], after[0]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_publishes_disconnected_once() {
        let mut h = build_harness().await;
        let endpoint: SocketAddr = "203.0.113.5:51000".parse().unwrap();
        h.actor
            .on_ice_conn_ready(ice_ready(ConnPriority::ICE_P2P, endpoint))
            .await;

        h.actor.on_close().await;
        let disconnects_after_first = h
            .status_sink
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.status == ConnStatus::Disconnected)
            .count();

        h.actor.on_close().await;
        let disconnects_after_second = h
            .status_sink
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.status == ConnStatus::Disconnected)
            .count();

        assert_eq!(disconnects_after_first, 1);
        assert_eq!(
            disconnects_after_second, 2,
            "second close still republishes, but removes nothing new"
        );
        assert_eq!(h.actor.eval_status(), ConnStatus::Disconnected);
        assert_eq!(h.wg.removed.lock().unwrap().len(), 2);
        assert_eq!(h.status_sink.resets.lock().unwrap().len(), 2);
    }
}
