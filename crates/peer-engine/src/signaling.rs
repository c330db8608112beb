use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::broadcast;
use xtra::prelude::*;
use xtras::SendAsyncSafe;

use crate::error::SignalError;
use crate::keys::PeerKey;

/// Whether an [`OfferAnswer`] is the initiating offer or the reply to one
/// (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferAnswerKind {
    Offer,
    Answer,
}

/// A signaling message carrying everything a worker needs to start or
/// resume a session with the remote peer (spec.md §4.5, §6). Both the ICE
/// and the relay worker receive the same message independently.
#[derive(Debug, Clone)]
pub struct OfferAnswer {
    pub kind: OfferAnswerKind,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub wg_pubkey: PeerKey,
    pub relay_server_address: Option<String>,
    pub rosenpass_pubkey: Option<Vec<u8>>,
    pub rosenpass_addr: Option<SocketAddr>,
    pub version: String,
}

/// What [`crate::peer_conn::PeerConnActor::do_handshake`] sends out as a
/// fresh offer (spec.md §4.5 `SendOffer`: "local ICE ufrag/pwd, local relay
/// address (if any), Rosenpass public key (optional post-quantum handshake
/// data), and WG public key").
#[derive(Debug, Clone)]
pub struct HandshakeArgs {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub relay_addr: Option<String>,
    pub wg_pubkey: PeerKey,
    pub rosenpass_pubkey: Option<Vec<u8>>,
    pub rosenpass_addr: Option<SocketAddr>,
}

/// The external signaling channel (spec.md §6). Message routing by remote
/// peer key is this crate's responsibility; the Signaler only needs to
/// know it's talking to one specific remote.
#[async_trait]
pub trait Signaler: Send + Sync {
    /// Whether the signaling channel is currently usable (spec.md §7
    /// "Signaler not ready").
    fn ready(&self) -> bool;

    async fn send_offer(&self, remote: &PeerKey, args: HandshakeArgs) -> Result<(), SignalError>;
}

/// Sent to a worker (ICE or relay) every time a new offer or answer arrives
/// from the remote (spec.md §4.5 "both ICEWorker and RelayWorker register
/// as listeners and independently process the same remote offer/answer").
pub struct OnNewOfferAnswer(pub OfferAnswer);

/// Fans inbound offer/answer messages out to every registered worker and
/// forwards outbound offers to the [`Signaler`] (spec.md §4.5).
///
/// Grounded on `conn.go`'s `Handshaker`/`AddOnNewOfferListener`: there, the
/// Go implementation keeps an explicit listener-function slice; here a
/// `tokio::sync::broadcast` channel plays the same role; a worker that
/// hasn't subscribed yet (or has lagged) simply misses the message, which
/// matches the spec's "non-blocking; discards if not ready" contract.
pub struct Handshaker {
    local_key: PeerKey,
    remote_key: PeerKey,
    signaler: std::sync::Arc<dyn Signaler>,
    offer_answer_tx: broadcast::Sender<OfferAnswer>,
}

impl Handshaker {
    pub fn new(local_key: PeerKey, remote_key: PeerKey, signaler: std::sync::Arc<dyn Signaler>) -> Self {
        let (offer_answer_tx, _) = broadcast::channel(16);
        Self {
            local_key,
            remote_key,
            signaler,
            offer_answer_tx,
        }
    }

    /// Registers a new listener (spec.md §4.5 `Listen`). Call once per
    /// worker during construction; the returned receiver sees every
    /// subsequent offer/answer.
    pub fn subscribe(&self) -> broadcast::Receiver<OfferAnswer> {
        self.offer_answer_tx.subscribe()
    }

    /// Handles an inbound offer (spec.md §4.5 `OnRemoteOffer`). Non-blocking;
    /// returns whether at least one listener picked it up.
    pub fn on_remote_offer(&self, mut offer: OfferAnswer) -> bool {
        offer.kind = OfferAnswerKind::Offer;
        self.offer_answer_tx.send(offer).is_ok()
    }

    /// Handles an inbound answer (spec.md §4.5 `OnRemoteAnswer`).
    pub fn on_remote_answer(&self, mut answer: OfferAnswer) -> bool {
        answer.kind = OfferAnswerKind::Answer;
        self.offer_answer_tx.send(answer).is_ok()
    }

    /// Sends a fresh offer carrying the given arguments (spec.md §4.5
    /// `SendOffer`). Fails fast if the signaler isn't ready; no retry at
    /// this layer (reconvergence is the reconnect loop's job, spec.md
    /// §4.7).
    pub async fn send_offer(&self, args: HandshakeArgs) -> Result<(), SignalError> {
        if !self.signaler.ready() {
            return Err(SignalError::NotReady);
        }
        self.signaler.send_offer(&self.remote_key, args).await
    }

    pub fn local_key(&self) -> &PeerKey {
        &self.local_key
    }

    pub fn remote_key(&self) -> &PeerKey {
        &self.remote_key
    }
}

/// Bridges a [`Handshaker`] subscription into a worker actor's mailbox,
/// implementing the "Listen() dispatches inbound messages to registered
/// listeners" half of spec.md §4.5. Runs until the channel closes (the
/// `Handshaker` is dropped) or the worker actor disconnects.
pub fn spawn_offer_answer_listener<A>(
    mut rx: broadcast::Receiver<OfferAnswer>,
    worker: Address<A>,
) -> tokio::task::JoinHandle<()>
where
    A: Handler<OnNewOfferAnswer, Return = ()> + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if worker
                        .send_async_safe(OnNewOfferAnswer(msg))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "offer/answer listener lagged, dropping backlog");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
