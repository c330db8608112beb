use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use xtra::prelude::*;

use crate::error::IceError;
use crate::signaling::OfferAnswer;
use crate::signaling::OfferAnswerKind;
use crate::signaling::OnNewOfferAnswer;
use crate::status::ConnPriority;
use crate::status::ConnStatus;
use crate::wg_proxy::TurnStream;

/// Candidate type naming follows the `webrtc-ice` crate convention used
/// elsewhere in this pack's reference material, for consistency with the
/// wider Rust WebRTC/ICE ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    fn is_relay(self) -> bool {
        matches!(self, CandidateType::Relay)
    }
}

#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// An opaque ICE candidate relayed from the remote peer over signaling
/// (spec.md §6 `Candidate`). The wire encoding is the ICE agent
/// implementation's concern.
#[derive(Debug, Clone)]
pub struct IceCandidate(pub Vec<u8>);

/// The transport an ICE session ultimately selected.
pub enum IceEndpoint {
    /// A direct UDP remote address (host/srflx/prflx candidate pair).
    Direct(SocketAddr),
    /// A byte-stream transport through a TURN relay, to be wrapped in a
    /// [`crate::wg_proxy::WgProxy`] (spec.md §4.7 step 4).
    Turn(Box<dyn TurnStream>),
}

/// Terminal success outcome of one ICE session (spec.md §4.3).
pub struct IceSession {
    pub local_candidate_type: CandidateType,
    pub remote_candidate_type: CandidateType,
    pub endpoint: IceEndpoint,
    pub local_candidate_endpoint: Option<SocketAddr>,
    pub remote_candidate_endpoint: Option<SocketAddr>,
    /// Resolves once the session detects it has gone down after having
    /// succeeded (liveness loss, ICE restart failure, etc).
    pub disconnected: BoxFuture<'static, ()>,
}

impl IceSession {
    pub fn relayed_on_local(&self) -> bool {
        matches!(self.endpoint, IceEndpoint::Turn(_))
    }

    pub fn priority(&self) -> ConnPriority {
        if self.local_candidate_type.is_relay() || self.remote_candidate_type.is_relay() {
            ConnPriority::ICE_TURN
        } else {
            ConnPriority::ICE_P2P
        }
    }

    pub fn direct(&self) -> bool {
        !self.relayed()
    }

    pub fn relayed(&self) -> bool {
        self.local_candidate_type.is_relay() || self.remote_candidate_type.is_relay()
    }
}

/// The ICE STUN/TURN agent, an external collaborator (spec.md §1, §4.3).
/// A concrete implementation owns its own candidate gathering and
/// negotiation policy; this engine only needs local credentials up front
/// and a single terminal outcome per session.
#[async_trait]
pub trait IceAgent: Send + Sync {
    /// Local ufrag/pwd, stable for the lifetime of the agent.
    fn local_user_credentials(&self) -> IceCredentials;

    /// Drives one ICE session against the remote's credentials to
    /// completion. `candidates` trickles in remote candidates received
    /// while the session is running.
    async fn connect(
        &self,
        remote: IceCredentials,
        candidates: mpsc::Receiver<IceCandidate>,
    ) -> Result<IceSession, IceError>;
}

/// Information handed to [`crate::peer_conn::PeerConnActor`] on ICE success
/// (spec.md §3 `ICEConnInfo`).
pub struct IceConnInfo {
    pub endpoint: IceEndpoint,
    pub relayed_on_local: bool,
    pub local_candidate_type: CandidateType,
    pub remote_candidate_type: CandidateType,
    pub local_candidate_endpoint: Option<SocketAddr>,
    pub remote_candidate_endpoint: Option<SocketAddr>,
    pub direct: bool,
    pub relayed: bool,
    pub rosenpass_pubkey: Option<Vec<u8>>,
    pub rosenpass_addr: Option<SocketAddr>,
}

/// Sent to the owning `PeerConnActor` on ICE success.
pub struct IceConnReady {
    pub priority: ConnPriority,
    pub info: IceConnInfo,
}

/// Sent to the owning `PeerConnActor` on ICE failure or liveness loss.
pub struct IceStatusChanged(pub ConnStatus);

struct ActiveSession {
    _candidates: mpsc::Sender<IceCandidate>,
    task: JoinHandle<()>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Runs one [`IceAgent`] and reports terminal outcomes back to the owning
/// `PeerConnActor` (spec.md §4.3).
pub struct IceWorkerActor<P> {
    agent: Arc<dyn IceAgent>,
    owner: Address<P>,
    active: Option<ActiveSession>,
}

impl<P> IceWorkerActor<P>
where
    P: Handler<IceConnReady, Return = ()> + Handler<IceStatusChanged, Return = ()>,
{
    pub fn new(agent: Arc<dyn IceAgent>, owner: Address<P>) -> Self {
        Self {
            agent,
            owner,
            active: None,
        }
    }

    pub fn local_user_credentials(&self) -> IceCredentials {
        self.agent.local_user_credentials()
    }

    /// A new offer/answer arrived. Aborts any in-flight session and starts
    /// a new one against the remote's credentials (spec.md §4.3 contract:
    /// "a new offer aborts the previous session before starting").
    fn on_new_offer_answer(&mut self, msg: &OfferAnswer) {
        let remote = IceCredentials {
            ufrag: msg.ice_ufrag.clone(),
            pwd: msg.ice_pwd.clone(),
        };

        let (candidates_tx, candidates_rx) = mpsc::channel(16);
        let agent = self.agent.clone();
        let owner = self.owner.clone();
        let rosenpass_pubkey = msg.rosenpass_pubkey.clone();
        let rosenpass_addr = msg.rosenpass_addr;

        let task = tokio::spawn(async move {
            match agent.connect(remote, candidates_rx).await {
                Ok(session) => {
                    let priority = session.priority();
                    let relayed_on_local = session.relayed_on_local();
                    let direct = session.direct();
                    let relayed = session.relayed();
                    let local_candidate_type = session.local_candidate_type;
                    let remote_candidate_type = session.remote_candidate_type;
                    let local_candidate_endpoint = session.local_candidate_endpoint;
                    let remote_candidate_endpoint = session.remote_candidate_endpoint;
                    let disconnected = session.disconnected;
                    let endpoint = session.endpoint;

                    let ready = IceConnReady {
                        priority,
                        info: IceConnInfo {
                            endpoint,
                            relayed_on_local,
                            local_candidate_type,
                            remote_candidate_type,
                            local_candidate_endpoint,
                            remote_candidate_endpoint,
                            direct,
                            relayed,
                            rosenpass_pubkey,
                            rosenpass_addr,
                        },
                    };

                    if owner.send(ready).await.is_err() {
                        return;
                    }

                    disconnected.await;
                    let _ = owner.send(IceStatusChanged(ConnStatus::Disconnected)).await;
                }
                Err(err) => {
                    tracing::warn!(%err, "ICE negotiation failed");
                    let _ = owner.send(IceStatusChanged(ConnStatus::Disconnected)).await;
                }
            }
        });

        self.active = Some(ActiveSession {
            _candidates: candidates_tx,
            task,
        });
    }

    fn on_remote_candidate(&self, candidate: IceCandidate) {
        if let Some(active) = &self.active {
            let _ = active._candidates.try_send(candidate);
        }
    }
}

pub struct OnRemoteCandidate(pub IceCandidate);
pub struct GetLocalUserCredentials;

#[async_trait]
impl<P> Actor for IceWorkerActor<P>
where
    P: Handler<IceConnReady, Return = ()> + Handler<IceStatusChanged, Return = ()> + 'static,
{
    type Stop = ();

    async fn stopped(self) -> Self::Stop {}
}

#[async_trait]
impl<P> Handler<OnNewOfferAnswer> for IceWorkerActor<P>
where
    P: Handler<IceConnReady, Return = ()> + Handler<IceStatusChanged, Return = ()> + 'static,
{
    type Return = ();

    async fn handle(&mut self, msg: OnNewOfferAnswer, _: &mut Context<Self>) -> Self::Return {
        // Both offers and answers carry the remote's ICE credentials, so
        // either kind starts (or restarts) a session.
        if matches!(msg.0.kind, OfferAnswerKind::Offer | OfferAnswerKind::Answer) {
            self.on_new_offer_answer(&msg.0);
        }
    }
}

#[async_trait]
impl<P> Handler<OnRemoteCandidate> for IceWorkerActor<P>
where
    P: Handler<IceConnReady, Return = ()> + Handler<IceStatusChanged, Return = ()> + 'static,
{
    type Return = ();

    async fn handle(&mut self, msg: OnRemoteCandidate, _: &mut Context<Self>) -> Self::Return {
        self.on_remote_candidate(msg.0);
    }
}

#[async_trait]
impl<P> Handler<GetLocalUserCredentials> for IceWorkerActor<P>
where
    P: Handler<IceConnReady, Return = ()> + Handler<IceStatusChanged, Return = ()> + 'static,
{
    type Return = IceCredentials;

    async fn handle(&mut self, _: GetLocalUserCredentials, _: &mut Context<Self>) -> Self::Return {
        self.local_user_credentials()
    }
}
