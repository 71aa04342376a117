//! Offer/answer negotiation for a single call attempt.
//!
//! The engine owns the peer connection and the local media handle of one
//! [`CallIdentity`]. It is driven from the outside: the call session feeds it
//! remote descriptions and candidates as they arrive, hands it peer events,
//! and delivers media acquisition results. Nothing here spawns tasks.

use crate::media::{self, AcquiredMedia, MediaConstraints, MediaHandle, MediaSink, MediaSource, MediaTrack};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent};
use crate::sdp::{SdpType, SessionDescription, SignalingState};
use peercall_common::config::RtcConfig;
use peercall_common::{CallError, CallIdentity, NegotiationError, NegotiationStep};
use peercall_signaling::{IceCandidateInit, SignalBody, Signaler};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Which end of the call we are. Decides who yields on glare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// The polite side rolls back its own offer when offers collide.
    pub fn is_polite(self) -> bool {
        matches!(self, Self::Callee)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectingStage {
    /// Caller, waiting for media before sending the first offer.
    CreatingOffer,
    /// Callee, waiting for the first offer.
    AwaitingOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationPhase {
    Idle,
    Connecting(ConnectingStage),
    Stable,
    Negotiating,
    Closed,
}

/// Read-only view of the engine, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationState {
    pub role: Role,
    pub phase: NegotiationPhase,
    pub signaling_state: SignalingState,
    pub pending_ice_candidates: usize,
    pub negotiation_in_flight: bool,
    pub renegotiation_pending: bool,
    pub rollbacks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{operation} is not valid while signaling state is {state}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },

    #[error("Negotiation has not been started")]
    NotStarted,

    #[error("Negotiation is closed")]
    Closed,

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

impl EngineError {
    /// Whether the call this engine belongs to has to end.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Negotiation(_))
    }
}

/// Something the call session may want to react to.
#[derive(Debug, Clone)]
pub enum EngineNotice {
    Connected,
    Disconnected,
    RemoteTrack(MediaTrack),
    /// A best-effort signal (a trickled candidate) could not be sent.
    SignalFailed(CallError),
}

/// An acquisition to run off the session loop. Only the result of the most
/// recent request is applied; older ones are released on arrival.
pub struct MediaRequest {
    pub generation: u64,
    pub future: Pin<Box<dyn Future<Output = AcquiredMedia> + Send>>,
}

/// Collaborators shared by every engine a session creates.
#[derive(Clone)]
pub struct RtcContext {
    pub signaler: Signaler,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub rtc: RtcConfig,
    pub media_source: Arc<dyn MediaSource>,
    pub sink: Arc<dyn MediaSink>,
}

pub struct NegotiationEngine {
    identity: CallIdentity,
    role: Role,
    ctx: RtcContext,
    phase: NegotiationPhase,
    peer: Option<Box<dyn PeerConnection>>,
    pending_candidates: VecDeque<Option<IceCandidateInit>>,
    negotiation_in_flight: bool,
    renegotiation_pending: bool,
    answer_deferred: bool,
    media_settled: bool,
    media: Option<MediaHandle>,
    media_generation: u64,
    last_remote_offer: Option<String>,
    rollbacks: u32,
}

impl NegotiationEngine {
    pub fn new(identity: CallIdentity, role: Role, ctx: RtcContext) -> Self {
        Self {
            identity,
            role,
            ctx,
            phase: NegotiationPhase::Idle,
            peer: None,
            pending_candidates: VecDeque::new(),
            negotiation_in_flight: false,
            renegotiation_pending: false,
            answer_deferred: false,
            media_settled: false,
            media: None,
            media_generation: 0,
            last_remote_offer: None,
            rollbacks: 0,
        }
    }

    pub fn identity(&self) -> &CallIdentity {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// How many times we rolled back our own offer to accept the peer's.
    pub fn rollbacks(&self) -> u32 {
        self.rollbacks
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.peer
            .as_ref()
            .map_or(SignalingState::Closed, |p| p.signaling_state())
    }

    pub fn state(&self) -> NegotiationState {
        NegotiationState {
            role: self.role,
            phase: self.phase,
            signaling_state: self.signaling_state(),
            pending_ice_candidates: self.pending_candidates.len(),
            negotiation_in_flight: self.negotiation_in_flight,
            renegotiation_pending: self.renegotiation_pending,
            rollbacks: self.rollbacks,
        }
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.peer.as_ref().map(|p| p.local_tracks()).unwrap_or_default()
    }

    pub fn remote_tracks(&self) -> Vec<MediaTrack> {
        self.peer.as_ref().map(|p| p.remote_tracks()).unwrap_or_default()
    }

    /// Create the peer connection. The returned receiver carries its events,
    /// which go back into [`handle_peer_event`](Self::handle_peer_event).
    ///
    /// Local media is requested separately with [`request_media`](Self::request_media);
    /// the caller's first offer goes out once it settles.
    pub fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, EngineError> {
        if self.phase != NegotiationPhase::Idle {
            return Err(EngineError::InvalidState {
                operation: "start",
                state: self.signaling_state(),
            });
        }

        let (peer, events) = self
            .ctx
            .factory
            .create(&self.ctx.rtc)
            .map_err(|e| NegotiationError::new(NegotiationStep::Start, e))?;
        self.peer = Some(peer);
        self.phase = NegotiationPhase::Connecting(match self.role {
            Role::Caller => ConnectingStage::CreatingOffer,
            Role::Callee => ConnectingStage::AwaitingOffer,
        });

        info!(call = %self.identity, role = ?self.role, "Negotiation started");
        Ok(events)
    }

    /// Start acquiring `constraints`. Supersedes any request still in flight.
    pub fn request_media(&mut self, constraints: MediaConstraints) -> MediaRequest {
        self.media_generation += 1;
        let source = self.ctx.media_source.clone();
        debug!(
            call = %self.identity,
            generation = self.media_generation,
            audio = constraints.audio,
            video = constraints.video,
            "Requesting local media"
        );
        MediaRequest {
            generation: self.media_generation,
            future: Box::pin(async move {
                media::acquire_with_fallback(source.as_ref(), constraints).await
            }),
        }
    }

    /// Apply the result of a [`MediaRequest`].
    ///
    /// The first result unblocks the initial offer (caller) or a deferred
    /// answer (callee). Later results swap tracks on the peer connection and
    /// renegotiate if anything changed.
    pub async fn media_ready(
        &mut self,
        generation: u64,
        handle: MediaHandle,
    ) -> Result<(), EngineError> {
        if generation != self.media_generation || self.peer.is_none() {
            debug!(
                call = %self.identity,
                generation,
                latest = self.media_generation,
                "Releasing superseded media"
            );
            self.ctx.media_source.release(handle);
            return Ok(());
        }

        let first = !self.media_settled;
        self.media_settled = true;
        let changed = self.replace_tracks(handle)?;

        if first {
            match (self.role, self.phase) {
                (Role::Caller, NegotiationPhase::Connecting(ConnectingStage::CreatingOffer)) => {
                    self.create_offer().await?;
                }
                (Role::Callee, _) if self.answer_deferred => {
                    self.create_answer().await?;
                }
                _ => {}
            }
        } else if changed {
            self.renegotiate().await?;
        }
        Ok(())
    }

    fn replace_tracks(&mut self, handle: MediaHandle) -> Result<bool, EngineError> {
        let peer = self.peer.as_mut().ok_or(EngineError::Closed)?;
        let previous = self.media.take();
        let old_tracks = previous
            .as_ref()
            .map(|h| h.tracks.clone())
            .unwrap_or_default();

        for track in old_tracks.iter().filter(|t| !handle.tracks.contains(t)) {
            peer.remove_track(&track.id)
                .map_err(|e| NegotiationError::new(NegotiationStep::UpdateTracks, e))?;
        }
        for track in handle.tracks.iter().filter(|t| !old_tracks.contains(t)) {
            peer.add_track(track.clone())
                .map_err(|e| NegotiationError::new(NegotiationStep::UpdateTracks, e))?;
        }

        let changed = old_tracks != handle.tracks;
        if let Some(previous) = previous {
            self.ctx.media_source.release(previous);
        }
        if handle.is_empty() {
            self.ctx.sink.clear_local();
        } else {
            self.ctx.sink.show_local(&handle);
        }
        debug!(call = %self.identity, tracks = handle.tracks.len(), changed, "Local media updated");
        self.media = Some(handle);
        Ok(changed)
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        match self.phase {
            NegotiationPhase::Idle => Err(EngineError::NotStarted),
            NegotiationPhase::Closed => Err(EngineError::Closed),
            _ => Ok(()),
        }
    }

    fn peer_mut(&mut self) -> Result<&mut Box<dyn PeerConnection>, EngineError> {
        self.ensure_active()?;
        self.peer.as_mut().ok_or(EngineError::Closed)
    }

    async fn send_negotiation(&self, body: SignalBody) -> Result<(), EngineError> {
        self.ctx
            .signaler
            .send(&self.identity, body)
            .await
            .map_err(|e| NegotiationError::new(NegotiationStep::Signaling, e).into())
    }

    /// Create an offer, apply it locally and send it. Only valid in `stable`.
    pub async fn create_offer(&mut self) -> Result<(), EngineError> {
        let peer = self.peer_mut()?;
        let state = peer.signaling_state();
        if state != SignalingState::Stable {
            return Err(EngineError::InvalidState {
                operation: "create_offer",
                state,
            });
        }

        let offer = peer
            .create_offer()
            .await
            .map_err(|e| NegotiationError::new(NegotiationStep::CreateOffer, e))?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::new(NegotiationStep::SetLocalDescription, e))?;

        self.negotiation_in_flight = true;
        if matches!(self.phase, NegotiationPhase::Connecting(_)) {
            self.phase = NegotiationPhase::Negotiating;
        }
        info!(call = %self.identity, "Sending offer");
        self.send_negotiation(SignalBody::IceOffer { sdp: offer.sdp }).await
    }

    /// Answer the applied remote offer. Only valid in `have-remote-offer`.
    pub async fn create_answer(&mut self) -> Result<(), EngineError> {
        let peer = self.peer_mut()?;
        let state = peer.signaling_state();
        if state != SignalingState::HaveRemoteOffer {
            return Err(EngineError::InvalidState {
                operation: "create_answer",
                state,
            });
        }

        let answer = peer
            .create_answer()
            .await
            .map_err(|e| NegotiationError::new(NegotiationStep::CreateAnswer, e))?;
        peer.set_local_description(answer.clone())
            .await
            .map_err(|e| NegotiationError::new(NegotiationStep::SetLocalDescription, e))?;

        self.answer_deferred = false;
        self.phase = NegotiationPhase::Stable;
        info!(call = %self.identity, "Sending answer");
        self.send_negotiation(SignalBody::IceAnswer { sdp: answer.sdp })
            .await?;
        self.run_pending_renegotiation().await
    }

    /// Apply an offer or answer from the peer.
    ///
    /// A repeated offer and an answer with no offer outstanding are dropped.
    /// Colliding offers are resolved by role: the callee rolls back and
    /// answers, then re-offers; the caller ignores the peer's offer.
    pub async fn apply_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), EngineError> {
        self.ensure_active()?;
        if desc.sdp_type == SdpType::Offer
            && self.last_remote_offer.as_deref() == Some(desc.sdp.as_str())
        {
            debug!(call = %self.identity, "Ignoring repeated offer");
            return Ok(());
        }

        let polite = self.role.is_polite();
        let identity = self.identity.clone();
        let peer = self.peer.as_mut().ok_or(EngineError::Closed)?;
        let state = peer.signaling_state();

        match desc.sdp_type {
            SdpType::Offer => {
                let mut rolled_back = false;
                if state == SignalingState::HaveLocalOffer {
                    if !polite {
                        info!(call = %identity, "Offer collision, keeping our offer");
                        return Ok(());
                    }
                    info!(call = %identity, "Offer collision, rolling back our offer");
                    peer.set_local_description(SessionDescription::rollback())
                        .await
                        .map_err(|e| NegotiationError::new(NegotiationStep::Rollback, e))?;
                    rolled_back = true;
                }

                peer.set_remote_description(desc.clone())
                    .await
                    .map_err(|e| NegotiationError::new(NegotiationStep::SetRemoteDescription, e))?;

                if rolled_back {
                    self.rollbacks += 1;
                    self.negotiation_in_flight = false;
                    self.renegotiation_pending = true;
                }
                self.last_remote_offer = Some(desc.sdp);
                if self.phase == NegotiationPhase::Stable {
                    self.phase = NegotiationPhase::Negotiating;
                }
                self.flush_pending_candidates().await;

                if self.media_settled {
                    self.create_answer().await
                } else {
                    debug!(call = %identity, "Answer deferred until local media settles");
                    self.answer_deferred = true;
                    Ok(())
                }
            }
            SdpType::Answer => {
                if state != SignalingState::HaveLocalOffer {
                    debug!(call = %identity, %state, "Ignoring answer with no offer outstanding");
                    return Ok(());
                }

                peer.set_remote_description(desc)
                    .await
                    .map_err(|e| NegotiationError::new(NegotiationStep::SetRemoteDescription, e))?;

                self.negotiation_in_flight = false;
                self.phase = NegotiationPhase::Stable;
                info!(call = %identity, "Answer applied");
                self.flush_pending_candidates().await;
                self.run_pending_renegotiation().await
            }
            SdpType::Rollback => Err(EngineError::InvalidState {
                operation: "apply_remote_description(rollback)",
                state,
            }),
        }
    }

    /// Apply a trickled candidate, or hold it until the remote description
    /// is in place.
    pub async fn add_remote_ice_candidate(
        &mut self,
        candidate: Option<IceCandidateInit>,
    ) -> Result<(), EngineError> {
        let has_remote = self.peer_mut()?.has_remote_description();
        if !has_remote {
            self.pending_candidates.push_back(candidate);
            debug!(
                call = %self.identity,
                pending = self.pending_candidates.len(),
                "Buffering candidate until remote description is set"
            );
            return Ok(());
        }

        self.flush_pending_candidates().await;
        self.apply_candidate(candidate).await;
        Ok(())
    }

    async fn flush_pending_candidates(&mut self) {
        if !self.pending_candidates.is_empty() {
            debug!(
                call = %self.identity,
                count = self.pending_candidates.len(),
                "Replaying buffered candidates"
            );
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: Option<IceCandidateInit>) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!(call = %self.identity, error = %e, "Dropping remote candidate");
        }
    }

    /// Negotiate again with the current tracks. If a negotiation is already
    /// running, one follow-up is queued; further requests fold into it.
    pub async fn renegotiate(&mut self) -> Result<(), EngineError> {
        if matches!(self.phase, NegotiationPhase::Idle | NegotiationPhase::Closed) {
            debug!(call = %self.identity, phase = ?self.phase, "Renegotiation skipped");
            return Ok(());
        }

        let state = self.signaling_state();
        let busy = self.phase != NegotiationPhase::Stable
            || self.negotiation_in_flight
            || state != SignalingState::Stable
            || !self.media_settled;
        if busy {
            if !self.renegotiation_pending {
                debug!(call = %self.identity, "Renegotiation queued");
            }
            self.renegotiation_pending = true;
            return Ok(());
        }

        self.renegotiation_pending = false;
        self.phase = NegotiationPhase::Negotiating;
        info!(call = %self.identity, "Renegotiating");
        self.create_offer().await
    }

    async fn run_pending_renegotiation(&mut self) -> Result<(), EngineError> {
        if self.renegotiation_pending {
            self.renegotiate().await
        } else {
            Ok(())
        }
    }

    /// React to an event from our peer connection.
    ///
    /// A failed ICE connection is returned as an error; everything else is a
    /// notice at most.
    pub async fn handle_peer_event(
        &mut self,
        event: PeerEvent,
    ) -> Result<Option<EngineNotice>, EngineError> {
        if self.phase == NegotiationPhase::Closed {
            return Ok(None);
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                match self
                    .ctx
                    .signaler
                    .send(&self.identity, SignalBody::IceCandidate { candidate })
                    .await
                {
                    Ok(()) => Ok(None),
                    Err(e) => Ok(Some(EngineNotice::SignalFailed(e))),
                }
            }
            PeerEvent::ConnectionState(state) => match state {
                PeerConnectionState::Connected => {
                    info!(call = %self.identity, "Peer connection established");
                    Ok(Some(EngineNotice::Connected))
                }
                PeerConnectionState::Disconnected => {
                    warn!(call = %self.identity, "Peer connection interrupted");
                    Ok(Some(EngineNotice::Disconnected))
                }
                PeerConnectionState::Failed => {
                    error!(call = %self.identity, "ICE connection failed");
                    Err(NegotiationError::new(
                        NegotiationStep::Connection,
                        "ICE connection failed",
                    )
                    .into())
                }
                _ => Ok(None),
            },
            PeerEvent::RemoteTrack(track) => {
                debug!(call = %self.identity, track = %track.id, kind = %track.kind, "Remote track");
                self.ctx.sink.attach_remote(&track);
                Ok(Some(EngineNotice::RemoteTrack(track)))
            }
        }
    }

    /// Close the peer connection and release local media. Idempotent.
    pub fn close(&mut self) {
        if self.phase == NegotiationPhase::Closed {
            return;
        }

        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        if let Some(handle) = self.media.take() {
            self.ctx.media_source.release(handle);
        }
        self.ctx.sink.clear_local();
        self.ctx.sink.detach_remote();
        self.pending_candidates.clear();
        self.negotiation_in_flight = false;
        self.renegotiation_pending = false;
        self.answer_deferred = false;
        self.phase = NegotiationPhase::Closed;
        info!(call = %self.identity, "Negotiation closed");
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, NullSink};
    use crate::peer::RtcError;
    use crate::soft::{SoftPeerConnection, SoftPeerFactory, SyntheticMediaSource};
    use async_trait::async_trait;
    use peercall_signaling::{decode, Inbound, MemoryBus, Transport};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    const AUDIO: MediaConstraints = MediaConstraints {
        audio: true,
        video: false,
    };

    struct Side {
        engine: NegotiationEngine,
        inbox: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        source: SyntheticMediaSource,
        connected: bool,
        offers_received: usize,
    }

    impl Side {
        async fn new(
            bus: &MemoryBus,
            local: &str,
            remote: &str,
            role: Role,
            factory: Arc<dyn PeerConnectionFactory>,
        ) -> Self {
            let source = SyntheticMediaSource::new();
            let transport: Arc<dyn Transport> = Arc::new(bus.clone());
            let signaler = Signaler::new(local.into(), transport);
            let inbox = signaler.inbox().await;
            let ctx = RtcContext {
                signaler,
                factory,
                rtc: RtcConfig::default(),
                media_source: Arc::new(source.clone()),
                sink: Arc::new(NullSink),
            };
            let mut engine = NegotiationEngine::new(CallIdentity::new(remote, 100), role, ctx);
            let events = engine.start().unwrap();
            Self {
                engine,
                inbox,
                events,
                source,
                connected: false,
                offers_received: 0,
            }
        }

        async fn settle_media(&mut self, constraints: MediaConstraints) {
            let request = self.engine.request_media(constraints);
            let acquired = request.future.await;
            self.engine
                .media_ready(request.generation, acquired.handle)
                .await
                .unwrap();
        }

        /// Handle everything queued for this side. Returns whether anything was.
        async fn drain(&mut self) -> bool {
            let mut progressed = false;
            while let Ok(event) = self.events.try_recv() {
                progressed = true;
                if let Some(EngineNotice::Connected) =
                    self.engine.handle_peer_event(event).await.unwrap()
                {
                    self.connected = true;
                }
            }
            while let Ok(payload) = self.inbox.try_recv() {
                progressed = true;
                let Inbound::Signal(envelope) = decode(&payload).unwrap() else {
                    panic!("unexpected payload {payload}");
                };
                match envelope.message {
                    SignalBody::IceOffer { sdp } => {
                        self.offers_received += 1;
                        self.engine
                            .apply_remote_description(SessionDescription::offer(sdp))
                            .await
                            .unwrap();
                    }
                    SignalBody::IceAnswer { sdp } => self
                        .engine
                        .apply_remote_description(SessionDescription::answer(sdp))
                        .await
                        .unwrap(),
                    SignalBody::IceCandidate { candidate } => self
                        .engine
                        .add_remote_ice_candidate(candidate)
                        .await
                        .unwrap(),
                    other => panic!("unexpected {other:?}"),
                }
            }
            progressed
        }
    }

    async fn pump(a: &mut Side, b: &mut Side) {
        loop {
            let progressed_a = a.drain().await;
            let progressed_b = b.drain().await;
            if !progressed_a && !progressed_b {
                break;
            }
        }
    }

    async fn connected_pair(bus: &MemoryBus) -> (Side, Side) {
        let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SoftPeerFactory::new());
        let mut alice = Side::new(bus, "alice", "bob", Role::Caller, factory.clone()).await;
        let mut bob = Side::new(bus, "bob", "alice", Role::Callee, factory).await;
        alice.settle_media(AUDIO).await;
        bob.settle_media(AUDIO).await;
        pump(&mut alice, &mut bob).await;
        (alice, bob)
    }

    fn candidate(n: u32) -> Option<IceCandidateInit> {
        Some(IceCandidateInit {
            candidate: format!("candidate:{n} 1 udp 1 127.0.0.1 500{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        })
    }

    #[tokio::test]
    async fn caller_and_callee_converge_and_connect() {
        let bus = MemoryBus::new();
        let (alice, bob) = connected_pair(&bus).await;

        for side in [&alice, &bob] {
            assert_eq!(side.engine.phase(), NegotiationPhase::Stable);
            assert_eq!(side.engine.signaling_state(), SignalingState::Stable);
            assert!(side.connected);
        }
        assert_eq!(bob.engine.remote_tracks(), alice.engine.local_tracks());
        assert_eq!(alice.engine.remote_tracks(), bob.engine.local_tracks());
        assert_eq!(bob.offers_received, 1);
    }

    #[tokio::test]
    async fn callee_defers_answer_until_media_settles() {
        let bus = MemoryBus::new();
        let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SoftPeerFactory::new());
        let mut alice = Side::new(&bus, "alice", "bob", Role::Caller, factory.clone()).await;
        let mut bob = Side::new(&bus, "bob", "alice", Role::Callee, factory).await;

        alice.settle_media(AUDIO).await;
        pump(&mut alice, &mut bob).await;
        assert_eq!(bob.engine.signaling_state(), SignalingState::HaveRemoteOffer);
        assert_eq!(
            alice.engine.signaling_state(),
            SignalingState::HaveLocalOffer
        );

        bob.settle_media(AUDIO).await;
        pump(&mut alice, &mut bob).await;
        assert_eq!(bob.engine.phase(), NegotiationPhase::Stable);
        assert_eq!(alice.engine.phase(), NegotiationPhase::Stable);
    }

    #[tokio::test]
    async fn answer_outside_have_remote_offer_is_rejected_without_side_effects() {
        let bus = MemoryBus::new();
        let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SoftPeerFactory::new());
        let mut bob = Side::new(&bus, "bob", "alice", Role::Callee, factory).await;
        let before = bob.engine.state();

        let err = bob.engine.create_answer().await.unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidState {
                operation: "create_answer",
                state: SignalingState::Stable,
            }
        );
        assert!(!err.is_fatal());
        assert_eq!(bob.engine.state(), before);
        assert_eq!(bus.delivered(), 0);
    }

    #[tokio::test]
    async fn offer_outside_stable_is_rejected() {
        let bus = MemoryBus::new();
        let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SoftPeerFactory::new());
        let mut alice = Side::new(&bus, "alice", "bob", Role::Caller, factory).await;
        alice.settle_media(AUDIO).await;

        let err = alice.engine.create_offer().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                state: SignalingState::HaveLocalOffer,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn glare_is_resolved_by_one_callee_rollback() {
        let bus = MemoryBus::new();
        let (mut alice, mut bob) = connected_pair(&bus).await;

        alice.engine.renegotiate().await.unwrap();
        bob.engine.renegotiate().await.unwrap();
        assert_eq!(alice.engine.signaling_state(), SignalingState::HaveLocalOffer);
        assert_eq!(bob.engine.signaling_state(), SignalingState::HaveLocalOffer);

        pump(&mut alice, &mut bob).await;

        assert_eq!(bob.engine.rollbacks(), 1);
        assert_eq!(alice.engine.rollbacks(), 0);
        for side in [&alice, &bob] {
            let state = side.engine.state();
            assert_eq!(state.phase, NegotiationPhase::Stable);
            assert_eq!(state.signaling_state, SignalingState::Stable);
            assert!(!state.negotiation_in_flight);
            assert!(!state.renegotiation_pending);
        }
        assert_eq!(bob.engine.remote_tracks(), alice.engine.local_tracks());
    }

    #[tokio::test]
    async fn renegotiation_requests_coalesce_into_one_follow_up() {
        let bus = MemoryBus::new();
        let (mut alice, mut bob) = connected_pair(&bus).await;

        alice.engine.renegotiate().await.unwrap();
        alice.engine.renegotiate().await.unwrap();
        alice.engine.renegotiate().await.unwrap();
        assert!(alice.engine.state().renegotiation_pending);

        pump(&mut alice, &mut bob).await;

        // One initial offer, one renegotiation, one coalesced follow-up.
        assert_eq!(bob.offers_received, 3);
        assert_eq!(alice.engine.phase(), NegotiationPhase::Stable);
        assert!(!alice.engine.state().renegotiation_pending);
    }

    #[tokio::test]
    async fn enabling_video_renegotiates_with_the_new_track() {
        let bus = MemoryBus::new();
        let (mut alice, mut bob) = connected_pair(&bus).await;

        alice
            .settle_media(MediaConstraints {
                audio: true,
                video: true,
            })
            .await;
        pump(&mut alice, &mut bob).await;

        let remote = bob.engine.remote_tracks();
        assert_eq!(remote.len(), 2);
        assert!(remote.iter().any(|t| t.kind == MediaKind::Video));
        // The audio-only handle was released when replaced.
        assert_eq!(alice.source.outstanding(), 1);
    }

    #[tokio::test]
    async fn superseded_media_is_released_not_applied() {
        let bus = MemoryBus::new();
        let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SoftPeerFactory::new());
        let mut alice = Side::new(&bus, "alice", "bob", Role::Caller, factory).await;

        let first = alice.engine.request_media(AUDIO);
        let second = alice.engine.request_media(MediaConstraints {
            audio: true,
            video: true,
        });
        let stale = first.future.await;
        alice
            .engine
            .media_ready(first.generation, stale.handle)
            .await
            .unwrap();
        assert!(alice.engine.local_tracks().is_empty());
        assert_eq!(alice.source.outstanding(), 0);

        let fresh = second.future.await;
        alice
            .engine
            .media_ready(second.generation, fresh.handle)
            .await
            .unwrap();
        assert_eq!(alice.engine.local_tracks().len(), 2);
        assert_eq!(alice.engine.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn repeated_offer_is_answered_once() {
        let bus = MemoryBus::new();
        bus.set_duplicate_delivery(true);
        let (alice, bob) = connected_pair(&bus).await;

        assert_eq!(bob.offers_received, 2);
        assert_eq!(bob.engine.phase(), NegotiationPhase::Stable);
        assert_eq!(alice.engine.phase(), NegotiationPhase::Stable);
        assert!(alice.connected && bob.connected);
    }

    #[tokio::test]
    async fn remote_description_failure_is_fatal() {
        let bus = MemoryBus::new();
        let factory = SoftPeerFactory::new();
        let faulty = SoftPeerFactory::new();
        faulty
            .faults()
            .set_remote_description
            .store(true, Ordering::Release);
        let mut alice = Side::new(&bus, "alice", "bob", Role::Caller, Arc::new(factory)).await;
        let mut bob = Side::new(&bus, "bob", "alice", Role::Callee, Arc::new(faulty)).await;
        alice.settle_media(AUDIO).await;
        bob.settle_media(AUDIO).await;

        let payload = bob.inbox.recv().await.unwrap();
        let Inbound::Signal(envelope) = decode(&payload).unwrap() else {
            panic!("expected a signal");
        };
        let SignalBody::IceOffer { sdp } = envelope.message else {
            panic!("expected an offer");
        };
        let err = bob
            .engine
            .apply_remote_description(SessionDescription::offer(sdp))
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            err,
            EngineError::Negotiation(NegotiationError {
                phase: NegotiationStep::SetRemoteDescription,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn ice_failure_surfaces_as_connection_error() {
        let bus = MemoryBus::new();
        let factory: Arc<dyn PeerConnectionFactory> = Arc::new(SoftPeerFactory::new());
        let mut bob = Side::new(&bus, "bob", "alice", Role::Callee, factory).await;

        let err = bob
            .engine
            .handle_peer_event(PeerEvent::ConnectionState(PeerConnectionState::Failed))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::Negotiation(NegotiationError::new(
                NegotiationStep::Connection,
                "ICE connection failed"
            ))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_media() {
        let bus = MemoryBus::new();
        let (mut alice, _bob) = connected_pair(&bus).await;
        assert_eq!(alice.source.outstanding(), 1);

        alice.engine.close();
        alice.engine.close();

        assert_eq!(alice.engine.phase(), NegotiationPhase::Closed);
        assert_eq!(alice.engine.signaling_state(), SignalingState::Closed);
        assert_eq!(alice.source.outstanding(), 0);
        assert_eq!(
            alice.engine.create_offer().await.unwrap_err(),
            EngineError::Closed
        );
    }

    /// Wraps a soft connection and records the candidates applied to it.
    struct RecordingPeer {
        inner: SoftPeerConnection,
        applied: Arc<Mutex<Vec<Option<IceCandidateInit>>>>,
    }

    #[async_trait]
    impl PeerConnection for RecordingPeer {
        fn signaling_state(&self) -> SignalingState {
            self.inner.signaling_state()
        }

        fn connection_state(&self) -> PeerConnectionState {
            self.inner.connection_state()
        }

        fn has_remote_description(&self) -> bool {
            self.inner.has_remote_description()
        }

        async fn create_offer(&mut self) -> Result<SessionDescription, RtcError> {
            self.inner.create_offer().await
        }

        async fn create_answer(&mut self) -> Result<SessionDescription, RtcError> {
            self.inner.create_answer().await
        }

        async fn set_local_description(
            &mut self,
            desc: SessionDescription,
        ) -> Result<(), RtcError> {
            self.inner.set_local_description(desc).await
        }

        async fn set_remote_description(
            &mut self,
            desc: SessionDescription,
        ) -> Result<(), RtcError> {
            self.inner.set_remote_description(desc).await
        }

        async fn add_ice_candidate(
            &mut self,
            candidate: Option<IceCandidateInit>,
        ) -> Result<(), RtcError> {
            self.applied.lock().unwrap().push(candidate.clone());
            self.inner.add_ice_candidate(candidate).await
        }

        fn add_track(&mut self, track: MediaTrack) -> Result<(), RtcError> {
            self.inner.add_track(track)
        }

        fn remove_track(&mut self, track_id: &str) -> Result<(), RtcError> {
            self.inner.remove_track(track_id)
        }

        fn local_tracks(&self) -> Vec<MediaTrack> {
            self.inner.local_tracks()
        }

        fn remote_tracks(&self) -> Vec<MediaTrack> {
            self.inner.remote_tracks()
        }

        fn close(&mut self) {
            self.inner.close()
        }
    }

    #[derive(Default)]
    struct RecordingFactory {
        applied: Arc<Mutex<Vec<Option<IceCandidateInit>>>>,
    }

    impl PeerConnectionFactory for RecordingFactory {
        fn create(
            &self,
            _config: &RtcConfig,
        ) -> Result<(Box<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), RtcError>
        {
            let (inner, events) = SoftPeerConnection::new(Default::default());
            let peer = RecordingPeer {
                inner,
                applied: self.applied.clone(),
            };
            Ok((Box::new(peer), events))
        }
    }

    #[tokio::test]
    async fn early_candidates_are_replayed_in_arrival_order() {
        let bus = MemoryBus::new();
        let recording = Arc::new(RecordingFactory::default());
        let applied = recording.applied.clone();
        let mut bob = Side::new(&bus, "bob", "alice", Role::Callee, recording).await;
        bob.settle_media(AUDIO).await;

        for c in [candidate(1), candidate(2), None] {
            bob.engine.add_remote_ice_candidate(c).await.unwrap();
        }
        assert_eq!(bob.engine.state().pending_ice_candidates, 3);
        assert!(applied.lock().unwrap().is_empty());

        let (mut remote, _events) = SoftPeerConnection::new(Default::default());
        let offer = remote.create_offer().await.unwrap();
        bob.engine.apply_remote_description(offer).await.unwrap();

        assert_eq!(bob.engine.state().pending_ice_candidates, 0);
        assert_eq!(
            *applied.lock().unwrap(),
            vec![candidate(1), candidate(2), None]
        );
        assert_eq!(bob.engine.phase(), NegotiationPhase::Stable);
    }
}
