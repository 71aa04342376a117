//! The peer connection collaborator.
//!
//! Modelled on the browser's `RTCPeerConnection`: the engine calls
//! description/candidate/track methods, and the connection reports back
//! asynchronously through a [`PeerEvent`] channel handed out at creation.

use crate::media::MediaTrack;
use crate::sdp::{SessionDescription, SignalingState};
use async_trait::async_trait;
use peercall_common::config::RtcConfig;
use peercall_signaling::IceCandidateInit;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate was gathered. `None` marks end-of-candidates.
    LocalCandidate(Option<IceCandidateInit>),
    ConnectionState(PeerConnectionState),
    /// The remote side started sending a track.
    RemoteTrack(MediaTrack),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RtcError {
    #[error("{operation} is not valid in signaling state {state}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },

    #[error("Invalid SDP: {0}")]
    Sdp(String),

    #[error("Invalid ICE candidate: {0}")]
    Candidate(String),

    #[error("Peer connection is closed")]
    Closed,

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PeerConnectionState;

    fn has_remote_description(&self) -> bool;

    async fn create_offer(&mut self) -> Result<SessionDescription, RtcError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, RtcError>;

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), RtcError>;

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), RtcError>;

    /// `None` is the end-of-candidates marker.
    async fn add_ice_candidate(&mut self, candidate: Option<IceCandidateInit>)
        -> Result<(), RtcError>;

    fn add_track(&mut self, track: MediaTrack) -> Result<(), RtcError>;

    fn remove_track(&mut self, track_id: &str) -> Result<(), RtcError>;

    fn local_tracks(&self) -> Vec<MediaTrack>;

    fn remote_tracks(&self) -> Vec<MediaTrack>;

    fn close(&mut self);
}

/// Creates one peer connection per call.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &RtcConfig,
    ) -> Result<(Box<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), RtcError>;
}
