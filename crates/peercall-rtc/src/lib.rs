//! # peercall-rtc
//!
//! WebRTC negotiation for one call at a time.
//!
//! [`NegotiationEngine`] owns the peer connection and local media of a single
//! call attempt and drives the offer/answer exchange on top of it:
//! - SDP offer/answer creation and application
//! - ICE candidate trickling, with candidates buffered until the remote
//!   description is in place
//! - renegotiation when local tracks change, at most one in flight
//! - glare resolution: the callee is polite and rolls back, the caller is not
//!
//! The peer connection itself and the capture devices are collaborators
//! behind [`PeerConnection`] and [`MediaSource`]. [`soft`] provides
//! in-process implementations of both.

pub mod engine;
pub mod media;
pub mod peer;
pub mod sdp;
pub mod soft;

pub use engine::{
    ConnectingStage, EngineError, EngineNotice, MediaRequest, NegotiationEngine, NegotiationPhase,
    NegotiationState, Role, RtcContext,
};
pub use media::{
    AcquiredMedia, MediaConstraints, MediaHandle, MediaKind, MediaSink, MediaSource, MediaTrack,
    NullSink,
};
pub use peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcError};
pub use sdp::{SdpType, SessionDescription, SignalingState};
