//! Signaling message types.

use peercall_common::{CallIdentity, UserId};
use serde::{Deserialize, Serialize};

/// A trickled ICE candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u32>,
}

/// What a signaling message says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SignalBody {
    /// Caller → callee: I am dialing you.
    CallInit,

    /// Callee → caller: I accept your call.
    CallAccept,

    /// Either side: the call is over, rejected, or cancelled.
    /// The receiver works out which from its own state.
    CallEnd,

    /// SDP offer, for the first negotiation or a renegotiation.
    IceOffer { sdp: String },

    /// SDP answer to the last offer.
    IceAnswer { sdp: String },

    /// ICE candidate. `None` marks end-of-candidates for this round.
    IceCandidate { candidate: Option<IceCandidateInit> },
}

impl SignalBody {
    /// Every `type` tag this version understands.
    pub const KINDS: [&'static str; 6] = [
        "call_init",
        "call_accept",
        "call_end",
        "ice_offer",
        "ice_answer",
        "ice_candidate",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::CallInit => "call_init",
            Self::CallAccept => "call_accept",
            Self::CallEnd => "call_end",
            Self::IceOffer { .. } => "ice_offer",
            Self::IceAnswer { .. } => "ice_answer",
            Self::IceCandidate { .. } => "ice_candidate",
        }
    }
}

/// A signaling message as published on the wire.
///
/// The recipient is implicit: it is whoever owns the channel the envelope
/// was published to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: UserId,
    /// Start time of the call this message belongs to (chosen by the caller).
    pub start_time: i64,
    pub message: SignalBody,
}

impl Envelope {
    pub fn new(sender_id: UserId, start_time: i64, message: SignalBody) -> Self {
        Self {
            sender_id,
            start_time,
            message,
        }
    }

    /// The call this envelope refers to, from the receiver's point of view.
    pub fn identity(&self) -> CallIdentity {
        CallIdentity::new(self.sender_id.clone(), self.start_time)
    }
}
