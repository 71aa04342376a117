//! What the session tells the UI layer.

use crate::model::{CallRecord, CallState};
use peercall_common::{CallError, CallIdentity, MediaAcquisitionError, ProtocolError};
use peercall_rtc::{MediaConstraints, MediaTrack, NegotiationState};
use serde::Serialize;

/// Notifications broadcast by the session.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A call started ringing locally.
    IncomingCall(CallRecord),
    StateChanged {
        identity: CallIdentity,
        from: CallState,
        to: CallState,
    },
    /// A call reached a terminal state and was logged.
    CallEnded(CallRecord),
    /// Capture failed; the call goes on with whatever was granted.
    MediaUnavailable {
        identity: CallIdentity,
        error: MediaAcquisitionError,
    },
    RemoteTrack {
        identity: CallIdentity,
        track: MediaTrack,
    },
    /// An inbound payload could not be decoded and was dropped.
    ProtocolError(ProtocolError),
    /// A message to the peer could not be sent.
    SignalFailed {
        identity: CallIdentity,
        error: CallError,
    },
}

/// Everything the UI reads, published after every transition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub current_call: Option<CallRecord>,
    pub last_incoming_call: Option<CallRecord>,
    pub call_log: Vec<CallRecord>,
    pub media: MediaConstraints,
    pub negotiation: Option<NegotiationState>,
}

impl SessionSnapshot {
    pub fn current_state(&self) -> CallState {
        self.current_call
            .as_ref()
            .map_or(CallState::None, |c| c.call_state)
    }

    pub fn incoming_state(&self) -> CallState {
        self.last_incoming_call
            .as_ref()
            .map_or(CallState::None, |c| c.call_state)
    }

    pub fn is_dialing(&self) -> bool {
        self.current_state() == CallState::Initiated
    }

    pub fn is_ringing(&self) -> bool {
        self.incoming_state() == CallState::Receiving
    }

    pub fn in_call(&self) -> bool {
        self.current_state().is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == CallState::Connected
    }
}
