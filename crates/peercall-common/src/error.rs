//! Centralized error types for peercall.
//!
//! The taxonomy follows how each failure is handled:
//! - [`ProtocolError`]: malformed signaling input, dropped.
//! - [`MediaAcquisitionError`]: device denied/unavailable, the call continues without it.
//! - [`NegotiationError`]: SDP/ICE failure, ends the affected call only.
//! - [`TransportError`]: a send failed, surfaced to the caller layer.
//!
//! [`CallError`] is what the public client API returns.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A signaling payload that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed signaling payload: {0}")]
    Malformed(String),

    #[error("Invalid `{kind}` payload: {message}")]
    InvalidPayload { kind: String, message: String },

    #[error("Failed to encode signaling message: {0}")]
    Encode(String),
}

/// Local capture could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum MediaAcquisitionError {
    #[error("Permission to use {device} was denied")]
    PermissionDenied { device: String },

    #[error("No {device} device available")]
    Unavailable { device: String },

    #[error("Media acquisition failed: {0}")]
    Other(String),
}

/// The step of the offer/answer exchange that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStep {
    Start,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    Rollback,
    AddIceCandidate,
    UpdateTracks,
    Signaling,
    Connection,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::CreateOffer => "create-offer",
            Self::CreateAnswer => "create-answer",
            Self::SetLocalDescription => "set-local-description",
            Self::SetRemoteDescription => "set-remote-description",
            Self::Rollback => "rollback",
            Self::AddIceCandidate => "add-ice-candidate",
            Self::UpdateTracks => "update-tracks",
            Self::Signaling => "signaling",
            Self::Connection => "connection",
        };
        f.write_str(name)
    }
}

/// An asynchronous WebRTC operation failed. Terminates the call it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Negotiation failed during {phase}: {cause}")]
pub struct NegotiationError {
    pub phase: NegotiationStep,
    pub cause: String,
}

impl NegotiationError {
    pub fn new(phase: NegotiationStep, cause: impl fmt::Display) -> Self {
        Self {
            phase,
            cause: cause.to_string(),
        }
    }
}

/// The signaling transport refused or failed to deliver a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to publish to channel {channel}: {message}")]
    SendFailed { channel: String, message: String },

    #[error("Transport is closed")]
    Closed,
}

/// Errors returned by the call client API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("Operation not allowed while {state}")]
    InvalidState { state: String },

    #[error("No incoming call to {action}")]
    NoIncomingCall { action: &'static str },

    #[error("Cannot call yourself")]
    SelfCall,

    #[error("Call session has shut down")]
    SessionClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CallError {
    pub fn invalid_state(state: impl fmt::Display) -> Self {
        Self::InvalidState {
            state: state.to_string(),
        }
    }
}

/// Convenience type alias for Results using CallError.
pub type CallResult<T> = Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_error_names_the_step() {
        let err = NegotiationError::new(NegotiationStep::SetRemoteDescription, "bad sdp");
        assert_eq!(
            err.to_string(),
            "Negotiation failed during set-remote-description: bad sdp"
        );
    }

    #[test]
    fn transport_error_converts_into_call_error() {
        let err: CallError = TransportError::Closed.into();
        assert!(matches!(err, CallError::Transport(TransportError::Closed)));
        assert_eq!(err.to_string(), "Transport is closed");
    }
}
