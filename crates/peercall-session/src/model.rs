//! Call records and the call log.

use peercall_common::{CallIdentity, NegotiationStep, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one call attempt. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    None,
    /// Outgoing, dialing.
    Initiated,
    /// Incoming, ringing.
    Receiving,
    Accepted,
    Connected,
    Completed,
    NotAnswered,
    Rejected,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::NotAnswered | Self::Rejected)
    }

    /// Accepted or connected: media is being negotiated or flowing.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Accepted | Self::Connected)
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (None, Initiated | Receiving)
                | (Initiated | Receiving, Accepted | NotAnswered | Rejected)
                | (Accepted, Connected | Completed)
                | (Connected, Completed)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Initiated => "INITIATED",
            Self::Receiving => "RECEIVING",
            Self::Accepted => "ACCEPTED",
            Self::Connected => "CONNECTED",
            Self::Completed => "COMPLETED",
            Self::NotAnswered => "NOT_ANSWERED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallType {
    Outgoing,
    Incoming,
}

/// Why a call reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EndReason {
    /// We hung up an established call.
    LocalHangup,
    /// The peer hung up an established call.
    RemoteHangup,
    /// We stopped dialing before the peer answered.
    Cancelled,
    /// The peer declined our call.
    RemoteRejected,
    /// We declined an incoming call.
    Rejected,
    /// The caller gave up before we answered.
    RemoteCancelled,
    Timeout,
    /// Arrived while we were in another call.
    Busy,
    /// A newer incoming call replaced this one while it was ringing.
    Superseded,
    NegotiationFailed { phase: NegotiationStep, cause: String },
    /// The call could not be signaled to the peer at all.
    SignalingFailed { message: String },
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("local hangup"),
            Self::RemoteHangup => f.write_str("remote hangup"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::RemoteRejected => f.write_str("rejected by peer"),
            Self::Rejected => f.write_str("rejected"),
            Self::RemoteCancelled => f.write_str("cancelled by peer"),
            Self::Timeout => f.write_str("timed out"),
            Self::Busy => f.write_str("busy"),
            Self::Superseded => f.write_str("superseded"),
            Self::NegotiationFailed { phase, cause } => {
                write!(f, "negotiation failed during {phase}: {cause}")
            }
            Self::SignalingFailed { message } => write!(f, "signaling failed: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal call transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: CallState,
    pub to: CallState,
}

/// One call attempt, live or logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub peer_user_id: UserId,
    pub call_type: CallType,
    pub call_state: CallState,
    pub start_time: i64,
    pub end_time: Option<i64>,
    /// State the call was in when it ended.
    pub ended_from: Option<CallState>,
    pub end_reason: Option<EndReason>,
}

impl CallRecord {
    pub fn outgoing(peer_user_id: UserId, start_time: i64) -> Self {
        Self::new(peer_user_id, CallType::Outgoing, CallState::Initiated, start_time)
    }

    pub fn incoming(peer_user_id: UserId, start_time: i64) -> Self {
        Self::new(peer_user_id, CallType::Incoming, CallState::Receiving, start_time)
    }

    fn new(peer_user_id: UserId, call_type: CallType, call_state: CallState, start_time: i64) -> Self {
        Self {
            peer_user_id,
            call_type,
            call_state,
            start_time,
            end_time: None,
            ended_from: None,
            end_reason: None,
        }
    }

    pub fn identity(&self) -> CallIdentity {
        CallIdentity::new(self.peer_user_id.clone(), self.start_time)
    }

    pub fn is(&self, identity: &CallIdentity) -> bool {
        self.start_time == identity.start_time && self.peer_user_id == identity.peer_user_id
    }

    pub fn is_terminal(&self) -> bool {
        self.call_state.is_terminal()
    }

    /// Move to a non-terminal state. Returns the previous state.
    pub(crate) fn advance(&mut self, next: CallState) -> Result<CallState, IllegalTransition> {
        let from = self.call_state;
        if !from.can_transition_to(next) || next.is_terminal() {
            return Err(IllegalTransition { from, to: next });
        }
        self.call_state = next;
        Ok(from)
    }

    /// Move to a terminal state, stamping the end time and reason.
    pub(crate) fn finish(
        &mut self,
        next: CallState,
        reason: EndReason,
        end_time: i64,
    ) -> Result<CallState, IllegalTransition> {
        let from = self.call_state;
        if !from.can_transition_to(next) || !next.is_terminal() {
            return Err(IllegalTransition { from, to: next });
        }
        self.call_state = next;
        self.end_time = Some(end_time);
        self.ended_from = Some(from);
        self.end_reason = Some(reason);
        Ok(from)
    }
}

/// Terminal call records in the order they ended. Entries are never changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CallLog {
    entries: Vec<CallRecord>,
}

impl CallLog {
    pub(crate) fn append(&mut self, record: CallRecord) {
        debug_assert!(record.is_terminal(), "only ended calls are logged");
        self.entries.push(record);
    }

    pub fn entries(&self) -> &[CallRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&CallRecord> {
        self.entries.last()
    }

    pub fn contains(&self, identity: &CallIdentity) -> bool {
        self.entries.iter().any(|r| r.is(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        use CallState::*;
        assert!(None.can_transition_to(Initiated));
        assert!(Initiated.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Completed));
        assert!(Receiving.can_transition_to(Rejected));

        assert!(!Connected.can_transition_to(Accepted));
        assert!(!Initiated.can_transition_to(Connected));
        assert!(!Initiated.can_transition_to(Completed));
        for terminal in [Completed, NotAnswered, Rejected] {
            for next in [None, Initiated, Receiving, Accepted, Connected, Completed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn finish_records_where_the_call_ended() {
        let mut call = CallRecord::outgoing("bob".into(), 100);
        let from = call
            .finish(CallState::NotAnswered, EndReason::Timeout, 30_100)
            .unwrap();

        assert_eq!(from, CallState::Initiated);
        assert_eq!(call.ended_from, Some(CallState::Initiated));
        assert_eq!(call.end_time, Some(30_100));
        assert_eq!(call.end_reason, Some(EndReason::Timeout));

        let err = call.advance(CallState::Accepted).unwrap_err();
        assert_eq!(
            err,
            IllegalTransition {
                from: CallState::NotAnswered,
                to: CallState::Accepted,
            }
        );
    }

    #[test]
    fn advance_refuses_terminal_states() {
        let mut call = CallRecord::incoming("alice".into(), 100);
        assert!(call.advance(CallState::Rejected).is_err());
        assert_eq!(call.call_state, CallState::Receiving);
        assert_eq!(call.advance(CallState::Accepted), Ok(CallState::Receiving));
    }

    #[test]
    fn identity_matches_peer_and_start_time() {
        let call = CallRecord::incoming("alice".into(), 100);
        assert!(call.is(&CallIdentity::new("alice", 100)));
        assert!(!call.is(&CallIdentity::new("alice", 99)));
        assert_eq!(call.identity(), CallIdentity::new("alice", 100));
    }

    #[test]
    fn states_serialize_in_upper_case() {
        let call = CallRecord::outgoing("bob".into(), 100);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["call_state"], "INITIATED");
        assert_eq!(json["call_type"], "OUTGOING");
    }

    #[test]
    fn failed_call_reads_back_from_json() {
        let mut call = CallRecord::incoming("alice".into(), 100);
        call.advance(CallState::Accepted).unwrap();
        call.finish(
            CallState::Completed,
            EndReason::NegotiationFailed {
                phase: NegotiationStep::SetRemoteDescription,
                cause: "bad sdp".into(),
            },
            250,
        )
        .unwrap();

        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains(r#""phase":"set_remote_description""#));
        let back: CallRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, call);
    }
}
