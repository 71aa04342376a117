//! JSON encoding of signaling envelopes.
//!
//! Decoding happens in two steps so that newer peers can add message kinds:
//! an envelope whose `type` tag is not one we know decodes to
//! [`Inbound::Unknown`] and is ignored, while a known kind with a bad payload
//! (or text that is not an envelope at all) is a [`ProtocolError`].

use crate::message::{Envelope, SignalBody};
use peercall_common::{ProtocolError, UserId};
use serde_json::Value;

/// Result of decoding one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Signal(Envelope),
    /// A message kind this version does not understand.
    Unknown {
        kind: String,
        sender_id: Option<UserId>,
    },
}

pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode(payload: &str) -> Result<Inbound, ProtocolError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("message")
        .and_then(|m| m.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("missing message.type".into()))?
        .to_owned();

    if !SignalBody::KINDS.contains(&kind.as_str()) {
        let sender_id = value
            .get("sender_id")
            .and_then(Value::as_str)
            .map(UserId::from);
        return Ok(Inbound::Unknown { kind, sender_id });
    }

    serde_json::from_value::<Envelope>(value)
        .map(Inbound::Signal)
        .map_err(|e| ProtocolError::InvalidPayload {
            kind,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::IceCandidateInit;

    fn envelope(message: SignalBody) -> Envelope {
        Envelope::new(UserId::from("alice"), 100, message)
    }

    #[test]
    fn control_messages_have_no_data() {
        let json = encode(&envelope(SignalBody::CallInit)).unwrap();
        assert_eq!(
            json,
            r#"{"sender_id":"alice","start_time":100,"message":{"type":"call_init"}}"#
        );
    }

    #[test]
    fn every_kind_decodes_back() {
        let bodies = vec![
            SignalBody::CallInit,
            SignalBody::CallAccept,
            SignalBody::CallEnd,
            SignalBody::IceOffer { sdp: "v=0\r\n".into() },
            SignalBody::IceAnswer { sdp: "v=0\r\n".into() },
            SignalBody::IceCandidate {
                candidate: Some(IceCandidateInit {
                    candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_m_line_index: Some(0),
                }),
            },
            SignalBody::IceCandidate { candidate: None },
        ];
        for body in bodies {
            let env = envelope(body);
            let decoded = decode(&encode(&env).unwrap()).unwrap();
            assert_eq!(decoded, Inbound::Signal(env));
        }
    }

    #[test]
    fn end_of_candidates_is_explicit_null() {
        let json = encode(&envelope(SignalBody::IceCandidate { candidate: None })).unwrap();
        assert!(json.contains(r#""data":{"candidate":null}"#));
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        let payload = r#"{"sender_id":"bob","start_time":5,"message":{"type":"screen_share","data":{}}}"#;
        assert_eq!(
            decode(payload).unwrap(),
            Inbound::Unknown {
                kind: "screen_share".into(),
                sender_id: Some(UserId::from("bob")),
            }
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"sender_id":"bob"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn known_kind_with_bad_payload_is_invalid() {
        let payload = r#"{"sender_id":"bob","start_time":5,"message":{"type":"ice_offer","data":{"sdp":42}}}"#;
        match decode(payload) {
            Err(ProtocolError::InvalidPayload { kind, .. }) => assert_eq!(kind, "ice_offer"),
            other => panic!("expected invalid payload, got {other:?}"),
        }
    }

    #[test]
    fn missing_start_time_is_invalid() {
        let payload = r#"{"sender_id":"bob","message":{"type":"call_init"}}"#;
        assert!(matches!(
            decode(payload),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }
}
