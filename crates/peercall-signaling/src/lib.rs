//! # peercall-signaling
//!
//! Call signaling over a per-user publish/subscribe channel.
//!
//! Every message is published to the recipient's channel (their user id) and
//! carries the sender id plus the call's start time, so the receiver can tell
//! which call attempt it belongs to:
//! - `call_init` / `call_accept` / `call_end` drive the call lifecycle
//! - `ice_offer` / `ice_answer` / `ice_candidate` drive WebRTC negotiation
//!
//! Media never flows through this channel.

pub mod codec;
pub mod message;
pub mod transport;

pub use codec::{decode, encode, Inbound};
pub use message::{Envelope, IceCandidateInit, SignalBody};
pub use transport::{MemoryBus, Signaler, Transport};
