//! # peercall-common
//!
//! Shared configuration, error taxonomy, and identifiers used across all peercall crates.
//! This is the foundation layer: no call logic, just primitives and contracts.

pub mod config;
pub mod error;
pub mod identity;

pub use error::{
    CallError, CallResult, MediaAcquisitionError, NegotiationError, NegotiationStep, ProtocolError,
    TransportError,
};
pub use identity::{CallIdentity, Clock, ManualClock, StartTimeClock, SystemClock, UserId};
