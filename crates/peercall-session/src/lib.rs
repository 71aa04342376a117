//! # peercall-session
//!
//! The call lifecycle on top of signaling and negotiation.
//!
//! A [`CallClient`] is a handle to one user's session task, which tracks the
//! current call, the last incoming call and the call log, reacts to
//! `CallInit`/`CallAccept`/`CallEnd` from peers, and starts a fresh
//! negotiation engine for every accepted call. Dial and ring attempts are
//! bounded by the timeout supervisor.
//!
//! ```text
//! NONE -> INITIATED | RECEIVING -> ACCEPTED -> CONNECTED -> COMPLETED
//!                 \-> NOT_ANSWERED | REJECTED
//! ```

pub mod client;
pub mod event;
pub mod model;
pub mod session;
pub mod timeout;

pub use client::CallClient;
pub use event::{CallEvent, SessionSnapshot};
pub use model::{CallLog, CallRecord, CallState, CallType, EndReason};
pub use session::SessionOptions;
pub use timeout::{CallTimeoutSupervisor, TimeoutKind, TimerFired};
