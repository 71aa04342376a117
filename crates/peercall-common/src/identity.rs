//! User and call identifiers.
//!
//! A call attempt is identified by the peer it is with and the start time
//! chosen by whoever dialed. Start times come from [`StartTimeClock`], which
//! never hands out the same millisecond twice, so a quick redial to the same
//! peer still gets a distinct identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A user id, which doubles as that user's signaling channel name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// `(peer_user_id, start_time)`: one call attempt, as seen from the local side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallIdentity {
    pub peer_user_id: UserId,
    /// Unix milliseconds, chosen by the caller.
    pub start_time: i64,
}

impl CallIdentity {
    pub fn new(peer_user_id: impl Into<UserId>, start_time: i64) -> Self {
        Self {
            peer_user_id: peer_user_id.into(),
            start_time,
        }
    }
}

impl fmt::Display for CallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer_user_id, self.start_time)
    }
}

/// Source of wall-clock time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Strictly increasing millisecond timestamps.
pub struct StartTimeClock {
    source: Arc<dyn Clock>,
    last: AtomicI64,
}

impl StartTimeClock {
    pub fn new() -> Self {
        Self::with_source(Arc::new(SystemClock))
    }

    pub fn with_source(source: Arc<dyn Clock>) -> Self {
        Self {
            source,
            last: AtomicI64::new(i64::MIN),
        }
    }

    /// Current time, for end times and other non-identity stamps.
    pub fn now(&self) -> i64 {
        self.source.now_millis()
    }

    /// Current Unix time in milliseconds, bumped past the last value handed out.
    pub fn next(&self) -> i64 {
        let now = self.source.now_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

impl Default for StartTimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StartTimeClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartTimeClock")
            .field("last", &self.last.load(Ordering::Relaxed))
            .finish()
    }
}
