//! Single-shot dial/ring timers keyed by call identity.
//!
//! Each armed timer is a sleeping task that posts a [`TimerFired`] back to the
//! session loop. Cancelling aborts the task, but a timer that already fired
//! may still be queued, so the session must [`acknowledge`] every firing
//! before acting on it. Acknowledging a cancelled or replaced timer fails.
//!
//! [`acknowledge`]: CallTimeoutSupervisor::acknowledge

use peercall_common::CallIdentity;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Outgoing call waiting for `CallAccept`.
    Dial,
    /// Incoming call waiting for the local user.
    Ring,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dial => f.write_str("dial"),
            Self::Ring => f.write_str("ring"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub identity: CallIdentity,
    pub kind: TimeoutKind,
    token: u64,
}

struct ArmedTimer {
    kind: TimeoutKind,
    token: u64,
    task: AbortHandle,
}

pub struct CallTimeoutSupervisor {
    timers: HashMap<CallIdentity, ArmedTimer>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    next_token: u64,
}

impl CallTimeoutSupervisor {
    pub fn new(fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            timers: HashMap::new(),
            fired_tx,
            next_token: 0,
        }
    }

    /// Arm a timer for `identity`, replacing any timer it already has.
    pub fn arm(&mut self, identity: CallIdentity, kind: TimeoutKind, after: Duration) {
        self.cancel(&identity);

        self.next_token += 1;
        let token = self.next_token;
        let fired = TimerFired {
            identity: identity.clone(),
            kind,
            token,
        };
        let tx = self.fired_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(fired);
        })
        .abort_handle();

        tracing::debug!(call = %identity, %kind, timeout_ms = after.as_millis() as u64, "Timer armed");
        self.timers.insert(identity, ArmedTimer { kind, token, task });
    }

    /// Disarm the timer for `identity`. Returns whether one was armed.
    pub fn cancel(&mut self, identity: &CallIdentity) -> bool {
        match self.timers.remove(identity) {
            Some(timer) => {
                timer.task.abort();
                tracing::debug!(call = %identity, kind = %timer.kind, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn armed(&self) -> usize {
        self.timers.len()
    }

    /// Claim a firing. Only the first firing of a timer that is still armed
    /// is accepted; everything else is stale.
    pub fn acknowledge(&mut self, fired: &TimerFired) -> bool {
        match self.timers.get(&fired.identity) {
            Some(timer) if timer.token == fired.token => {
                self.timers.remove(&fired.identity);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }
}

impl Drop for CallTimeoutSupervisor {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (CallTimeoutSupervisor, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CallTimeoutSupervisor::new(tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_the_timeout() {
        let (mut timers, mut fired) = supervisor();
        let call = CallIdentity::new("bob", 100);
        timers.arm(call.clone(), TimeoutKind::Dial, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(fired.try_recv().is_err());

        let event = fired.recv().await.unwrap();
        assert_eq!(event.identity, call);
        assert_eq!(event.kind, TimeoutKind::Dial);
        assert!(timers.acknowledge(&event));
        assert!(!timers.acknowledge(&event));
        assert_eq!(timers.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (mut timers, mut fired) = supervisor();
        let call = CallIdentity::new("bob", 100);
        timers.arm(call.clone(), TimeoutKind::Ring, Duration::from_secs(5));

        assert!(timers.cancel(&call));
        assert!(!timers.cancel(&call));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn firing_queued_before_cancel_is_stale() {
        let (mut timers, mut fired) = supervisor();
        let call = CallIdentity::new("bob", 100);
        timers.arm(call.clone(), TimeoutKind::Dial, Duration::from_secs(1));

        let event = fired.recv().await.unwrap();
        timers.cancel(&call);
        assert!(!timers.acknowledge(&event));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_invalidates_the_previous_timer() {
        let (mut timers, mut fired) = supervisor();
        let call = CallIdentity::new("bob", 100);
        timers.arm(call.clone(), TimeoutKind::Dial, Duration::from_secs(1));
        let first = fired.recv().await.unwrap();

        timers.arm(call.clone(), TimeoutKind::Dial, Duration::from_secs(1));
        assert!(!timers.acknowledge(&first));

        let second = fired.recv().await.unwrap();
        assert!(timers.acknowledge(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn timers_are_independent_per_identity() {
        let (mut timers, mut fired) = supervisor();
        let old = CallIdentity::new("bob", 100);
        let new = CallIdentity::new("bob", 101);
        timers.arm(old.clone(), TimeoutKind::Dial, Duration::from_secs(1));
        timers.arm(new.clone(), TimeoutKind::Dial, Duration::from_secs(2));
        timers.cancel(&old);

        let event = fired.recv().await.unwrap();
        assert_eq!(event.identity, new);
        assert!(timers.acknowledge(&event));
    }
}
