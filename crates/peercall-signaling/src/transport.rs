//! The signaling transport collaborator.
//!
//! The call core only needs two things from the pub/sub layer: publish a
//! payload to a user's channel, and receive whatever is published to our own
//! channel. Delivery is at-least-once and ordered per channel; retries are the
//! transport's business, not ours.

use crate::codec;
use crate::message::{Envelope, SignalBody};
use async_trait::async_trait;
use peercall_common::{CallIdentity, CallResult, TransportError, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish `payload` on `channel`.
    async fn send(&self, channel: &UserId, payload: String) -> Result<(), TransportError>;

    /// Receive everything published on `channel` from now on.
    async fn subscribe(&self, channel: &UserId) -> mpsc::UnboundedReceiver<String>;
}

/// In-process pub/sub bus.
///
/// Each channel delivers in publish order to every live subscriber. For
/// exercising at-least-once handling it can deliver every payload twice, and
/// it can be told to fail the next few sends.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    channels: RwLock<HashMap<UserId, Vec<mpsc::UnboundedSender<String>>>>,
    duplicate_delivery: AtomicBool,
    failing_sends: AtomicUsize,
    delivered: AtomicUsize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every payload twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::Relaxed);
    }

    /// Make the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.inner.failing_sends.store(count, Ordering::Relaxed);
    }

    /// Number of payload deliveries made so far (duplicates included).
    pub fn delivered(&self) -> usize {
        self.inner.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn send(&self, channel: &UserId, payload: String) -> Result<(), TransportError> {
        let should_fail = self
            .inner
            .failing_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::SendFailed {
                channel: channel.to_string(),
                message: "injected failure".into(),
            });
        }

        let copies = if self.inner.duplicate_delivery.load(Ordering::Relaxed) {
            2
        } else {
            1
        };

        let mut channels = self.inner.channels.write().await;
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                for _ in 0..copies {
                    if tx.send(payload.clone()).is_ok() {
                        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &UserId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .channels
            .write()
            .await
            .entry(channel.clone())
            .or_default()
            .push(tx);
        rx
    }
}

/// Sends signaling messages on behalf of the local user.
#[derive(Clone)]
pub struct Signaler {
    local_id: UserId,
    transport: Arc<dyn Transport>,
}

impl Signaler {
    pub fn new(local_id: UserId, transport: Arc<dyn Transport>) -> Self {
        Self {
            local_id,
            transport,
        }
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    /// Publish `body` to the peer of `identity`, tagged with its start time.
    pub async fn send(&self, identity: &CallIdentity, body: SignalBody) -> CallResult<()> {
        let kind = body.kind();
        let envelope = Envelope::new(self.local_id.clone(), identity.start_time, body);
        let payload = codec::encode(&envelope)?;

        self.transport
            .send(&identity.peer_user_id, payload)
            .await
            .inspect_err(|e| {
                tracing::warn!(call = %identity, kind, error = %e, "Signaling send failed");
            })?;

        tracing::debug!(call = %identity, kind, "Signal sent");
        Ok(())
    }

    /// Our own channel's inbound payloads.
    pub async fn inbox(&self) -> mpsc::UnboundedReceiver<String> {
        self.transport.subscribe(&self.local_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, Inbound};

    #[tokio::test]
    async fn delivers_in_order_to_the_addressed_channel_only() {
        let bus = MemoryBus::new();
        let mut bob = bus.subscribe(&"bob".into()).await;
        let mut carol = bus.subscribe(&"carol".into()).await;

        bus.send(&"bob".into(), "one".into()).await.unwrap();
        bus.send(&"bob".into(), "two".into()).await.unwrap();

        assert_eq!(bob.recv().await.as_deref(), Some("one"));
        assert_eq!(bob.recv().await.as_deref(), Some("two"));
        assert!(carol.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_delivery_sends_twice() {
        let bus = MemoryBus::new();
        bus.set_duplicate_delivery(true);
        let mut bob = bus.subscribe(&"bob".into()).await;

        bus.send(&"bob".into(), "hi".into()).await.unwrap();

        assert_eq!(bob.recv().await.as_deref(), Some("hi"));
        assert_eq!(bob.recv().await.as_deref(), Some("hi"));
        assert_eq!(bus.delivered(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let bus = MemoryBus::new();
        bus.fail_next_sends(1);

        let err = bus.send(&"bob".into(), "x".into()).await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed { .. }));
        assert!(bus.send(&"bob".into(), "x".into()).await.is_ok());
    }

    #[tokio::test]
    async fn signaler_publishes_to_peer_channel() {
        let bus = MemoryBus::new();
        let mut bob = bus.subscribe(&"bob".into()).await;
        let alice = Signaler::new("alice".into(), Arc::new(bus.clone()));

        alice
            .send(&CallIdentity::new("bob", 100), SignalBody::CallInit)
            .await
            .unwrap();

        let payload = bob.recv().await.unwrap();
        match decode(&payload).unwrap() {
            Inbound::Signal(env) => {
                assert_eq!(env.sender_id, UserId::from("alice"));
                assert_eq!(env.start_time, 100);
                assert_eq!(env.message, SignalBody::CallInit);
                assert_eq!(env.identity(), CallIdentity::new("alice", 100));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
