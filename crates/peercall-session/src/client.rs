//! The handle the UI layer holds.

use crate::event::{CallEvent, SessionSnapshot};
use crate::model::CallRecord;
use crate::session::{self, Command, SessionInputs, SessionOptions};
use peercall_common::{CallError, CallIdentity, CallResult, UserId};
use peercall_rtc::{MediaConstraints, MediaKind};
use peercall_signaling::{Signaler, Transport};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Cheap to clone; every clone talks to the same session task.
#[derive(Clone)]
pub struct CallClient {
    local_id: UserId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl CallClient {
    /// Subscribe to `local_id`'s signaling channel and start its session task.
    pub async fn spawn(
        local_id: impl Into<UserId>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
    ) -> Self {
        let local_id = local_id.into();
        let signaler = Signaler::new(local_id.clone(), transport);
        let inbox = signaler.inbox().await;

        let (commands, commands_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());

        tokio::spawn(session::run(
            signaler,
            options,
            SessionInputs {
                commands: commands_rx,
                inbox,
            },
            events.clone(),
            snapshot_tx,
        ));

        Self {
            local_id,
            commands,
            events,
            snapshot,
        }
    }

    pub fn local_id(&self) -> &UserId {
        &self.local_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<CallResult<T>>) -> Command,
    ) -> CallResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }

    /// Dial `peer`. Returns the identity of the new call.
    pub async fn place_call(&self, peer: impl Into<UserId>) -> CallResult<CallIdentity> {
        let peer = peer.into();
        self.request(|reply| Command::PlaceCall { peer, reply }).await
    }

    /// Accept the ringing incoming call, cancelling our own dial if any.
    pub async fn answer_call(&self) -> CallResult<()> {
        self.request(|reply| Command::AnswerCall { reply }).await
    }

    pub async fn reject_call(&self) -> CallResult<()> {
        self.request(|reply| Command::RejectCall { reply }).await
    }

    /// Hang up, or stop dialing. The call ends locally even if the peer
    /// cannot be told.
    pub async fn end_call(&self) -> CallResult<()> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Flip the camera toggle. Mid-call this re-acquires media and renegotiates.
    pub async fn toggle_video(&self) -> CallResult<MediaConstraints> {
        self.request(|reply| Command::Toggle {
            kind: MediaKind::Video,
            reply,
        })
        .await
    }

    pub async fn toggle_audio(&self) -> CallResult<MediaConstraints> {
        self.request(|reply| Command::Toggle {
            kind: MediaKind::Audio,
            reply,
        })
        .await
    }

    pub fn current_call(&self) -> Option<CallRecord> {
        self.snapshot.borrow().current_call.clone()
    }

    pub fn last_incoming_call(&self) -> Option<CallRecord> {
        self.snapshot.borrow().last_incoming_call.clone()
    }

    pub fn call_log(&self) -> Vec<CallRecord> {
        self.snapshot.borrow().call_log.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Observe every published snapshot.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Hang up any active call and stop the session task.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
    }
}
