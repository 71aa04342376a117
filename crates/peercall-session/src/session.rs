//! The call session actor.
//!
//! One task owns every piece of call state: the current and last incoming
//! call, the call log, the negotiation engine and the timers. User commands,
//! inbound signaling, timer firings, media results and peer events are all
//! handled on that task one at a time, so no transition ever observes another
//! half-applied. Work that has to wait (media capture, peer event streams)
//! runs in helper tasks that post results back tagged with the call identity
//! they belong to; results for a call that is no longer current are dropped.

use crate::event::{CallEvent, SessionSnapshot};
use crate::model::{CallLog, CallRecord, CallState, CallType, EndReason};
use crate::timeout::{CallTimeoutSupervisor, TimeoutKind, TimerFired};
use peercall_common::config::{AppConfig, CallConfig, MediaConfig, RtcConfig};
use peercall_common::{CallError, CallIdentity, CallResult, NegotiationError, StartTimeClock, UserId};
use peercall_rtc::soft::{SoftPeerFactory, SyntheticMediaSource};
use peercall_rtc::{
    AcquiredMedia, EngineError, EngineNotice, MediaConstraints, MediaKind, MediaSink, MediaSource,
    NegotiationEngine, NullSink, PeerConnectionFactory, PeerEvent, Role, RtcContext,
    SessionDescription,
};
use peercall_signaling::{decode, Inbound, SignalBody, Signaler};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Everything a session needs besides its transport.
#[derive(Clone)]
pub struct SessionOptions {
    pub call: CallConfig,
    pub media: MediaConfig,
    pub rtc: RtcConfig,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub media_source: Arc<dyn MediaSource>,
    pub sink: Arc<dyn MediaSink>,
    pub clock: Arc<StartTimeClock>,
}

impl SessionOptions {
    /// Options from configuration, with the in-process peer connection and
    /// capture device.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            call: config.call.clone(),
            media: config.media.clone(),
            rtc: config.rtc.clone(),
            peer_factory: Arc::new(SoftPeerFactory::new()),
            media_source: Arc::new(SyntheticMediaSource::new()),
            sink: Arc::new(NullSink),
            clock: Arc::new(StartTimeClock::new()),
        }
    }

    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = factory;
        self
    }

    pub fn with_media_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.media_source = source;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<StartTimeClock>) -> Self {
        self.clock = clock;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Requests from [`CallClient`](crate::CallClient) handles.
#[derive(Debug)]
pub(crate) enum Command {
    PlaceCall {
        peer: UserId,
        reply: oneshot::Sender<CallResult<CallIdentity>>,
    },
    AnswerCall {
        reply: oneshot::Sender<CallResult<()>>,
    },
    RejectCall {
        reply: oneshot::Sender<CallResult<()>>,
    },
    EndCall {
        reply: oneshot::Sender<CallResult<()>>,
    },
    Toggle {
        kind: MediaKind,
        reply: oneshot::Sender<CallResult<MediaConstraints>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results posted back by helper tasks.
enum Internal {
    MediaSettled {
        identity: CallIdentity,
        generation: u64,
        media: AcquiredMedia,
    },
    Peer {
        identity: CallIdentity,
        event: PeerEvent,
    },
}

pub(crate) struct SessionInputs {
    pub commands: mpsc::Receiver<Command>,
    pub inbox: mpsc::UnboundedReceiver<String>,
}

pub(crate) struct CallSession {
    local_id: UserId,
    signaler: Signaler,
    call_config: CallConfig,
    media: MediaConstraints,
    rtc: RtcContext,
    clock: Arc<StartTimeClock>,
    current_call: Option<CallRecord>,
    last_incoming_call: Option<CallRecord>,
    call_log: CallLog,
    engine: Option<NegotiationEngine>,
    timers: CallTimeoutSupervisor,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
}

/// Run a session until it is shut down or its inbox closes.
pub(crate) async fn run(
    signaler: Signaler,
    options: SessionOptions,
    inputs: SessionInputs,
    events: broadcast::Sender<CallEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
) {
    let SessionInputs {
        mut commands,
        mut inbox,
    } = inputs;
    let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();

    let mut session = CallSession {
        local_id: signaler.local_id().clone(),
        rtc: RtcContext {
            signaler: signaler.clone(),
            factory: options.peer_factory,
            rtc: options.rtc,
            media_source: options.media_source,
            sink: options.sink,
        },
        signaler,
        call_config: options.call,
        media: MediaConstraints {
            audio: options.media.audio,
            video: options.media.video,
        },
        clock: options.clock,
        current_call: None,
        last_incoming_call: None,
        call_log: CallLog::default(),
        engine: None,
        timers: CallTimeoutSupervisor::new(timer_tx),
        internal_tx,
        events,
        snapshot,
    };
    session.publish();
    tracing::info!(user = %session.local_id, "Call session started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown { reply }) => {
                    session.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                Some(command) => session.handle_command(command).await,
                None => break,
            },
            payload = inbox.recv() => match payload {
                Some(payload) => session.handle_inbound(&payload).await,
                None => {
                    tracing::warn!(user = %session.local_id, "Signaling inbox closed");
                    break;
                }
            },
            Some(fired) = timer_rx.recv() => session.handle_timer(fired).await,
            Some(internal) = internal_rx.recv() => session.handle_internal(internal).await,
        }
        session.publish();
    }

    session.shutdown().await;
}

impl CallSession {
    fn current_state(&self) -> CallState {
        self.current_call
            .as_ref()
            .map_or(CallState::None, |c| c.call_state)
    }

    fn ringing_call(&self) -> Option<CallIdentity> {
        self.last_incoming_call
            .as_ref()
            .filter(|c| c.call_state == CallState::Receiving)
            .map(CallRecord::identity)
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            current_call: self.current_call.clone(),
            last_incoming_call: self.last_incoming_call.clone(),
            call_log: self.call_log.entries().to_vec(),
            media: self.media,
            negotiation: self.engine.as_ref().map(NegotiationEngine::state),
        });
    }

    /// Send a control message. Failures are reported and returned.
    async fn signal(&self, identity: &CallIdentity, body: SignalBody) -> CallResult<()> {
        self.signaler.send(identity, body).await.inspect_err(|e| {
            self.emit(CallEvent::SignalFailed {
                identity: identity.clone(),
                error: e.clone(),
            });
        })
    }

    /// Tell the peer a call is over when nobody is waiting on the outcome.
    async fn notify_peer_end(&self, identity: &CallIdentity) {
        let _ = self.signal(identity, SignalBody::CallEnd).await;
    }

    // --- transitions ---

    /// Move every live copy of `identity` to a non-terminal state.
    fn advance_call(&mut self, identity: &CallIdentity, next: CallState) -> bool {
        let mut from = None;
        for record in [self.current_call.as_mut(), self.last_incoming_call.as_mut()]
            .into_iter()
            .flatten()
            .filter(|r| r.is(identity))
        {
            match record.advance(next) {
                Ok(prev) => from = from.or(Some(prev)),
                Err(e) => tracing::debug!(call = %identity, error = %e, "Transition skipped"),
            }
        }

        let Some(from) = from else {
            return false;
        };
        tracing::info!(call = %identity, %from, to = %next, "Call state changed");
        self.emit(CallEvent::StateChanged {
            identity: identity.clone(),
            from,
            to: next,
        });
        true
    }

    /// End every live copy of `identity`, log it once, and tear down its
    /// timer and negotiation. Returns false if the call had already ended.
    fn finish_call(&mut self, identity: &CallIdentity, next: CallState, reason: EndReason) -> bool {
        let now = self.clock.now();
        let mut ended = None;
        for record in [self.current_call.as_mut(), self.last_incoming_call.as_mut()]
            .into_iter()
            .flatten()
            .filter(|r| r.is(identity) && !r.is_terminal())
        {
            let end_time = now.max(record.start_time);
            match record.finish(next, reason.clone(), end_time) {
                Ok(_) if ended.is_none() => ended = Some(record.clone()),
                Ok(_) => {}
                Err(e) => tracing::warn!(call = %identity, error = %e, "Cannot end call"),
            }
        }

        let Some(record) = ended else {
            tracing::debug!(call = %identity, "Call already ended");
            return false;
        };

        tracing::info!(
            call = %identity,
            from = ?record.ended_from,
            to = %next,
            reason = %reason,
            "Call ended"
        );
        self.call_log.append(record.clone());
        self.timers.cancel(identity);
        if self
            .engine
            .as_ref()
            .is_some_and(|engine| engine.identity() == identity)
        {
            if let Some(mut engine) = self.engine.take() {
                engine.close();
            }
        }
        self.emit(CallEvent::CallEnded(record));
        true
    }

    // --- negotiation ---

    fn start_engine(&mut self, identity: CallIdentity, role: Role) -> Result<(), EngineError> {
        if let Some(mut previous) = self.engine.take() {
            previous.close();
        }

        let mut engine = NegotiationEngine::new(identity.clone(), role, self.rtc.clone());
        let events = engine.start()?;
        self.engine = Some(engine);
        self.forward_peer_events(identity, events);
        self.acquire_media();
        Ok(())
    }

    fn forward_peer_events(
        &self,
        identity: CallIdentity,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let internal = Internal::Peer {
                    identity: identity.clone(),
                    event,
                };
                if tx.send(internal).is_err() {
                    break;
                }
            }
        });
    }

    /// Capture media for the active call with the current toggles.
    fn acquire_media(&mut self) {
        let media = self.media;
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let identity = engine.identity().clone();
        let request = engine.request_media(media);
        let source = self.rtc.media_source.clone();
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let media = request.future.await;
            let settled = Internal::MediaSettled {
                identity,
                generation: request.generation,
                media,
            };
            if let Err(unsent) = tx.send(settled) {
                if let Internal::MediaSettled { media, .. } = unsent.0 {
                    source.release(media.handle);
                }
            }
        });
    }

    async fn after_engine(&mut self, identity: &CallIdentity, result: Result<(), EngineError>) {
        match result {
            Ok(()) => {}
            Err(EngineError::Negotiation(e)) => self.fail_negotiation(identity, e).await,
            Err(e) => tracing::warn!(call = %identity, error = %e, "Negotiation step skipped"),
        }
    }

    /// A failed negotiation ends the call as if the peer had hung up, and
    /// the peer is told.
    async fn fail_negotiation(&mut self, identity: &CallIdentity, error: NegotiationError) {
        tracing::error!(
            call = %identity,
            phase = %error.phase,
            cause = %error.cause,
            "Negotiation failed, ending call"
        );
        let reason = EndReason::NegotiationFailed {
            phase: error.phase,
            cause: error.cause,
        };
        if self.finish_call(identity, CallState::Completed, reason) {
            self.notify_peer_end(identity).await;
        }
    }

    fn engine_for(&mut self, identity: &CallIdentity) -> Option<&mut NegotiationEngine> {
        self.engine
            .as_mut()
            .filter(|engine| engine.identity() == identity)
    }

    // --- commands ---

    /// Replies go out only after the snapshot reflects the command, so a
    /// caller reading observers right after a reply sees its effect.
    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::PlaceCall { peer, reply } => {
                let result = self.place_call(peer).await;
                self.respond(reply, result);
            }
            Command::AnswerCall { reply } => {
                let result = self.answer_call().await;
                self.respond(reply, result);
            }
            Command::RejectCall { reply } => {
                let result = self.reject_call().await;
                self.respond(reply, result);
            }
            Command::EndCall { reply } => {
                let result = self.end_call().await;
                self.respond(reply, result);
            }
            Command::Toggle { kind, reply } => {
                let result = Ok(self.toggle(kind));
                self.respond(reply, result);
            }
            Command::Shutdown { reply } => self.respond(reply, ()),
        }
    }

    fn respond<T>(&self, reply: oneshot::Sender<T>, result: T) {
        self.publish();
        let _ = reply.send(result);
    }

    async fn place_call(&mut self, peer: UserId) -> CallResult<CallIdentity> {
        if peer == self.local_id {
            return Err(CallError::SelfCall);
        }
        let state = self.current_state();
        if state != CallState::None && !state.is_terminal() {
            return Err(CallError::invalid_state(state));
        }

        let record = CallRecord::outgoing(peer, self.clock.next());
        let identity = record.identity();
        self.current_call = Some(record);
        tracing::info!(call = %identity, "Dialing");
        self.emit(CallEvent::StateChanged {
            identity: identity.clone(),
            from: CallState::None,
            to: CallState::Initiated,
        });

        if let Err(e) = self.signal(&identity, SignalBody::CallInit).await {
            self.finish_call(
                &identity,
                CallState::NotAnswered,
                EndReason::SignalingFailed {
                    message: e.to_string(),
                },
            );
            return Err(e);
        }

        self.timers.arm(
            identity.clone(),
            TimeoutKind::Dial,
            self.call_config.dial_timeout(),
        );
        Ok(identity)
    }

    async fn answer_call(&mut self) -> CallResult<()> {
        let incoming = self
            .ringing_call()
            .ok_or(CallError::NoIncomingCall { action: "answer" })?;
        let state = self.current_state();
        if state.is_active() {
            return Err(CallError::invalid_state(state));
        }

        if state == CallState::Initiated {
            if let Some(dialing) = self.current_call.as_ref().map(CallRecord::identity) {
                tracing::info!(call = %dialing, "Cancelling outgoing call to answer");
                self.finish_call(&dialing, CallState::NotAnswered, EndReason::Cancelled);
                self.notify_peer_end(&dialing).await;
            }
        }

        self.signal(&incoming, SignalBody::CallAccept).await?;

        self.timers.cancel(&incoming);
        self.current_call = self.last_incoming_call.clone();
        self.advance_call(&incoming, CallState::Accepted);
        let started = self.start_engine(incoming.clone(), Role::Callee);
        self.after_engine(&incoming, started).await;
        Ok(())
    }

    async fn reject_call(&mut self) -> CallResult<()> {
        let incoming = self
            .ringing_call()
            .ok_or(CallError::NoIncomingCall { action: "reject" })?;
        self.finish_call(&incoming, CallState::Rejected, EndReason::Rejected);
        self.signal(&incoming, SignalBody::CallEnd).await
    }

    async fn end_call(&mut self) -> CallResult<()> {
        let Some(call) = self.current_call.as_ref().filter(|c| !c.is_terminal()) else {
            return Err(CallError::invalid_state(self.current_state()));
        };
        let identity = call.identity();
        let (next, reason) = match call.call_state {
            CallState::Initiated => (CallState::NotAnswered, EndReason::Cancelled),
            _ => (CallState::Completed, EndReason::LocalHangup),
        };

        self.finish_call(&identity, next, reason);
        self.signal(&identity, SignalBody::CallEnd).await
    }

    fn toggle(&mut self, kind: MediaKind) -> MediaConstraints {
        match kind {
            MediaKind::Audio => self.media.audio = !self.media.audio,
            MediaKind::Video => self.media.video = !self.media.video,
        }
        tracing::info!(
            user = %self.local_id,
            audio = self.media.audio,
            video = self.media.video,
            "Media toggled"
        );
        if self.current_state().is_active() {
            self.acquire_media();
        }
        self.media
    }

    async fn shutdown(&mut self) {
        if self.current_call.as_ref().is_some_and(|c| !c.is_terminal()) {
            let _ = self.end_call().await;
        }
        self.timers.cancel_all();
        if let Some(mut engine) = self.engine.take() {
            engine.close();
        }
        self.publish();
        tracing::info!(user = %self.local_id, "Call session stopped");
    }

    // --- inbound signaling ---

    async fn handle_inbound(&mut self, payload: &str) {
        let envelope = match decode(payload) {
            Ok(Inbound::Signal(envelope)) => envelope,
            Ok(Inbound::Unknown { kind, sender_id }) => {
                tracing::debug!(kind, sender = ?sender_id, "Ignoring unknown message kind");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable signaling payload");
                self.emit(CallEvent::ProtocolError(e));
                return;
            }
        };

        if envelope.sender_id == self.local_id {
            tracing::debug!(kind = envelope.message.kind(), "Ignoring our own message");
            return;
        }

        let identity = envelope.identity();
        tracing::debug!(call = %identity, kind = envelope.message.kind(), "Signal received");
        match envelope.message {
            SignalBody::CallInit => self.on_call_init(identity).await,
            SignalBody::CallAccept => self.on_call_accept(identity).await,
            SignalBody::CallEnd => self.on_call_end(identity),
            negotiation => self.on_negotiation(identity, negotiation).await,
        }
    }

    async fn on_call_init(&mut self, identity: CallIdentity) {
        if self
            .current_call
            .as_ref()
            .is_some_and(|c| c.call_type == CallType::Outgoing && c.is(&identity))
        {
            // Both sides dialed in the same millisecond. Each keeps its own
            // dial and the crossed CallInit is dropped.
            tracing::warn!(call = %identity, "Ignoring CallInit that crosses our own dial");
            return;
        }
        let known = self.current_call.as_ref().is_some_and(|c| c.is(&identity))
            || self
                .last_incoming_call
                .as_ref()
                .is_some_and(|c| c.is(&identity))
            || self.call_log.contains(&identity);
        if known {
            tracing::debug!(call = %identity, "Ignoring repeated CallInit");
            return;
        }
        let outdated = self.last_incoming_call.as_ref().is_some_and(|c| {
            c.peer_user_id == identity.peer_user_id && c.start_time > identity.start_time
        });
        if outdated {
            tracing::debug!(call = %identity, "Ignoring CallInit older than the last one from this peer");
            return;
        }

        // One call rings at a time and the newest wins, busy or not.
        if let Some(ringing) = self.ringing_call() {
            self.finish_call(&ringing, CallState::NotAnswered, EndReason::Superseded);
            if self.call_config.busy_reply {
                self.notify_peer_end(&ringing).await;
            }
        }

        let mut record = CallRecord::incoming(identity.peer_user_id.clone(), identity.start_time);
        let state = self.current_state();
        if state.is_active() {
            tracing::info!(call = %identity, current = %state, "Busy, incoming call not answered");
            let end_time = self.clock.now().max(record.start_time);
            if let Err(e) = record.finish(CallState::NotAnswered, EndReason::Busy, end_time) {
                tracing::warn!(call = %identity, error = %e, "Cannot record missed call");
                return;
            }
            self.call_log.append(record.clone());
            self.last_incoming_call = Some(record.clone());
            self.emit(CallEvent::CallEnded(record));
            if self.call_config.busy_reply {
                self.notify_peer_end(&identity).await;
            }
            return;
        }

        tracing::info!(call = %identity, "Incoming call");
        self.last_incoming_call = Some(record.clone());
        self.timers.arm(
            identity,
            TimeoutKind::Ring,
            self.call_config.ring_timeout(),
        );
        self.emit(CallEvent::IncomingCall(record));
    }

    async fn on_call_accept(&mut self, identity: CallIdentity) {
        let dialing = self.current_call.as_ref().is_some_and(|c| {
            c.is(&identity)
                && c.call_type == CallType::Outgoing
                && c.call_state == CallState::Initiated
        });
        if !dialing {
            tracing::debug!(call = %identity, "Ignoring CallAccept for a call we are not dialing");
            return;
        }

        self.timers.cancel(&identity);
        self.advance_call(&identity, CallState::Accepted);
        let started = self.start_engine(identity.clone(), Role::Caller);
        self.after_engine(&identity, started).await;
    }

    /// `CallEnd` means different things depending on where the call was.
    fn on_call_end(&mut self, identity: CallIdentity) {
        let current = self
            .current_call
            .as_ref()
            .filter(|c| c.is(&identity) && !c.is_terminal())
            .map(|c| c.call_state);

        match current {
            Some(CallState::Initiated) => {
                self.finish_call(&identity, CallState::Rejected, EndReason::RemoteRejected);
            }
            Some(_) => {
                self.finish_call(&identity, CallState::Completed, EndReason::RemoteHangup);
            }
            None if self.ringing_call().as_ref() == Some(&identity) => {
                self.finish_call(&identity, CallState::NotAnswered, EndReason::RemoteCancelled);
            }
            None => tracing::debug!(call = %identity, "Ignoring CallEnd for an inactive call"),
        }
    }

    async fn on_negotiation(&mut self, identity: CallIdentity, body: SignalBody) {
        let Some(engine) = self.engine_for(&identity) else {
            tracing::debug!(call = %identity, kind = body.kind(), "Dropping negotiation message for an inactive call");
            return;
        };

        let result = match body {
            SignalBody::IceOffer { sdp } => {
                engine
                    .apply_remote_description(SessionDescription::offer(sdp))
                    .await
            }
            SignalBody::IceAnswer { sdp } => {
                engine
                    .apply_remote_description(SessionDescription::answer(sdp))
                    .await
            }
            SignalBody::IceCandidate { candidate } => {
                engine.add_remote_ice_candidate(candidate).await
            }
            SignalBody::CallInit | SignalBody::CallAccept | SignalBody::CallEnd => Ok(()),
        };
        self.after_engine(&identity, result).await;
    }

    // --- timers and helper tasks ---

    async fn handle_timer(&mut self, fired: TimerFired) {
        if !self.timers.acknowledge(&fired) {
            tracing::debug!(call = %fired.identity, kind = %fired.kind, "Ignoring stale timer");
            return;
        }

        let identity = fired.identity;
        match fired.kind {
            TimeoutKind::Dial => {
                let dialing = self
                    .current_call
                    .as_ref()
                    .is_some_and(|c| c.is(&identity) && c.call_state == CallState::Initiated);
                if dialing {
                    tracing::info!(call = %identity, "No answer");
                    self.finish_call(&identity, CallState::NotAnswered, EndReason::Timeout);
                    self.notify_peer_end(&identity).await;
                }
            }
            TimeoutKind::Ring => {
                if self.ringing_call().as_ref() == Some(&identity) {
                    tracing::info!(call = %identity, "Missed call");
                    self.finish_call(&identity, CallState::NotAnswered, EndReason::Timeout);
                }
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::MediaSettled {
                identity,
                generation,
                media,
            } => {
                let AcquiredMedia { handle, error } = media;
                let Some(engine) = self.engine_for(&identity) else {
                    tracing::debug!(call = %identity, "Releasing media for a call that has ended");
                    self.rtc.media_source.release(handle);
                    return;
                };

                let result = engine.media_ready(generation, handle).await;
                if let Some(error) = error {
                    tracing::warn!(call = %identity, error = %error, "Continuing without some local media");
                    self.emit(CallEvent::MediaUnavailable {
                        identity: identity.clone(),
                        error,
                    });
                }
                self.after_engine(&identity, result).await;
            }
            Internal::Peer { identity, event } => {
                let Some(engine) = self.engine_for(&identity) else {
                    tracing::debug!(call = %identity, "Dropping peer event for a call that has ended");
                    return;
                };

                let outcome = engine.handle_peer_event(event).await;
                match outcome {
                    Ok(Some(EngineNotice::Connected)) => {
                        self.advance_call(&identity, CallState::Connected);
                    }
                    Ok(Some(EngineNotice::RemoteTrack(track))) => {
                        self.emit(CallEvent::RemoteTrack { identity, track });
                    }
                    Ok(Some(EngineNotice::SignalFailed(error))) => {
                        self.emit(CallEvent::SignalFailed { identity, error });
                    }
                    Ok(Some(EngineNotice::Disconnected)) | Ok(None) => {}
                    Err(e) => self.after_engine(&identity, Err(e)).await,
                }
            }
        }
    }
}
