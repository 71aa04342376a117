//! In-process peer connection and capture device.
//!
//! `SoftPeerConnection` follows the browser's signaling-state rules exactly
//! (including rollback) but moves no media: its SDP lists the local tracks,
//! it "gathers" a single host candidate when the first local description is
//! set, and it reports `connected` once both descriptions are applied and a
//! remote candidate has arrived. If the remote side signals end-of-candidates
//! without having sent any, the connection fails.
//!
//! Faults can be injected per operation through [`SoftFaults`].

use crate::media::{MediaConstraints, MediaHandle, MediaKind, MediaSource, MediaTrack};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcError};
use crate::sdp::{SdpType, SessionDescription, SignalingState};
use async_trait::async_trait;
use peercall_common::config::RtcConfig;
use peercall_common::MediaAcquisitionError;
use peercall_signaling::IceCandidateInit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Switches that make the next matching operation fail.
#[derive(Debug, Default)]
pub struct SoftFaults {
    pub create_offer: AtomicBool,
    pub create_answer: AtomicBool,
    pub set_local_description: AtomicBool,
    pub set_remote_description: AtomicBool,
    /// Never report `connected`; report `failed` at end-of-candidates instead.
    pub ice: AtomicBool,
}

impl SoftFaults {
    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::AcqRel)
    }
}

pub struct SoftPeerConnection {
    session_id: u64,
    sdp_version: u64,
    signaling_state: SignalingState,
    connection_state: PeerConnectionState,
    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    local_tracks: Vec<MediaTrack>,
    remote_tracks: Vec<MediaTrack>,
    remote_candidates: Vec<IceCandidateInit>,
    remote_end_of_candidates: bool,
    gathered: bool,
    faults: Arc<SoftFaults>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl SoftPeerConnection {
    pub fn new(faults: Arc<SoftFaults>) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let pc = Self {
            session_id: Uuid::new_v4().as_u64_pair().0 >> 1,
            sdp_version: 0,
            signaling_state: SignalingState::Stable,
            connection_state: PeerConnectionState::New,
            current_local: None,
            pending_local: None,
            remote: None,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            remote_candidates: Vec::new(),
            remote_end_of_candidates: false,
            gathered: false,
            faults,
            events,
        };
        (pc, rx)
    }

    fn ensure_open(&self) -> Result<(), RtcError> {
        if self.signaling_state == SignalingState::Closed {
            return Err(RtcError::Closed);
        }
        Ok(())
    }

    fn invalid(&self, operation: &'static str) -> RtcError {
        RtcError::InvalidState {
            operation,
            state: self.signaling_state,
        }
    }

    fn render_sdp(&mut self) -> String {
        self.sdp_version += 1;
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id, self.sdp_version
        );
        for (mid, track) in self.local_tracks.iter().enumerate() {
            let (kind, payload) = match track.kind {
                MediaKind::Audio => ("audio", 111),
                MediaKind::Video => ("video", 96),
            };
            sdp.push_str(&format!(
                "m={kind} 9 UDP/TLS/RTP/SAVPF {payload}\r\na=mid:{mid}\r\na=msid:- {}\r\na=sendrecv\r\n",
                track.id
            ));
        }
        sdp
    }

    fn parse_tracks(sdp: &str) -> Result<Vec<MediaTrack>, RtcError> {
        if !sdp.starts_with("v=0") {
            return Err(RtcError::Sdp("missing version line".into()));
        }

        let mut tracks = Vec::new();
        let mut kind = None;
        for line in sdp.lines() {
            if let Some(media) = line.strip_prefix("m=") {
                kind = match media.split(' ').next() {
                    Some("audio") => Some(MediaKind::Audio),
                    Some("video") => Some(MediaKind::Video),
                    other => {
                        return Err(RtcError::Sdp(format!("unsupported media {other:?}")));
                    }
                };
            } else if let Some(msid) = line.strip_prefix("a=msid:") {
                let id = msid
                    .split(' ')
                    .nth(1)
                    .ok_or_else(|| RtcError::Sdp(format!("bad msid line {line:?}")))?;
                let kind = kind.ok_or_else(|| RtcError::Sdp("msid before m-line".into()))?;
                tracks.push(MediaTrack {
                    id: id.to_owned(),
                    kind,
                });
            }
        }
        Ok(tracks)
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn set_connection_state(&mut self, state: PeerConnectionState) {
        if self.connection_state != state {
            self.connection_state = state;
            self.emit(PeerEvent::ConnectionState(state));
        }
    }

    fn gather(&mut self) {
        if self.gathered {
            return;
        }
        self.gathered = true;
        let port = 50_000 + (self.session_id % 10_000);
        self.emit(PeerEvent::LocalCandidate(Some(IceCandidateInit {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {port} typ host",
                self.session_id % 1_000_000
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        })));
        self.emit(PeerEvent::LocalCandidate(None));
        self.set_connection_state(PeerConnectionState::Connecting);
    }

    fn update_remote_tracks(&mut self, tracks: Vec<MediaTrack>) {
        for track in &tracks {
            if !self.remote_tracks.contains(track) {
                self.emit(PeerEvent::RemoteTrack(track.clone()));
            }
        }
        self.remote_tracks = tracks;
    }

    fn check_connectivity(&mut self) {
        if matches!(
            self.connection_state,
            PeerConnectionState::Connected | PeerConnectionState::Failed | PeerConnectionState::Closed
        ) {
            return;
        }
        let described = self.current_local.is_some() && self.remote.is_some();
        if self.faults.ice.load(Ordering::Acquire) {
            if self.remote_end_of_candidates {
                self.set_connection_state(PeerConnectionState::Failed);
            }
            return;
        }
        if described && !self.remote_candidates.is_empty() {
            self.set_connection_state(PeerConnectionState::Connected);
        } else if self.remote_end_of_candidates && self.remote_candidates.is_empty() {
            self.set_connection_state(PeerConnectionState::Failed);
        }
    }
}

#[async_trait]
impl PeerConnection for SoftPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.connection_state
    }

    fn has_remote_description(&self) -> bool {
        self.remote.is_some()
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        if !matches!(
            self.signaling_state,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            return Err(self.invalid("create_offer"));
        }
        if SoftFaults::take(&self.faults.create_offer) {
            return Err(RtcError::Failed("create_offer failed".into()));
        }
        Ok(SessionDescription::offer(self.render_sdp()))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, RtcError> {
        self.ensure_open()?;
        if self.signaling_state != SignalingState::HaveRemoteOffer {
            return Err(self.invalid("create_answer"));
        }
        if SoftFaults::take(&self.faults.create_answer) {
            return Err(RtcError::Failed("create_answer failed".into()));
        }
        Ok(SessionDescription::answer(self.render_sdp()))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), RtcError> {
        self.ensure_open()?;
        if SoftFaults::take(&self.faults.set_local_description) {
            return Err(RtcError::Failed("set_local_description failed".into()));
        }
        match desc.sdp_type {
            SdpType::Offer => {
                if !matches!(
                    self.signaling_state,
                    SignalingState::Stable | SignalingState::HaveLocalOffer
                ) {
                    return Err(self.invalid("set_local_description(offer)"));
                }
                self.pending_local = Some(desc);
                self.signaling_state = SignalingState::HaveLocalOffer;
            }
            SdpType::Answer => {
                if self.signaling_state != SignalingState::HaveRemoteOffer {
                    return Err(self.invalid("set_local_description(answer)"));
                }
                self.current_local = Some(desc);
                self.signaling_state = SignalingState::Stable;
            }
            SdpType::Rollback => {
                if self.signaling_state != SignalingState::HaveLocalOffer {
                    return Err(self.invalid("set_local_description(rollback)"));
                }
                self.pending_local = None;
                self.signaling_state = SignalingState::Stable;
                return Ok(());
            }
        }
        self.gather();
        self.check_connectivity();
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), RtcError> {
        self.ensure_open()?;
        if SoftFaults::take(&self.faults.set_remote_description) {
            return Err(RtcError::Failed("set_remote_description failed".into()));
        }
        match desc.sdp_type {
            SdpType::Offer => {
                if !matches!(
                    self.signaling_state,
                    SignalingState::Stable | SignalingState::HaveRemoteOffer
                ) {
                    return Err(self.invalid("set_remote_description(offer)"));
                }
                let tracks = Self::parse_tracks(&desc.sdp)?;
                self.remote = Some(desc);
                self.signaling_state = SignalingState::HaveRemoteOffer;
                self.update_remote_tracks(tracks);
            }
            SdpType::Answer => {
                if self.signaling_state != SignalingState::HaveLocalOffer {
                    return Err(self.invalid("set_remote_description(answer)"));
                }
                let tracks = Self::parse_tracks(&desc.sdp)?;
                self.remote = Some(desc);
                self.current_local = self.pending_local.take();
                self.signaling_state = SignalingState::Stable;
                self.update_remote_tracks(tracks);
            }
            SdpType::Rollback => return Err(self.invalid("set_remote_description(rollback)")),
        }
        self.check_connectivity();
        Ok(())
    }

    async fn add_ice_candidate(
        &mut self,
        candidate: Option<IceCandidateInit>,
    ) -> Result<(), RtcError> {
        self.ensure_open()?;
        if self.remote.is_none() {
            return Err(self.invalid("add_ice_candidate"));
        }
        match candidate {
            Some(c) => {
                if !c.candidate.starts_with("candidate:") {
                    return Err(RtcError::Candidate(c.candidate));
                }
                self.remote_candidates.push(c);
            }
            None => self.remote_end_of_candidates = true,
        }
        self.check_connectivity();
        Ok(())
    }

    fn add_track(&mut self, track: MediaTrack) -> Result<(), RtcError> {
        self.ensure_open()?;
        if self.local_tracks.iter().any(|t| t.id == track.id) {
            return Err(RtcError::Failed(format!("track {} already added", track.id)));
        }
        self.local_tracks.push(track);
        Ok(())
    }

    fn remove_track(&mut self, track_id: &str) -> Result<(), RtcError> {
        self.ensure_open()?;
        self.local_tracks.retain(|t| t.id != track_id);
        Ok(())
    }

    fn local_tracks(&self) -> Vec<MediaTrack> {
        self.local_tracks.clone()
    }

    fn remote_tracks(&self) -> Vec<MediaTrack> {
        self.remote_tracks.clone()
    }

    fn close(&mut self) {
        if self.signaling_state == SignalingState::Closed {
            return;
        }
        self.signaling_state = SignalingState::Closed;
        self.set_connection_state(PeerConnectionState::Closed);
    }
}

/// Hands out [`SoftPeerConnection`]s sharing one set of [`SoftFaults`].
#[derive(Clone, Default)]
pub struct SoftPeerFactory {
    faults: Arc<SoftFaults>,
    created: Arc<AtomicUsize>,
}

impl SoftPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Arc<SoftFaults> {
        &self.faults
    }

    /// How many peer connections have been created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl PeerConnectionFactory for SoftPeerFactory {
    fn create(
        &self,
        config: &RtcConfig,
    ) -> Result<(Box<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), RtcError> {
        tracing::debug!(
            ice_servers = config.ice_servers.len(),
            bundle_policy = ?config.bundle_policy,
            rtcp_mux_policy = ?config.rtcp_mux_policy,
            "Creating soft peer connection"
        );
        self.created.fetch_add(1, Ordering::Relaxed);
        let (pc, events) = SoftPeerConnection::new(self.faults.clone());
        Ok((Box::new(pc), events))
    }
}

/// A capture device that always has a microphone and a camera, unless told
/// to refuse one of them.
#[derive(Clone, Default)]
pub struct SyntheticMediaSource {
    inner: Arc<SyntheticInner>,
}

#[derive(Default)]
struct SyntheticInner {
    deny_audio: AtomicBool,
    deny_video: AtomicBool,
    delay_ms: AtomicU64,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl SyntheticMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse requests that include `kind`.
    pub fn deny(&self, kind: MediaKind, denied: bool) {
        let flag = match kind {
            MediaKind::Audio => &self.inner.deny_audio,
            MediaKind::Video => &self.inner.deny_video,
        };
        flag.store(denied, Ordering::Relaxed);
    }

    /// Simulate a slow permission prompt.
    pub fn set_delay(&self, delay: Duration) {
        self.inner
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::Relaxed)
    }

    /// Handles acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaHandle, MediaAcquisitionError> {
        let delay = self.inner.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if constraints.audio && self.inner.deny_audio.load(Ordering::Relaxed) {
            return Err(MediaAcquisitionError::PermissionDenied {
                device: "microphone".into(),
            });
        }
        if constraints.video && self.inner.deny_video.load(Ordering::Relaxed) {
            return Err(MediaAcquisitionError::PermissionDenied {
                device: "camera".into(),
            });
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack {
                id: format!("audio-{}", Uuid::new_v4().simple()),
                kind: MediaKind::Audio,
            });
        }
        if constraints.video {
            tracks.push(MediaTrack {
                id: format!("video-{}", Uuid::new_v4().simple()),
                kind: MediaKind::Video,
            });
        }

        self.inner.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(MediaHandle {
            id: Uuid::new_v4(),
            tracks,
        })
    }

    fn release(&self, handle: MediaHandle) {
        if handle.id.is_nil() {
            return;
        }
        self.inner.released.fetch_add(1, Ordering::Relaxed);
    }
}
