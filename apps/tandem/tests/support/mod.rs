#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_bus::LocalRelay;
use signal_proto::{ConnectivityCandidate, SessionDescription};
use tandem_core::chat::ChatLog;
use tandem_core::media::{
    DisplaySurface, LocalTrack, MediaConstraints, MediaDevices, MediaError, MediaHandle,
    TrackInfo, TrackKind,
};
use tandem_core::peer::{
    PeerConnection, PeerConnector, PeerError, PeerEvent, PeerEventSink,
};
use tandem_core::session::{CallEvent, Collaborators, ControllerConfig, SessionController};
use tokio::sync::{Semaphore, broadcast};
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn until(what: &str, mut check: impl FnMut() -> bool) {
    let reached = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

pub fn local_candidate(n: u32) -> ConnectivityCandidate {
    ConnectivityCandidate::from_line(format!("candidate:{n} 1 udp 2122 10.0.0.{n} 5000 typ host"))
}

/// Every peer call made by one party, in order.
#[derive(Debug, Default)]
pub struct PeerLog(Mutex<Vec<String>>);

impl PeerLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| e.as_str() == entry).count()
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub log: Arc<PeerLog>,
    /// When set, `create_offer` waits for a permit.
    pub offer_gate: Option<Arc<Semaphore>>,
    pub fail_remote: bool,
    /// Candidate reported after each `set_local_description`.
    pub gathered: Option<ConnectivityCandidate>,
    pub connects: AtomicUsize,
    pub sinks: Mutex<Vec<PeerEventSink>>,
}

impl FakeConnector {
    /// Event sink handed to the `index`th connection.
    pub fn sink(&self, index: usize) -> PeerEventSink {
        self.sinks.lock()[index].clone()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().push(events.clone());
        Ok(Arc::new(FakePeer {
            events,
            log: self.log.clone(),
            offer_gate: self.offer_gate.clone(),
            fail_remote: self.fail_remote,
            gathered: self.gathered.clone(),
        }))
    }
}

struct FakePeer {
    events: PeerEventSink,
    log: Arc<PeerLog>,
    offer_gate: Option<Arc<Semaphore>>,
    fail_remote: bool,
    gathered: Option<ConnectivityCandidate>,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        if let Some(gate) = &self.offer_gate {
            gate.acquire()
                .await
                .map_err(|err| PeerError::Rejected(err.to_string()))?
                .forget();
        }
        self.log.push("create_offer");
        Ok(SessionDescription::new("offer", "v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.log.push("create_answer");
        Ok(SessionDescription::new("answer", "v=0 fake-answer"))
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.log.push("set_local");
        if let Some(candidate) = &self.gathered {
            self.events.emit(PeerEvent::LocalCandidate(candidate.clone()));
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.log.push("set_remote");
        if self.fail_remote {
            return Err(PeerError::Rejected("malformed sdp".into()));
        }
        Ok(())
    }

    async fn rollback_local_description(&self) -> Result<(), PeerError> {
        self.log.push("rollback");
        Ok(())
    }

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError> {
        self.log
            .push(format!("add_candidate {}", candidate.line().unwrap_or("?")));
        Ok(())
    }

    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.log.push(format!("add_track {}", track.info.id));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.log.push("close");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeMedia {
    pub fail: bool,
    /// When set, acquisition waits for a permit.
    pub gate: Option<Arc<Semaphore>>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl FakeMedia {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn acquire_local_media(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|err| MediaError::DeviceUnavailable(err.to_string()))?
                .forget();
        }
        if self.fail {
            return Err(MediaError::PermissionDenied("camera blocked".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let info = TrackInfo {
            id: "mic".into(),
            stream_id: "local-stream".into(),
            kind: TrackKind::Audio,
        };
        Ok(MediaHandle {
            stream_id: "local-stream".into(),
            tracks: vec![LocalTrack::new(info, Arc::new(()))],
        })
    }

    async fn release_media(&self, _handle: MediaHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct RecordingDisplay(Mutex<Vec<String>>);

impl RecordingDisplay {
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

impl DisplaySurface for RecordingDisplay {
    fn attach(&self, surface: &str, track: &TrackInfo) {
        self.0.lock().push(format!("attach {surface} {}", track.id));
    }

    fn detach(&self, surface: &str) {
        self.0.lock().push(format!("detach {surface}"));
    }
}

/// One call participant wired to fakes.
pub struct Party {
    pub controller: Arc<SessionController>,
    pub relay: Arc<LocalRelay>,
    pub connector: Arc<FakeConnector>,
    pub media: Arc<FakeMedia>,
    pub display: Arc<RecordingDisplay>,
    pub chat: Arc<ChatLog>,
}

impl Party {
    pub fn new(name: &str, relay: LocalRelay, connector: FakeConnector, media: FakeMedia) -> Self {
        Self::with_config(name, relay, connector, media, |_| {})
    }

    pub fn with_config(
        name: &str,
        relay: LocalRelay,
        connector: FakeConnector,
        media: FakeMedia,
        tweak: impl FnOnce(&mut ControllerConfig),
    ) -> Self {
        let mut config = ControllerConfig {
            display_name: name.to_string(),
            ..ControllerConfig::default()
        };
        tweak(&mut config);
        let relay = Arc::new(relay);
        let connector = Arc::new(connector);
        let media = Arc::new(media);
        let display = Arc::new(RecordingDisplay::default());
        let chat = Arc::new(ChatLog::new());
        let controller = SessionController::new(
            config,
            Collaborators {
                relay: relay.clone(),
                connector: connector.clone(),
                media: media.clone(),
                display: display.clone(),
                chat: chat.clone(),
            },
        );
        Self {
            controller,
            relay,
            connector,
            media,
            display,
            chat,
        }
    }

    /// Starts the controller's event loop.
    pub fn started(self) -> Self {
        self.controller.spawn().expect("event loop");
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.connector.log.entries()
    }
}

pub fn drain_events(
    events: &mut broadcast::Receiver<CallEvent>,
) -> Vec<CallEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Two started parties joined by an in-memory relay.
pub fn linked(a: FakeConnector, b: FakeConnector) -> (Party, Party) {
    let (relay_a, relay_b) = LocalRelay::pair();
    (
        Party::new("alice", relay_a, a, FakeMedia::default()).started(),
        Party::new("bob", relay_b, b, FakeMedia::default()).started(),
    )
}
