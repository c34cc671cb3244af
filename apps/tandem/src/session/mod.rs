//! Binds a negotiation state machine to the relay, the media devices and a
//! peer connection, one call at a time.

pub mod call;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use relay_bus::{RelayChannel, RelayError};
use signal_proto::{
    ConnectivityCandidate, EncodeError, SessionDescription, SessionId, SignalingMessage,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::chat::ChatSink;
use crate::media::{
    DisplaySurface, LOCAL_SURFACE, MediaConstraints, MediaDevices, MediaError, MediaHandle,
    REMOTE_SURFACE, TrackInfo,
};
use crate::negotiation::{
    Action, Completion, EndReason, NegotiationConfig, NegotiationState,
    NegotiationStateMachine, ProtocolError, Role,
};
use crate::peer::{
    PeerConnection, PeerConnectionState, PeerConnector, PeerError, PeerEvent, PeerEventSink,
};

pub use call::CallSession;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        generation: u64,
        state: NegotiationState,
    },
    RemoteTrack(TrackInfo),
    PeerState(PeerConnectionState),
    MediaAcquisitionFailed(String),
    Ended {
        generation: u64,
        reason: EndReason,
    },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("media acquisition failed: {0}")]
    MediaAcquisitionFailed(#[from] MediaError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Channel(#[from] RelayError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("call start cancelled by hangup")]
    Cancelled,
    #[error("controller event loop already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Sender name stamped on outgoing chat
    pub display_name: String,
    pub negotiation: NegotiationConfig,
    pub constraints: MediaConstraints,
    /// Answer offers that arrive while no call is active
    pub auto_answer: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            display_name: "anonymous".to_string(),
            negotiation: NegotiationConfig::default(),
            constraints: MediaConstraints::default(),
            auto_answer: true,
        }
    }
}

/// The external collaborators a controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub relay: Arc<dyn RelayChannel>,
    pub connector: Arc<dyn PeerConnector>,
    pub media: Arc<dyn MediaDevices>,
    pub display: Arc<dyn DisplaySurface>,
    pub chat: Arc<dyn ChatSink>,
}

/// A closed session whose resources still have to be released.
struct Retired {
    generation: u64,
    reason: EndReason,
    connection: Arc<dyn PeerConnection>,
    media: Option<MediaHandle>,
}

type LoopInputs = (
    mpsc::UnboundedReceiver<Completion>,
    mpsc::UnboundedReceiver<(u64, PeerEvent)>,
);

pub struct SessionController {
    config: ControllerConfig,
    parts: Collaborators,
    session: Mutex<Option<CallSession>>,
    live_generation: Arc<AtomicU64>,
    next_generation: AtomicU64,
    start_epoch: AtomicU64,
    events: broadcast::Sender<CallEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    peer_events_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    loop_inputs: Mutex<Option<LoopInputs>>,
}

impl SessionController {
    pub fn new(config: ControllerConfig, parts: Collaborators) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            parts,
            session: Mutex::new(None),
            live_generation: Arc::new(AtomicU64::new(0)),
            next_generation: AtomicU64::new(0),
            start_epoch: AtomicU64::new(0),
            events,
            completions_tx,
            peer_events_tx,
            loop_inputs: Mutex::new(Some((completions_rx, peer_events_rx))),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// State of the active call, if any.
    pub fn state(&self) -> Option<NegotiationState> {
        self.session.lock().as_ref().map(CallSession::state)
    }

    pub fn role(&self) -> Option<Role> {
        self.session.lock().as_ref().map(CallSession::role)
    }

    /// Starts the event loop: relay traffic, peer events and completions are
    /// handled one at a time until the relay's inbound stream ends.
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>, ControllerError> {
        let (mut completions, mut peer_events) = self
            .loop_inputs
            .lock()
            .take()
            .ok_or(ControllerError::AlreadyRunning)?;
        let mut inbound = self.parts.relay.inbound()?;
        let controller = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = inbound.recv() => match received {
                        Some(bytes) => controller.on_relay_bytes(&bytes).await,
                        None => {
                            controller.on_channel_lost("relay stream ended").await;
                            break;
                        }
                    },
                    Some(completion) = completions.recv() => {
                        controller.on_completion(completion).await;
                    }
                    Some((generation, event)) = peer_events.recv() => {
                        controller.on_peer_event(generation, event).await;
                    }
                }
            }
            tracing::debug!(target: "tandem::session", "controller loop stopped");
        }))
    }

    pub async fn start_call(&self) -> Result<(), ControllerError> {
        if let Some(state) = self.state() {
            return Err(ProtocolError::AlreadyInProgress(state).into());
        }
        let epoch = self.start_epoch.load(Ordering::SeqCst);
        let media = self.acquire_media().await?;
        let session = self.open_session(media).await?;
        if self.start_epoch.load(Ordering::SeqCst) != epoch {
            tracing::info!(target: "tandem::session", "call start cancelled by hangup");
            self.discard(session).await;
            return Err(ControllerError::Cancelled);
        }
        if let Err((session, state)) = self.install(session) {
            self.discard(session).await;
            return Err(ProtocolError::AlreadyInProgress(state).into());
        }
        tracing::info!(target: "tandem::session", "starting call");
        match self.step(NegotiationStateMachine::initiate) {
            Some((result, retired)) => {
                self.settle(retired).await;
                result.map_err(ControllerError::from)
            }
            None => Err(ProtocolError::SessionClosed.into()),
        }
    }

    /// Hangs up. Safe to call at any point, including before or during
    /// `start_call`.
    pub async fn end_call(&self) {
        self.start_epoch.fetch_add(1, Ordering::SeqCst);
        match self.step(|machine| machine.close(EndReason::Hangup)) {
            Some((_, retired)) => self.settle(retired).await,
            None => tracing::debug!(target: "tandem::session", "hangup with no active call"),
        }
    }

    pub async fn on_signaling_message(&self, message: SignalingMessage) {
        match message {
            SignalingMessage::ChatMessage { sender, body } => {
                self.parts.chat.deliver(&sender, &body);
            }
            SignalingMessage::ChatHistory { messages } => {
                for entry in &messages {
                    self.parts.chat.deliver(&entry.sender, &entry.message);
                }
            }
            SignalingMessage::Offer {
                description,
                session_id,
            } => self.on_remote_offer(description, session_id).await,
            SignalingMessage::Answer { description } => {
                self.route("answer", |machine| machine.on_answer_received(description))
                    .await;
            }
            SignalingMessage::IceCandidate { candidate } => {
                self.route("ice_candidate", |machine| {
                    machine.on_candidate_received(candidate)
                })
                .await;
            }
        }
    }

    /// Forwards a message produced by the state machine to the relay as is.
    pub fn on_outgoing_signal(&self, message: &SignalingMessage) -> Result<(), ControllerError> {
        let bytes = signal_proto::encode(message)?;
        tracing::trace!(
            target: "tandem::session",
            kind = message.kind(),
            len = bytes.len(),
            "signal out"
        );
        self.parts.relay.send(bytes)?;
        Ok(())
    }

    pub fn send_chat(&self, body: &str) -> Result<(), ControllerError> {
        self.on_outgoing_signal(&SignalingMessage::ChatMessage {
            sender: self.config.display_name.clone(),
            body: body.to_string(),
        })
    }

    async fn on_relay_bytes(&self, bytes: &[u8]) {
        match signal_proto::decode(bytes) {
            Ok(message) => self.on_signaling_message(message).await,
            Err(err) => tracing::warn!(
                target: "tandem::session",
                error = %err,
                len = bytes.len(),
                "dropping undecodable relay message"
            ),
        }
    }

    async fn on_remote_offer(
        &self,
        description: SessionDescription,
        remote_id: Option<SessionId>,
    ) {
        if self.state().is_none() {
            if !self.config.auto_answer {
                tracing::info!(
                    target: "tandem::session",
                    "incoming offer ignored; auto-answer disabled"
                );
                return;
            }
            let Ok(media) = self.acquire_media().await else {
                return;
            };
            let session = match self.open_session(media).await {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(
                        target: "tandem::session",
                        error = %err,
                        "could not open session for incoming offer"
                    );
                    return;
                }
            };
            if let Err((session, _)) = self.install(session) {
                // a call appeared meanwhile; the offer goes to it instead
                self.discard(session).await;
            } else {
                tracing::info!(target: "tandem::session", "answering incoming call");
            }
        }
        self.route("offer", |machine| {
            machine.on_offer_received(description, remote_id)
        })
        .await;
    }

    async fn on_completion(&self, completion: Completion) {
        if let Some((_, retired)) = self.step(|machine| machine.on_completion(completion)) {
            self.settle(retired).await;
        }
    }

    async fn on_peer_event(&self, generation: u64, event: PeerEvent) {
        if generation != self.live_generation.load(Ordering::SeqCst) {
            tracing::trace!(
                target: "tandem::session",
                generation,
                "ignoring event from retired connection"
            );
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate).await,
            PeerEvent::RemoteTrack(track) => {
                self.parts.display.attach(REMOTE_SURFACE, &track);
                let _ = self.events.send(CallEvent::RemoteTrack(track));
            }
            PeerEvent::ConnectionState(state) => {
                let _ = self.events.send(CallEvent::PeerState(state));
                if state == PeerConnectionState::Failed {
                    if let Some((_, retired)) = self.step(|machine| {
                        machine.close(EndReason::NegotiationFailed(
                            "peer connection failed".into(),
                        ))
                    }) {
                        self.settle(retired).await;
                    }
                }
            }
        }
    }

    async fn on_local_candidate(&self, candidate: ConnectivityCandidate) {
        if let Some((_, retired)) = self.step(|machine| machine.on_local_candidate(candidate)) {
            self.settle(retired).await;
        }
    }

    async fn on_channel_lost(&self, detail: &str) {
        tracing::warn!(target: "tandem::session", detail, "relay channel lost");
        if let Some((_, retired)) =
            self.step(|machine| machine.close(EndReason::ChannelError(detail.to_string())))
        {
            self.settle(retired).await;
        }
    }

    async fn route<F>(&self, kind: &'static str, apply: F)
    where
        F: FnOnce(&mut NegotiationStateMachine) -> Result<(), ProtocolError>,
    {
        match self.step(apply) {
            None => tracing::debug!(
                target: "tandem::session",
                kind,
                "no active call; dropping signal"
            ),
            Some((result, retired)) => {
                if let Err(err) = result {
                    tracing::warn!(
                        target: "tandem::session",
                        kind,
                        error = %err,
                        "dropping signal"
                    );
                }
                self.settle(retired).await;
            }
        }
    }

    async fn acquire_media(&self) -> Result<MediaHandle, ControllerError> {
        match self
            .parts
            .media
            .acquire_local_media(&self.config.constraints)
            .await
        {
            Ok(media) => Ok(media),
            Err(err) => {
                tracing::warn!(target: "tandem::session", error = %err, "media acquisition failed");
                let _ = self
                    .events
                    .send(CallEvent::MediaAcquisitionFailed(err.to_string()));
                Err(err.into())
            }
        }
    }

    /// Builds a session around freshly acquired media. On failure the media
    /// is released before returning.
    async fn open_session(&self, media: MediaHandle) -> Result<CallSession, ControllerError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = PeerEventSink::new(generation, self.peer_events_tx.clone());
        let connection = match self.parts.connector.connect(sink).await {
            Ok(connection) => connection,
            Err(err) => {
                self.parts.media.release_media(media).await;
                return Err(err.into());
            }
        };
        if let Err(err) = add_tracks(connection.as_ref(), &media).await {
            close_connection(connection.as_ref(), generation).await;
            self.parts.media.release_media(media).await;
            return Err(err.into());
        }
        let machine = NegotiationStateMachine::new(
            SessionId::random(),
            generation,
            &self.config.negotiation,
        );
        Ok(CallSession::new(
            machine,
            connection,
            Some(media),
            Arc::clone(&self.live_generation),
            self.completions_tx.clone(),
        ))
    }

    fn install(&self, session: CallSession) -> Result<(), (CallSession, NegotiationState)> {
        let mut slot = self.session.lock();
        if let Some(existing) = slot.as_ref() {
            return Err((session, existing.state()));
        }
        self.live_generation
            .store(session.generation(), Ordering::SeqCst);
        if let Some(media) = session.media() {
            for track in &media.tracks {
                self.parts.display.attach(LOCAL_SURFACE, &track.info);
            }
        }
        *slot = Some(session);
        Ok(())
    }

    // Runs one machine step under the lock and executes the actions it queued.
    fn step<R>(
        &self,
        apply: impl FnOnce(&mut NegotiationStateMachine) -> R,
    ) -> Option<(R, Option<Retired>)> {
        let mut slot = self.session.lock();
        let session = slot.as_mut()?;
        let result = apply(&mut session.machine);
        let retired = self.dispatch(&mut slot);
        Some((result, retired))
    }

    fn dispatch(&self, slot: &mut Option<CallSession>) -> Option<Retired> {
        let mut released = None;
        while let Some(session) = slot.as_mut() {
            let actions = session.machine.drain_actions();
            if actions.is_empty() {
                break;
            }
            let generation = session.generation();
            let mut closing = false;
            for action in actions {
                match action {
                    Action::Peer { generation, op } if !closing => session.submit(generation, op),
                    Action::Send(message) if !closing => {
                        if let Err(err) = self.on_outgoing_signal(&message) {
                            tracing::warn!(
                                target: "tandem::session",
                                error = %err,
                                kind = message.kind(),
                                "relay send failed"
                            );
                            closing = true;
                            session
                                .machine
                                .close(EndReason::ChannelError(err.to_string()));
                        }
                    }
                    Action::Peer { .. } | Action::Send(_) => {}
                    Action::StateChanged(state) => {
                        let _ = self
                            .events
                            .send(CallEvent::StateChanged { generation, state });
                    }
                    Action::Release(reason) => {
                        closing = true;
                        released = Some(reason);
                    }
                }
            }
        }

        let reason = released?;
        let session = slot.take()?;
        self.live_generation.store(0, Ordering::SeqCst);
        let generation = session.generation();
        let (connection, media) = session.into_resources();
        Some(Retired {
            generation,
            reason,
            connection,
            media,
        })
    }

    async fn settle(&self, retired: Option<Retired>) {
        if let Some(retired) = retired {
            self.finish(retired).await;
        }
    }

    async fn finish(&self, retired: Retired) {
        close_connection(retired.connection.as_ref(), retired.generation).await;
        self.parts.display.detach(LOCAL_SURFACE);
        self.parts.display.detach(REMOTE_SURFACE);
        if let Some(media) = retired.media {
            self.parts.media.release_media(media).await;
        }
        tracing::info!(
            target: "tandem::session",
            generation = retired.generation,
            reason = %retired.reason,
            "call ended"
        );
        let _ = self.events.send(CallEvent::Ended {
            generation: retired.generation,
            reason: retired.reason,
        });
    }

    // Releases a session that was never installed.
    async fn discard(&self, session: CallSession) {
        let generation = session.generation();
        let (connection, media) = session.into_resources();
        close_connection(connection.as_ref(), generation).await;
        if let Some(media) = media {
            self.parts.media.release_media(media).await;
        }
    }
}

async fn add_tracks(connection: &dyn PeerConnection, media: &MediaHandle) -> Result<(), PeerError> {
    for track in &media.tracks {
        connection.add_local_track(track).await?;
    }
    Ok(())
}

async fn close_connection(connection: &dyn PeerConnection, generation: u64) {
    if let Err(err) = connection.close().await {
        tracing::warn!(
            target: "tandem::session",
            generation,
            error = %err,
            "peer connection close failed"
        );
    }
}
