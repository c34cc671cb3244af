//! The peer-connection capability the controller drives, and the glue that
//! turns a [`PeerOp`] into a [`Completion`].

pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use signal_proto::{ConnectivityCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalTrack, TrackInfo};
use crate::negotiation::{Completion, Outcome, PeerOp};

pub use self::webrtc::WebRtcConnector;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("peer connection rejected request: {0}")]
    Rejected(String),
    #[error("unsupported local track: {0}")]
    UnsupportedTrack(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(ConnectivityCandidate),
    RemoteTrack(TrackInfo),
    ConnectionState(PeerConnectionState),
}

/// Where a connection reports its events. Every event is stamped with the
/// generation of the session that owns the connection.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: PeerEvent) {
        if self.tx.send((self.generation, event)).is_err() {
            tracing::trace!(
                target: "tandem::peer",
                generation = self.generation,
                "peer event dropped; controller gone"
            );
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), PeerError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError>;
    /// Discards a local offer that was applied but never answered.
    async fn rollback_local_description(&self) -> Result<(), PeerError>;
    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError>;
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Builds one connection per call session.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// Runs `op` against `connection` and reports the result for `generation`.
pub async fn execute(connection: &dyn PeerConnection, generation: u64, op: PeerOp) -> Completion {
    let step = op.step();
    let result = match op {
        PeerOp::CreateOffer => connection.create_offer().await.map(Outcome::OfferCreated),
        PeerOp::CreateAnswer => connection.create_answer().await.map(Outcome::AnswerCreated),
        PeerOp::SetLocalDescription(description) => connection
            .set_local_description(description)
            .await
            .map(|_| Outcome::LocalDescriptionApplied),
        PeerOp::SetRemoteDescription(description) => connection
            .set_remote_description(description)
            .await
            .map(|_| Outcome::RemoteDescriptionApplied),
        PeerOp::RollbackLocalDescription => connection
            .rollback_local_description()
            .await
            .map(|_| Outcome::RolledBack),
        PeerOp::AddCandidate(candidate) => connection
            .add_candidate(candidate)
            .await
            .map(|_| Outcome::CandidateApplied),
    };
    Completion {
        generation,
        step,
        result: result.map_err(|err| err.to_string()),
    }
}
