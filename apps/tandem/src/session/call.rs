use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::media::MediaHandle;
use crate::negotiation::{Completion, NegotiationState, NegotiationStateMachine, PeerOp, Role};
use crate::peer::{self, PeerConnection};

/// One call: the negotiation state plus the resources it exclusively owns.
pub struct CallSession {
    pub(crate) machine: NegotiationStateMachine,
    connection: Arc<dyn PeerConnection>,
    media: Option<MediaHandle>,
    ops_tx: mpsc::UnboundedSender<(u64, PeerOp)>,
    worker: JoinHandle<()>,
}

impl CallSession {
    pub(crate) fn new(
        machine: NegotiationStateMachine,
        connection: Arc<dyn PeerConnection>,
        media: Option<MediaHandle>,
        live_generation: Arc<AtomicU64>,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let worker = spawn_worker(connection.clone(), ops_rx, live_generation, completions);
        Self {
            machine,
            connection,
            media,
            ops_tx,
            worker,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.machine.state()
    }

    pub fn role(&self) -> Role {
        self.machine.role()
    }

    pub fn generation(&self) -> u64 {
        self.machine.generation()
    }

    pub fn media(&self) -> Option<&MediaHandle> {
        self.media.as_ref()
    }

    pub(crate) fn submit(&self, generation: u64, op: PeerOp) {
        if self.ops_tx.send((generation, op)).is_err() {
            tracing::warn!(
                target: "tandem::session",
                generation,
                "peer worker gone; operation dropped"
            );
        }
    }

    /// Splits the session into the resources that still need releasing.
    pub(crate) fn into_resources(self) -> (Arc<dyn PeerConnection>, Option<MediaHandle>) {
        // Queued operations are skipped once the generation is retired; the
        // worker exits when `ops_tx` drops here.
        drop(self.ops_tx);
        drop(self.worker);
        (self.connection, self.media)
    }
}

// Executes peer operations one at a time, in submission order, so buffered
// candidates reach the connection in arrival order.
fn spawn_worker(
    connection: Arc<dyn PeerConnection>,
    mut ops_rx: mpsc::UnboundedReceiver<(u64, PeerOp)>,
    live_generation: Arc<AtomicU64>,
    completions: mpsc::UnboundedSender<Completion>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((generation, op)) = ops_rx.recv().await {
            if live_generation.load(Ordering::SeqCst) != generation {
                tracing::debug!(
                    target: "tandem::session",
                    generation,
                    step = %op.step(),
                    "skipping operation for retired session"
                );
                continue;
            }
            let completion = peer::execute(connection.as_ref(), generation, op).await;
            if completions.send(completion).is_err() {
                break;
            }
        }
    })
}
