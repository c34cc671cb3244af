use std::collections::VecDeque;

use signal_proto::ConnectivityCandidate;

/// Remote candidates that arrived before a remote description was applied.
///
/// FIFO, no dedup: the connectivity layer tolerates redundant candidates.
/// With a cap set, pushing into a full buffer evicts the oldest entry.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<ConnectivityCandidate>,
    cap: Option<usize>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            cap: Some(cap.max(1)),
        }
    }

    /// Appends `candidate`, returning the evicted entry if the cap was hit.
    pub fn push(&mut self, candidate: ConnectivityCandidate) -> Option<ConnectivityCandidate> {
        let evicted = match self.cap {
            Some(cap) if self.queue.len() >= cap => self.queue.pop_front(),
            _ => None,
        };
        self.queue.push_back(candidate);
        evicted
    }

    pub fn drain_in_order(&mut self) -> Vec<ConnectivityCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
