use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay channel closed")]
    Closed,
    #[error("relay inbound stream already taken")]
    InboundTaken,
    #[error("relay transport error: {0}")]
    Transport(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Ordered, possibly duplicating message pipe to the other call participant.
///
/// `send` never blocks; implementations queue the payload for a writer task.
/// The inbound stream ends when the underlying transport is gone.
pub trait RelayChannel: Send + Sync {
    fn send(&self, payload: Bytes) -> RelayResult<()>;

    /// Hands out the inbound stream. Only the first call succeeds.
    fn inbound(&self) -> RelayResult<mpsc::UnboundedReceiver<Bytes>>;

    fn is_open(&self) -> bool;
}

#[derive(Debug, Default)]
struct Link {
    a_to_b: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    b_to_a: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl Link {
    fn lane(&self, side: Side) -> &Mutex<Option<mpsc::UnboundedSender<Bytes>>> {
        match side {
            Side::A => &self.a_to_b,
            Side::B => &self.b_to_a,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    A,
    B,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

/// In-memory relay for tests and same-process demos. Created as a linked pair;
/// whatever one end sends, the other end receives in order.
#[derive(Debug)]
pub struct LocalRelay {
    side: Side,
    link: Arc<Link>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl LocalRelay {
    pub fn pair() -> (Self, Self) {
        let (a_to_b, b_rx) = mpsc::unbounded_channel();
        let (b_to_a, a_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            a_to_b: Mutex::new(Some(a_to_b)),
            b_to_a: Mutex::new(Some(b_to_a)),
        });
        let a = Self {
            side: Side::A,
            link: link.clone(),
            inbound: Mutex::new(Some(a_rx)),
        };
        let b = Self {
            side: Side::B,
            link,
            inbound: Mutex::new(Some(b_rx)),
        };
        (a, b)
    }

    /// Delivers `payload` to this end as if the peer had sent it. Lets tests
    /// replay duplicates or late messages.
    pub fn inject(&self, payload: Bytes) -> RelayResult<()> {
        push(self.link.lane(self.side.other()), payload)
    }

    /// Tears the link down for both ends; both inbound streams end.
    pub fn close(&self) {
        self.link.a_to_b.lock().take();
        self.link.b_to_a.lock().take();
    }
}

fn push(lane: &Mutex<Option<mpsc::UnboundedSender<Bytes>>>, payload: Bytes) -> RelayResult<()> {
    let guard = lane.lock();
    let sender = guard.as_ref().ok_or(RelayError::Closed)?;
    sender.send(payload).map_err(|_| RelayError::Closed)
}

impl RelayChannel for LocalRelay {
    fn send(&self, payload: Bytes) -> RelayResult<()> {
        push(self.link.lane(self.side), payload)
    }

    fn inbound(&self) -> RelayResult<mpsc::UnboundedReceiver<Bytes>> {
        self.inbound.lock().take().ok_or(RelayError::InboundTaken)
    }

    fn is_open(&self) -> bool {
        self.link.lane(self.side).lock().is_some()
    }
}
