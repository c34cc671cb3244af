//! Per-call negotiation state machine.
//!
//! The machine never touches the network or the media stack. Every entry point
//! mutates state synchronously and queues [`Action`]s; the owner executes them
//! and feeds results of asynchronous peer operations back through
//! [`NegotiationStateMachine::on_completion`]. Each completion carries the
//! generation of the session that asked for it, so work finishing after a
//! session was closed or replaced is ignored.
//!
//! While a description-mutating operation is outstanding, inbound offers and
//! answers are queued and replayed in arrival order once it resolves. Remote
//! candidates never wait: they are applied or buffered immediately.

pub mod candidates;

use std::collections::VecDeque;
use std::fmt;

use signal_proto::{ConnectivityCandidate, SessionDescription, SessionId, SignalingMessage};
use thiserror::Error;

pub use candidates::CandidateBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingLocalOffer,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::AwaitingLocalOffer => "awaiting_local_offer",
            NegotiationState::OfferSent => "offer_sent",
            NegotiationState::OfferReceived => "offer_received",
            NegotiationState::AnswerSent => "answer_sent",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Undecided,
    Caller,
    Callee,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("call already in progress (state {0})")]
    AlreadyInProgress(NegotiationState),
    #[error("unexpected offer in state {0}")]
    UnexpectedOffer(NegotiationState),
    #[error("unexpected answer in state {0}")]
    UnexpectedAnswer(NegotiationState),
    #[error("session is closed")]
    SessionClosed,
}

/// Why a session reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    NegotiationFailed(String),
    ChannelError(String),
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Hangup => f.write_str("hangup"),
            EndReason::NegotiationFailed(detail) => write!(f, "negotiation failed: {detail}"),
            EndReason::ChannelError(detail) => write!(f, "relay channel error: {detail}"),
        }
    }
}

/// Work for the peer-connection capability.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerOp {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    RollbackLocalDescription,
    AddCandidate(ConnectivityCandidate),
}

impl PeerOp {
    pub fn step(&self) -> Step {
        match self {
            PeerOp::CreateOffer => Step::CreateOffer,
            PeerOp::CreateAnswer => Step::CreateAnswer,
            PeerOp::SetLocalDescription(_) => Step::SetLocal,
            PeerOp::SetRemoteDescription(_) => Step::SetRemote,
            PeerOp::RollbackLocalDescription => Step::Rollback,
            PeerOp::AddCandidate(_) => Step::AddCandidate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateOffer,
    CreateAnswer,
    SetLocal,
    SetRemote,
    Rollback,
    AddCandidate,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::CreateOffer => "create_offer",
            Step::CreateAnswer => "create_answer",
            Step::SetLocal => "set_local_description",
            Step::SetRemote => "set_remote_description",
            Step::Rollback => "rollback_local_description",
            Step::AddCandidate => "add_candidate",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    LocalDescriptionApplied,
    RemoteDescriptionApplied,
    RolledBack,
    CandidateApplied,
}

/// Result of one [`PeerOp`], tagged with the generation that requested it.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub generation: u64,
    pub step: Step,
    pub result: Result<Outcome, String>,
}

impl Completion {
    pub fn succeeded(generation: u64, step: Step, outcome: Outcome) -> Self {
        Self {
            generation,
            step,
            result: Ok(outcome),
        }
    }

    pub fn failed(generation: u64, step: Step, error: impl Into<String>) -> Self {
        Self {
            generation,
            step,
            result: Err(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Peer { generation: u64, op: PeerOp },
    Send(SignalingMessage),
    StateChanged(NegotiationState),
    /// Emitted exactly once per session, when it closes.
    Release(EndReason),
}

#[derive(Debug)]
enum Deferred {
    Offer(SessionDescription, Option<SessionId>),
    Answer(SessionDescription),
}

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub max_pending_candidates: Option<usize>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_pending_candidates: Some(64),
        }
    }
}

#[derive(Debug)]
pub struct NegotiationStateMachine {
    local_id: SessionId,
    generation: u64,
    state: NegotiationState,
    role: Role,
    local_description_set: bool,
    remote_description_set: bool,
    pending_remote: CandidateBuffer,
    held_local: Vec<ConnectivityCandidate>,
    local_signal_sent: bool,
    suspended: Option<Step>,
    local_offer: Option<SessionDescription>,
    stashed_offer: Option<SessionDescription>,
    deferred: VecDeque<Deferred>,
    actions: VecDeque<Action>,
}

impl NegotiationStateMachine {
    pub fn new(local_id: SessionId, generation: u64, config: &NegotiationConfig) -> Self {
        let pending_remote = match config.max_pending_candidates {
            Some(cap) => CandidateBuffer::with_cap(cap),
            None => CandidateBuffer::new(),
        };
        Self {
            local_id,
            generation,
            state: NegotiationState::Idle,
            role: Role::Undecided,
            local_description_set: false,
            remote_description_set: false,
            pending_remote,
            held_local: Vec::new(),
            local_signal_sent: false,
            suspended: None,
            local_offer: None,
            stashed_offer: None,
            deferred: VecDeque::new(),
            actions: VecDeque::new(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_id(&self) -> &SessionId {
        &self.local_id
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    /// True while a description-mutating operation is outstanding.
    pub fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    pub fn drain_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    pub fn initiate(&mut self) -> Result<(), ProtocolError> {
        if self.state != NegotiationState::Idle {
            return Err(ProtocolError::AlreadyInProgress(self.state));
        }
        self.role = Role::Caller;
        self.set_state(NegotiationState::AwaitingLocalOffer);
        self.suspend(PeerOp::CreateOffer);
        Ok(())
    }

    pub fn on_offer_received(
        &mut self,
        description: SessionDescription,
        remote_id: Option<SessionId>,
    ) -> Result<(), ProtocolError> {
        if self.state == NegotiationState::Closed {
            return Err(ProtocolError::UnexpectedOffer(self.state));
        }
        if self.suspended.is_some() {
            tracing::debug!(
                target: "tandem::negotiation",
                session = %self.local_id,
                state = %self.state,
                "offer queued behind outstanding operation"
            );
            self.deferred
                .push_back(Deferred::Offer(description, remote_id));
            return Ok(());
        }
        match self.state {
            NegotiationState::Idle => {
                self.role = Role::Callee;
                self.set_state(NegotiationState::OfferReceived);
                self.suspend(PeerOp::SetRemoteDescription(description));
                Ok(())
            }
            NegotiationState::OfferSent => self.resolve_glare(description, remote_id),
            state => Err(ProtocolError::UnexpectedOffer(state)),
        }
    }

    // Both sides offered. The smaller id yields: it rolls back and answers.
    fn resolve_glare(
        &mut self,
        description: SessionDescription,
        remote_id: Option<SessionId>,
    ) -> Result<(), ProtocolError> {
        let remote_id = remote_id.unwrap_or_else(|| SessionId::new(""));
        if self.local_id == remote_id {
            return Err(ProtocolError::UnexpectedOffer(self.state));
        }
        if self.local_id > remote_id {
            tracing::info!(
                target: "tandem::negotiation",
                session = %self.local_id,
                remote = %remote_id,
                "glare: keeping local offer, ignoring remote offer"
            );
            return Ok(());
        }
        tracing::info!(
            target: "tandem::negotiation",
            session = %self.local_id,
            remote = %remote_id,
            "glare: rolling back local offer to answer remote"
        );
        self.role = Role::Callee;
        self.local_signal_sent = false;
        self.local_offer = None;
        self.stashed_offer = Some(description);
        self.set_state(NegotiationState::OfferReceived);
        self.suspend(PeerOp::RollbackLocalDescription);
        Ok(())
    }

    pub fn on_answer_received(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), ProtocolError> {
        if self.state == NegotiationState::Closed {
            return Err(ProtocolError::UnexpectedAnswer(self.state));
        }
        if self.suspended.is_some() {
            tracing::debug!(
                target: "tandem::negotiation",
                session = %self.local_id,
                state = %self.state,
                "answer queued behind outstanding operation"
            );
            self.deferred.push_back(Deferred::Answer(description));
            return Ok(());
        }
        match self.state {
            NegotiationState::OfferSent => {
                self.suspend(PeerOp::SetRemoteDescription(description));
                Ok(())
            }
            state => Err(ProtocolError::UnexpectedAnswer(state)),
        }
    }

    pub fn on_candidate_received(
        &mut self,
        candidate: ConnectivityCandidate,
    ) -> Result<(), ProtocolError> {
        if self.state == NegotiationState::Closed {
            return Err(ProtocolError::SessionClosed);
        }
        if self.remote_description_set {
            self.request(PeerOp::AddCandidate(candidate));
            return Ok(());
        }
        if let Some(evicted) = self.pending_remote.push(candidate) {
            tracing::warn!(
                target: "tandem::negotiation",
                session = %self.local_id,
                dropped = evicted.line().unwrap_or("<opaque>"),
                "pending candidate buffer full; dropped oldest"
            );
        }
        Ok(())
    }

    /// Forwards a locally gathered candidate, holding it until our offer or
    /// answer has gone out.
    pub fn on_local_candidate(&mut self, candidate: ConnectivityCandidate) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if self.local_signal_sent {
            self.actions
                .push_back(Action::Send(SignalingMessage::IceCandidate { candidate }));
        } else {
            self.held_local.push(candidate);
        }
    }

    pub fn on_completion(&mut self, completion: Completion) {
        if completion.generation != self.generation || self.state == NegotiationState::Closed {
            tracing::debug!(
                target: "tandem::negotiation",
                session = %self.local_id,
                step = %completion.step,
                completion_generation = completion.generation,
                generation = self.generation,
                "discarding stale completion"
            );
            return;
        }

        if completion.step == Step::AddCandidate {
            if let Err(err) = completion.result {
                self.fail(format!("{}: {err}", completion.step));
            }
            return;
        }

        if self.suspended != Some(completion.step) {
            tracing::warn!(
                target: "tandem::negotiation",
                session = %self.local_id,
                step = %completion.step,
                expected = ?self.suspended,
                "completion does not match outstanding operation"
            );
            return;
        }
        self.suspended = None;

        let outcome = match completion.result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail(format!("{}: {err}", completion.step));
                return;
            }
        };

        match outcome {
            Outcome::OfferCreated(offer) => {
                self.local_offer = Some(offer.clone());
                self.suspend(PeerOp::SetLocalDescription(offer));
            }
            Outcome::LocalDescriptionApplied => {
                self.local_description_set = true;
                match self.state {
                    NegotiationState::AwaitingLocalOffer => self.emit_offer(),
                    NegotiationState::AnswerSent => self.set_state(NegotiationState::Connected),
                    state => tracing::warn!(
                        target: "tandem::negotiation",
                        session = %self.local_id,
                        %state,
                        "local description applied in unexpected state"
                    ),
                }
            }
            Outcome::RemoteDescriptionApplied => {
                self.remote_description_set = true;
                for candidate in self.pending_remote.drain_in_order() {
                    self.request(PeerOp::AddCandidate(candidate));
                }
                match self.state {
                    NegotiationState::OfferReceived => self.suspend(PeerOp::CreateAnswer),
                    NegotiationState::OfferSent => self.set_state(NegotiationState::Connected),
                    state => tracing::warn!(
                        target: "tandem::negotiation",
                        session = %self.local_id,
                        %state,
                        "remote description applied in unexpected state"
                    ),
                }
            }
            Outcome::AnswerCreated(answer) => {
                self.actions.push_back(Action::Send(SignalingMessage::Answer {
                    description: answer.clone(),
                }));
                self.set_state(NegotiationState::AnswerSent);
                self.release_held_local();
                self.suspend(PeerOp::SetLocalDescription(answer));
            }
            Outcome::RolledBack => {
                self.local_description_set = false;
                match self.stashed_offer.take() {
                    Some(offer) => self.suspend(PeerOp::SetRemoteDescription(offer)),
                    None => self.fail("rollback finished without a remote offer".into()),
                }
            }
            Outcome::CandidateApplied => {}
        }

        self.replay_deferred();
    }

    /// Moves to `Closed`. Calling it again is a no-op.
    pub fn close(&mut self, reason: EndReason) {
        if self.state == NegotiationState::Closed {
            return;
        }
        tracing::debug!(
            target: "tandem::negotiation",
            session = %self.local_id,
            generation = self.generation,
            from = %self.state,
            %reason,
            "closing session"
        );
        self.pending_remote.clear();
        self.held_local.clear();
        self.deferred.clear();
        self.suspended = None;
        self.local_offer = None;
        self.stashed_offer = None;
        self.actions
            .retain(|action| matches!(action, Action::StateChanged(_)));
        self.set_state(NegotiationState::Closed);
        self.actions.push_back(Action::Release(reason));
    }

    fn emit_offer(&mut self) {
        let Some(offer) = self.local_offer.take() else {
            self.fail("local offer missing after it was applied".into());
            return;
        };
        self.actions.push_back(Action::Send(SignalingMessage::Offer {
            description: offer,
            session_id: Some(self.local_id.clone()),
        }));
        self.set_state(NegotiationState::OfferSent);
        self.release_held_local();
    }

    fn release_held_local(&mut self) {
        self.local_signal_sent = true;
        for candidate in self.held_local.drain(..) {
            self.actions
                .push_back(Action::Send(SignalingMessage::IceCandidate { candidate }));
        }
    }

    fn replay_deferred(&mut self) {
        while self.suspended.is_none() && self.state != NegotiationState::Closed {
            let Some(next) = self.deferred.pop_front() else {
                break;
            };
            let result = match next {
                Deferred::Offer(description, remote_id) => {
                    self.on_offer_received(description, remote_id)
                }
                Deferred::Answer(description) => self.on_answer_received(description),
            };
            if let Err(err) = result {
                tracing::warn!(
                    target: "tandem::negotiation",
                    session = %self.local_id,
                    error = %err,
                    "dropping queued signal"
                );
            }
        }
    }

    fn fail(&mut self, detail: String) {
        tracing::warn!(
            target: "tandem::negotiation",
            session = %self.local_id,
            state = %self.state,
            error = %detail,
            "negotiation failed"
        );
        self.close(EndReason::NegotiationFailed(detail));
    }

    fn suspend(&mut self, op: PeerOp) {
        self.suspended = Some(op.step());
        self.request(op);
    }

    fn request(&mut self, op: PeerOp) {
        self.actions.push_back(Action::Peer {
            generation: self.generation,
            op,
        });
    }

    fn set_state(&mut self, next: NegotiationState) {
        if self.state == next {
            return;
        }
        tracing::debug!(
            target: "tandem::negotiation",
            session = %self.local_id,
            from = %self.state,
            to = %next,
            "state transition"
        );
        self.state = next;
        self.actions.push_back(Action::StateChanged(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEN: u64 = 1;

    fn cand(n: u32) -> ConnectivityCandidate {
        ConnectivityCandidate::from_line(format!("candidate:{n} 1 udp 1 192.0.2.{n} 9 typ host"))
    }

    fn sdp(kind: &str, tag: &str) -> SessionDescription {
        SessionDescription::new(kind, format!("v=0 {tag}"))
    }

    /// Executes queued peer operations one at a time, always successfully.
    struct Harness {
        machine: NegotiationStateMachine,
        inflight: VecDeque<(u64, PeerOp)>,
        sent: Vec<SignalingMessage>,
        applied: Vec<ConnectivityCandidate>,
        states: Vec<NegotiationState>,
        released: Vec<EndReason>,
    }

    impl Harness {
        fn new(id: &str) -> Self {
            Self::with_config(id, &NegotiationConfig::default())
        }

        fn with_config(id: &str, config: &NegotiationConfig) -> Self {
            Self {
                machine: NegotiationStateMachine::new(SessionId::new(id), GEN, config),
                inflight: VecDeque::new(),
                sent: Vec::new(),
                applied: Vec::new(),
                states: Vec::new(),
                released: Vec::new(),
            }
        }

        fn collect(&mut self) {
            for action in self.machine.drain_actions() {
                match action {
                    Action::Peer { generation, op } => self.inflight.push_back((generation, op)),
                    Action::Send(message) => self.sent.push(message),
                    Action::StateChanged(state) => self.states.push(state),
                    Action::Release(reason) => self.released.push(reason),
                }
            }
        }

        fn complete_next(&mut self) -> bool {
            self.collect();
            let Some((generation, op)) = self.inflight.pop_front() else {
                return false;
            };
            let step = op.step();
            let outcome = match op {
                PeerOp::CreateOffer => Outcome::OfferCreated(sdp("offer", "local")),
                PeerOp::CreateAnswer => Outcome::AnswerCreated(sdp("answer", "local")),
                PeerOp::SetLocalDescription(_) => Outcome::LocalDescriptionApplied,
                PeerOp::SetRemoteDescription(_) => Outcome::RemoteDescriptionApplied,
                PeerOp::RollbackLocalDescription => Outcome::RolledBack,
                PeerOp::AddCandidate(candidate) => {
                    self.applied.push(candidate);
                    Outcome::CandidateApplied
                }
            };
            self.machine
                .on_completion(Completion::succeeded(generation, step, outcome));
            self.collect();
            true
        }

        fn settle(&mut self) {
            while self.complete_next() {}
        }

        fn fail_next(&mut self, error: &str) {
            self.collect();
            let (generation, op) = self.inflight.pop_front().expect("operation in flight");
            self.machine
                .on_completion(Completion::failed(generation, op.step(), error));
            self.collect();
        }

        fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent.iter().map(SignalingMessage::kind).collect()
        }
    }

    #[test]
    fn initiate_emits_offer_once_local_description_applied() {
        let mut h = Harness::new("alpha");
        h.machine.initiate().expect("initiate");
        h.collect();
        assert_eq!(h.machine.state(), NegotiationState::AwaitingLocalOffer);
        assert!(h.sent.is_empty());
        assert_eq!(h.inflight.front().map(|(_, op)| op.clone()), Some(PeerOp::CreateOffer));

        h.settle();
        assert_eq!(h.machine.state(), NegotiationState::OfferSent);
        assert_eq!(h.machine.role(), Role::Caller);
        assert!(h.machine.local_description_set());
        assert_eq!(
            h.sent,
            vec![SignalingMessage::Offer {
                description: sdp("offer", "local"),
                session_id: Some(SessionId::new("alpha")),
            }]
        );
    }

    #[test]
    fn initiate_outside_idle_is_rejected() {
        let mut h = Harness::new("alpha");
        h.machine.initiate().expect("initiate");
        assert_eq!(
            h.machine.initiate(),
            Err(ProtocolError::AlreadyInProgress(
                NegotiationState::AwaitingLocalOffer
            ))
        );
    }

    #[test]
    fn callee_answers_and_connects() {
        let mut h = Harness::new("bravo");
        h.machine
            .on_offer_received(sdp("offer", "remote"), Some(SessionId::new("alpha")))
            .expect("offer accepted");
        h.settle();
        assert_eq!(h.machine.role(), Role::Callee);
        assert_eq!(
            h.states,
            vec![
                NegotiationState::OfferReceived,
                NegotiationState::AnswerSent,
                NegotiationState::Connected,
            ]
        );
        assert_eq!(h.sent_kinds(), ["answer"]);
        assert!(h.machine.local_description_set());
        assert!(h.machine.remote_description_set());
    }

    #[test]
    fn early_candidates_apply_in_order_after_answer() {
        let mut h = Harness::new("alpha");
        h.machine.initiate().expect("initiate");
        h.settle();
        for n in 1..=3 {
            h.machine.on_candidate_received(cand(n)).expect("buffered");
        }
        h.settle();
        assert!(h.applied.is_empty());
        assert_eq!(h.machine.pending_candidates(), 3);

        h.machine
            .on_answer_received(sdp("answer", "remote"))
            .expect("answer accepted");
        // candidate arriving while the remote description is being applied
        h.machine.on_candidate_received(cand(4)).expect("buffered");
        h.settle();

        assert_eq!(h.machine.state(), NegotiationState::Connected);
        assert_eq!(h.applied, vec![cand(1), cand(2), cand(3), cand(4)]);
        assert_eq!(h.machine.pending_candidates(), 0);

        h.machine.on_candidate_received(cand(5)).expect("applied");
        h.settle();
        assert_eq!(h.applied.last(), Some(&cand(5)));
        assert_eq!(h.applied.len(), 5);
    }

    #[test]
    fn candidate_cap_drops_oldest() {
        let config = NegotiationConfig {
            max_pending_candidates: Some(2),
        };
        let mut h = Harness::with_config("alpha", &config);
        h.machine.initiate().expect("initiate");
        h.settle();
        for n in 1..=3 {
            h.machine.on_candidate_received(cand(n)).expect("buffered");
        }
        h.machine
            .on_answer_received(sdp("answer", "remote"))
            .expect("answer accepted");
        h.settle();
        assert_eq!(h.applied, vec![cand(2), cand(3)]);
    }

    #[test]
    fn late_answer_after_connected_is_dropped() {
        let mut h = Harness::new("alpha");
        h.machine.initiate().expect("initiate");
        h.settle();
        h.machine
            .on_answer_received(sdp("answer", "remote"))
            .expect("answer accepted");
        h.settle();
        assert_eq!(h.machine.state(), NegotiationState::Connected);

        let err = h
            .machine
            .on_answer_received(sdp("answer", "remote"))
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedAnswer(NegotiationState::Connected)
        );
        assert!(h.machine.drain_actions().is_empty());
        assert_eq!(h.machine.state(), NegotiationState::Connected);
    }

    #[test]
    fn duplicate_offer_is_queued_then_dropped() {
        let mut h = Harness::new("bravo");
        h.machine
            .on_offer_received(sdp("offer", "remote"), Some(SessionId::new("alpha")))
            .expect("offer accepted");
        h.machine
            .on_offer_received(sdp("offer", "remote"), Some(SessionId::new("alpha")))
            .expect("queued");
        h.settle();
        assert_eq!(h.machine.state(), NegotiationState::Connected);
        assert_eq!(h.sent_kinds(), ["answer"]);
        assert!(h.released.is_empty());
    }

    #[test]
    fn unexpected_answer_before_offer() {
        let mut h = Harness::new("alpha");
        assert_eq!(
            h.machine.on_answer_received(sdp("answer", "x")),
            Err(ProtocolError::UnexpectedAnswer(NegotiationState::Idle))
        );
    }

    #[test]
    fn close_is_idempotent_from_every_reachable_state() {
        type Drive = fn(&mut Harness);
        let drives: [(NegotiationState, Drive); 6] = [
            (NegotiationState::Idle, |_| {}),
            (NegotiationState::AwaitingLocalOffer, |h| {
                h.machine.initiate().expect("initiate");
            }),
            (NegotiationState::OfferSent, |h| {
                h.machine.initiate().expect("initiate");
                h.settle();
            }),
            (NegotiationState::OfferReceived, |h| {
                h.machine
                    .on_offer_received(sdp("offer", "r"), None)
                    .expect("offer");
            }),
            (NegotiationState::AnswerSent, |h| {
                h.machine
                    .on_offer_received(sdp("offer", "r"), None)
                    .expect("offer");
                // set remote, create answer; leave set local outstanding
                h.complete_next();
                h.complete_next();
            }),
            (NegotiationState::Connected, |h| {
                h.machine
                    .on_offer_received(sdp("offer", "r"), None)
                    .expect("offer");
                h.settle();
            }),
        ];

        for (expected, drive) in drives {
            let mut h = Harness::new("alpha");
            drive(&mut h);
            h.collect();
            assert_eq!(h.machine.state(), expected);
            for _ in 0..3 {
                h.machine.close(EndReason::Hangup);
            }
            h.settle();
            assert_eq!(h.machine.state(), NegotiationState::Closed);
            assert_eq!(h.released, vec![EndReason::Hangup], "from {expected}");
        }
    }

    #[test]
    fn close_during_offer_creation_discards_resumption() {
        let mut h = Harness::new("alpha");
        h.machine.initiate().expect("initiate");
        h.collect();
        let (generation, op) = h.inflight.pop_front().expect("create offer");
        assert_eq!(op, PeerOp::CreateOffer);

        h.machine.close(EndReason::Hangup);
        h.collect();
        let states_at_close = h.states.clone();

        h.machine.on_completion(Completion::succeeded(
            generation,
            Step::CreateOffer,
            Outcome::OfferCreated(sdp("offer", "late")),
        ));
        h.collect();
        assert!(h.sent.is_empty());
        assert!(h.inflight.is_empty());
        assert_eq!(h.states, states_at_close);
        assert_eq!(h.machine.state(), NegotiationState::Closed);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let mut h = Harness::new("alpha");
        h.machine.initiate().expect("initiate");
        h.collect();
        h.machine.on_completion(Completion::succeeded(
            GEN + 1,
            Step::CreateOffer,
            Outcome::OfferCreated(sdp("offer", "other")),
        ));
        assert!(h.machine.drain_actions().is_empty());
        assert!(h.machine.is_suspended());
    }

    #[test]
    fn peer_failure_is_fatal() {
        let mut h = Harness::new("bravo");
        h.machine
            .on_offer_received(sdp("offer", "remote"), None)
            .expect("offer accepted");
        h.fail_next("bad sdp");
        assert_eq!(h.machine.state(), NegotiationState::Closed);
        assert_eq!(
            h.released,
            vec![EndReason::NegotiationFailed(
                "set_remote_description: bad sdp".into()
            )]
        );
        assert!(h.sent.is_empty());
    }

    #[test]
    fn candidate_failure_is_fatal() {
        let mut h = Harness::new("alpha");
        h.machine.initiate().expect("initiate");
        h.settle();
        h.machine
            .on_answer_received(sdp("answer", "remote"))
            .expect("answer");
        h.settle();
        h.machine.on_candidate_received(cand(1)).expect("applied");
        h.fail_next("unparseable candidate");
        assert_eq!(h.machine.state(), NegotiationState::Closed);
        assert_eq!(h.released.len(), 1);
    }

    #[test]
    fn candidates_after_close_are_rejected() {
        let mut h = Harness::new("alpha");
        h.machine.close(EndReason::Hangup);
        assert_eq!(
            h.machine.on_candidate_received(cand(1)),
            Err(ProtocolError::SessionClosed)
        );
    }

    #[test]
    fn local_candidates_wait_for_offer() {
        let mut h = Harness::new("alpha");
        h.machine.initiate().expect("initiate");
        h.machine.on_local_candidate(cand(1));
        h.collect();
        assert!(h.sent.is_empty());
        h.settle();
        h.machine.on_local_candidate(cand(2));
        h.collect();
        assert_eq!(h.sent_kinds(), ["offer", "ice_candidate", "ice_candidate"]);
    }

    #[test]
    fn glare_smaller_id_rolls_back_and_answers() {
        let mut h = Harness::new("aaaa");
        h.machine.initiate().expect("initiate");
        h.settle();
        h.machine
            .on_offer_received(sdp("offer", "remote"), Some(SessionId::new("bbbb")))
            .expect("glare handled");
        h.collect();
        assert_eq!(
            h.inflight.front().map(|(_, op)| op.clone()),
            Some(PeerOp::RollbackLocalDescription)
        );
        h.settle();
        assert_eq!(h.machine.role(), Role::Callee);
        assert_eq!(h.machine.state(), NegotiationState::Connected);
        assert_eq!(h.sent_kinds(), ["offer", "answer"]);
    }

    #[test]
    fn glare_larger_id_ignores_remote_offer() {
        let mut h = Harness::new("bbbb");
        h.machine.initiate().expect("initiate");
        h.settle();
        h.machine
            .on_offer_received(sdp("offer", "remote"), Some(SessionId::new("aaaa")))
            .expect("glare handled");
        h.collect();
        assert!(h.inflight.is_empty());
        assert_eq!(h.machine.state(), NegotiationState::OfferSent);
        assert_eq!(h.machine.role(), Role::Caller);
    }
}
