//! Offer/answer choreography for a single remote peer.
//!
//! The coordinator never touches a transport directly. Every method returns
//! the [`NegotiationAction`]s the caller must carry out, in order: transport
//! commands for the peer connection and descriptions to forward over the
//! relay. Work that completes asynchronously (creating an offer or answer) is
//! requested with a [`Ticket`]; the completion must be handed back with the
//! same ticket or it is treated as stale and dropped.

use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::protocol::{IceCandidate, PeerId, SessionDescription};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptionState {
    None,
    LocalOfferSet,
    RemoteOfferSet,
    Stable,
}

/// Identifies one asynchronous description request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub epoch: u64,
    seq: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCommand {
    CreateOffer(Ticket),
    CreateAnswer(Ticket),
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    /// Discard a local offer that lost a glare tie-break.
    Rollback,
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NegotiationAction {
    Transport(TransportCommand),
    SendOffer(SessionDescription),
    SendAnswer(SessionDescription),
}

#[derive(Clone, Debug)]
pub struct NegotiationContext {
    pub peer_id: Option<PeerId>,
    pub local_role: NegotiationRole,
    pub description_state: DescriptionState,
    pub candidate_buffer: VecDeque<IceCandidate>,
}

#[derive(Debug)]
pub struct NegotiationCoordinator {
    epoch: u64,
    local_id: PeerId,
    context: NegotiationContext,
    local_offer: Option<SessionDescription>,
    pending: Option<Ticket>,
    next_seq: u64,
    closed: bool,
}

impl NegotiationCoordinator {
    pub fn new(
        epoch: u64,
        local_id: PeerId,
        peer_id: Option<PeerId>,
        local_role: NegotiationRole,
    ) -> Self {
        Self {
            epoch,
            local_id,
            context: NegotiationContext {
                peer_id,
                local_role,
                description_state: DescriptionState::None,
                candidate_buffer: VecDeque::new(),
            },
            local_offer: None,
            pending: None,
            next_seq: 0,
            closed: false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn context(&self) -> &NegotiationContext {
        &self.context
    }

    pub fn description_state(&self) -> DescriptionState {
        self.context.description_state
    }

    pub fn local_role(&self) -> NegotiationRole {
        self.context.local_role
    }

    pub fn local_offer(&self) -> Option<&SessionDescription> {
        self.local_offer.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn initiate_offer(&mut self) -> Vec<NegotiationAction> {
        if self.closed {
            return Vec::new();
        }
        if self.context.local_role != NegotiationRole::Offerer
            || self.context.description_state != DescriptionState::None
            || self.pending.is_some()
        {
            warn!(
                epoch = self.epoch,
                role = ?self.context.local_role,
                state = ?self.context.description_state,
                "glare: offer already in progress, not initiating another"
            );
            return Vec::new();
        }
        let ticket = self.issue_ticket();
        vec![NegotiationAction::Transport(TransportCommand::CreateOffer(
            ticket,
        ))]
    }

    pub fn on_offer_created(
        &mut self,
        ticket: Ticket,
        offer: SessionDescription,
    ) -> Vec<NegotiationAction> {
        if !self.redeem(ticket) || self.context.description_state != DescriptionState::None {
            debug!(epoch = self.epoch, ?ticket, "discarding stale local offer");
            return Vec::new();
        }
        self.local_offer = Some(offer.clone());
        self.context.description_state = DescriptionState::LocalOfferSet;
        vec![
            NegotiationAction::Transport(TransportCommand::SetLocalDescription(offer.clone())),
            NegotiationAction::SendOffer(offer),
        ]
    }

    pub fn on_remote_offer(
        &mut self,
        from: &PeerId,
        offer: SessionDescription,
    ) -> Vec<NegotiationAction> {
        if self.closed || !self.accepts_sender(from) {
            return Vec::new();
        }
        match self.context.description_state {
            DescriptionState::None => {
                if self.pending.take().is_some() {
                    debug!(epoch = self.epoch, "remote offer arrived first, dropping local offer in flight");
                }
                self.accept_offer(offer, false)
            }
            DescriptionState::LocalOfferSet if self.local_id < *from => {
                debug!(
                    epoch = self.epoch,
                    local = %self.local_id,
                    remote = %from,
                    "glare: yielding to remote offer"
                );
                self.local_offer = None;
                self.context.local_role = NegotiationRole::Answerer;
                self.accept_offer(offer, true)
            }
            DescriptionState::LocalOfferSet => {
                debug!(
                    epoch = self.epoch,
                    local = %self.local_id,
                    remote = %from,
                    "glare: keeping local offer, ignoring remote offer"
                );
                Vec::new()
            }
            state => {
                debug!(epoch = self.epoch, ?state, "discarding duplicate or late remote offer");
                Vec::new()
            }
        }
    }

    pub fn on_answer_created(
        &mut self,
        ticket: Ticket,
        answer: SessionDescription,
    ) -> Vec<NegotiationAction> {
        if !self.redeem(ticket)
            || self.context.description_state != DescriptionState::RemoteOfferSet
        {
            debug!(epoch = self.epoch, ?ticket, "discarding stale local answer");
            return Vec::new();
        }
        self.context.description_state = DescriptionState::Stable;
        let mut actions = vec![
            NegotiationAction::Transport(TransportCommand::SetLocalDescription(answer.clone())),
            NegotiationAction::SendAnswer(answer),
        ];
        actions.extend(self.flush_candidates());
        actions
    }

    pub fn on_remote_answer(
        &mut self,
        from: &PeerId,
        answer: SessionDescription,
    ) -> Vec<NegotiationAction> {
        if self.closed || !self.accepts_sender(from) {
            return Vec::new();
        }
        if self.context.description_state != DescriptionState::LocalOfferSet {
            debug!(
                epoch = self.epoch,
                state = ?self.context.description_state,
                "discarding answer that matches no outstanding offer"
            );
            return Vec::new();
        }
        self.context.description_state = DescriptionState::Stable;
        let mut actions = vec![NegotiationAction::Transport(
            TransportCommand::SetRemoteDescription(answer),
        )];
        actions.extend(self.flush_candidates());
        actions
    }

    pub fn on_remote_candidate(
        &mut self,
        from: &PeerId,
        candidate: IceCandidate,
    ) -> Vec<NegotiationAction> {
        if self.closed || !self.accepts_sender(from) {
            return Vec::new();
        }
        if self.context.description_state == DescriptionState::Stable {
            return vec![NegotiationAction::Transport(TransportCommand::AddCandidate(
                candidate,
            ))];
        }
        self.context.candidate_buffer.push_back(candidate);
        debug!(
            epoch = self.epoch,
            buffered = self.context.candidate_buffer.len(),
            "buffering remote candidate until descriptions are stable"
        );
        Vec::new()
    }

    /// A description request failed inside the transport. The round is
    /// abandoned; connectivity monitoring decides whether the call survives.
    pub fn on_request_failed(&mut self, ticket: Ticket, reason: &str) {
        if self.redeem(ticket) {
            warn!(epoch = self.epoch, ?ticket, reason, "description request failed");
        }
    }

    pub fn close(&mut self) -> Vec<NegotiationAction> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.pending = None;
        self.local_offer = None;
        self.context.candidate_buffer.clear();
        self.context.description_state = DescriptionState::None;
        vec![NegotiationAction::Transport(TransportCommand::Close)]
    }

    fn accept_offer(&mut self, offer: SessionDescription, rollback: bool) -> Vec<NegotiationAction> {
        self.context.description_state = DescriptionState::RemoteOfferSet;
        let ticket = self.issue_ticket();
        let mut actions = Vec::with_capacity(3);
        if rollback {
            actions.push(NegotiationAction::Transport(TransportCommand::Rollback));
        }
        actions.push(NegotiationAction::Transport(
            TransportCommand::SetRemoteDescription(offer),
        ));
        actions.push(NegotiationAction::Transport(TransportCommand::CreateAnswer(
            ticket,
        )));
        actions
    }

    fn flush_candidates(&mut self) -> Vec<NegotiationAction> {
        self.context
            .candidate_buffer
            .drain(..)
            .map(|candidate| NegotiationAction::Transport(TransportCommand::AddCandidate(candidate)))
            .collect()
    }

    fn accepts_sender(&mut self, from: &PeerId) -> bool {
        match &self.context.peer_id {
            Some(expected) if expected != from => {
                warn!(
                    epoch = self.epoch,
                    expected = %expected,
                    from = %from,
                    "ignoring signal from unexpected peer"
                );
                false
            }
            Some(_) => true,
            None => {
                self.context.peer_id = Some(from.clone());
                true
            }
        }
    }

    fn issue_ticket(&mut self) -> Ticket {
        self.next_seq += 1;
        let ticket = Ticket {
            epoch: self.epoch,
            seq: self.next_seq,
        };
        self.pending = Some(ticket);
        ticket
    }

    fn redeem(&mut self, ticket: Ticket) -> bool {
        if self.closed || self.pending != Some(ticket) {
            return false;
        }
        self.pending = None;
        true
    }
}
