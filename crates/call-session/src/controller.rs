use std::time::Duration;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionError, AdmissionGate, EntryOutcome};
use crate::code::CallCode;
use crate::error::CallError;
use crate::negotiation::{
    NegotiationAction, NegotiationCoordinator, NegotiationRole, Ticket, TransportCommand,
};
use crate::protocol::{
    AdmitPayload, CallJoinedPayload, CandidatePayload, ClientMessage, CodePayload,
    CreateCallPayload, DescriptionPayload, JoinCallPayload, ParticipantCountPayload, PeerId,
    RejectReason, RelayMessage, SessionDescription, MAX_PARTICIPANTS,
};
use crate::transport::{ConnectivityState, RemoteTrack, TransportEvent, TransportEventKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Creating,
    Joining,
    Waiting,
    WaitingApproval,
    InCall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Owner,
    Joiner,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSession {
    pub code: CallCode,
    pub role: Role,
    pub participant_count: u8,
    pub remote_peer: Option<PeerId>,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub admission_control: bool,
    pub leave_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            admission_control: false,
            leave_grace: Duration::from_millis(3000),
        }
    }
}

/// Everything that can happen to a call besides a user operation.
#[derive(Clone, Debug)]
pub enum Event {
    Relay(RelayMessage),
    MediaGranted { request: u64 },
    MediaDenied { request: u64, reason: String },
    OfferCreated { ticket: Ticket, description: SessionDescription },
    AnswerCreated { ticket: Ticket, description: SessionDescription },
    DescriptionFailed { ticket: Ticket, reason: String },
    Transport(TransportEvent),
    GraceElapsed { token: u64 },
}

/// Work the runtime must perform, in order, after a transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    Send(ClientMessage),
    AcquireMedia { request: u64 },
    ReleaseMedia { request: u64 },
    /// Open the transport for a new negotiation context, attaching the media
    /// granted under `media` if any.
    OpenTransport { epoch: u64, media: Option<u64> },
    Transport { epoch: u64, command: TransportCommand },
    StartGraceTimer { token: u64, delay: Duration },
    Notify(CallNotice),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallNotice {
    StateChanged(CallState),
    CallCode(CallCode),
    ParticipantCount(u8),
    AdmissionRequested(PeerId),
    Connectivity(ConnectivityState),
    RemoteMedia(RemoteTrack),
    Error(CallError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Request {
    Create,
    Join(CallCode),
}

#[derive(Clone, Copy, Debug)]
struct MediaSlot {
    request: u64,
    granted: bool,
}

/// Top-level call state machine.
///
/// Pure: every operation and [`Event`] returns the [`Effect`]s to carry out
/// and nothing else. The controller is the only component that produces
/// relay messages; negotiation output is wrapped into them here.
#[derive(Debug)]
pub struct CallSessionController {
    local_id: PeerId,
    options: SessionOptions,
    state: CallState,
    session: Option<CallSession>,
    /// Create or join in progress, and whether the relay has seen it yet.
    request: Option<(Request, bool)>,
    /// A create or join the relay saw but the user abandoned.
    abandoned: Option<Request>,
    gate: AdmissionGate,
    negotiation: Option<NegotiationCoordinator>,
    media: Option<MediaSlot>,
    grace_token: Option<u64>,
    next_epoch: u64,
    next_media: u64,
    next_timer: u64,
    last_error: Option<CallError>,
}

impl CallSessionController {
    pub fn new(local_id: PeerId, options: SessionOptions) -> Self {
        Self {
            local_id,
            options,
            state: CallState::Idle,
            session: None,
            request: None,
            abandoned: None,
            gate: AdmissionGate::new(),
            negotiation: None,
            media: None,
            grace_token: None,
            next_epoch: 0,
            next_media: 0,
            next_timer: 0,
            last_error: None,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn negotiation(&self) -> Option<&NegotiationCoordinator> {
        self.negotiation.as_ref()
    }

    pub fn admission(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn last_error(&self) -> Option<&CallError> {
        self.last_error.as_ref()
    }

    pub fn create_call(&mut self) -> Result<Vec<Effect>, CallError> {
        self.ensure_idle()?;
        self.request = Some((Request::Create, false));
        Ok(self.begin(CallState::Creating))
    }

    pub fn join_call(&mut self, raw_code: &str) -> Result<Vec<Effect>, CallError> {
        let code = CallCode::parse(raw_code)?;
        self.ensure_idle()?;
        self.request = Some((Request::Join(code), false));
        Ok(self.begin(CallState::Joining))
    }

    pub fn admit_or_reject(
        &mut self,
        participant_id: &PeerId,
        accept: bool,
    ) -> Result<Vec<Effect>, CallError> {
        let code = match &self.session {
            Some(session) if session.role == Role::Owner => session.code.clone(),
            _ => return Err(CallError::NotOwner),
        };
        match self.gate.decide(participant_id, accept) {
            Ok(_) => {}
            Err(AdmissionError::NotFound(id)) => {
                debug!(participant = %id, "admission decision for unknown request ignored");
                return Ok(Vec::new());
            }
        }
        let mut effects = vec![Effect::Send(ClientMessage::AdmitParticipant(AdmitPayload {
            code,
            participant_id: participant_id.clone(),
            accept,
            reason: (!accept).then_some(RejectReason::Declined),
        }))];
        if accept {
            info!(participant = %participant_id, "admitted participant");
            effects.extend(self.enter_call(MAX_PARTICIPANTS, Some(participant_id.clone())));
            effects.extend(self.open_context(NegotiationRole::Offerer));
        }
        Ok(effects)
    }

    /// Leave from any state. Safe to call repeatedly.
    pub fn leave_call(&mut self) -> Vec<Effect> {
        self.teardown(true)
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Relay(message) => self.on_relay(message),
            Event::MediaGranted { request } => self.on_media_granted(request),
            Event::MediaDenied { request, reason } => {
                if self.media.map(|slot| slot.request) != Some(request) {
                    return Vec::new();
                }
                self.fail(CallError::Media(reason), false)
            }
            Event::OfferCreated {
                ticket,
                description,
            } => self.negotiate(Some(ticket.epoch), |coord| {
                coord.on_offer_created(ticket, description)
            }),
            Event::AnswerCreated {
                ticket,
                description,
            } => self.negotiate(Some(ticket.epoch), |coord| {
                coord.on_answer_created(ticket, description)
            }),
            Event::DescriptionFailed { ticket, reason } => self.negotiate(Some(ticket.epoch), |coord| {
                coord.on_request_failed(ticket, &reason);
                Vec::new()
            }),
            Event::Transport(event) => self.on_transport(event),
            Event::GraceElapsed { token } => {
                if self.grace_token != Some(token) {
                    return Vec::new();
                }
                debug!("grace period elapsed after remote departure");
                self.teardown(false)
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), CallError> {
        if self.state == CallState::Idle {
            Ok(())
        } else {
            Err(CallError::AlreadyActive)
        }
    }

    fn begin(&mut self, state: CallState) -> Vec<Effect> {
        self.last_error = None;
        self.next_media += 1;
        let request = self.next_media;
        self.media = Some(MediaSlot {
            request,
            granted: false,
        });
        vec![self.transition(state), Effect::AcquireMedia { request }]
    }

    fn on_media_granted(&mut self, request: u64) -> Vec<Effect> {
        let current = matches!(self.media, Some(slot) if slot.request == request);
        let Some((pending, sent)) = self.request.as_mut().filter(|_| current) else {
            debug!(request, "releasing media granted after teardown");
            return vec![Effect::ReleaseMedia { request }];
        };
        *sent = true;
        let message = match pending {
            Request::Create => ClientMessage::CreateCall(CreateCallPayload {
                peer_id: self.local_id.clone(),
                admission_control: self.options.admission_control,
            }),
            Request::Join(code) => ClientMessage::JoinCall(JoinCallPayload {
                code: code.clone(),
                peer_id: self.local_id.clone(),
            }),
        };
        if let Some(slot) = self.media.as_mut() {
            slot.granted = true;
        }
        vec![Effect::Send(message)]
    }

    fn on_relay(&mut self, message: RelayMessage) -> Vec<Effect> {
        let event = message.event_name();
        match message {
            RelayMessage::CallCreated(CodePayload { code }) => self.on_call_created(code),
            RelayMessage::CallJoined(payload) => self.on_call_joined(payload),
            RelayMessage::CallNotFound => self.registry_failure(event, CallError::NotFound),
            RelayMessage::CallFull => self.registry_failure(event, CallError::Full),
            RelayMessage::RegistryError(payload) => {
                self.registry_failure(event, CallError::RegistryUnavailable(payload.reason))
            }
            RelayMessage::ParticipantWaiting(payload) => {
                self.on_participant_waiting(payload.participant_id)
            }
            RelayMessage::ParticipantAccepted(payload) => {
                if self.state != CallState::WaitingApproval || payload.participant_id != self.local_id
                {
                    return self.ignore(event);
                }
                let remote = self.session.as_ref().and_then(|s| s.remote_peer.clone());
                let mut effects = self.enter_call(MAX_PARTICIPANTS, remote);
                effects.extend(self.open_context(NegotiationRole::Answerer));
                effects
            }
            RelayMessage::ParticipantRejected(payload) => {
                if self.state != CallState::WaitingApproval || payload.participant_id != self.local_id
                {
                    return self.ignore(event);
                }
                let error = match payload.reason {
                    RejectReason::Busy => CallError::Busy,
                    RejectReason::Declined => CallError::Rejected,
                };
                self.fail(error, false)
            }
            RelayMessage::ParticipantJoined(payload) => self.on_participant_joined(payload),
            RelayMessage::ParticipantLeft(payload) => self.on_participant_left(payload),
            RelayMessage::ReceiveOffer(payload) => {
                if !self.signal_matches(&payload.code) {
                    return self.ignore(event);
                }
                let epoch = self.current_epoch();
                self.negotiate(epoch, |coord| {
                    coord.on_remote_offer(&payload.from, payload.description)
                })
            }
            RelayMessage::ReceiveAnswer(payload) => {
                if !self.signal_matches(&payload.code) {
                    return self.ignore(event);
                }
                let epoch = self.current_epoch();
                self.negotiate(epoch, |coord| {
                    coord.on_remote_answer(&payload.from, payload.description)
                })
            }
            RelayMessage::ReceiveIceCandidate(payload) => {
                if !self.signal_matches(&payload.code) {
                    return self.ignore(event);
                }
                let epoch = self.current_epoch();
                self.negotiate(epoch, |coord| {
                    coord.on_remote_candidate(&payload.from, payload.candidate)
                })
            }
        }
    }

    fn on_call_created(&mut self, code: CallCode) -> Vec<Effect> {
        if self.state == CallState::Creating && matches!(self.request, Some((Request::Create, true)))
        {
            self.request = None;
            info!(code = %code, "call created");
            self.session = Some(CallSession {
                code: code.clone(),
                role: Role::Owner,
                participant_count: 1,
                remote_peer: None,
            });
            return vec![
                Effect::Notify(CallNotice::CallCode(code)),
                self.transition(CallState::Waiting),
                Effect::Notify(CallNotice::ParticipantCount(1)),
            ];
        }
        if self.abandoned == Some(Request::Create) {
            self.abandoned = None;
            debug!(code = %code, "destroying code created after leave");
            return vec![Effect::Send(ClientMessage::LeaveCall(CodePayload { code }))];
        }
        self.ignore("call-created")
    }

    fn on_call_joined(&mut self, payload: CallJoinedPayload) -> Vec<Effect> {
        let code = match &self.request {
            Some((Request::Join(code), true)) if self.state == CallState::Joining => code.clone(),
            _ => {
                if let Some(Request::Join(code)) = self.abandoned.clone() {
                    self.abandoned = None;
                    debug!(code = %code, "leaving call joined after leave");
                    return vec![Effect::Send(ClientMessage::LeaveCall(CodePayload { code }))];
                }
                return self.ignore("call-joined");
            }
        };
        self.request = None;
        info!(code = %code, awaiting = payload.awaiting_approval, "joined call");
        self.session = Some(CallSession {
            code,
            role: Role::Joiner,
            participant_count: payload.participant_count,
            remote_peer: payload.peer_id.clone(),
        });
        if payload.awaiting_approval {
            return vec![self.transition(CallState::WaitingApproval)];
        }
        let mut effects = self.enter_call(payload.participant_count, payload.peer_id);
        effects.extend(self.open_context(NegotiationRole::Answerer));
        effects
    }

    fn on_participant_waiting(&mut self, participant_id: PeerId) -> Vec<Effect> {
        let code = match &self.session {
            Some(session) if session.role == Role::Owner && self.state == CallState::Waiting => {
                session.code.clone()
            }
            _ => return self.ignore("participant-waiting"),
        };
        match self.gate.request_entry(participant_id.clone()) {
            EntryOutcome::Queued => {
                info!(participant = %participant_id, "participant waiting for admission");
                vec![Effect::Notify(CallNotice::AdmissionRequested(participant_id))]
            }
            EntryOutcome::Replaced => Vec::new(),
            EntryOutcome::Busy => {
                debug!(participant = %participant_id, "admission slot taken, answering busy");
                vec![Effect::Send(ClientMessage::AdmitParticipant(AdmitPayload {
                    code,
                    participant_id,
                    accept: false,
                    reason: Some(RejectReason::Busy),
                }))]
            }
        }
    }

    fn on_participant_joined(&mut self, payload: ParticipantCountPayload) -> Vec<Effect> {
        let Some(session) = self.session.as_mut().filter(|s| s.role == Role::Owner) else {
            return self.ignore("participant-joined");
        };
        if self.state != CallState::Waiting {
            session.participant_count = payload.participant_count;
            debug!(state = ?self.state, "participant-joined while not waiting, ignoring");
            return Vec::new();
        }
        let mut effects = self.enter_call(payload.participant_count, payload.peer_id);
        effects.extend(self.open_context(NegotiationRole::Offerer));
        effects
    }

    fn on_participant_left(&mut self, payload: ParticipantCountPayload) -> Vec<Effect> {
        let Some(role) = self.session.as_ref().map(|s| s.role) else {
            return self.ignore("participant-left");
        };
        let count = payload.participant_count.min(1);
        match (role, self.state) {
            (Role::Owner, CallState::Waiting | CallState::InCall) => {
                match &payload.peer_id {
                    Some(id) => match self.gate.decide(id, false) {
                        Ok(_) => debug!(participant = %id, "pending joiner left"),
                        Err(AdmissionError::NotFound(_)) => {
                            debug!(participant = %id, "departed peer had no pending request")
                        }
                    },
                    // While waiting the only other member can be the pending
                    // joiner, and the gate has a single slot.
                    None if self.state == CallState::Waiting => {
                        let dropped = self.gate.clear();
                        if !dropped.is_empty() {
                            debug!(count = dropped.len(), "pending joiner left without an id");
                        }
                    }
                    None => {}
                }
                let mut effects = self.close_context();
                if let Some(session) = self.session.as_mut() {
                    session.participant_count = count;
                    session.remote_peer = None;
                }
                effects.push(Effect::Notify(CallNotice::ParticipantCount(count)));
                if self.state != CallState::Waiting {
                    info!("remote participant left, waiting for someone new");
                    effects.push(self.transition(CallState::Waiting));
                }
                effects
            }
            (Role::Joiner, CallState::InCall) => {
                info!("owner left the call");
                let mut effects = self.close_context();
                if let Some(session) = self.session.as_mut() {
                    session.participant_count = count;
                    session.remote_peer = None;
                }
                self.next_timer += 1;
                let token = self.next_timer;
                self.grace_token = Some(token);
                effects.push(Effect::Notify(CallNotice::ParticipantCount(count)));
                effects.push(Effect::Notify(CallNotice::Error(CallError::RemoteLeft)));
                effects.push(Effect::StartGraceTimer {
                    token,
                    delay: self.options.leave_grace,
                });
                effects
            }
            (Role::Joiner, CallState::WaitingApproval) => self.fail(CallError::RemoteLeft, false),
            _ => self.ignore("participant-left"),
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> Vec<Effect> {
        if self.current_epoch() != Some(event.epoch) {
            debug!(epoch = event.epoch, "discarding event from retired transport");
            return Vec::new();
        }
        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                let Some(session) = &self.session else {
                    return Vec::new();
                };
                vec![Effect::Send(ClientMessage::SendIceCandidate(
                    CandidatePayload {
                        code: session.code.clone(),
                        candidate,
                        from: self.local_id.clone(),
                    },
                ))]
            }
            TransportEventKind::Connectivity(state) => {
                debug!(epoch = event.epoch, ?state, "connectivity changed");
                let mut effects = vec![Effect::Notify(CallNotice::Connectivity(state))];
                if state.is_terminal_failure() {
                    warn!(epoch = event.epoch, "peer connection failed");
                    effects.extend(self.fail(CallError::ConnectionFailed, true));
                }
                effects
            }
            TransportEventKind::RemoteMedia(track) => {
                vec![Effect::Notify(CallNotice::RemoteMedia(track))]
            }
        }
    }

    fn enter_call(&mut self, count: u8, remote: Option<PeerId>) -> Vec<Effect> {
        if let Some(session) = self.session.as_mut() {
            session.participant_count = count;
            if remote.is_some() {
                session.remote_peer = remote;
            }
        }
        vec![
            self.transition(CallState::InCall),
            Effect::Notify(CallNotice::ParticipantCount(count)),
        ]
    }

    fn open_context(&mut self, role: NegotiationRole) -> Vec<Effect> {
        let mut effects = self.close_context();
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let remote = self.session.as_ref().and_then(|s| s.remote_peer.clone());
        let mut coord = NegotiationCoordinator::new(epoch, self.local_id.clone(), remote, role);
        effects.push(Effect::OpenTransport {
            epoch,
            media: self.media.filter(|slot| slot.granted).map(|slot| slot.request),
        });
        let initial = if role == NegotiationRole::Offerer {
            coord.initiate_offer()
        } else {
            Vec::new()
        };
        self.negotiation = Some(coord);
        effects.extend(self.wrap(epoch, initial));
        effects
    }

    fn close_context(&mut self) -> Vec<Effect> {
        match self.negotiation.take() {
            Some(mut coord) => {
                let epoch = coord.epoch();
                let actions = coord.close();
                self.wrap(epoch, actions)
            }
            None => Vec::new(),
        }
    }

    fn current_epoch(&self) -> Option<u64> {
        self.negotiation.as_ref().map(NegotiationCoordinator::epoch)
    }

    fn negotiate<F>(&mut self, epoch: Option<u64>, step: F) -> Vec<Effect>
    where
        F: FnOnce(&mut NegotiationCoordinator) -> Vec<NegotiationAction>,
    {
        let Some(coord) = self
            .negotiation
            .as_mut()
            .filter(|coord| Some(coord.epoch()) == epoch)
        else {
            debug!(?epoch, "no negotiation context for signal, discarding");
            return Vec::new();
        };
        let actions = step(coord);
        let epoch = coord.epoch();
        self.wrap(epoch, actions)
    }

    fn wrap(&self, epoch: u64, actions: Vec<NegotiationAction>) -> Vec<Effect> {
        let code = self.session.as_ref().map(|s| s.code.clone());
        actions
            .into_iter()
            .filter_map(|action| match action {
                NegotiationAction::Transport(command) => Some(Effect::Transport { epoch, command }),
                NegotiationAction::SendOffer(description) => {
                    code.clone().map(|code| {
                        Effect::Send(ClientMessage::SendOffer(DescriptionPayload {
                            code,
                            description,
                            from: self.local_id.clone(),
                        }))
                    })
                }
                NegotiationAction::SendAnswer(description) => {
                    code.clone().map(|code| {
                        Effect::Send(ClientMessage::SendAnswer(DescriptionPayload {
                            code,
                            description,
                            from: self.local_id.clone(),
                        }))
                    })
                }
            })
            .collect()
    }

    fn signal_matches(&self, code: &CallCode) -> bool {
        self.state == CallState::InCall
            && self.session.as_ref().is_some_and(|s| &s.code == code)
    }

    fn registry_failure(&mut self, event: &'static str, error: CallError) -> Vec<Effect> {
        match self.state {
            CallState::Creating | CallState::Joining | CallState::WaitingApproval => {
                warn!(event, error = %error, "registry refused request");
                self.fail(error, false)
            }
            _ => {
                if event == "registry-error" {
                    warn!(event, error = %error, "registry error outside of a request");
                }
                self.ignore(event)
            }
        }
    }

    fn fail(&mut self, error: CallError, notify_registry: bool) -> Vec<Effect> {
        let mut effects = self.teardown(notify_registry);
        self.last_error = Some(error.clone());
        // The cause is reported ahead of the transition back to idle.
        let at = effects.len().saturating_sub(1);
        effects.insert(at, Effect::Notify(CallNotice::Error(error)));
        effects
    }

    /// Shared by leave and every error path.
    fn teardown(&mut self, notify_registry: bool) -> Vec<Effect> {
        if self.state == CallState::Idle {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if let Some((request, sent)) = self.request.take() {
            if sent {
                self.abandoned = Some(request);
            }
        }
        if let Some(session) = self.session.take() {
            if notify_registry {
                effects.push(Effect::Send(ClientMessage::LeaveCall(CodePayload {
                    code: session.code,
                })));
            }
        }
        let dropped = self.gate.clear();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropping pending join requests");
        }
        effects.extend(self.close_context());
        if let Some(slot) = self.media.take() {
            effects.push(Effect::ReleaseMedia {
                request: slot.request,
            });
        }
        self.grace_token = None;
        effects.push(self.transition(CallState::Idle));
        effects
    }

    fn transition(&mut self, state: CallState) -> Effect {
        debug!(from = ?self.state, to = ?state, "call state transition");
        self.state = state;
        Effect::Notify(CallNotice::StateChanged(state))
    }

    fn ignore(&self, event: &'static str) -> Vec<Effect> {
        debug!(event, state = ?self.state, "ignoring relay message");
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IceCandidate, ParticipantPayload, RejectedPayload};

    fn code() -> CallCode {
        CallCode::parse("AB12CD").unwrap()
    }

    fn controller(id: &str, admission_control: bool) -> CallSessionController {
        CallSessionController::new(
            PeerId::new(id),
            SessionOptions {
                admission_control,
                leave_grace: Duration::from_millis(50),
            },
        )
    }

    fn sent(effects: &[Effect]) -> Vec<&ClientMessage> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Send(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn commands(effects: &[Effect]) -> Vec<&TransportCommand> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Transport { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    fn media_request(effects: &[Effect]) -> u64 {
        effects
            .iter()
            .find_map(|effect| match effect {
                Effect::AcquireMedia { request } => Some(*request),
                _ => None,
            })
            .expect("media request")
    }

    fn offer_ticket(effects: &[Effect]) -> Ticket {
        commands(effects)
            .into_iter()
            .find_map(|command| match command {
                TransportCommand::CreateOffer(ticket) => Some(*ticket),
                _ => None,
            })
            .expect("offer request")
    }

    fn relay(message: RelayMessage) -> Event {
        Event::Relay(message)
    }

    fn waiting_owner(admission_control: bool) -> CallSessionController {
        let mut owner = controller("owner", admission_control);
        let request = media_request(&owner.create_call().unwrap());
        owner.handle(Event::MediaGranted { request });
        owner.handle(relay(RelayMessage::CallCreated(CodePayload { code: code() })));
        assert_eq!(owner.state(), CallState::Waiting);
        owner
    }

    fn in_call_owner() -> CallSessionController {
        let mut owner = waiting_owner(false);
        owner.handle(relay(RelayMessage::ParticipantJoined(ParticipantCountPayload {
            participant_count: 2,
            peer_id: Some(PeerId::new("joiner")),
        })));
        owner
    }

    fn in_call_joiner() -> CallSessionController {
        let mut joiner = controller("joiner", false);
        let request = media_request(&joiner.join_call("ab12cd").unwrap());
        joiner.handle(Event::MediaGranted { request });
        joiner.handle(relay(RelayMessage::CallJoined(CallJoinedPayload {
            participant_count: 2,
            awaiting_approval: false,
            peer_id: Some(PeerId::new("owner")),
        })));
        joiner
    }

    #[test_timeout::timeout]
    fn malformed_code_fails_fast_without_effects() {
        let mut joiner = controller("joiner", false);
        let err = joiner.join_call("AB-12").unwrap_err();
        assert_eq!(err, CallError::InvalidCode("AB-12".into()));
        assert_eq!(joiner.state(), CallState::Idle);
    }

    #[test_timeout::timeout]
    fn create_sends_request_only_after_media_grant() {
        let mut owner = controller("owner", true);
        let effects = owner.create_call().unwrap();
        assert!(sent(&effects).is_empty());
        assert_eq!(owner.state(), CallState::Creating);

        let effects = owner.handle(Event::MediaGranted {
            request: media_request(&effects),
        });
        assert_eq!(
            sent(&effects),
            vec![&ClientMessage::CreateCall(CreateCallPayload {
                peer_id: PeerId::new("owner"),
                admission_control: true,
            })]
        );

        let effects = owner.handle(relay(RelayMessage::CallCreated(CodePayload { code: code() })));
        assert!(effects.contains(&Effect::Notify(CallNotice::CallCode(code()))));
        let session = owner.session().unwrap();
        assert_eq!(session.role, Role::Owner);
        assert_eq!(session.participant_count, 1);
        assert_eq!(owner.create_call().unwrap_err(), CallError::AlreadyActive);
    }

    #[test_timeout::timeout]
    fn join_unknown_code_returns_to_idle_without_leave() {
        let mut joiner = controller("joiner", false);
        let request = media_request(&joiner.join_call("zz99zz").unwrap());
        let effects = joiner.handle(Event::MediaGranted { request });
        assert!(matches!(
            sent(&effects)[..],
            [ClientMessage::JoinCall(JoinCallPayload { code, .. })] if code.as_str() == "ZZ99ZZ"
        ));

        let effects = joiner.handle(relay(RelayMessage::CallNotFound));
        assert!(sent(&effects).is_empty());
        assert!(effects.contains(&Effect::ReleaseMedia { request }));
        assert!(effects.contains(&Effect::Notify(CallNotice::Error(CallError::NotFound))));
        assert_eq!(joiner.state(), CallState::Idle);
        assert_eq!(joiner.last_error(), Some(&CallError::NotFound));
    }

    #[test_timeout::timeout]
    fn owner_offers_when_participant_joins() {
        let mut owner = waiting_owner(false);
        let effects = owner.handle(relay(RelayMessage::ParticipantJoined(
            ParticipantCountPayload {
                participant_count: 2,
                peer_id: Some(PeerId::new("joiner")),
            },
        )));
        assert_eq!(owner.state(), CallState::InCall);
        assert!(effects.contains(&Effect::OpenTransport {
            epoch: 1,
            media: Some(1)
        }));
        let ticket = offer_ticket(&effects);

        let effects = owner.handle(Event::OfferCreated {
            ticket,
            description: SessionDescription::offer("v=0 owner"),
        });
        assert!(matches!(
            sent(&effects)[..],
            [ClientMessage::SendOffer(DescriptionPayload { from, .. })] if from.as_str() == "owner"
        ));

        // Duplicate delivery of the join does not start a second negotiation.
        let effects = owner.handle(relay(RelayMessage::ParticipantJoined(
            ParticipantCountPayload {
                participant_count: 2,
                peer_id: Some(PeerId::new("joiner")),
            },
        )));
        assert!(effects.is_empty());
        assert_eq!(owner.negotiation().unwrap().epoch(), 1);
    }

    #[test_timeout::timeout]
    fn joiner_answers_and_flushes_early_candidates() {
        let mut joiner = in_call_joiner();
        assert_eq!(joiner.state(), CallState::InCall);
        let owner = PeerId::new("owner");
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        let effects = joiner.handle(relay(RelayMessage::ReceiveIceCandidate(CandidatePayload {
            code: code(),
            candidate: candidate.clone(),
            from: owner.clone(),
        })));
        assert!(effects.is_empty());

        let effects = joiner.handle(relay(RelayMessage::ReceiveOffer(DescriptionPayload {
            code: code(),
            description: SessionDescription::offer("v=0 owner"),
            from: owner,
        })));
        let ticket = commands(&effects)
            .into_iter()
            .find_map(|command| match command {
                TransportCommand::CreateAnswer(ticket) => Some(*ticket),
                _ => None,
            })
            .unwrap();
        let effects = joiner.handle(Event::AnswerCreated {
            ticket,
            description: SessionDescription::answer("v=0 joiner"),
        });
        assert_eq!(sent(&effects).len(), 1);
        assert!(commands(&effects).contains(&&TransportCommand::AddCandidate(candidate)));
    }

    #[test_timeout::timeout]
    fn admission_second_request_is_busy_and_first_is_admitted() {
        let mut owner = waiting_owner(true);
        let first = PeerId::new("first");
        let second = PeerId::new("second");

        let effects = owner.handle(relay(RelayMessage::ParticipantWaiting(ParticipantPayload {
            participant_id: first.clone(),
        })));
        assert_eq!(
            effects,
            vec![Effect::Notify(CallNotice::AdmissionRequested(first.clone()))]
        );
        let effects = owner.handle(relay(RelayMessage::ParticipantWaiting(ParticipantPayload {
            participant_id: first.clone(),
        })));
        assert!(effects.is_empty());

        let effects = owner.handle(relay(RelayMessage::ParticipantWaiting(ParticipantPayload {
            participant_id: second.clone(),
        })));
        assert_eq!(
            sent(&effects),
            vec![&ClientMessage::AdmitParticipant(AdmitPayload {
                code: code(),
                participant_id: second,
                accept: false,
                reason: Some(RejectReason::Busy),
            })]
        );

        let effects = owner.admit_or_reject(&first, true).unwrap();
        assert_eq!(owner.state(), CallState::InCall);
        assert_eq!(owner.session().unwrap().participant_count, 2);
        assert!(owner.admission().is_empty());
        offer_ticket(&effects);
    }

    #[test_timeout::timeout]
    fn reject_keeps_owner_waiting_and_unknown_decision_is_benign() {
        let mut owner = waiting_owner(true);
        let guest = PeerId::new("guest");
        owner.handle(relay(RelayMessage::ParticipantWaiting(ParticipantPayload {
            participant_id: guest.clone(),
        })));
        let effects = owner.admit_or_reject(&guest, false).unwrap();
        assert_eq!(sent(&effects).len(), 1);
        assert_eq!(owner.state(), CallState::Waiting);
        assert!(owner.admit_or_reject(&guest, true).unwrap().is_empty());

        let mut joiner = in_call_joiner();
        assert_eq!(
            joiner.admit_or_reject(&guest, true).unwrap_err(),
            CallError::NotOwner
        );
    }

    #[test_timeout::timeout]
    fn joiner_waits_for_approval_then_sees_rejection() {
        let mut joiner = controller("joiner", false);
        let request = media_request(&joiner.join_call("AB12CD").unwrap());
        joiner.handle(Event::MediaGranted { request });
        joiner.handle(relay(RelayMessage::CallJoined(CallJoinedPayload {
            participant_count: 1,
            awaiting_approval: true,
            peer_id: None,
        })));
        assert_eq!(joiner.state(), CallState::WaitingApproval);

        let effects = joiner.handle(relay(RelayMessage::ParticipantRejected(RejectedPayload {
            participant_id: PeerId::new("joiner"),
            reason: RejectReason::Busy,
        })));
        assert!(effects.contains(&Effect::Notify(CallNotice::Error(CallError::Busy))));
        assert_eq!(joiner.state(), CallState::Idle);
    }

    #[test_timeout::timeout]
    fn leave_is_idempotent_and_sends_one_leave() {
        let mut idle = controller("owner", false);
        assert!(idle.leave_call().is_empty());

        let mut owner = in_call_owner();
        let effects = owner.leave_call();
        assert_eq!(
            sent(&effects),
            vec![&ClientMessage::LeaveCall(CodePayload { code: code() })]
        );
        assert!(commands(&effects).contains(&&TransportCommand::Close));
        assert!(effects.contains(&Effect::ReleaseMedia { request: 1 }));
        assert!(owner.leave_call().is_empty());
        assert_eq!(owner.state(), CallState::Idle);
    }

    #[test_timeout::timeout]
    fn late_grant_and_late_creation_are_cleaned_up() {
        let mut owner = controller("owner", false);
        let request = media_request(&owner.create_call().unwrap());
        owner.leave_call();
        assert_eq!(
            owner.handle(Event::MediaGranted { request }),
            vec![Effect::ReleaseMedia { request }]
        );

        let request = media_request(&owner.create_call().unwrap());
        owner.handle(Event::MediaGranted { request });
        owner.leave_call();
        let effects = owner.handle(relay(RelayMessage::CallCreated(CodePayload { code: code() })));
        assert_eq!(
            effects,
            vec![Effect::Send(ClientMessage::LeaveCall(CodePayload { code: code() }))]
        );
        assert_eq!(owner.state(), CallState::Idle);
        assert!(owner.session().is_none());
    }

    #[test_timeout::timeout]
    fn owner_returns_to_waiting_when_participant_leaves() {
        let mut owner = in_call_owner();
        let effects = owner.handle(relay(RelayMessage::ParticipantLeft(ParticipantCountPayload {
            participant_count: 1,
            peer_id: Some(PeerId::new("joiner")),
        })));
        assert!(commands(&effects).contains(&&TransportCommand::Close));
        assert!(sent(&effects).is_empty());
        assert_eq!(owner.state(), CallState::Waiting);
        assert!(owner.negotiation().is_none());
        assert_eq!(owner.session().unwrap().participant_count, 1);
    }

    #[test_timeout::timeout]
    fn joiner_tears_down_transport_now_and_leaves_after_grace() {
        let mut joiner = in_call_joiner();
        let effects = joiner.handle(relay(RelayMessage::ParticipantLeft(ParticipantCountPayload {
            participant_count: 1,
            peer_id: Some(PeerId::new("owner")),
        })));
        assert!(commands(&effects).contains(&&TransportCommand::Close));
        let token = effects
            .iter()
            .find_map(|effect| match effect {
                Effect::StartGraceTimer { token, .. } => Some(*token),
                _ => None,
            })
            .unwrap();
        assert_eq!(joiner.state(), CallState::InCall);

        assert!(joiner.handle(Event::GraceElapsed { token: token + 1 }).is_empty());
        let effects = joiner.handle(Event::GraceElapsed { token });
        assert!(sent(&effects).is_empty());
        assert_eq!(joiner.state(), CallState::Idle);
    }

    #[test_timeout::timeout]
    fn connectivity_failure_surfaces_and_tears_down() {
        let mut joiner = in_call_joiner();
        let epoch = joiner.negotiation().unwrap().epoch();
        let effects = joiner.handle(Event::Transport(TransportEvent {
            epoch,
            kind: TransportEventKind::Connectivity(ConnectivityState::Failed),
        }));
        assert!(effects.contains(&Effect::Notify(CallNotice::Error(CallError::ConnectionFailed))));
        assert_eq!(sent(&effects).len(), 1);
        assert_eq!(joiner.state(), CallState::Idle);
    }

    #[test_timeout::timeout]
    fn events_from_retired_transport_are_ignored() {
        let mut owner = in_call_owner();
        let stale = owner.negotiation().unwrap().epoch();
        owner.handle(relay(RelayMessage::ParticipantLeft(ParticipantCountPayload {
            participant_count: 1,
            peer_id: None,
        })));
        owner.handle(relay(RelayMessage::ParticipantJoined(ParticipantCountPayload {
            participant_count: 2,
            peer_id: Some(PeerId::new("second")),
        })));
        assert_ne!(owner.negotiation().unwrap().epoch(), stale);

        let effects = owner.handle(Event::Transport(TransportEvent {
            epoch: stale,
            kind: TransportEventKind::Connectivity(ConnectivityState::Failed),
        }));
        assert!(effects.is_empty());
        assert_eq!(owner.state(), CallState::InCall);
    }

    #[test_timeout::timeout]
    fn local_candidates_are_forwarded_to_the_relay() {
        let mut owner = in_call_owner();
        let epoch = owner.negotiation().unwrap().epoch();
        let candidate = IceCandidate::new("candidate:9 1 udp 1 192.168.1.9 6000 typ host");
        let effects = owner.handle(Event::Transport(TransportEvent {
            epoch,
            kind: TransportEventKind::LocalCandidate(candidate.clone()),
        }));
        assert_eq!(
            sent(&effects),
            vec![&ClientMessage::SendIceCandidate(CandidatePayload {
                code: code(),
                candidate,
                from: PeerId::new("owner"),
            })]
        );
    }

    #[test_timeout::timeout]
    fn media_denial_is_fatal_to_starting() {
        let mut owner = controller("owner", false);
        let request = media_request(&owner.create_call().unwrap());
        let effects = owner.handle(Event::MediaDenied {
            request,
            reason: "permission denied".into(),
        });
        assert!(sent(&effects).is_empty());
        assert_eq!(owner.state(), CallState::Idle);
        assert_eq!(
            owner.last_error(),
            Some(&CallError::Media("permission denied".into()))
        );
    }

    #[test_timeout::timeout]
    fn pending_joiner_leaving_without_id_frees_the_slot() {
        let mut owner = waiting_owner(true);
        owner.handle(relay(RelayMessage::ParticipantWaiting(ParticipantPayload {
            participant_id: PeerId::new("a"),
        })));
        owner.handle(relay(RelayMessage::ParticipantLeft(ParticipantCountPayload {
            participant_count: 1,
            peer_id: None,
        })));
        assert!(owner.admission().is_empty());
        assert_eq!(owner.state(), CallState::Waiting);

        let effects = owner.handle(relay(RelayMessage::ParticipantWaiting(ParticipantPayload {
            participant_id: PeerId::new("b"),
        })));
        assert_eq!(
            effects,
            vec![Effect::Notify(CallNotice::AdmissionRequested(PeerId::new("b")))]
        );
    }

    #[test_timeout::timeout]
    fn departure_of_a_stranger_keeps_the_pending_request() {
        let mut owner = waiting_owner(true);
        owner.handle(relay(RelayMessage::ParticipantWaiting(ParticipantPayload {
            participant_id: PeerId::new("a"),
        })));
        owner.handle(relay(RelayMessage::ParticipantLeft(ParticipantCountPayload {
            participant_count: 1,
            peer_id: Some(PeerId::new("someone-else")),
        })));
        let pending: Vec<_> = owner
            .admission()
            .pending()
            .map(|request| request.participant_id.clone())
            .collect();
        assert_eq!(pending, vec![PeerId::new("a")]);
    }
}
