//! In-memory rendezvous registry and relay.
//!
//! [`LocalRelay`] plays the server side of the call protocol inside one
//! process: it hands out codes, tracks who is in which call, routes admission
//! decisions and forwards descriptions and candidates between the two
//! members. Each client attaches through [`LocalRelay::connect`].

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::code::CallCode;
use crate::protocol::{
    AdmitPayload, CallJoinedPayload, ClientMessage, CodePayload, ParticipantCountPayload,
    ParticipantPayload, PeerId, RegistryErrorPayload, RejectReason, RejectedPayload, RelayMessage,
    MAX_PARTICIPANTS,
};
use crate::transport::{SignalingChannel, SignalingError};

const DEFAULT_CALL_LIMIT: usize = 1024;
const CODE_ATTEMPTS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallInfo {
    pub code: CallCode,
    pub owner: PeerId,
    pub admission_control: bool,
    pub participant_count: u8,
    pub pending: Vec<PeerId>,
}

#[derive(Debug)]
struct CallEntry {
    owner: PeerId,
    admission_control: bool,
    participant: Option<PeerId>,
    pending: Vec<PeerId>,
}

impl CallEntry {
    fn count(&self) -> u8 {
        1 + u8::from(self.participant.is_some())
    }

    fn peer_of(&self, sender: &PeerId) -> Option<&PeerId> {
        if *sender == self.owner {
            self.participant.as_ref()
        } else if self.participant.as_ref() == Some(sender) {
            Some(&self.owner)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct RelayState {
    rng: StdRng,
    limit: usize,
    peers: HashMap<PeerId, mpsc::UnboundedSender<RelayMessage>>,
    calls: HashMap<CallCode, CallEntry>,
}

impl RelayState {
    fn deliver(&self, to: &PeerId, message: RelayMessage) {
        match self.peers.get(to) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!(peer = %to, "peer receiver dropped");
                }
            }
            None => debug!(peer = %to, event = message.event_name(), "peer not connected"),
        }
    }

    fn allocate_code(&mut self) -> Option<CallCode> {
        if self.calls.len() >= self.limit {
            return None;
        }
        (0..CODE_ATTEMPTS)
            .map(|_| CallCode::generate(&mut self.rng))
            .find(|code| !self.calls.contains_key(code))
    }

    fn handle(&mut self, sender: &PeerId, message: ClientMessage) {
        match message {
            ClientMessage::CreateCall(payload) => {
                let Some(code) = self.allocate_code() else {
                    warn!(limit = self.limit, "no call codes available");
                    self.deliver(
                        sender,
                        RelayMessage::RegistryError(RegistryErrorPayload {
                            reason: "no call codes available".into(),
                        }),
                    );
                    return;
                };
                info!(code = %code, owner = %sender, admission = payload.admission_control, "call created");
                self.calls.insert(
                    code.clone(),
                    CallEntry {
                        owner: sender.clone(),
                        admission_control: payload.admission_control,
                        participant: None,
                        pending: Vec::new(),
                    },
                );
                self.deliver(sender, RelayMessage::CallCreated(CodePayload { code }));
            }
            ClientMessage::JoinCall(payload) => self.join(sender, payload.code),
            ClientMessage::AdmitParticipant(payload) => self.admit(sender, payload),
            ClientMessage::SendOffer(payload) => {
                self.forward(sender, &payload.code.clone(), RelayMessage::ReceiveOffer(payload))
            }
            ClientMessage::SendAnswer(payload) => {
                self.forward(sender, &payload.code.clone(), RelayMessage::ReceiveAnswer(payload))
            }
            ClientMessage::SendIceCandidate(payload) => self.forward(
                sender,
                &payload.code.clone(),
                RelayMessage::ReceiveIceCandidate(payload),
            ),
            ClientMessage::LeaveCall(CodePayload { code }) => self.leave(sender, &code),
        }
    }

    fn join(&mut self, sender: &PeerId, code: CallCode) {
        let Some(entry) = self.calls.get_mut(&code) else {
            debug!(code = %code, peer = %sender, "join for unknown code");
            self.deliver(sender, RelayMessage::CallNotFound);
            return;
        };
        if entry.owner == *sender || entry.participant.as_ref() == Some(sender) {
            debug!(code = %code, peer = %sender, "duplicate join ignored");
            return;
        }
        if entry.count() >= MAX_PARTICIPANTS {
            self.deliver(sender, RelayMessage::CallFull);
            return;
        }
        let owner = entry.owner.clone();
        if entry.admission_control {
            if !entry.pending.contains(sender) {
                entry.pending.push(sender.clone());
            }
            self.deliver(
                &owner,
                RelayMessage::ParticipantWaiting(ParticipantPayload {
                    participant_id: sender.clone(),
                }),
            );
            self.deliver(
                sender,
                RelayMessage::CallJoined(CallJoinedPayload {
                    participant_count: 1,
                    awaiting_approval: true,
                    peer_id: Some(owner),
                }),
            );
            return;
        }
        entry.participant = Some(sender.clone());
        info!(code = %code, peer = %sender, "participant joined");
        self.deliver(
            &owner,
            RelayMessage::ParticipantJoined(ParticipantCountPayload {
                participant_count: MAX_PARTICIPANTS,
                peer_id: Some(sender.clone()),
            }),
        );
        self.deliver(
            sender,
            RelayMessage::CallJoined(CallJoinedPayload {
                participant_count: MAX_PARTICIPANTS,
                awaiting_approval: false,
                peer_id: Some(owner),
            }),
        );
    }

    fn admit(&mut self, sender: &PeerId, payload: AdmitPayload) {
        let Some(entry) = self.calls.get_mut(&payload.code) else {
            return;
        };
        if entry.owner != *sender {
            warn!(code = %payload.code, peer = %sender, "admission decision from non-owner");
            return;
        }
        let Some(position) = entry.pending.iter().position(|id| *id == payload.participant_id)
        else {
            debug!(participant = %payload.participant_id, "decision for participant no longer waiting");
            return;
        };
        let participant = entry.pending.remove(position);
        if payload.accept && entry.participant.is_none() {
            entry.participant = Some(participant.clone());
            info!(code = %payload.code, peer = %participant, "participant admitted");
            self.deliver(
                &participant,
                RelayMessage::ParticipantAccepted(ParticipantPayload {
                    participant_id: participant.clone(),
                }),
            );
        } else {
            let reason = if payload.accept {
                RejectReason::Busy
            } else {
                payload.reason.unwrap_or_default()
            };
            self.deliver(
                &participant,
                RelayMessage::ParticipantRejected(RejectedPayload {
                    participant_id: participant.clone(),
                    reason,
                }),
            );
        }
    }

    fn forward(&self, sender: &PeerId, code: &CallCode, message: RelayMessage) {
        match self.calls.get(code).and_then(|entry| entry.peer_of(sender)) {
            Some(target) => self.deliver(target, message),
            None => debug!(code = %code, peer = %sender, event = message.event_name(), "no peer to forward to"),
        }
    }

    fn leave(&mut self, sender: &PeerId, code: &CallCode) {
        let Some(entry) = self.calls.get_mut(code) else {
            return;
        };
        if entry.owner == *sender {
            if let Some(entry) = self.calls.remove(code) {
                info!(code = %code, "owner left, call destroyed");
                self.notify_destroyed(code, entry);
            }
            return;
        }
        if entry.participant.as_ref() == Some(sender) {
            entry.participant = None;
        } else if let Some(position) = entry.pending.iter().position(|id| id == sender) {
            entry.pending.remove(position);
        } else {
            return;
        }
        let owner = entry.owner.clone();
        let count = entry.count();
        info!(code = %code, peer = %sender, "participant left");
        self.deliver(
            &owner,
            RelayMessage::ParticipantLeft(ParticipantCountPayload {
                participant_count: count,
                peer_id: Some(sender.clone()),
            }),
        );
    }

    fn notify_destroyed(&self, code: &CallCode, entry: CallEntry) {
        for member in entry.participant.iter().chain(entry.pending.iter()) {
            debug!(code = %code, peer = %member, "notifying member of destroyed call");
            self.deliver(
                member,
                RelayMessage::ParticipantLeft(ParticipantCountPayload {
                    participant_count: 1,
                    peer_id: Some(entry.owner.clone()),
                }),
            );
        }
    }

    fn disconnect(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        let memberships: Vec<CallCode> = self
            .calls
            .iter()
            .filter(|(_, entry)| {
                entry.owner == *peer
                    || entry.participant.as_ref() == Some(peer)
                    || entry.pending.contains(peer)
            })
            .map(|(code, _)| code.clone())
            .collect();
        for code in memberships {
            self.leave(peer, &code);
        }
    }
}

/// Shared in-process registry. Clones refer to the same state.
#[derive(Clone, Debug)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::with_limit(DEFAULT_CALL_LIMIT)
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay that refuses to create more than `limit` live calls.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                rng: StdRng::from_entropy(),
                limit,
                peers: HashMap::new(),
                calls: HashMap::new(),
            })),
        }
    }

    /// Attach a client. Replaces any earlier connection for the same peer.
    pub fn connect(&self, peer_id: PeerId) -> LocalSignaling {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().peers.insert(peer_id.clone(), tx);
        LocalSignaling {
            relay: self.clone(),
            peer_id,
            inbound: Mutex::new(Some(rx)),
        }
    }

    pub fn lookup(&self, code: &CallCode) -> Option<CallInfo> {
        let state = self.state.lock();
        state.calls.get(code).map(|entry| CallInfo {
            code: code.clone(),
            owner: entry.owner.clone(),
            admission_control: entry.admission_control,
            participant_count: entry.count(),
            pending: entry.pending.clone(),
        })
    }

    /// Remove a call regardless of who is in it. Members are told the owner
    /// left.
    pub fn destroy(&self, code: &CallCode) -> bool {
        let mut state = self.state.lock();
        match state.calls.remove(code) {
            Some(entry) => {
                info!(code = %code, "call destroyed");
                state.notify_destroyed(code, entry);
                true
            }
            None => false,
        }
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    fn submit(&self, sender: &PeerId, message: ClientMessage) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if !state.peers.contains_key(sender) {
            return Err(SignalingError::Closed);
        }
        state.handle(sender, message);
        Ok(())
    }
}

/// One client's connection to a [`LocalRelay`]. Dropping it counts as
/// leaving every call the peer belongs to.
#[derive(Debug)]
pub struct LocalSignaling {
    relay: LocalRelay,
    peer_id: PeerId,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<RelayMessage>>>,
}

impl LocalSignaling {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

#[async_trait]
impl SignalingChannel for LocalSignaling {
    async fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.relay.submit(&self.peer_id, message)
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RelayMessage>, SignalingError> {
        self.inbound
            .lock()
            .take()
            .ok_or(SignalingError::AlreadySubscribed)
    }
}

impl Drop for LocalSignaling {
    fn drop(&mut self) {
        self.relay.state.lock().disconnect(&self.peer_id);
    }
}
