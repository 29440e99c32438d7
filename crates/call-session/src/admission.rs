use std::collections::HashMap;
use thiserror::Error;

use crate::protocol::PeerId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingJoinRequest {
    pub participant_id: PeerId,
}

/// Outcome of [`AdmissionGate::request_entry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryOutcome {
    /// First request from this participant; the owner should be asked.
    Queued,
    /// Repeat delivery for a participant already pending; the owner was
    /// already asked.
    Replaced,
    /// Another participant holds the slot.
    Busy,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("no pending join request from {0}")]
    NotFound(PeerId),
}

/// Owner-side approval queue with room for a single outstanding request.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    pending: HashMap<PeerId, PendingJoinRequest>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_entry(&mut self, participant_id: PeerId) -> EntryOutcome {
        if self.pending.contains_key(&participant_id) {
            self.pending.insert(
                participant_id.clone(),
                PendingJoinRequest { participant_id },
            );
            return EntryOutcome::Replaced;
        }
        if !self.pending.is_empty() {
            return EntryOutcome::Busy;
        }
        self.pending.insert(
            participant_id.clone(),
            PendingJoinRequest { participant_id },
        );
        EntryOutcome::Queued
    }

    /// Resolve a pending request. `accept` is carried by the caller; the gate
    /// only cares that the request leaves the queue either way.
    pub fn decide(
        &mut self,
        participant_id: &PeerId,
        accept: bool,
    ) -> Result<PendingJoinRequest, AdmissionError> {
        let request = self
            .pending
            .remove(participant_id)
            .ok_or_else(|| AdmissionError::NotFound(participant_id.clone()))?;
        tracing::debug!(participant = %participant_id, accept, "join request decided");
        Ok(request)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingJoinRequest> {
        self.pending.values()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending request, returning the identifiers that were waiting.
    pub fn clear(&mut self) -> Vec<PeerId> {
        self.pending.drain().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::new(id)
    }

    #[test_timeout::timeout]
    fn duplicate_request_replaces_instead_of_accumulating() {
        let mut gate = AdmissionGate::new();
        assert_eq!(gate.request_entry(peer("a")), EntryOutcome::Queued);
        assert_eq!(gate.request_entry(peer("a")), EntryOutcome::Replaced);
        assert_eq!(gate.pending().count(), 1);
    }

    #[test_timeout::timeout]
    fn second_participant_is_busy_and_first_survives() {
        let mut gate = AdmissionGate::new();
        gate.request_entry(peer("a"));
        assert_eq!(gate.request_entry(peer("b")), EntryOutcome::Busy);
        let ids: Vec<_> = gate.pending().map(|r| r.participant_id.clone()).collect();
        assert_eq!(ids, vec![peer("a")]);
    }

    #[test_timeout::timeout]
    fn decide_removes_and_unknown_is_not_found() {
        let mut gate = AdmissionGate::new();
        gate.request_entry(peer("a"));
        let request = gate.decide(&peer("a"), true).expect("pending");
        assert_eq!(request.participant_id, peer("a"));
        assert!(gate.is_empty());
        assert_eq!(
            gate.decide(&peer("a"), false),
            Err(AdmissionError::NotFound(peer("a")))
        );
    }

    #[test_timeout::timeout]
    fn slot_frees_after_decision() {
        let mut gate = AdmissionGate::new();
        gate.request_entry(peer("a"));
        gate.decide(&peer("a"), false).unwrap();
        assert_eq!(gate.request_entry(peer("b")), EntryOutcome::Queued);
        assert_eq!(gate.clear(), vec![peer("b")]);
        assert!(gate.is_empty());
    }
}
