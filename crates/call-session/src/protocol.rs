//! Relay message vocabulary.
//!
//! Every frame on the wire is a JSON object `{"event": "...", "payload": {...}}`
//! with camelCase payload keys. Outbound frames are [`ClientMessage`]s, inbound
//! frames are [`RelayMessage`]s; inbound text only reaches the state machine
//! through [`RelayMessage::decode`], which rejects anything outside the closed
//! vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::code::CallCode;

pub const MAX_PARTICIPANTS: u8 = 2;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed relay message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid {event} payload: {reason}")]
    Invalid { event: &'static str, reason: String },
}

/// Opaque participant identifier. Ordering is plain lexicographic string
/// ordering and is what breaks negotiation ties.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network-path candidate in the browser `RTCIceCandidateInit` JSON shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    #[default]
    Declined,
    Busy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallPayload {
    pub peer_id: PeerId,
    #[serde(default)]
    pub admission_control: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCallPayload {
    pub code: CallCode,
    pub peer_id: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmitPayload {
    pub code: CallCode,
    pub participant_id: PeerId,
    pub accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionPayload {
    pub code: CallCode,
    pub description: SessionDescription,
    pub from: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub code: CallCode,
    pub candidate: IceCandidate,
    pub from: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodePayload {
    pub code: CallCode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallJoinedPayload {
    pub participant_count: u8,
    #[serde(default)]
    pub awaiting_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryErrorPayload {
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPayload {
    pub participant_id: PeerId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedPayload {
    pub participant_id: PeerId,
    #[serde(default)]
    pub reason: RejectReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantCountPayload {
    pub participant_count: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

/// Frames sent from a client to the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    CreateCall(CreateCallPayload),
    JoinCall(JoinCallPayload),
    AdmitParticipant(AdmitPayload),
    SendOffer(DescriptionPayload),
    SendAnswer(DescriptionPayload),
    SendIceCandidate(CandidatePayload),
    LeaveCall(CodePayload),
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::CreateCall(_) => "create-call",
            ClientMessage::JoinCall(_) => "join-call",
            ClientMessage::AdmitParticipant(_) => "admit-participant",
            ClientMessage::SendOffer(_) => "send-offer",
            ClientMessage::SendAnswer(_) => "send-answer",
            ClientMessage::SendIceCandidate(_) => "send-ice-candidate",
            ClientMessage::LeaveCall(_) => "leave-call",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames delivered by the relay to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum RelayMessage {
    CallCreated(CodePayload),
    CallJoined(CallJoinedPayload),
    CallNotFound,
    CallFull,
    RegistryError(RegistryErrorPayload),
    ParticipantWaiting(ParticipantPayload),
    ParticipantAccepted(ParticipantPayload),
    ParticipantRejected(RejectedPayload),
    ParticipantJoined(ParticipantCountPayload),
    ParticipantLeft(ParticipantCountPayload),
    ReceiveOffer(DescriptionPayload),
    ReceiveAnswer(DescriptionPayload),
    ReceiveIceCandidate(CandidatePayload),
}

impl RelayMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayMessage::CallCreated(_) => "call-created",
            RelayMessage::CallJoined(_) => "call-joined",
            RelayMessage::CallNotFound => "call-not-found",
            RelayMessage::CallFull => "call-full",
            RelayMessage::RegistryError(_) => "registry-error",
            RelayMessage::ParticipantWaiting(_) => "participant-waiting",
            RelayMessage::ParticipantAccepted(_) => "participant-accepted",
            RelayMessage::ParticipantRejected(_) => "participant-rejected",
            RelayMessage::ParticipantJoined(_) => "participant-joined",
            RelayMessage::ParticipantLeft(_) => "participant-left",
            RelayMessage::ReceiveOffer(_) => "receive-offer",
            RelayMessage::ReceiveAnswer(_) => "receive-answer",
            RelayMessage::ReceiveIceCandidate(_) => "receive-ice-candidate",
        }
    }

    /// Parse and validate one inbound frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let message: RelayMessage = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let event = self.event_name();
        let invalid = |reason: String| ProtocolError::Invalid { event, reason };
        match self {
            RelayMessage::CallJoined(CallJoinedPayload {
                participant_count, ..
            })
            | RelayMessage::ParticipantJoined(ParticipantCountPayload {
                participant_count, ..
            })
            | RelayMessage::ParticipantLeft(ParticipantCountPayload {
                participant_count, ..
            }) if *participant_count > MAX_PARTICIPANTS => Err(invalid(format!(
                "participant count {participant_count} exceeds {MAX_PARTICIPANTS}"
            ))),
            RelayMessage::ReceiveOffer(payload) if payload.description.kind != SdpKind::Offer => {
                Err(invalid("description is not an offer".into()))
            }
            RelayMessage::ReceiveAnswer(payload) if payload.description.kind != SdpKind::Answer => {
                Err(invalid("description is not an answer".into()))
            }
            RelayMessage::ReceiveIceCandidate(payload) if payload.candidate.candidate.is_empty() => {
                Err(invalid("empty candidate".into()))
            }
            _ => Ok(()),
        }
    }
}
