//! Two-party call sessions keyed by a six-character rendezvous code.
//!
//! The crate is split into a pure core and an async shell:
//!
//! * [`controller::CallSessionController`] tracks call identity, role and
//!   participant count, and routes relay traffic.
//! * [`negotiation::NegotiationCoordinator`] runs the offer/answer exchange
//!   for one remote peer, resolving glare and buffering early candidates.
//! * [`admission::AdmissionGate`] holds the owner's single pending join
//!   request.
//! * [`runtime::CallRuntime`] executes the effects the core asks for against
//!   the collaborators in [`transport`].
//!
//! [`relay::LocalRelay`] implements the registry side in memory for tests and
//! local demos.

pub mod admission;
pub mod code;
pub mod config;
pub mod controller;
pub mod error;
pub mod negotiation;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod transport;

pub use admission::{AdmissionError, AdmissionGate, EntryOutcome, PendingJoinRequest};
pub use code::CallCode;
pub use config::CallConfig;
pub use controller::{
    CallNotice, CallSession, CallSessionController, CallState, Effect, Event, Role,
    SessionOptions,
};
pub use error::{CallError, ErrorKind};
pub use negotiation::{DescriptionState, NegotiationCoordinator, NegotiationRole};
pub use protocol::{ClientMessage, IceCandidate, PeerId, RelayMessage, SessionDescription};
pub use relay::{LocalRelay, LocalSignaling};
pub use runtime::{CallHandle, CallRuntime, CallSnapshot, Collaborators, RuntimeError};
pub use transport::{
    ConnectivityState, MediaSource, MediaStream, PeerTransport, PeerTransportFactory,
    RemoteTrack, SignalingChannel, TrackKind, TransportEvents,
};
