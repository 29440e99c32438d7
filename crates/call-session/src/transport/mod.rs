//! Seams between the call runtime and the outside world.
//!
//! The runtime only ever speaks to these traits. `call-webrtc` provides the
//! production implementations; [`mock`] provides recording doubles for tests.

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, IceCandidate, ProtocolError, RelayMessage, SessionDescription};

pub mod mock;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("relay connection failed: {0}")]
    Connect(String),
    #[error("relay channel closed")]
    Closed,
    #[error("relay subscription already taken")]
    AlreadySubscribed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture permission denied")]
    Denied,
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

/// Connection to the rendezvous relay. Delivery is at-least-once and ordered
/// per peer; the runtime tolerates duplicates.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<(), SignalingError>;

    /// Hands out the single stream of inbound relay messages.
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<RelayMessage>, SignalingError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    async fn rollback(&self) -> Result<(), TransportError>;
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn open(
        &self,
        media: Option<Arc<dyn MediaStream>>,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// A granted local capture. Dropping the last handle does not release the
/// device; call [`MediaStream::stop`].
pub trait MediaStream: Send + Sync + fmt::Debug {
    fn track_count(&self) -> usize;
    fn stop(&self);
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn MediaStream>, MediaError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, ConnectivityState::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEventKind {
    LocalCandidate(IceCandidate),
    Connectivity(ConnectivityState),
    RemoteMedia(RemoteTrack),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    pub epoch: u64,
    pub kind: TransportEventKind,
}

/// Event sink handed to a transport when it is opened. Every event is tagged
/// with the epoch of the negotiation context that owns the transport, so
/// events from a torn-down transport can be recognised and dropped.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl TransportEvents {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn candidate(&self, candidate: IceCandidate) {
        self.emit(TransportEventKind::LocalCandidate(candidate));
    }

    pub fn connectivity(&self, state: ConnectivityState) {
        self.emit(TransportEventKind::Connectivity(state));
    }

    pub fn remote_media(&self, track: RemoteTrack) {
        self.emit(TransportEventKind::RemoteMedia(track));
    }

    fn emit(&self, kind: TransportEventKind) {
        // Receiver gone means the runtime shut down; nothing left to notify.
        let _ = self.tx.send(TransportEvent {
            epoch: self.epoch,
            kind,
        });
    }
}
