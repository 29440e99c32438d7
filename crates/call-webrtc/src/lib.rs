//! Production collaborators for `call-session`: WebRTC peer connections,
//! local sample tracks and a WebSocket relay client.

pub mod media;
pub mod signaling;
pub mod transport;

pub use media::{LocalTracks, SilentAudioSource};
pub use signaling::WsSignalingChannel;
pub use transport::{WebRtcPeerTransport, WebRtcTransportFactory};
