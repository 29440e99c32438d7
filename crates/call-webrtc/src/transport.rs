use std::sync::Arc;

use async_trait::async_trait;
use call_session::protocol::{IceCandidate, SdpKind, SessionDescription};
use call_session::transport::{
    ConnectivityState, MediaStream, PeerTransport, PeerTransportFactory, RemoteTrack, TrackKind,
    TransportError, TransportEvents,
};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::media::LocalTracks;

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Opens one `RTCPeerConnection` per negotiation context.
pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }

    pub async fn open_peer(
        &self,
        media: Option<Arc<dyn MediaStream>>,
        events: TransportEvents,
    ) -> Result<Arc<WebRtcPeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: if self.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: self.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let epoch = events.epoch();
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        match media.as_deref().map(|stream| stream.as_any().downcast_ref::<LocalTracks>()) {
            Some(Some(local)) => {
                for track in local.tracks() {
                    let track: Arc<dyn TrackLocal + Send + Sync> = track;
                    pc.add_track(track).await.map_err(to_setup_error)?;
                }
            }
            Some(None) => tracing::warn!(
                target = "webrtc",
                epoch,
                "media stream has no local tracks, connecting receive-only"
            ),
            None => {}
        }

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.candidate(from_candidate_init(init)),
                    Err(err) => tracing::warn!(
                        target = "webrtc",
                        error = %err,
                        "failed to serialize local candidate"
                    ),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let sink = sink.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                if let Some(state) = connectivity_from(state) {
                    sink.connectivity(state);
                }
            })
        }));

        let sink = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let sink = sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                };
                tracing::debug!(target = "webrtc", id = %track.id(), ?kind, "remote track");
                sink.remote_media(RemoteTrack {
                    id: track.id(),
                    kind,
                });
            })
        }));

        Ok(Arc::new(WebRtcPeerTransport { pc }))
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn open(
        &self,
        media: Option<Arc<dyn MediaStream>>,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport: Arc<dyn PeerTransport> = self.open_peer(media, events).await?;
        Ok(transport)
    }
}

pub struct WebRtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeerTransport {
    pub fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_description_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_description_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(to_description_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(to_description_error)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        // The pending offer's SDP has to come along; an empty rollback is
        // refused before the signaling state is consulted.
        let Some(pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        let rollback: RTCSessionDescription = serde_json::from_value(serde_json::json!({
            "type": RTCSdpType::Rollback.to_string(),
            "sdp": pending.sdp,
        }))
        .map_err(to_description_error)?;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(to_description_error)
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

pub(crate) fn connectivity_from(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectivityState::New,
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_description_error)
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_description_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Description(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SilentAudioSource;
    use call_session::transport::{MediaSource, TransportEvent};
    use tokio::sync::mpsc;

    #[test_timeout::timeout]
    fn peer_states_map_onto_connectivity() {
        assert_eq!(
            connectivity_from(RTCPeerConnectionState::Failed),
            Some(ConnectivityState::Failed)
        );
        assert_eq!(
            connectivity_from(RTCPeerConnectionState::Connecting),
            Some(ConnectivityState::Connecting)
        );
        assert_eq!(connectivity_from(RTCPeerConnectionState::Unspecified), None);
    }

    #[test_timeout::timeout]
    async fn offer_carries_local_audio_and_rolls_back() {
        let (tx, _rx) = mpsc::unbounded_channel::<TransportEvent>();
        let factory = WebRtcTransportFactory::new(Vec::new()).unwrap();
        let media = SilentAudioSource::new().acquire().await.unwrap();
        let transport = factory
            .open_peer(Some(media.clone()), TransportEvents::new(1, tx))
            .await
            .unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));

        transport.set_local_description(offer).await.unwrap();
        assert_eq!(transport.signaling_state(), RTCSignalingState::HaveLocalOffer);
        transport.rollback().await.unwrap();
        assert_eq!(transport.signaling_state(), RTCSignalingState::Stable);

        transport.close().await.unwrap();
        media.stop();
    }

    #[test_timeout::timeout]
    async fn malformed_remote_description_is_a_description_error() {
        let (tx, _rx) = mpsc::unbounded_channel::<TransportEvent>();
        let factory = WebRtcTransportFactory::new(Vec::new()).unwrap();
        let transport = factory
            .open_peer(None, TransportEvents::new(1, tx))
            .await
            .unwrap();
        let err = transport
            .set_remote_description(SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Description(_)));
        transport.close().await.unwrap();
    }
}
