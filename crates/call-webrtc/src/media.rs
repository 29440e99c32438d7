use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use call_session::transport::{MediaError, MediaSource, MediaStream};
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Opus frame that decodes to 20ms of silence.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const FRAME: Duration = Duration::from_millis(20);

/// Local capture backed by `webrtc` sample tracks.
pub struct LocalTracks {
    tracks: Vec<Arc<TrackLocalStaticSample>>,
    stopped: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl LocalTracks {
    pub fn new(tracks: Vec<Arc<TrackLocalStaticSample>>, pump: Option<JoinHandle<()>>) -> Self {
        Self {
            tracks,
            stopped: AtomicBool::new(false),
            pump: Mutex::new(pump),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = Arc<TrackLocalStaticSample>> + '_ {
        self.tracks.iter().cloned()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTracks")
            .field("tracks", &self.tracks.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl MediaStream for LocalTracks {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for LocalTracks {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Media source for headless peers: a single Opus track carrying silence.
#[derive(Debug, Clone)]
pub struct SilentAudioSource {
    stream_id: String,
}

impl Default for SilentAudioSource {
    fn default() -> Self {
        Self {
            stream_id: "beach-call".into(),
        }
    }
}

impl SilentAudioSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaSource for SilentAudioSource {
    async fn acquire(&self) -> Result<Arc<dyn MediaStream>, MediaError> {
        // The silence pump needs a runtime to live on.
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| MediaError::Unavailable(format!("no runtime for audio pump: {err}")))?;
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            self.stream_id.clone(),
        ));

        let writer = Arc::clone(&track);
        let pump = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(FRAME);
            loop {
                ticker.tick().await;
                let sample = Sample {
                    data: Bytes::from_static(OPUS_SILENCE),
                    duration: FRAME,
                    ..Default::default()
                };
                if let Err(err) = writer.write_sample(&sample).await {
                    tracing::debug!(target = "webrtc", error = %err, "silent audio pump stopped");
                    break;
                }
            }
        });
        tracing::debug!(target = "webrtc", stream = %self.stream_id, "silent audio track ready");

        Ok(Arc::new(LocalTracks::new(vec![track], Some(pump))))
    }
}
