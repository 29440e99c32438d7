//! Recording doubles for the collaborator traits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    MediaError, MediaSource, MediaStream, PeerTransport, PeerTransportFactory, TransportError,
    TransportEvents,
};
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    Rollback,
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Debug)]
pub struct MockTransport {
    label: String,
    events: TransportEvents,
    calls: Mutex<Vec<MockCall>>,
    has_media: bool,
    close_delay: Option<Duration>,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn events(&self) -> &TransportEvents {
        &self.events
    }

    pub fn has_media(&self) -> bool {
        self.has_media
    }

    pub fn is_closed(&self) -> bool {
        self.calls.lock().contains(&MockCall::Close)
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::SetRemote(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(MockCall::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(MockCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.label)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetLocal(description));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetRemote(description));
        Ok(())
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        self.record(MockCall::Rollback);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(MockCall::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(MockCall::Close);
        Ok(())
    }
}

/// Opens [`MockTransport`]s and keeps every one it handed out.
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    label: String,
    opened: Mutex<Vec<Arc<MockTransport>>>,
    fail_open: AtomicBool,
    close_delay: Option<Duration>,
}

impl MockTransportFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Transports from this factory take `delay` to finish closing.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<Arc<MockTransport>> {
        self.opened.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.opened.lock().last().cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn open(
        &self,
        media: Option<Arc<dyn MediaStream>>,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.fail_open.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Setup("mock open failure".into()));
        }
        let transport = Arc::new(MockTransport {
            label: format!("{}#{}", self.label, events.epoch()),
            events,
            calls: Mutex::new(Vec::new()),
            has_media: media.is_some(),
            close_delay: self.close_delay,
        });
        self.opened.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Debug, Default)]
pub struct MockStream {
    stopped: AtomicBool,
}

impl MockStream {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaStream for MockStream {
    fn track_count(&self) -> usize {
        2
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Grants (or denies) capture and remembers every stream it handed out.
#[derive(Debug, Default)]
pub struct MockMediaSource {
    deny: bool,
    acquisitions: AtomicUsize,
    streams: Mutex<Vec<Arc<MockStream>>>,
}

impl MockMediaSource {
    pub fn granting() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> Vec<Arc<MockStream>> {
        self.streams.lock().clone()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn acquire(&self) -> Result<Arc<dyn MediaStream>, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(MediaError::Denied);
        }
        let stream = Arc::new(MockStream::default());
        self.streams.lock().push(stream.clone());
        Ok(stream)
    }
}
