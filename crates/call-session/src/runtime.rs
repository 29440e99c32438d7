//! Async shell around [`CallSessionController`].
//!
//! One task owns the controller and every collaborator handle. It waits on
//! user commands, relay messages, transport events and internal completions,
//! feeds each into the controller, and executes the returned effects in
//! order before looking at the next input.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::controller::{
    CallNotice, CallSession, CallSessionController, CallState, Effect, Event, SessionOptions,
};
use crate::error::CallError;
use crate::negotiation::{DescriptionState, TransportCommand};
use crate::protocol::{ClientMessage, PeerId, RegistryErrorPayload, RelayMessage};
use crate::transport::{
    ConnectivityState, MediaError, MediaSource, MediaStream, PeerTransportFactory,
    SignalingChannel, SignalingError, TransportEvent, TransportEvents,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("call runtime stopped")]
    Stopped,
}

/// External services a runtime drives.
#[derive(Clone)]
pub struct Collaborators {
    pub signaling: Arc<dyn SignalingChannel>,
    pub media: Arc<dyn MediaSource>,
    pub transports: Arc<dyn PeerTransportFactory>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSnapshot {
    pub local_id: PeerId,
    pub state: CallState,
    pub session: Option<CallSession>,
    pub pending_admissions: Vec<PeerId>,
    pub description_state: Option<DescriptionState>,
}

enum Command {
    Create(oneshot::Sender<Result<(), CallError>>),
    Join(String, oneshot::Sender<Result<(), CallError>>),
    Admit(PeerId, bool, oneshot::Sender<Result<(), CallError>>),
    Leave(oneshot::Sender<()>),
    Snapshot(oneshot::Sender<CallSnapshot>),
    Shutdown,
}

/// Upper bound on waiting for a peer transport to finish closing.
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

enum Internal {
    Media(u64, Result<Arc<dyn MediaStream>, MediaError>),
    Event(Event),
}

/// Cloneable front door to a running [`CallRuntime`].
#[derive(Clone, Debug)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CallHandle {
    pub async fn create_call(&self) -> Result<(), RuntimeError> {
        self.request(Command::Create).await?.map_err(Into::into)
    }

    pub async fn join_call(&self, code: &str) -> Result<(), RuntimeError> {
        let code = code.to_string();
        self.request(|reply| Command::Join(code, reply))
            .await?
            .map_err(Into::into)
    }

    pub async fn admit_or_reject(
        &self,
        participant_id: PeerId,
        accept: bool,
    ) -> Result<(), RuntimeError> {
        self.request(|reply| Command::Admit(participant_id, accept, reply))
            .await?
            .map_err(Into::into)
    }

    pub async fn leave_call(&self) -> Result<(), RuntimeError> {
        self.request(Command::Leave).await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, RuntimeError> {
        self.request(Command::Snapshot).await
    }

    /// Leave any active call and stop the runtime task.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| RuntimeError::Stopped)?;
        response.await.map_err(|_| RuntimeError::Stopped)
    }
}

pub struct CallRuntime {
    controller: CallSessionController,
    collaborators: Collaborators,
    notices: mpsc::UnboundedSender<CallNotice>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    media: HashMap<u64, Arc<dyn MediaStream>>,
    transports: HashMap<u64, WorkerSlot>,
}

/// Command queue and task of one [`TransportWorker`].
struct WorkerSlot {
    commands: mpsc::UnboundedSender<TransportCommand>,
    task: JoinHandle<()>,
}

impl WorkerSlot {
    /// Ask the worker to close its transport and wait until it has.
    async fn close(self, epoch: u64) {
        let WorkerSlot { commands, mut task } = self;
        let _ = commands.send(TransportCommand::Close);
        drop(commands);
        match tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(epoch, error = %err, "transport worker ended abnormally"),
            Err(_) => {
                warn!(epoch, "peer transport did not close in time, abandoning it");
                task.abort();
            }
        }
    }
}

impl CallRuntime {
    /// Start a runtime task. Fails only if the relay subscription is
    /// unavailable.
    pub fn spawn(
        local_id: PeerId,
        options: SessionOptions,
        collaborators: Collaborators,
    ) -> Result<(CallHandle, mpsc::UnboundedReceiver<CallNotice>, JoinHandle<()>), RuntimeError>
    {
        let relay_rx = collaborators.signaling.subscribe()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        info!(peer = %local_id, "starting call runtime");
        let runtime = CallRuntime {
            controller: CallSessionController::new(local_id, options),
            collaborators,
            notices: notice_tx,
            transport_tx,
            internal_tx,
            media: HashMap::new(),
            transports: HashMap::new(),
        };
        let task = tokio::spawn(runtime.run(command_rx, relay_rx, transport_rx, internal_rx));
        Ok((CallHandle { tx: command_tx }, notice_rx, task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut relay: mpsc::UnboundedReceiver<RelayMessage>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                message = relay.recv() => match message {
                    Some(message) => {
                        trace!(event = message.event_name(), "relay message");
                        self.dispatch(Event::Relay(message)).await;
                    }
                    None => {
                        warn!("relay subscription closed, stopping call runtime");
                        break;
                    }
                },
                Some(event) = transport_events.recv() => {
                    self.dispatch(Event::Transport(event)).await;
                }
                Some(completion) = internal.recv() => match completion {
                    Internal::Media(request, Ok(stream)) => {
                        debug!(request, tracks = stream.track_count(), "media granted");
                        self.media.insert(request, stream);
                        self.dispatch(Event::MediaGranted { request }).await;
                    }
                    Internal::Media(request, Err(err)) => {
                        warn!(request, error = %err, "media acquisition failed");
                        self.dispatch(Event::MediaDenied { request, reason: err.to_string() }).await;
                    }
                    Internal::Event(event) => self.dispatch(event).await,
                },
            }
        }

        let effects = self.controller.leave_call();
        self.execute_all(effects).await;
        for (epoch, slot) in std::mem::take(&mut self.transports) {
            slot.close(epoch).await;
        }
        for (_, stream) in self.media.drain() {
            stream.stop();
        }
        info!(peer = %self.controller.local_id(), "call runtime stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Create(reply) => {
                let result = self.controller.create_call();
                self.reply_with(result, reply).await;
            }
            Command::Join(code, reply) => {
                let result = self.controller.join_call(&code);
                self.reply_with(result, reply).await;
            }
            Command::Admit(participant, accept, reply) => {
                let result = self.controller.admit_or_reject(&participant, accept);
                self.reply_with(result, reply).await;
            }
            Command::Leave(reply) => {
                let effects = self.controller.leave_call();
                self.execute_all(effects).await;
                let _ = reply.send(());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    async fn reply_with(
        &mut self,
        result: Result<Vec<Effect>, CallError>,
        reply: oneshot::Sender<Result<(), CallError>>,
    ) {
        match result {
            Ok(effects) => {
                let _ = reply.send(Ok(()));
                self.execute_all(effects).await;
            }
            Err(err) => {
                debug!(error = %err, "operation refused");
                let _ = reply.send(Err(err));
            }
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            local_id: self.controller.local_id().clone(),
            state: self.controller.state(),
            session: self.controller.session().cloned(),
            pending_admissions: self
                .controller
                .admission()
                .pending()
                .map(|request| request.participant_id.clone())
                .collect(),
            description_state: self
                .controller
                .negotiation()
                .map(|coord| coord.description_state()),
        }
    }

    async fn dispatch(&mut self, event: Event) {
        let effects = self.controller.handle(event);
        self.execute_all(effects).await;
    }

    /// Runs effects in order. Follow-up events produced while executing are
    /// handled after the current batch, so no handler re-enters the
    /// controller mid-transition.
    async fn execute_all(&mut self, effects: Vec<Effect>) {
        let mut follow_ups = VecDeque::new();
        for effect in effects {
            if let Some(event) = self.execute(effect).await {
                follow_ups.push_back(event);
            }
        }
        while let Some(event) = follow_ups.pop_front() {
            for effect in self.controller.handle(event) {
                if let Some(event) = self.execute(effect).await {
                    follow_ups.push_back(event);
                }
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Send(message) => self.send(message).await,
            Effect::AcquireMedia { request } => {
                let source = self.collaborators.media.clone();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = source.acquire().await;
                    let _ = internal.send(Internal::Media(request, result));
                });
                None
            }
            Effect::ReleaseMedia { request } => {
                if let Some(stream) = self.media.remove(&request) {
                    debug!(request, "releasing local media");
                    stream.stop();
                }
                None
            }
            Effect::OpenTransport { epoch, media } => {
                let media = media.and_then(|request| self.media.get(&request).cloned());
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = TransportWorker {
                    epoch,
                    factory: self.collaborators.transports.clone(),
                    events: TransportEvents::new(epoch, self.transport_tx.clone()),
                    completions: self.internal_tx.clone(),
                };
                let task = tokio::spawn(worker.run(media, rx));
                self.transports.insert(epoch, WorkerSlot { commands: tx, task });
                None
            }
            Effect::Transport {
                epoch,
                command: TransportCommand::Close,
            } => {
                // Teardown does not move on until the transport is released.
                if let Some(slot) = self.transports.remove(&epoch) {
                    slot.close(epoch).await;
                }
                None
            }
            Effect::Transport { epoch, command } => {
                let delivered = self
                    .transports
                    .get(&epoch)
                    .map(|slot| slot.commands.send(command).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    debug!(epoch, "transport gone, dropping command");
                }
                None
            }
            Effect::StartGraceTimer { token, delay } => {
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = internal.send(Internal::Event(Event::GraceElapsed { token }));
                });
                None
            }
            Effect::Notify(notice) => {
                let _ = self.notices.send(notice);
                None
            }
        }
    }

    async fn send(&self, message: ClientMessage) -> Option<Event> {
        let event = message.event_name();
        trace!(event, "sending relay message");
        let starting = matches!(
            message,
            ClientMessage::CreateCall(_) | ClientMessage::JoinCall(_)
        );
        match self.collaborators.signaling.send(message).await {
            Ok(()) => None,
            Err(err) if starting => {
                warn!(event, error = %err, "relay unreachable");
                Some(Event::Relay(RelayMessage::RegistryError(
                    RegistryErrorPayload {
                        reason: err.to_string(),
                    },
                )))
            }
            Err(err) => {
                warn!(event, error = %err, "failed to send relay message");
                None
            }
        }
    }
}

/// Owns one peer transport and applies its commands strictly in order.
struct TransportWorker {
    epoch: u64,
    factory: Arc<dyn PeerTransportFactory>,
    events: TransportEvents,
    completions: mpsc::UnboundedSender<Internal>,
}

impl TransportWorker {
    async fn run(
        self,
        media: Option<Arc<dyn MediaStream>>,
        mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    ) {
        let epoch = self.epoch;
        let transport = match self.factory.open(media, self.events.clone()).await {
            Ok(transport) => transport,
            Err(err) => {
                warn!(epoch, error = %err, "failed to open peer transport");
                self.events.connectivity(ConnectivityState::Failed);
                return;
            }
        };
        debug!(epoch, "peer transport open");

        while let Some(command) = commands.recv().await {
            let result = match command {
                TransportCommand::CreateOffer(ticket) => {
                    let event = match transport.create_offer().await {
                        Ok(description) => Event::OfferCreated {
                            ticket,
                            description,
                        },
                        Err(err) => Event::DescriptionFailed {
                            ticket,
                            reason: err.to_string(),
                        },
                    };
                    let _ = self.completions.send(Internal::Event(event));
                    Ok(())
                }
                TransportCommand::CreateAnswer(ticket) => {
                    let event = match transport.create_answer().await {
                        Ok(description) => Event::AnswerCreated {
                            ticket,
                            description,
                        },
                        Err(err) => Event::DescriptionFailed {
                            ticket,
                            reason: err.to_string(),
                        },
                    };
                    let _ = self.completions.send(Internal::Event(event));
                    Ok(())
                }
                TransportCommand::SetLocalDescription(description) => {
                    transport.set_local_description(description).await
                }
                TransportCommand::SetRemoteDescription(description) => {
                    transport.set_remote_description(description).await
                }
                TransportCommand::Rollback => transport.rollback().await,
                TransportCommand::AddCandidate(candidate) => {
                    transport.add_candidate(candidate).await
                }
                TransportCommand::Close => break,
            };
            if let Err(err) = result {
                warn!(epoch, error = %err, "transport rejected command");
            }
        }

        if let Err(err) = transport.close().await {
            debug!(epoch, error = %err, "error closing peer transport");
        }
        debug!(epoch, "peer transport closed");
    }
}
