use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use call_session::{
    CallCode, CallConfig, CallHandle, CallNotice, CallRuntime, CallState, Collaborators,
    ConnectivityState, LocalRelay, PeerId,
};
use call_webrtc::{SilentAudioSource, WebRtcTransportFactory};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cli::DemoArgs;
use crate::console::describe;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

struct DemoPeer {
    label: &'static str,
    handle: CallHandle,
    notices: mpsc::UnboundedReceiver<CallNotice>,
    task: JoinHandle<()>,
}

impl DemoPeer {
    fn spawn(
        label: &'static str,
        relay: &LocalRelay,
        config: &CallConfig,
        admission_control: bool,
    ) -> Result<Self> {
        let peer_id = PeerId::new(format!("{label}-{}", PeerId::random()));
        let collaborators = Collaborators {
            signaling: Arc::new(relay.connect(peer_id.clone())),
            media: Arc::new(SilentAudioSource::new()),
            transports: Arc::new(
                WebRtcTransportFactory::new(config.ice_servers.clone())
                    .context("webrtc setup failed")?,
            ),
        };
        let mut options = config.session_options();
        options.admission_control = admission_control;
        let (handle, notices, task) = CallRuntime::spawn(peer_id, options, collaborators)?;
        Ok(Self {
            label,
            handle,
            notices,
            task,
        })
    }

    fn print(&self, notice: &CallNotice) {
        if let Some(line) = describe(notice) {
            println!("[{}] {line}", self.label);
        }
    }

    /// Print notices until one satisfies `done`; fail on any call error.
    async fn until<T>(&mut self, done: impl Fn(&CallNotice) -> Option<T>) -> Result<T> {
        loop {
            let notice = self
                .notices
                .recv()
                .await
                .with_context(|| format!("{} runtime stopped", self.label))?;
            self.print(&notice);
            if let CallNotice::Error(err) = &notice {
                bail!("{} failed: {err}", self.label);
            }
            if let Some(value) = done(&notice) {
                return Ok(value);
            }
        }
    }

    async fn stop(self) {
        self.handle.shutdown();
        let _ = self.task.await;
    }
}

/// Owner and joiner in one process: the relay is in memory, the media path
/// is a real WebRTC connection over loopback.
pub async fn run(config: CallConfig, args: DemoArgs) -> Result<()> {
    let relay = LocalRelay::new();
    let mut owner = DemoPeer::spawn("owner", &relay, &config, args.admission)?;
    let mut joiner = DemoPeer::spawn("joiner", &relay, &config, false)?;

    owner.handle.create_call().await?;
    let code: CallCode = owner
        .until(|n| match n {
            CallNotice::CallCode(code) => Some(code.clone()),
            _ => None,
        })
        .await?;
    info!(%code, "demo call created");

    joiner.handle.join_call(code.as_str()).await?;
    if args.admission {
        let peer = owner
            .until(|n| match n {
                CallNotice::AdmissionRequested(peer) => Some(peer.clone()),
                _ => None,
            })
            .await?;
        println!("[owner] admitting {peer}");
        owner.handle.admit_or_reject(peer, true).await?;
    }

    let connected = |n: &CallNotice| {
        (*n == CallNotice::Connectivity(ConnectivityState::Connected)).then_some(())
    };
    tokio::time::timeout(CONNECT_TIMEOUT, async {
        tokio::try_join!(owner.until(connected), joiner.until(connected))
    })
    .await
    .context("peers did not connect in time")??;

    println!("connected; holding for {}s", args.hold);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.hold)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    joiner.handle.leave_call().await?;
    owner
        .until(|n| (*n == CallNotice::StateChanged(CallState::Waiting)).then_some(()))
        .await?;
    owner.handle.leave_call().await?;

    joiner.stop().await;
    owner.stop().await;
    Ok(())
}
