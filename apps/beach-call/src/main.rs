mod cli;
mod console;
mod demo;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use call_session::{CallConfig, CallRuntime, Collaborators, PeerId};
use call_webrtc::{SilentAudioSource, WebRtcTransportFactory, WsSignalingChannel};
use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use console::AdmissionPolicy;

enum Entry {
    Create,
    Join(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;

    let mut config = CallConfig::from_env();
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }
    if !cli.ice_servers.is_empty() {
        config.ice_servers = cli.ice_servers;
    }

    match cli.command {
        Command::Create(args) => {
            config.admission_control |= args.admission;
            let policy = if args.auto_admit {
                AdmissionPolicy::AutoAdmit
            } else {
                AdmissionPolicy::Prompt
            };
            run_call(config, Entry::Create, policy).await
        }
        Command::Join(args) => run_call(config, Entry::Join(args.code), AdmissionPolicy::Prompt).await,
        Command::Demo(args) => demo::run(config, args).await,
    }
}

async fn run_call(config: CallConfig, entry: Entry, policy: AdmissionPolicy) -> Result<()> {
    let signaling = WsSignalingChannel::connect(&config.relay_url)
        .await
        .with_context(|| format!("could not reach relay at {}", config.relay_url))?;
    let collaborators = Collaborators {
        signaling: Arc::new(signaling),
        media: Arc::new(SilentAudioSource::new()),
        transports: Arc::new(
            WebRtcTransportFactory::new(config.ice_servers.clone())
                .context("webrtc setup failed")?,
        ),
    };

    let peer_id = PeerId::random();
    info!(peer = %peer_id, relay = %config.relay_url, "starting call client");
    let (handle, notices, task) =
        CallRuntime::spawn(peer_id, config.session_options(), collaborators)?;

    match entry {
        Entry::Create => handle.create_call().await?,
        Entry::Join(code) => handle.join_call(&code).await?,
    }
    let outcome = console::drive(&handle, notices, policy).await;

    handle.shutdown();
    let _ = task.await;
    outcome
}
