use anyhow::{anyhow, Result};
use call_session::{CallError, CallHandle, CallNotice, CallState, ConnectivityState, PeerId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How the owner answers join requests when admission control is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionPolicy {
    Prompt,
    AutoAdmit,
}

/// Render a notice for the terminal. Returns `None` for notices that are
/// only interesting in logs.
pub fn describe(notice: &CallNotice) -> Option<String> {
    Some(match notice {
        CallNotice::StateChanged(state) => format!("state: {}", state_label(*state)),
        CallNotice::CallCode(code) => format!("call code: {code}  (share it with the other side)"),
        CallNotice::ParticipantCount(count) => format!("participants: {count}/2"),
        CallNotice::AdmissionRequested(peer) => format!("{peer} is asking to join"),
        CallNotice::Connectivity(ConnectivityState::Connected) => "media connected".to_string(),
        CallNotice::Connectivity(ConnectivityState::Disconnected) => {
            "media interrupted, waiting for it to recover".to_string()
        }
        CallNotice::Connectivity(_) => return None,
        CallNotice::RemoteMedia(track) => format!("receiving {:?} from the other side", track.kind),
        CallNotice::Error(err) => format!("error: {err}"),
    })
}

fn state_label(state: CallState) -> &'static str {
    match state {
        CallState::Idle => "idle",
        CallState::Creating => "creating call",
        CallState::Joining => "joining call",
        CallState::Waiting => "waiting for someone to join",
        CallState::WaitingApproval => "waiting for the owner to let you in",
        CallState::InCall => "in call",
    }
}

/// `y`/`yes` admits, `n`/`no` declines, anything else asks again.
pub fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Print notices until the call ends or the user hangs up with Ctrl-C.
pub async fn drive(
    handle: &CallHandle,
    mut notices: mpsc::UnboundedReceiver<CallNotice>,
    policy: AdmissionPolicy,
) -> Result<()> {
    let mut active = false;
    let mut last_error: Option<CallError> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("hanging up");
                handle.leave_call().await?;
                return Ok(());
            }
            notice = notices.recv() => {
                let Some(notice) = notice else {
                    return Err(anyhow!("call runtime stopped"));
                };
                debug!(?notice, "call notice");
                if let Some(line) = describe(&notice) {
                    println!("{line}");
                }
                match notice {
                    CallNotice::StateChanged(CallState::Idle) if active => {
                        return match last_error.take() {
                            Some(err) => Err(anyhow!(err)),
                            None => Ok(()),
                        };
                    }
                    CallNotice::StateChanged(_) => active = true,
                    CallNotice::AdmissionRequested(peer) => {
                        answer_admission(handle.clone(), peer, policy);
                    }
                    // The other side hanging up ends the call normally.
                    CallNotice::Error(CallError::RemoteLeft) => {}
                    CallNotice::Error(err) => last_error = Some(err),
                    _ => {}
                }
            }
        }
    }
}

fn answer_admission(handle: CallHandle, peer: PeerId, policy: AdmissionPolicy) {
    tokio::spawn(async move {
        let accept = match policy {
            AdmissionPolicy::AutoAdmit => true,
            AdmissionPolicy::Prompt => match prompt(&peer).await {
                Ok(accept) => accept,
                Err(err) => {
                    warn!(error = %err, "admission prompt failed, declining");
                    false
                }
            },
        };
        if let Err(err) = handle.admit_or_reject(peer.clone(), accept).await {
            // The request may have been withdrawn while the prompt was open.
            warn!(peer = %peer, error = %err, "admission answer not applied");
        }
    });
}

async fn prompt(peer: &PeerId) -> std::io::Result<bool> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout
            .write_all(format!("let {peer} in? [y/n] ").as_bytes())
            .await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(false);
        };
        if let Some(accept) = parse_answer(&line) {
            return Ok(accept);
        }
    }
}
