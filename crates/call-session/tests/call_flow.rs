use std::sync::Arc;
use std::time::Duration;

use call_session::transport::mock::{MockCall, MockMediaSource, MockTransportFactory};
use call_session::{
    CallCode, CallError, CallHandle, CallNotice, CallRuntime, CallSnapshot, CallState,
    Collaborators, ConnectivityState, DescriptionState, LocalRelay, PeerId, RuntimeError,
    SessionOptions,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    handle: CallHandle,
    notices: mpsc::UnboundedReceiver<CallNotice>,
    transports: Arc<MockTransportFactory>,
    media: Arc<MockMediaSource>,
    task: JoinHandle<()>,
}

impl Peer {
    fn spawn(relay: &LocalRelay, id: &str, admission_control: bool) -> Self {
        Self::spawn_with(
            relay,
            id,
            admission_control,
            MockMediaSource::granting(),
            MockTransportFactory::new(id),
        )
    }

    fn spawn_with(
        relay: &LocalRelay,
        id: &str,
        admission_control: bool,
        media: MockMediaSource,
        transports: MockTransportFactory,
    ) -> Self {
        let peer_id = PeerId::new(id);
        let transports = Arc::new(transports);
        let media = Arc::new(media);
        let collaborators = Collaborators {
            signaling: Arc::new(relay.connect(peer_id.clone())),
            media: media.clone(),
            transports: transports.clone(),
        };
        let options = SessionOptions {
            admission_control,
            leave_grace: Duration::from_millis(50),
        };
        let (handle, notices, task) =
            CallRuntime::spawn(peer_id, options, collaborators).expect("runtime starts");
        Self {
            handle,
            notices,
            transports,
            media,
            task,
        }
    }

    async fn expect_notice(&mut self, matches: impl Fn(&CallNotice) -> bool) -> CallNotice {
        tokio::time::timeout(WAIT, async {
            loop {
                let notice = self.notices.recv().await.expect("runtime alive");
                if matches(&notice) {
                    return notice;
                }
            }
        })
        .await
        .expect("notice arrived in time")
    }

    async fn wait_for(&self, ready: impl Fn(&CallSnapshot) -> bool) -> CallSnapshot {
        tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = self.handle.snapshot().await.expect("runtime alive");
                if ready(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state reached in time")
    }

    async fn create(&mut self) -> CallCode {
        self.handle.create_call().await.expect("create accepted");
        match self
            .expect_notice(|n| matches!(n, CallNotice::CallCode(_)))
            .await
        {
            CallNotice::CallCode(code) => code,
            _ => unreachable!(),
        }
    }
}

async fn eventually(check: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

fn stable(snapshot: &CallSnapshot) -> bool {
    snapshot.state == CallState::InCall
        && snapshot.description_state == Some(DescriptionState::Stable)
}

#[test_timeout::timeout]
async fn owner_and_joiner_negotiate_to_stable() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn(&relay, "owner", false);
    let joiner = Peer::spawn(&relay, "joiner", false);

    let code = owner.create().await;
    joiner
        .handle
        .join_call(&format!(" {} ", code.as_str().to_lowercase()))
        .await
        .expect("join accepted");

    let owner_view = owner.wait_for(stable).await;
    let joiner_view = joiner.wait_for(stable).await;
    assert_eq!(owner_view.session.unwrap().participant_count, 2);
    assert_eq!(joiner_view.session.unwrap().code, code);

    let owner_transport = owner.transports.last().expect("owner transport");
    let joiner_transport = joiner.transports.last().expect("joiner transport");
    assert!(owner_transport.has_media());
    assert_eq!(owner_transport.calls()[0], MockCall::CreateOffer);
    assert_eq!(
        joiner_transport.remote_descriptions().len(),
        1,
        "joiner accepted exactly one offer"
    );
    assert!(joiner_transport.calls().contains(&MockCall::CreateAnswer));
    assert!(!joiner_transport.calls().contains(&MockCall::CreateOffer));
}

#[test_timeout::timeout]
async fn second_joiner_is_told_busy_while_first_waits() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn(&relay, "owner", true);
    let first = Peer::spawn(&relay, "first", false);
    let mut second = Peer::spawn(&relay, "second", false);

    let code = owner.create().await;
    first.handle.join_call(code.as_str()).await.unwrap();
    owner
        .expect_notice(|n| matches!(n, CallNotice::AdmissionRequested(id) if id.as_str() == "first"))
        .await;
    first
        .wait_for(|s| s.state == CallState::WaitingApproval)
        .await;

    second.handle.join_call(code.as_str()).await.unwrap();
    second
        .expect_notice(|n| *n == CallNotice::Error(CallError::Busy))
        .await;
    second.wait_for(|s| s.state == CallState::Idle).await;

    owner
        .handle
        .admit_or_reject(PeerId::new("first"), true)
        .await
        .unwrap();
    let owner_view = owner.wait_for(stable).await;
    first.wait_for(stable).await;
    assert!(owner_view.pending_admissions.is_empty());
    assert!(relay.lookup(&code).unwrap().pending.is_empty());
}

#[test_timeout::timeout]
async fn declined_joiner_returns_to_idle() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn(&relay, "owner", true);
    let mut joiner = Peer::spawn(&relay, "joiner", false);

    let code = owner.create().await;
    joiner.handle.join_call(code.as_str()).await.unwrap();
    owner
        .expect_notice(|n| matches!(n, CallNotice::AdmissionRequested(_)))
        .await;
    owner
        .handle
        .admit_or_reject(PeerId::new("joiner"), false)
        .await
        .unwrap();

    joiner
        .expect_notice(|n| *n == CallNotice::Error(CallError::Rejected))
        .await;
    let owner_view = owner.handle.snapshot().await.unwrap();
    assert_eq!(owner_view.state, CallState::Waiting);
    assert!(joiner.transports.opened().is_empty());
}

#[test_timeout::timeout]
async fn unknown_code_surfaces_not_found() {
    let relay = LocalRelay::new();
    let mut joiner = Peer::spawn(&relay, "joiner", false);

    joiner.handle.join_call("zz99zz").await.unwrap();
    joiner
        .expect_notice(|n| *n == CallNotice::Error(CallError::NotFound))
        .await;
    joiner.wait_for(|s| s.state == CallState::Idle).await;
    assert_eq!(relay.call_count(), 0);
    eventually(|| joiner.media.streams().iter().all(|s| s.is_stopped())).await;
}

#[test_timeout::timeout]
async fn malformed_code_is_rejected_locally() {
    let relay = LocalRelay::new();
    let joiner = Peer::spawn(&relay, "joiner", false);

    let err = joiner.handle.join_call("abc").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Call(CallError::InvalidCode(_))));
    assert_eq!(joiner.media.acquisitions(), 0);
}

#[test_timeout::timeout]
async fn owner_leaving_ends_call_for_joiner_after_grace() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn(&relay, "owner", false);
    let mut joiner = Peer::spawn(&relay, "joiner", false);

    let code = owner.create().await;
    joiner.handle.join_call(code.as_str()).await.unwrap();
    joiner.wait_for(stable).await;

    owner.handle.leave_call().await.unwrap();
    owner.handle.leave_call().await.unwrap();
    assert_eq!(owner.handle.snapshot().await.unwrap().state, CallState::Idle);
    assert!(relay.lookup(&code).is_none());

    joiner
        .expect_notice(|n| *n == CallNotice::Error(CallError::RemoteLeft))
        .await;
    joiner
        .expect_notice(|n| *n == CallNotice::StateChanged(CallState::Idle))
        .await;

    // Released before the departure was reported.
    let joiner_transport = joiner.transports.last().unwrap();
    assert!(joiner_transport.is_closed());
    let owner_transport = owner.transports.last().unwrap();
    assert!(owner_transport.is_closed());
    assert!(owner.media.streams().iter().all(|s| s.is_stopped()));
}

#[test_timeout::timeout]
async fn joiner_leaving_returns_owner_to_waiting() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn(&relay, "owner", false);
    let joiner = Peer::spawn(&relay, "joiner", false);

    let code = owner.create().await;
    joiner.handle.join_call(code.as_str()).await.unwrap();
    owner.wait_for(stable).await;

    joiner.handle.leave_call().await.unwrap();
    let owner_view = owner
        .wait_for(|s| s.state == CallState::Waiting)
        .await;
    assert_eq!(owner_view.session.unwrap().participant_count, 1);
    assert_eq!(owner_view.description_state, None);
    assert_eq!(relay.lookup(&code).unwrap().participant_count, 1);

    // A fresh joiner gets a fresh negotiation.
    let late = Peer::spawn(&relay, "late", false);
    late.handle.join_call(code.as_str()).await.unwrap();
    owner.wait_for(stable).await;
    late.wait_for(stable).await;
    assert_eq!(owner.transports.opened().len(), 2);
}

#[test_timeout::timeout]
async fn denied_media_aborts_create() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn_with(
        &relay,
        "owner",
        false,
        MockMediaSource::denying(),
        MockTransportFactory::new("owner"),
    );

    owner.handle.create_call().await.unwrap();
    owner
        .expect_notice(|n| matches!(n, CallNotice::Error(CallError::Media(_))))
        .await;
    owner.wait_for(|s| s.state == CallState::Idle).await;
    assert_eq!(relay.call_count(), 0);
}

#[test_timeout::timeout]
async fn connectivity_failure_tears_down_the_call() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn(&relay, "owner", false);
    let joiner = Peer::spawn(&relay, "joiner", false);

    let code = owner.create().await;
    joiner.handle.join_call(code.as_str()).await.unwrap();
    owner.wait_for(stable).await;

    let transport = owner.transports.last().unwrap();
    transport.events().connectivity(ConnectivityState::Connected);
    owner
        .expect_notice(|n| *n == CallNotice::Connectivity(ConnectivityState::Connected))
        .await;
    transport.events().connectivity(ConnectivityState::Failed);
    owner
        .expect_notice(|n| *n == CallNotice::Error(CallError::ConnectionFailed))
        .await;
    owner.wait_for(|s| s.state == CallState::Idle).await;
    assert!(relay.lookup(&code).is_none());
}

#[test_timeout::timeout]
async fn shutdown_leaves_the_active_call() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn(&relay, "owner", false);
    let code = owner.create().await;

    owner.handle.shutdown();
    tokio::time::timeout(WAIT, owner.task).await.unwrap().unwrap();
    assert!(relay.lookup(&code).is_none());
    assert!(matches!(
        owner.handle.snapshot().await,
        Err(RuntimeError::Stopped)
    ));
}

#[test_timeout::timeout]
async fn leave_returns_only_after_the_transport_is_released() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn_with(
        &relay,
        "owner",
        false,
        MockMediaSource::granting(),
        MockTransportFactory::new("owner").with_close_delay(Duration::from_millis(200)),
    );
    let joiner = Peer::spawn(&relay, "joiner", false);

    let code = owner.create().await;
    joiner.handle.join_call(code.as_str()).await.unwrap();
    owner.wait_for(stable).await;

    let transport = owner.transports.last().unwrap();
    assert!(!transport.is_closed());
    owner.handle.leave_call().await.unwrap();
    assert!(transport.is_closed());
}

#[test_timeout::timeout]
async fn shutdown_releases_the_transport_before_the_task_ends() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn_with(
        &relay,
        "owner",
        false,
        MockMediaSource::granting(),
        MockTransportFactory::new("owner").with_close_delay(Duration::from_millis(200)),
    );
    let joiner = Peer::spawn(&relay, "joiner", false);

    let code = owner.create().await;
    joiner.handle.join_call(code.as_str()).await.unwrap();
    owner.wait_for(stable).await;

    let transport = owner.transports.last().unwrap();
    owner.handle.shutdown();
    tokio::time::timeout(WAIT, owner.task).await.unwrap().unwrap();
    assert!(transport.is_closed());
    assert!(owner.media.streams().iter().all(|s| s.is_stopped()));
}

#[test_timeout::timeout]
async fn transport_that_cannot_open_fails_the_call() {
    let relay = LocalRelay::new();
    let mut owner = Peer::spawn(&relay, "owner", false);
    let mut joiner = Peer::spawn(&relay, "joiner", false);

    let code = owner.create().await;
    joiner.transports.fail_next_open();
    joiner.handle.join_call(code.as_str()).await.unwrap();

    joiner
        .expect_notice(|n| *n == CallNotice::Error(CallError::ConnectionFailed))
        .await;
    joiner.wait_for(|s| s.state == CallState::Idle).await;
    assert!(joiner.transports.opened().is_empty());
    let streams = joiner.media.streams();
    assert_eq!(streams.len(), 1);
    assert!(streams[0].is_stopped());

    // The joiner's leave-call reached the relay and the owner is free again.
    owner
        .expect_notice(|n| *n == CallNotice::StateChanged(CallState::InCall))
        .await;
    owner
        .expect_notice(|n| *n == CallNotice::StateChanged(CallState::Waiting))
        .await;
    let owner_view = owner.handle.snapshot().await.unwrap();
    assert_eq!(owner_view.session.unwrap().participant_count, 1);
    assert_eq!(relay.lookup(&code).unwrap().participant_count, 1);
}
