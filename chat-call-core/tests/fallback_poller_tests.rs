//! Fallback discovery of durable call requests missed by the change feed.

use chat_call_core::local::{
    LocalSignalHub, RecordingOutcomeSink, StaticChatDirectory, StubMediaBackend,
};
use chat_call_core::{
    CallConfig, CallEvent, CallPhase, CallService, ChatId, ChatKind, ChatProfile,
    MediaConstraints, UserId,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

fn test_config() -> CallConfig {
    CallConfig {
        settle_delay: Duration::from_millis(20),
        poll_interval: Duration::from_millis(100),
        request_freshness: Duration::from_secs(10),
        event_capacity: 64,
    }
}

fn direct_directory() -> Arc<StaticChatDirectory> {
    Arc::new(StaticChatDirectory::new().with_chat(
        ChatId::new("chat-1"),
        ChatProfile {
            kind: ChatKind::Direct,
            members: vec![UserId::new("alice"), UserId::new("bob")],
        },
    ))
}

fn build_service(
    hub: &Arc<LocalSignalHub>,
    directory: &Arc<StaticChatDirectory>,
    user: &str,
    config: CallConfig,
) -> CallService {
    CallService::builder()
        .local_user(UserId::new(user))
        .signal_store(hub.clone())
        .signal_broadcast(hub.clone())
        .presence_channel(hub.clone())
        .media_backend(Arc::new(StubMediaBackend::new()))
        .outcome_sink(Arc::new(RecordingOutcomeSink::new()))
        .chat_directory(directory.clone())
        .config(config)
        .build()
        .expect("service builds")
}

#[tokio::test]
async fn request_sent_before_recipient_started_rings_exactly_once() {
    let hub = Arc::new(LocalSignalHub::new());
    let directory = direct_directory();
    let chat = ChatId::new("chat-1");

    let alice = build_service(&hub, &directory, "alice", test_config());
    alice.start().await.expect("alice starts");
    alice
        .start_call(&chat, MediaConstraints::audio_only())
        .await
        .expect("call starts");

    // Bob comes online only after the request was persisted; the change
    // feed never saw it, so only the poller can find it.
    let bob = build_service(&hub, &directory, "bob", test_config());
    let mut bob_events = bob.subscribe();
    bob.start().await.expect("bob starts");

    let got = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match bob_events.recv().await {
                Ok(CallEvent::IncomingCall { from, .. }) => return from,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("poller rings the missed request");
    assert_eq!(got, UserId::new("alice"));
    assert_eq!(bob.phase(&chat).await, CallPhase::Incoming);

    // The poller keeps seeing the same record on every tick; id dedup
    // must keep it from ringing again.
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        match bob_events.try_recv() {
            Ok(CallEvent::IncomingCall { .. }) => panic!("request rang twice"),
            Ok(_) | Err(broadcast::error::TryRecvError::Empty) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn stale_request_does_not_ring() {
    let hub = Arc::new(LocalSignalHub::new());
    let directory = direct_directory();
    let chat = ChatId::new("chat-1");

    let alice = build_service(&hub, &directory, "alice", test_config());
    alice.start().await.expect("alice starts");
    alice
        .start_call(&chat, MediaConstraints::audio_only())
        .await
        .expect("call starts");

    // Bob's freshness window is shorter than the request's age by the
    // time he comes online.
    let bob_config = CallConfig {
        request_freshness: Duration::from_millis(100),
        ..test_config()
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let bob = build_service(&hub, &directory, "bob", bob_config);
    bob.start().await.expect("bob starts");
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(bob.phase(&chat).await, CallPhase::Idle);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn feed_and_poller_double_delivery_is_deduplicated() {
    let hub = Arc::new(LocalSignalHub::new());
    let directory = direct_directory();
    let chat = ChatId::new("chat-1");

    let alice = build_service(&hub, &directory, "alice", test_config());
    alice.start().await.expect("alice starts");

    // Bob is online the whole time: the feed delivers the request first
    // and the poller rediscovers the same record afterwards.
    let bob = build_service(&hub, &directory, "bob", test_config());
    let mut bob_events = bob.subscribe();
    bob.start().await.expect("bob starts");

    alice
        .start_call(&chat, MediaConstraints::audio_only())
        .await
        .expect("call starts");

    let mut rings = 0usize;
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        match bob_events.try_recv() {
            Ok(CallEvent::IncomingCall { .. }) => rings += 1,
            Ok(_) | Err(broadcast::error::TryRecvError::Empty) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }
    assert_eq!(rings, 1, "one request, one ring");

    alice.shutdown().await;
    bob.shutdown().await;
}
