//! Group call room semantics: join by presence, full mesh, partial leave.

use chat_call_core::local::{
    LocalSignalHub, RecordingOutcomeSink, StaticChatDirectory, StubMediaBackend,
};
use chat_call_core::{
    CallConfig, CallEvent, CallPhase, CallService, ChatId, ChatKind, ChatProfile,
    MediaConstraints, OutcomeStatus, UserId,
};
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

struct Participant {
    service: CallService,
    events: broadcast::Receiver<CallEvent>,
    outcomes: Arc<RecordingOutcomeSink>,
    backend: Arc<StubMediaBackend>,
}

async fn participant(
    hub: &Arc<LocalSignalHub>,
    directory: &Arc<StaticChatDirectory>,
    user: &str,
) -> Participant {
    let outcomes = Arc::new(RecordingOutcomeSink::new());
    let backend = Arc::new(StubMediaBackend::new());
    let service = CallService::builder()
        .local_user(UserId::new(user))
        .signal_store(hub.clone())
        .signal_broadcast(hub.clone())
        .presence_channel(hub.clone())
        .media_backend(backend.clone())
        .outcome_sink(outcomes.clone())
        .chat_directory(directory.clone())
        .config(test_config())
        .build()
        .expect("service builds");
    let events = service.subscribe();
    service.start().await.expect("service starts");
    Participant {
        service,
        events,
        outcomes,
        backend,
    }
}

fn team_directory() -> Arc<StaticChatDirectory> {
    Arc::new(StaticChatDirectory::new().with_chat(
        ChatId::new("team"),
        ChatProfile {
            kind: ChatKind::Group,
            members: vec![
                UserId::new("alice"),
                UserId::new("bob"),
                UserId::new("carol"),
            ],
        },
    ))
}

async fn wait_stream_from(events: &mut broadcast::Receiver<CallEvent>, user: &str) {
    let expected = UserId::new(user);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(CallEvent::RemoteStreamAdded { user_id, .. }) if user_id == expected => return,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for stream from {user}"))
}

async fn wait_for_phase(service: &CallService, chat: &ChatId, phase: CallPhase) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if service.phase(chat).await == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("phase {phase} not reached, at {}", service.phase(chat).await);
}

#[tokio::test]
async fn three_party_group_call_forms_a_full_mesh() {
    let hub = Arc::new(LocalSignalHub::new());
    let directory = team_directory();
    let chat = ChatId::new("team");

    let mut alice = participant(&hub, &directory, "alice").await;
    let mut bob = participant(&hub, &directory, "bob").await;
    let mut carol = participant(&hub, &directory, "carol").await;

    // The starter is in the room immediately.
    alice
        .service
        .start_call(&chat, MediaConstraints::audio_only())
        .await
        .expect("call starts");
    assert_eq!(alice.service.phase(&chat).await, CallPhase::Active);

    wait_for_phase(&bob.service, &chat, CallPhase::Incoming).await;
    bob.service
        .accept_call(&chat, MediaConstraints::audio_only())
        .await
        .expect("bob joins");

    wait_for_phase(&carol.service, &chat, CallPhase::Incoming).await;
    carol
        .service
        .accept_call(&chat, MediaConstraints::audio_only())
        .await
        .expect("carol joins");

    // Every pair negotiates exactly one link; streams flow both ways.
    wait_stream_from(&mut alice.events, "bob").await;
    wait_stream_from(&mut alice.events, "carol").await;
    wait_stream_from(&mut bob.events, "alice").await;
    wait_stream_from(&mut bob.events, "carol").await;
    wait_stream_from(&mut carol.events, "alice").await;
    wait_stream_from(&mut carol.events, "bob").await;

    for p in [&alice, &bob, &carol] {
        let connections = p.backend.connections();
        assert_eq!(connections.len(), 2, "one link per remote participant");
        for connection in connections {
            assert!(
                connection.remote_description().is_some(),
                "every link finished negotiation"
            );
        }
    }

    // One member leaving does not close the room.
    bob.service.end_call(&chat).await.expect("bob leaves");
    wait_for_phase(&bob.service, &chat, CallPhase::Idle).await;
    assert_eq!(bob.outcomes.recorded(), vec![OutcomeStatus::Completed]);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match alice.events.recv().await {
                Ok(CallEvent::RemoteStreamRemoved { user_id, .. })
                    if user_id == UserId::new("bob") =>
                {
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("alice sees bob's stream removed");
    assert_eq!(alice.service.phase(&chat).await, CallPhase::Active);
    assert_eq!(carol.service.phase(&chat).await, CallPhase::Active);

    // The last hangup collapses the room for everyone left.
    alice.service.end_call(&chat).await.expect("alice leaves");
    wait_for_phase(&alice.service, &chat, CallPhase::Idle).await;
    wait_for_phase(&carol.service, &chat, CallPhase::Idle).await;
    assert_eq!(alice.outcomes.recorded(), vec![OutcomeStatus::Completed]);
    assert_eq!(carol.outcomes.recorded(), vec![OutcomeStatus::Completed]);

    alice.service.shutdown().await;
    bob.service.shutdown().await;
    carol.service.shutdown().await;
}

#[tokio::test]
async fn group_member_decline_leaves_room_open() {
    let hub = Arc::new(LocalSignalHub::new());
    let directory = team_directory();
    let chat = ChatId::new("team");

    let alice = participant(&hub, &directory, "alice").await;
    let bob = participant(&hub, &directory, "bob").await;

    alice
        .service
        .start_call(&chat, MediaConstraints::audio_only())
        .await
        .expect("call starts");

    wait_for_phase(&bob.service, &chat, CallPhase::Incoming).await;
    bob.service.reject_call(&chat).await.expect("bob declines");

    // A short grace period; alice's room must survive the reject.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.service.phase(&chat).await, CallPhase::Active);
    assert_eq!(bob.outcomes.recorded(), vec![OutcomeStatus::Rejected]);
    assert!(alice.outcomes.recorded().is_empty());

    alice.service.shutdown().await;
    bob.service.shutdown().await;
}
