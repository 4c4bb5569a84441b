//! In-process transport and media implementations.
//!
//! [`LocalSignalHub`] implements all three signaling seams over shared
//! memory and [`StubMediaBackend`] fakes the media runtime with scripted
//! SDP and candidate events. They back the test suite and any
//! single-process embedding that wants call orchestration without a
//! network.

use crate::call::OutcomeSink;
use crate::media::{
    ConnectionEvent, ConnectionHandle, LinkState, LocalMedia, MediaBackend, MediaError,
    NewConnection, RemoteMedia, SdpType,
};
use crate::router::{PresenceChannel, SignalBroadcast, SignalError, SignalStore};
use crate::service::{ChatDirectory, ChatProfile};
use crate::types::{
    CallOutcome, CallSignal, ChatId, IceCandidate, MediaConstraints, OutcomeStatus,
    PresenceEntry, SignalEnvelope, SignalKind, UserId,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct HubState {
    records: Vec<CallSignal>,
    record_watchers: Vec<(UserId, mpsc::Sender<CallSignal>)>,
    topic_subscribers: HashMap<String, Vec<mpsc::Sender<SignalEnvelope>>>,
    presence: HashMap<String, Vec<PresenceEntry>>,
    presence_watchers: HashMap<String, Vec<mpsc::Sender<Vec<PresenceEntry>>>>,
}

/// Shared-memory signal hub: durable store, ephemeral broadcast, and
/// presence channel in one.
///
/// Locks are never held across sends; closed subscribers are pruned on
/// the next operation touching them.
#[derive(Default)]
pub struct LocalSignalHub {
    state: parking_lot::Mutex<HubState>,
}

impl LocalSignalHub {
    /// Empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn presence_snapshot_targets(
        &self,
        topic: &str,
    ) -> (Vec<PresenceEntry>, Vec<mpsc::Sender<Vec<PresenceEntry>>>) {
        let mut state = self.state.lock();
        let snapshot = state.presence.get(topic).cloned().unwrap_or_default();
        let watchers = state.presence_watchers.entry(topic.to_string()).or_default();
        watchers.retain(|w| !w.is_closed());
        (snapshot, watchers.clone())
    }

    async fn broadcast_presence(&self, topic: &str) {
        let (snapshot, watchers) = self.presence_snapshot_targets(topic);
        for watcher in watchers {
            let _ = watcher.send(snapshot.clone()).await;
        }
    }
}

#[async_trait]
impl SignalStore for LocalSignalHub {
    async fn append(&self, signal: CallSignal) -> Result<(), SignalError> {
        let watchers: Vec<mpsc::Sender<CallSignal>> = {
            let mut state = self.state.lock();
            state.records.push(signal.clone());
            state.record_watchers.retain(|(_, tx)| !tx.is_closed());
            state
                .record_watchers
                .iter()
                .filter(|(user, _)| *user == signal.to_user_id)
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for watcher in watchers {
            let _ = watcher.send(signal.clone()).await;
        }
        Ok(())
    }

    async fn watch(&self, recipient: &UserId) -> Result<mpsc::Receiver<CallSignal>, SignalError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.state
            .lock()
            .record_watchers
            .push((recipient.clone(), tx));
        Ok(rx)
    }

    async fn latest_call_request(
        &self,
        recipient: &UserId,
    ) -> Result<Option<CallSignal>, SignalError> {
        let state = self.state.lock();
        Ok(state
            .records
            .iter()
            .filter(|s| s.to_user_id == *recipient && s.kind() == SignalKind::CallRequest)
            .max_by_key(|s| s.created_at)
            .cloned())
    }
}

#[async_trait]
impl SignalBroadcast for LocalSignalHub {
    async fn publish(&self, topic: &str, envelope: SignalEnvelope) -> Result<(), SignalError> {
        let subscribers: Vec<mpsc::Sender<SignalEnvelope>> = {
            let mut state = self.state.lock();
            match state.topic_subscribers.get_mut(topic) {
                Some(subs) => {
                    subs.retain(|s| !s.is_closed());
                    subs.clone()
                }
                // Nobody listening: at-most-once means the signal is gone.
                None => return Ok(()),
            }
        };
        for subscriber in subscribers {
            let _ = subscriber.send(envelope.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<SignalEnvelope>, SignalError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.state
            .lock()
            .topic_subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[async_trait]
impl PresenceChannel for LocalSignalHub {
    async fn announce(&self, topic: &str, entry: PresenceEntry) -> Result<(), SignalError> {
        {
            let mut state = self.state.lock();
            let entries = state.presence.entry(topic.to_string()).or_default();
            entries.retain(|e| e.user_id != entry.user_id);
            entries.push(entry);
        }
        self.broadcast_presence(topic).await;
        Ok(())
    }

    async fn watch(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<Vec<PresenceEntry>>, SignalError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let snapshot = {
            let mut state = self.state.lock();
            state
                .presence_watchers
                .entry(topic.to_string())
                .or_default()
                .push(tx.clone());
            state.presence.get(topic).cloned().unwrap_or_default()
        };
        // Late watchers see who is already in the call.
        let _ = tx.send(snapshot).await;
        Ok(rx)
    }

    async fn leave(&self, topic: &str, user: &UserId) {
        {
            let mut state = self.state.lock();
            if let Some(entries) = state.presence.get_mut(topic) {
                entries.retain(|e| e.user_id != *user);
            }
        }
        self.broadcast_presence(topic).await;
    }
}

/// Fake local capture tracks.
pub struct StubLocalMedia {
    audio: AtomicBool,
    video: AtomicBool,
    stopped: AtomicBool,
}

impl StubLocalMedia {
    fn new(constraints: &MediaConstraints) -> Self {
        Self {
            audio: AtomicBool::new(constraints.audio),
            video: AtomicBool::new(constraints.video),
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether `stop` was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalMedia for StubLocalMedia {
    fn set_audio_enabled(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video.store(enabled, Ordering::SeqCst);
    }

    fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    fn video_enabled(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Fake remote stream handle.
pub struct StubRemoteStream {
    id: String,
}

impl RemoteMedia for StubRemoteStream {
    fn stream_id(&self) -> &str {
        &self.id
    }
}

#[derive(Default)]
struct StubConnectionState {
    remote_description: Option<(SdpType, String)>,
    local_description: Option<String>,
    applied_candidates: Vec<IceCandidate>,
    has_local_media: bool,
    closed: bool,
}

/// Scripted peer connection: descriptions succeed in order, two local
/// candidates trickle after each local description, and applying a remote
/// description surfaces a remote stream and a connected state.
pub struct StubConnection {
    label: usize,
    state: parking_lot::Mutex<StubConnectionState>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl StubConnection {
    /// Candidates applied so far, in application order.
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// The remote description currently set, if any.
    #[must_use]
    pub fn remote_description(&self) -> Option<String> {
        self.state
            .lock()
            .remote_description
            .as_ref()
            .map(|(_, sdp)| sdp.clone())
    }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    async fn trickle_candidates(&self) {
        for n in 0..2u16 {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{label}-{n} 1 UDP {n} 192.0.2.{label} 9 typ host",
                    label = self.label
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            };
            let _ = self
                .events
                .send(ConnectionEvent::LocalCandidate(candidate))
                .await;
        }
    }
}

#[async_trait]
impl ConnectionHandle for StubConnection {
    async fn attach_local_media(&self, _media: Arc<dyn LocalMedia>) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        state.has_local_media = true;
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        let sdp = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            let sdp = format!("v=0 stub-offer-{}", self.label);
            state.local_description = Some(sdp.clone());
            sdp
        };
        self.trickle_candidates().await;
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        let sdp = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            match state.remote_description {
                Some((SdpType::Offer, _)) => {}
                _ => return Err(MediaError::NegotiationState("answer without a remote offer")),
            }
            let sdp = format!("v=0 stub-answer-{}", self.label);
            state.local_description = Some(sdp.clone());
            sdp
        };
        self.trickle_candidates().await;
        Ok(sdp)
    }

    async fn set_remote_description(
        &self,
        sdp_type: SdpType,
        sdp: &str,
    ) -> Result<(), MediaError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(MediaError::Closed);
            }
            state.remote_description = Some((sdp_type, sdp.to_string()));
        }
        let stream = Arc::new(StubRemoteStream {
            id: format!("stub-stream-{}", self.label),
        });
        let _ = self
            .events
            .send(ConnectionEvent::RemoteStream(stream))
            .await;
        let _ = self
            .events
            .send(ConnectionEvent::StateChanged(LinkState::Connected))
            .await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(MediaError::Closed);
        }
        if state.remote_description.is_none() {
            return Err(MediaError::NegotiationState(
                "candidate before remote description",
            ));
        }
        state.applied_candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Fake media runtime handing out [`StubConnection`]s.
#[derive(Default)]
pub struct StubMediaBackend {
    fail_acquisition: bool,
    media: parking_lot::Mutex<Vec<Arc<StubLocalMedia>>>,
    connections: parking_lot::Mutex<Vec<Arc<StubConnection>>>,
}

impl StubMediaBackend {
    /// A backend where everything succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose media acquisition always fails, as if the devices
    /// were denied.
    #[must_use]
    pub fn failing_acquisition() -> Self {
        Self {
            fail_acquisition: true,
            ..Self::default()
        }
    }

    /// Every connection handed out so far, in creation order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<StubConnection>> {
        self.connections.lock().clone()
    }

    /// Every local media handle handed out so far.
    #[must_use]
    pub fn media_handles(&self) -> Vec<Arc<StubLocalMedia>> {
        self.media.lock().clone()
    }
}

#[async_trait]
impl MediaBackend for StubMediaBackend {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, MediaError> {
        if self.fail_acquisition {
            return Err(MediaError::Acquisition("devices denied".to_string()));
        }
        let media = Arc::new(StubLocalMedia::new(constraints));
        self.media.lock().push(media.clone());
        Ok(media)
    }

    async fn create_connection(&self) -> Result<NewConnection, MediaError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connection = {
            let mut connections = self.connections.lock();
            let connection = Arc::new(StubConnection {
                label: connections.len(),
                state: parking_lot::Mutex::default(),
                events: tx,
            });
            connections.push(connection.clone());
            connection
        };
        Ok(NewConnection {
            handle: connection,
            events: rx,
        })
    }
}

/// Fixed chat directory for tests and single-process embeddings.
#[derive(Default)]
pub struct StaticChatDirectory {
    chats: HashMap<ChatId, ChatProfile>,
}

impl StaticChatDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chat.
    #[must_use]
    pub fn with_chat(mut self, chat_id: ChatId, profile: ChatProfile) -> Self {
        self.chats.insert(chat_id, profile);
        self
    }
}

#[async_trait]
impl ChatDirectory for StaticChatDirectory {
    async fn lookup(&self, chat_id: &ChatId) -> anyhow::Result<Option<ChatProfile>> {
        Ok(self.chats.get(chat_id).cloned())
    }
}

/// Discards every outcome.
pub struct NullOutcomeSink;

#[async_trait]
impl OutcomeSink for NullOutcomeSink {
    async fn append_outcome(&self, _chat_id: &ChatId, _outcome: CallOutcome) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Remembers every outcome for assertions.
#[derive(Default)]
pub struct RecordingOutcomeSink {
    records: parking_lot::Mutex<Vec<(ChatId, CallOutcome)>>,
}

impl RecordingOutcomeSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses recorded so far, in order.
    #[must_use]
    pub fn recorded(&self) -> Vec<OutcomeStatus> {
        self.records.lock().iter().map(|(_, o)| o.status).collect()
    }

    /// Full records, in order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<(ChatId, CallOutcome)> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl OutcomeSink for RecordingOutcomeSink {
    async fn append_outcome(&self, chat_id: &ChatId, outcome: CallOutcome) -> anyhow::Result<()> {
        self.records.lock().push((chat_id.clone(), outcome));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SignalPayload;
    use std::time::Duration;

    #[tokio::test]
    async fn presence_watchers_get_current_snapshot_immediately() {
        let hub = LocalSignalHub::new();
        hub.announce("call:chat-1", PresenceEntry::now(UserId::new("alice")))
            .await
            .unwrap();

        let mut watch = PresenceChannel::watch(&hub, "call:chat-1").await.unwrap();
        let snapshot = watch.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].user_id, UserId::new("alice"));

        hub.leave("call:chat-1", &UserId::new("alice")).await;
        let snapshot = tokio::time::timeout(Duration::from_secs(1), watch.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn reannounce_replaces_rather_than_duplicates() {
        let hub = LocalSignalHub::new();
        hub.announce("t", PresenceEntry::now(UserId::new("alice")))
            .await
            .unwrap();
        hub.announce("t", PresenceEntry::now(UserId::new("alice")))
            .await
            .unwrap();

        let mut watch = PresenceChannel::watch(&hub, "t").await.unwrap();
        let snapshot = watch.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let hub = LocalSignalHub::new();
        let signal = CallSignal::new(
            ChatId::new("chat-1"),
            UserId::new("alice"),
            UserId::new("bob"),
            SignalPayload::Offer {
                sdp: "v=0".to_string(),
            },
        );
        hub.publish("call:chat-1", signal).await.unwrap();

        // A later subscriber must not see it.
        let mut rx = hub.subscribe("call:chat-1").await.unwrap();
        let empty = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(empty.is_err());
    }

    #[tokio::test]
    async fn stub_connection_enforces_negotiation_order() {
        let backend = StubMediaBackend::new();
        let NewConnection { handle, .. } = backend.create_connection().await.unwrap();

        assert!(handle.create_answer().await.is_err());
        let candidate = IceCandidate {
            candidate: "candidate:x".to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        };
        assert!(handle.add_ice_candidate(&candidate).await.is_err());

        handle
            .set_remote_description(SdpType::Offer, "v=0")
            .await
            .unwrap();
        assert!(handle.create_answer().await.is_ok());
        assert!(handle.add_ice_candidate(&candidate).await.is_ok());
    }
}
