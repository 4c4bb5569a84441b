//! Application-facing call service.
//!
//! [`CallService`] owns one [`ChatCall`] machine per chat, a dispatch
//! loop that merges the durable change feed with the fallback poller,
//! and the event channel the UI subscribes to. Every durable signal
//! passes through the router's id dedup before dispatch, so a record
//! discovered by both delivery paths transitions its machine at most
//! once.

use crate::call::{CallConfig, CallError, CallEvent, ChatCall, OutcomeSink};
use crate::media::MediaBackend;
use crate::poller::{CallActivity, FallbackPoller};
use crate::router::{PresenceChannel, SignalBroadcast, SignalRouter, SignalStore};
use crate::types::{CallPhase, CallSignal, ChatId, ChatKind, MediaConstraints, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

/// What the service needs to know about a chat before calling into it.
#[derive(Debug, Clone)]
pub struct ChatProfile {
    /// Direct or group.
    pub kind: ChatKind,
    /// Full member list, including the local user.
    pub members: Vec<UserId>,
}

/// Lookup seam into the surrounding messaging application's chat list.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// Resolve a chat id, or `None` if the chat does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the lookup itself fails.
    async fn lookup(&self, chat_id: &ChatId) -> anyhow::Result<Option<ChatProfile>>;
}

struct ServiceInner {
    local_user: UserId,
    router: Arc<SignalRouter>,
    backend: Arc<dyn MediaBackend>,
    outcomes: Arc<dyn OutcomeSink>,
    directory: Arc<dyn ChatDirectory>,
    config: CallConfig,
    chats: RwLock<HashMap<ChatId, ChatCall>>,
    events: broadcast::Sender<CallEvent>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Call orchestration service for one local participant.
#[derive(Clone)]
pub struct CallService {
    inner: Arc<ServiceInner>,
}

/// Poller-facing view of the service: busy while any chat is non-idle.
struct ServiceActivity {
    inner: Weak<ServiceInner>,
}

#[async_trait]
impl CallActivity for ServiceActivity {
    async fn in_call(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return true;
        };
        let chats: Vec<ChatCall> = inner.chats.read().await.values().cloned().collect();
        for call in chats {
            if call.phase().await != CallPhase::Idle {
                return true;
            }
        }
        false
    }
}

impl CallService {
    /// Start building a service.
    #[must_use]
    pub fn builder() -> CallServiceBuilder {
        CallServiceBuilder::default()
    }

    /// The local participant this service serves.
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.inner.local_user
    }

    /// Subscribe to call events across all chats.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Start the dispatch loop and the fallback poller. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the durable change feed cannot be subscribed.
    #[tracing::instrument(skip(self), fields(user = %self.inner.local_user))]
    pub async fn start(&self) -> Result<(), CallError> {
        {
            let tasks = self.inner.tasks.lock();
            if !tasks.is_empty() {
                return Ok(());
            }
        }

        let mut feed = self.inner.router.watch_session_signals().await?;
        let (tx, rx) = mpsc::channel(64);

        let feed_tx = tx.clone();
        let feed_task = tokio::spawn(async move {
            while let Some(signal) = feed.recv().await {
                if feed_tx.send(signal).await.is_err() {
                    break;
                }
            }
        });

        let poller = FallbackPoller::new(
            self.inner.router.clone(),
            Arc::new(ServiceActivity {
                inner: Arc::downgrade(&self.inner),
            }),
            self.inner.config.poll_interval,
            self.inner.config.request_freshness,
            tx,
        );
        let poll_task = poller.spawn();

        let dispatch_task = tokio::spawn(dispatch_loop(self.clone(), rx));

        let mut tasks = self.inner.tasks.lock();
        tasks.push(feed_task);
        tasks.push(poll_task);
        tasks.push(dispatch_task);
        tracing::info!("call service started");
        Ok(())
    }

    /// End every call and stop the background tasks.
    pub async fn shutdown(&self) {
        let chats: Vec<ChatCall> = self.inner.chats.read().await.values().cloned().collect();
        for call in chats {
            if let Err(e) = call.end_call().await {
                tracing::warn!(error = %e, "failed to end call during shutdown");
            }
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(user = %self.inner.local_user, "call service stopped");
    }

    /// Start a call in a chat.
    ///
    /// # Errors
    ///
    /// Returns error if the chat is unknown, a call already exists, or
    /// media setup fails.
    pub async fn start_call(
        &self,
        chat_id: &ChatId,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        self.ensure_chat(chat_id).await?.start_call(constraints).await
    }

    /// Accept the ringing call in a chat.
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing or media setup fails.
    pub async fn accept_call(
        &self,
        chat_id: &ChatId,
        constraints: MediaConstraints,
    ) -> Result<(), CallError> {
        self.existing(chat_id).await?.accept_call(constraints).await
    }

    /// Decline the ringing call in a chat.
    ///
    /// # Errors
    ///
    /// Returns error if nothing is ringing.
    pub async fn reject_call(&self, chat_id: &ChatId) -> Result<(), CallError> {
        self.existing(chat_id).await?.reject_call().await
    }

    /// End the call in a chat. No-op when idle.
    ///
    /// # Errors
    ///
    /// Returns error if the chat has never been called in and is unknown.
    pub async fn end_call(&self, chat_id: &ChatId) -> Result<(), CallError> {
        match self.existing(chat_id).await {
            Ok(call) => call.end_call().await,
            // No machine means no call; ending nothing is fine.
            Err(CallError::NoCall) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Toggle the local microphone in a chat's call.
    ///
    /// # Errors
    ///
    /// Returns error if no call is engaged.
    pub async fn toggle_mute(&self, chat_id: &ChatId) -> Result<bool, CallError> {
        self.existing(chat_id).await?.toggle_mute().await
    }

    /// Toggle the local camera in a chat's call.
    ///
    /// # Errors
    ///
    /// Returns error if no call is engaged.
    pub async fn toggle_video(&self, chat_id: &ChatId) -> Result<bool, CallError> {
        self.existing(chat_id).await?.toggle_video().await
    }

    /// Whether the local microphone is enabled in a chat's call.
    ///
    /// # Errors
    ///
    /// Returns error if no call is engaged.
    pub async fn audio_enabled(&self, chat_id: &ChatId) -> Result<bool, CallError> {
        self.existing(chat_id).await?.audio_enabled().await
    }

    /// Whether the local camera is enabled in a chat's call.
    ///
    /// # Errors
    ///
    /// Returns error if no call is engaged.
    pub async fn video_enabled(&self, chat_id: &ChatId) -> Result<bool, CallError> {
        self.existing(chat_id).await?.video_enabled().await
    }

    /// Current phase for a chat; Idle for chats without a machine.
    pub async fn phase(&self, chat_id: &ChatId) -> CallPhase {
        match self.inner.chats.read().await.get(chat_id) {
            Some(call) => call.phase().await,
            None => CallPhase::Idle,
        }
    }

    async fn existing(&self, chat_id: &ChatId) -> Result<ChatCall, CallError> {
        self.inner
            .chats
            .read()
            .await
            .get(chat_id)
            .cloned()
            .ok_or(CallError::NoCall)
    }

    async fn ensure_chat(&self, chat_id: &ChatId) -> Result<ChatCall, CallError> {
        if let Some(call) = self.inner.chats.read().await.get(chat_id) {
            return Ok(call.clone());
        }

        let profile = self
            .inner
            .directory
            .lookup(chat_id)
            .await
            .map_err(|e| CallError::Directory(e.to_string()))?
            .ok_or_else(|| CallError::UnknownChat(chat_id.clone()))?;

        let mut chats = self.inner.chats.write().await;
        if let Some(call) = chats.get(chat_id) {
            return Ok(call.clone());
        }
        let call = ChatCall::new(
            chat_id.clone(),
            profile.kind,
            profile.members,
            self.inner.local_user.clone(),
            self.inner.router.clone(),
            self.inner.backend.clone(),
            self.inner.outcomes.clone(),
            self.inner.events.clone(),
            self.inner.config.clone(),
        );
        chats.insert(chat_id.clone(), call.clone());
        tracing::debug!(%chat_id, kind = ?profile.kind, "chat call machine created");
        Ok(call)
    }
}

/// Merged delivery loop: change feed plus poller, deduped by signal id,
/// routed to the owning chat machine.
async fn dispatch_loop(service: CallService, mut rx: mpsc::Receiver<CallSignal>) {
    while let Some(signal) = rx.recv().await {
        if !service.inner.router.first_sighting(signal.id) {
            tracing::trace!(id = %signal.id, "duplicate signal suppressed");
            continue;
        }
        let chat = match service.ensure_chat(&signal.chat_id).await {
            Ok(chat) => chat,
            Err(e) => {
                tracing::warn!(
                    chat_id = %signal.chat_id,
                    error = %e,
                    "dropping signal for unresolvable chat"
                );
                continue;
            }
        };
        chat.handle_session_signal(signal).await;
    }
}

/// Builder for [`CallService`], wiring transports and seams.
#[derive(Default)]
pub struct CallServiceBuilder {
    local_user: Option<UserId>,
    store: Option<Arc<dyn SignalStore>>,
    bus: Option<Arc<dyn SignalBroadcast>>,
    presence: Option<Arc<dyn PresenceChannel>>,
    backend: Option<Arc<dyn MediaBackend>>,
    outcomes: Option<Arc<dyn OutcomeSink>>,
    directory: Option<Arc<dyn ChatDirectory>>,
    config: Option<CallConfig>,
}

impl CallServiceBuilder {
    /// The local participant.
    #[must_use]
    pub fn local_user(mut self, user: UserId) -> Self {
        self.local_user = Some(user);
        self
    }

    /// Durable store for session signals.
    #[must_use]
    pub fn signal_store(mut self, store: Arc<dyn SignalStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Ephemeral broadcast for technical signals.
    #[must_use]
    pub fn signal_broadcast(mut self, bus: Arc<dyn SignalBroadcast>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Presence channel for call topics.
    #[must_use]
    pub fn presence_channel(mut self, presence: Arc<dyn PresenceChannel>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Media runtime backend.
    #[must_use]
    pub fn media_backend(mut self, backend: Arc<dyn MediaBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Sink for finished-call records.
    #[must_use]
    pub fn outcome_sink(mut self, outcomes: Arc<dyn OutcomeSink>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    /// Chat directory of the surrounding application.
    #[must_use]
    pub fn chat_directory(mut self, directory: Arc<dyn ChatDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Override the default timings.
    #[must_use]
    pub fn config(mut self, config: CallConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the service.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Incomplete`] if a required seam is missing.
    pub fn build(self) -> Result<CallService, CallError> {
        let local_user = self.local_user.ok_or(CallError::Incomplete("local_user"))?;
        let store = self.store.ok_or(CallError::Incomplete("signal_store"))?;
        let bus = self.bus.ok_or(CallError::Incomplete("signal_broadcast"))?;
        let presence = self
            .presence
            .ok_or(CallError::Incomplete("presence_channel"))?;
        let backend = self.backend.ok_or(CallError::Incomplete("media_backend"))?;
        let outcomes = self.outcomes.ok_or(CallError::Incomplete("outcome_sink"))?;
        let directory = self
            .directory
            .ok_or(CallError::Incomplete("chat_directory"))?;
        let config = self.config.unwrap_or_default();

        let router = Arc::new(SignalRouter::new(local_user.clone(), store, bus, presence));
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(CallService {
            inner: Arc::new(ServiceInner {
                local_user,
                router,
                backend,
                outcomes,
                directory,
                config,
                chats: RwLock::new(HashMap::new()),
                events,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::local::{LocalSignalHub, NullOutcomeSink, StaticChatDirectory, StubMediaBackend};

    fn service_for(hub: &Arc<LocalSignalHub>, user: &str) -> CallService {
        let directory = StaticChatDirectory::new().with_chat(
            ChatId::new("chat-1"),
            ChatProfile {
                kind: ChatKind::Direct,
                members: vec![UserId::new("alice"), UserId::new("bob")],
            },
        );
        CallService::builder()
            .local_user(UserId::new(user))
            .signal_store(hub.clone())
            .signal_broadcast(hub.clone())
            .presence_channel(hub.clone())
            .media_backend(Arc::new(StubMediaBackend::new()))
            .outcome_sink(Arc::new(NullOutcomeSink))
            .chat_directory(Arc::new(directory))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn builder_requires_every_seam() {
        let result = CallService::builder()
            .local_user(UserId::new("alice"))
            .build();
        match result {
            Err(CallError::Incomplete(missing)) => assert_eq!(missing, "signal_store"),
            Err(other) => panic!("expected missing signal_store, got {other}"),
            Ok(_) => panic!("builder accepted an incomplete configuration"),
        }
    }

    #[tokio::test]
    async fn unknown_chat_is_rejected() {
        let hub = Arc::new(LocalSignalHub::new());
        let service = service_for(&hub, "alice");
        let err = service
            .start_call(&ChatId::new("nope"), MediaConstraints::audio_only())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::UnknownChat(_)));
    }

    #[tokio::test]
    async fn phase_defaults_to_idle_and_end_is_noop() {
        let hub = Arc::new(LocalSignalHub::new());
        let service = service_for(&hub, "alice");
        assert_eq!(service.phase(&ChatId::new("chat-1")).await, CallPhase::Idle);
        service.end_call(&ChatId::new("chat-1")).await.unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let hub = Arc::new(LocalSignalHub::new());
        let service = service_for(&hub, "alice");
        service.start().await.unwrap();
        service.start().await.unwrap();
        service.shutdown().await;
    }

    #[tokio::test]
    async fn accept_without_ringing_call_fails() {
        let hub = Arc::new(LocalSignalHub::new());
        let service = service_for(&hub, "bob");
        let err = service
            .accept_call(&ChatId::new("chat-1"), MediaConstraints::audio_only())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NoCall));
    }
}
