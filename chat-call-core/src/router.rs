//! Signal routing over the two-channel transport split.
//!
//! Technical signals (offer, answer, ice-candidate) ride a low-latency
//! ephemeral broadcast scoped to a per-chat topic: no persistence,
//! at-most-once, both parties must be subscribed concurrently. Session
//! signals (call-request, call-accept, call-reject, call-end) go to a
//! durable append-only store with a change feed, so an offline recipient
//! can discover them later through the fallback poller.
//!
//! `send` is deliberately infallible: transport failures are logged and
//! swallowed. Callers treat delivery as best-effort and rely on the state
//! machine's idempotence, not on retries.

use crate::types::{CallSignal, ChatId, PresenceEntry, SignalEnvelope, SignalId, UserId};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Signal transport errors.
#[derive(Error, Debug)]
pub enum SignalError {
    /// Durable store failure.
    #[error("signal store error: {0}")]
    Store(String),

    /// Ephemeral broadcast failure.
    #[error("signal transport error: {0}")]
    Transport(String),

    /// Presence channel failure.
    #[error("presence error: {0}")]
    Presence(String),
}

/// Durable append-only store for session signals.
///
/// Records are never mutated; logical at-most-once consumption is enforced
/// by the router's id dedup, not by the store.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Append a signal record.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    async fn append(&self, signal: CallSignal) -> Result<(), SignalError>;

    /// Subscribe to the change feed of signals addressed to `recipient`.
    ///
    /// Only records appended after the subscription are delivered.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established.
    async fn watch(&self, recipient: &UserId) -> Result<mpsc::Receiver<CallSignal>, SignalError>;

    /// Most recent `call-request` addressed to `recipient`, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    async fn latest_call_request(
        &self,
        recipient: &UserId,
    ) -> Result<Option<CallSignal>, SignalError>;
}

/// Ephemeral per-topic broadcast for technical signals.
///
/// Delivery is at-most-once and only reaches currently subscribed parties.
/// Dropping the returned receiver unsubscribes.
#[async_trait]
pub trait SignalBroadcast: Send + Sync {
    /// Publish an envelope on a topic.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the publish.
    async fn publish(&self, topic: &str, envelope: SignalEnvelope) -> Result<(), SignalError>;

    /// Subscribe to a topic.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<SignalEnvelope>, SignalError>;
}

/// Presence announcements on a call topic.
///
/// Every join and leave produces a fresh full snapshot on the watch stream.
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    /// Announce the local participant on a topic.
    ///
    /// # Errors
    ///
    /// Returns error if the announcement cannot be delivered.
    async fn announce(&self, topic: &str, entry: PresenceEntry) -> Result<(), SignalError>;

    /// Watch presence snapshots for a topic.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription cannot be established.
    async fn watch(
        &self,
        topic: &str,
    ) -> Result<mpsc::Receiver<Vec<PresenceEntry>>, SignalError>;

    /// Withdraw the local participant from a topic. Best effort.
    async fn leave(&self, topic: &str, user: &UserId);
}

/// Topic name for a chat's call channel.
#[must_use]
pub fn call_topic(chat_id: &ChatId) -> String {
    format!("call:{chat_id}")
}

/// Bounded set of already-sighted signal ids.
///
/// Guards against the same durable record arriving through both the change
/// feed and the fallback poller.
struct SeenSet {
    ids: HashSet<SignalId>,
    order: VecDeque<SignalId>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert the id; returns `true` only on first sighting.
    fn insert(&mut self, id: SignalId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

/// A joined call topic: filtered technical signals plus presence snapshots.
///
/// Dropping the handle stops the filter task and unsubscribes from the
/// broadcast; presence withdrawal is explicit via
/// [`SignalRouter::leave_call_topic`].
pub struct CallTopic {
    /// Technical signals addressed to the local user on this chat.
    pub technical: mpsc::Receiver<CallSignal>,
    /// Presence snapshots for the topic.
    pub presence: mpsc::Receiver<Vec<PresenceEntry>>,
    filter_task: JoinHandle<()>,
}

impl Drop for CallTopic {
    fn drop(&mut self) {
        self.filter_task.abort();
    }
}

/// Routes call signals between participants over the two channels.
pub struct SignalRouter {
    local_user: UserId,
    store: Arc<dyn SignalStore>,
    bus: Arc<dyn SignalBroadcast>,
    presence: Arc<dyn PresenceChannel>,
    seen: parking_lot::Mutex<SeenSet>,
}

impl SignalRouter {
    /// Create a router for one local participant.
    pub fn new(
        local_user: UserId,
        store: Arc<dyn SignalStore>,
        bus: Arc<dyn SignalBroadcast>,
        presence: Arc<dyn PresenceChannel>,
    ) -> Self {
        Self {
            local_user,
            store,
            bus,
            presence,
            seen: parking_lot::Mutex::new(SeenSet::new(1024)),
        }
    }

    /// The local participant this router serves.
    #[must_use]
    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Send a signal, best-effort.
    ///
    /// Technical signals are published on the chat's ephemeral topic;
    /// session signals are appended to the durable store. Failures are
    /// logged and swallowed: a dropped technical signal is never resent,
    /// and session signals get a second chance via the fallback poller.
    pub async fn send(&self, signal: CallSignal) {
        let kind = signal.kind();
        if kind.is_technical() {
            let topic = call_topic(&signal.chat_id);
            if let Err(e) = self.bus.publish(&topic, signal).await {
                tracing::warn!(%kind, %topic, error = %e, "dropping undeliverable technical signal");
            }
        } else {
            tracing::debug!(
                %kind,
                chat_id = %signal.chat_id,
                to = %signal.to_user_id,
                "appending session signal"
            );
            if let Err(e) = self.store.append(signal).await {
                tracing::warn!(%kind, error = %e, "failed to persist session signal");
            }
        }
    }

    /// Join a chat's call topic: subscribe to technical signals and
    /// presence, and announce the local participant.
    ///
    /// Incoming envelopes are filtered to `to == local user` and
    /// `chat == this chat`; everything else is discarded.
    ///
    /// # Errors
    ///
    /// Returns error if any subscription or the announcement fails.
    pub async fn join_call_topic(&self, chat_id: &ChatId) -> Result<CallTopic, SignalError> {
        let topic = call_topic(chat_id);
        let mut raw = self.bus.subscribe(&topic).await?;
        let presence_rx = self.presence.watch(&topic).await?;
        self.presence
            .announce(&topic, PresenceEntry::now(self.local_user.clone()))
            .await?;

        let (tx, rx) = mpsc::channel(64);
        let local = self.local_user.clone();
        let chat = chat_id.clone();
        let filter_task = tokio::spawn(async move {
            while let Some(envelope) = raw.recv().await {
                if envelope.to_user_id != local || envelope.chat_id != chat {
                    continue;
                }
                if !envelope.kind().is_technical() {
                    tracing::debug!(kind = %envelope.kind(), "ignoring session signal on ephemeral topic");
                    continue;
                }
                if tx.send(envelope).await.is_err() {
                    break;
                }
            }
        });

        tracing::debug!(%topic, user = %self.local_user, "joined call topic");
        Ok(CallTopic {
            technical: rx,
            presence: presence_rx,
            filter_task,
        })
    }

    /// Withdraw presence from a chat's call topic.
    pub async fn leave_call_topic(&self, chat_id: &ChatId) {
        let topic = call_topic(chat_id);
        self.presence.leave(&topic, &self.local_user).await;
        tracing::debug!(%topic, user = %self.local_user, "left call topic");
    }

    /// Subscribe to the durable change feed of session signals addressed to
    /// the local user. This is the primary delivery path; the fallback
    /// poller covers records missed while offline.
    ///
    /// # Errors
    ///
    /// Returns error if the store subscription fails.
    pub async fn watch_session_signals(
        &self,
    ) -> Result<mpsc::Receiver<CallSignal>, SignalError> {
        self.store.watch(&self.local_user).await
    }

    /// Most recent durable `call-request` for the local user.
    ///
    /// # Errors
    ///
    /// Returns error if the store query fails.
    pub async fn latest_call_request(&self) -> Result<Option<CallSignal>, SignalError> {
        self.store.latest_call_request(&self.local_user).await
    }

    /// Record a signal id sighting; returns `true` only the first time.
    ///
    /// Both the primary change-feed loop and the fallback poller run their
    /// deliveries through this, so a record discovered twice transitions
    /// the state machine at most once.
    pub fn first_sighting(&self, id: SignalId) -> bool {
        self.seen.lock().insert(id)
    }
}
