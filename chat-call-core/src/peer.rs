//! Per-session peer link management.
//!
//! One [`PeerManager`] exists per call session and exclusively owns one
//! [`PeerLink`] per remote participant, so concurrent sessions in
//! different chats can never cross-talk. The manager drives the
//! offer/answer/candidate exchange through the [`SignalRouter`] and
//! surfaces stream add/remove and link-closed events to the call state
//! machine.
//!
//! ICE candidates arriving before the remote description queue in arrival
//! order and are flushed exactly once when the description lands; order
//! matters because candidates belong to a specific negotiation round.

use crate::media::{
    ConnectionEvent, ConnectionHandle, LocalMedia, MediaBackend, MediaError, NewConnection,
    RemoteMedia, SdpType,
};
use crate::router::SignalRouter;
use crate::types::{CallSignal, ChatId, IceCandidate, SignalPayload, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Events surfaced by the peer manager to the call state machine.
pub enum PeerEvent {
    /// A remote participant's media stream arrived.
    StreamAdded {
        /// The remote participant.
        user: UserId,
        /// Their stream.
        stream: Arc<dyn RemoteMedia>,
    },
    /// A remote participant's stream went away.
    StreamRemoved {
        /// The remote participant.
        user: UserId,
    },
    /// A peer link was torn down (disconnect, failure, or removal).
    LinkClosed {
        /// The remote participant.
        user: UserId,
        /// Links still alive after the removal.
        remaining: usize,
    },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StreamAdded { user, stream } => f
                .debug_struct("StreamAdded")
                .field("user", user)
                .field("stream", &stream.stream_id())
                .finish(),
            Self::StreamRemoved { user } => {
                f.debug_struct("StreamRemoved").field("user", user).finish()
            }
            Self::LinkClosed { user, remaining } => f
                .debug_struct("LinkClosed")
                .field("user", user)
                .field("remaining", remaining)
                .finish(),
        }
    }
}

/// One peer-to-peer media connection to one remote participant.
struct PeerLink {
    handle: Arc<dyn ConnectionHandle>,
    initiator: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_stream: Option<Arc<dyn RemoteMedia>>,
    event_task: JoinHandle<()>,
    offer_task: Option<JoinHandle<()>>,
}

struct Inner {
    chat_id: ChatId,
    local_user: UserId,
    backend: Arc<dyn MediaBackend>,
    router: Arc<SignalRouter>,
    local_media: Arc<dyn LocalMedia>,
    links: RwLock<HashMap<UserId, PeerLink>>,
    events: mpsc::Sender<PeerEvent>,
    settle_delay: Duration,
}

/// Owns every peer link of one call session.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    /// Create a manager for one session, returning it together with the
    /// receiver for its [`PeerEvent`] stream.
    #[must_use]
    pub fn new(
        chat_id: ChatId,
        local_user: UserId,
        backend: Arc<dyn MediaBackend>,
        router: Arc<SignalRouter>,
        local_media: Arc<dyn LocalMedia>,
        settle_delay: Duration,
    ) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            chat_id,
            local_user,
            backend,
            router,
            local_media,
            links: RwLock::new(HashMap::new()),
            events: tx,
            settle_delay,
        });
        (Self { inner }, rx)
    }

    /// Create a link to `remote` if none exists yet.
    ///
    /// If `initiator` is set, an offer is created and sent after a short
    /// settling delay so tracks attach before negotiation starts.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot open the connection or attach
    /// local media.
    pub async fn ensure_link(&self, remote: &UserId, initiator: bool) -> Result<(), MediaError> {
        if self.inner.links.read().await.contains_key(remote) {
            return Ok(());
        }

        let NewConnection { handle, events } = self.inner.backend.create_connection().await?;
        handle
            .attach_local_media(self.inner.local_media.clone())
            .await?;

        let mut links = self.inner.links.write().await;
        // Another event may have raced us to the same remote.
        if links.contains_key(remote) {
            handle.close().await;
            return Ok(());
        }

        let event_task = tokio::spawn(forward_connection_events(
            self.inner.clone(),
            remote.clone(),
            events,
        ));
        let offer_task = initiator.then(|| {
            tokio::spawn(send_offer_after_settle(self.inner.clone(), remote.clone()))
        });

        tracing::debug!(
            chat_id = %self.inner.chat_id,
            %remote,
            initiator,
            "peer link created"
        );
        links.insert(
            remote.clone(),
            PeerLink {
                handle,
                initiator,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                remote_stream: None,
                event_task,
                offer_task,
            },
        );
        Ok(())
    }

    /// Apply a remote offer: create or reuse the non-initiator link, set
    /// the remote description, flush queued candidates in arrival order,
    /// then create and send the answer.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime rejects the description or answer.
    pub async fn handle_offer(&self, from: &UserId, sdp: &str) -> Result<(), MediaError> {
        self.ensure_link(from, false).await?;

        let handle = {
            let links = self.inner.links.read().await;
            let Some(link) = links.get(from) else {
                return Ok(());
            };
            if link.initiator {
                // The election picked us as offerer for this pair; a
                // crossing offer means the other side disagrees. Drop it.
                tracing::warn!(%from, "ignoring offer from the non-elected side");
                return Ok(());
            }
            link.handle.clone()
        };

        handle.set_remote_description(SdpType::Offer, sdp).await?;
        self.flush_candidates(from, &handle).await;

        let answer = handle.create_answer().await?;
        self.inner
            .router
            .send(CallSignal::new(
                self.inner.chat_id.clone(),
                self.inner.local_user.clone(),
                from.clone(),
                SignalPayload::Answer { sdp: answer },
            ))
            .await;
        Ok(())
    }

    /// Apply a remote answer on an existing link and flush queued
    /// candidates. An answer without a matching link is stale and dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime rejects the description.
    pub async fn handle_answer(&self, from: &UserId, sdp: &str) -> Result<(), MediaError> {
        let handle = {
            let links = self.inner.links.read().await;
            match links.get(from) {
                Some(link) => link.handle.clone(),
                None => {
                    tracing::warn!(%from, "answer for unknown peer link, dropping");
                    return Ok(());
                }
            }
        };

        handle.set_remote_description(SdpType::Answer, sdp).await?;
        self.flush_candidates(from, &handle).await;
        Ok(())
    }

    /// Apply a remote ICE candidate immediately if the remote description
    /// is set, otherwise queue it on that link's FIFO.
    ///
    /// # Errors
    ///
    /// Returns error if a link has to be created and that fails.
    pub async fn handle_candidate(
        &self,
        from: &UserId,
        candidate: IceCandidate,
    ) -> Result<(), MediaError> {
        // A candidate can be the first negotiation message we see.
        self.ensure_link(from, false).await?;

        let handle = {
            let mut links = self.inner.links.write().await;
            let Some(link) = links.get_mut(from) else {
                return Ok(());
            };
            if !link.remote_description_set {
                link.pending_candidates.push(candidate);
                return Ok(());
            }
            link.handle.clone()
        };

        if let Err(e) = handle.add_ice_candidate(&candidate).await {
            tracing::warn!(%from, error = %e, "failed to apply ICE candidate");
        }
        Ok(())
    }

    /// Mark the remote description as set and apply the queued candidates
    /// exactly once, in arrival order.
    async fn flush_candidates(&self, from: &UserId, handle: &Arc<dyn ConnectionHandle>) {
        let pending = {
            let mut links = self.inner.links.write().await;
            match links.get_mut(from) {
                Some(link) => {
                    link.remote_description_set = true;
                    std::mem::take(&mut link.pending_candidates)
                }
                None => return,
            }
        };
        for candidate in pending {
            if let Err(e) = handle.add_ice_candidate(&candidate).await {
                tracing::warn!(%from, error = %e, "failed to apply queued ICE candidate");
            }
        }
    }

    /// Tear down the link to one remote participant.
    ///
    /// Returns `false` if no such link existed.
    pub async fn remove_link(&self, remote: &UserId) -> bool {
        self.inner.remove_link(remote).await
    }

    /// Whether a link to `remote` exists.
    pub async fn has_link(&self, remote: &UserId) -> bool {
        self.inner.links.read().await.contains_key(remote)
    }

    /// Remote participants with a live link.
    pub async fn remote_ids(&self) -> Vec<UserId> {
        self.inner.links.read().await.keys().cloned().collect()
    }

    /// Number of live links.
    pub async fn link_count(&self) -> usize {
        self.inner.links.read().await.len()
    }

    /// Close every link without emitting per-link events.
    ///
    /// Used at session teardown, where a single call-ended notification
    /// supersedes individual stream removals.
    pub async fn close_all(&self) {
        let drained: Vec<(UserId, PeerLink)> =
            self.inner.links.write().await.drain().collect();
        for (remote, link) in drained {
            link.handle.close().await;
            if let Some(task) = &link.offer_task {
                task.abort();
            }
            link.event_task.abort();
            tracing::debug!(chat_id = %self.inner.chat_id, %remote, "peer link closed");
        }
    }
}

impl Inner {
    async fn remove_link(&self, remote: &UserId) -> bool {
        let link = { self.links.write().await.remove(remote) };
        let Some(link) = link else {
            return false;
        };

        link.handle.close().await;
        if let Some(task) = &link.offer_task {
            task.abort();
        }

        if link.remote_stream.is_some() {
            let _ = self
                .events
                .send(PeerEvent::StreamRemoved {
                    user: remote.clone(),
                })
                .await;
        }
        let remaining = self.links.read().await.len();
        let _ = self
            .events
            .send(PeerEvent::LinkClosed {
                user: remote.clone(),
                remaining,
            })
            .await;
        tracing::debug!(chat_id = %self.chat_id, %remote, remaining, "peer link removed");

        // May be our own task when called from the event forwarder; abort
        // last so the cleanup above has already run.
        link.event_task.abort();
        true
    }
}

/// Forward runtime events for one connection into manager state and the
/// session event stream.
async fn forward_connection_events(
    inner: Arc<Inner>,
    remote: UserId,
    mut events: mpsc::Receiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::RemoteStream(stream) => {
                {
                    let mut links = inner.links.write().await;
                    match links.get_mut(&remote) {
                        Some(link) => link.remote_stream = Some(stream.clone()),
                        // Link already gone; the stream is stale.
                        None => continue,
                    }
                }
                let _ = inner
                    .events
                    .send(PeerEvent::StreamAdded {
                        user: remote.clone(),
                        stream,
                    })
                    .await;
            }
            ConnectionEvent::LocalCandidate(candidate) => {
                inner
                    .router
                    .send(CallSignal::new(
                        inner.chat_id.clone(),
                        inner.local_user.clone(),
                        remote.clone(),
                        SignalPayload::IceCandidate(candidate),
                    ))
                    .await;
            }
            ConnectionEvent::StateChanged(state) if state.is_terminal() => {
                tracing::debug!(%remote, ?state, "peer connection reached terminal state");
                inner.remove_link(&remote).await;
                break;
            }
            ConnectionEvent::StateChanged(state) => {
                tracing::trace!(%remote, ?state, "peer connection state changed");
            }
        }
    }
}

/// Initiator side: wait for tracks to attach, then create and send the
/// offer, unless the link disappeared in the meantime.
async fn send_offer_after_settle(inner: Arc<Inner>, remote: UserId) {
    tokio::time::sleep(inner.settle_delay).await;

    let handle = {
        let links = inner.links.read().await;
        links.get(&remote).map(|link| link.handle.clone())
    };
    let Some(handle) = handle else {
        return;
    };

    match handle.create_offer().await {
        Ok(sdp) => {
            inner
                .router
                .send(CallSignal::new(
                    inner.chat_id.clone(),
                    inner.local_user.clone(),
                    remote.clone(),
                    SignalPayload::Offer { sdp },
                ))
                .await;
        }
        Err(e) => {
            tracing::warn!(%remote, error = %e, "offer creation failed, removing peer link");
            inner.remove_link(&remote).await;
        }
    }
}
