//! Per-chat call state machine.
//!
//! One [`ChatCall`] exists per chat and moves through the phases
//! Idle -> Outgoing|Incoming -> Active -> Ending -> Idle. Every
//! transition is driven either by a local operation (start, accept,
//! reject, end) or by a session signal, and duplicate or stale signals
//! after a terminal transition are no-ops, so redelivery through the
//! fallback poller is harmless.
//!
//! Direct chats ring: the callee must explicitly accept before any media
//! is acquired on their side. Group chats are rooms: the starter goes
//! straight to Active and everyone else joins by announcing presence on
//! the call topic.

use crate::media::{LocalMedia, MediaBackend, MediaError, RemoteMedia};
use crate::peer::{PeerEvent, PeerManager};
use crate::presence::{initiates, PresenceRoster};
use crate::router::{CallTopic, SignalError, SignalRouter};
use crate::types::{
    CallOutcome, CallPhase, CallRole, CallSignal, ChatId, ChatKind, MediaConstraints,
    SignalPayload, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

/// Call orchestration errors.
#[derive(thiserror::Error, Debug)]
pub enum CallError {
    /// A call already exists for this chat.
    #[error("a call is already in progress for this chat")]
    Busy,

    /// No call exists for this chat.
    #[error("no call in progress")]
    NoCall,

    /// The operation is not valid in the current phase.
    #[error("operation not valid in phase {0}")]
    InvalidPhase(CallPhase),

    /// Media acquisition or negotiation failed.
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Signal transport failure while setting up.
    #[error(transparent)]
    Signal(#[from] SignalError),

    /// The chat is not known to the directory.
    #[error("unknown chat: {0}")]
    UnknownChat(ChatId),

    /// Chat directory lookup failed.
    #[error("chat directory error: {0}")]
    Directory(String),

    /// Service builder was missing a required seam.
    #[error("service configuration incomplete: missing {0}")]
    Incomplete(&'static str),
}

/// Tunable timings and capacities.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Delay between link creation and sending the offer, so local tracks
    /// attach before negotiation starts.
    pub settle_delay: Duration,
    /// Fallback poll interval for durable call requests.
    pub poll_interval: Duration,
    /// Maximum age at which a polled call request still rings.
    pub request_freshness: Duration,
    /// Capacity of the call event broadcast channel.
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(200),
            poll_interval: Duration::from_secs(2),
            request_freshness: Duration::from_secs(10),
            event_capacity: 64,
        }
    }
}

/// Sink for finished-call records (the chat's call log).
///
/// Failures are logged and never fail the call teardown.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    /// Append one outcome record for a chat.
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written.
    async fn append_outcome(&self, chat_id: &ChatId, outcome: CallOutcome) -> anyhow::Result<()>;
}

/// Events surfaced to the application.
#[derive(Clone)]
pub enum CallEvent {
    /// A call request is ringing locally.
    IncomingCall {
        /// Chat the call belongs to.
        chat_id: ChatId,
        /// Who is calling.
        from: UserId,
    },
    /// A locally started call is ringing the remote side.
    OutgoingRinging {
        /// Chat the call belongs to.
        chat_id: ChatId,
    },
    /// The call reached the Active phase.
    CallConnected {
        /// Chat the call belongs to.
        chat_id: ChatId,
    },
    /// A remote participant's stream became available.
    RemoteStreamAdded {
        /// Chat the call belongs to.
        chat_id: ChatId,
        /// The remote participant.
        user_id: UserId,
        /// Their stream.
        stream: Arc<dyn RemoteMedia>,
    },
    /// A remote participant's stream went away.
    RemoteStreamRemoved {
        /// Chat the call belongs to.
        chat_id: ChatId,
        /// The remote participant.
        user_id: UserId,
    },
    /// The call ended; the session is gone.
    CallEnded {
        /// Chat the call belongs to.
        chat_id: ChatId,
        /// How the call ended.
        outcome: CallOutcome,
    },
}

impl std::fmt::Debug for CallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncomingCall { chat_id, from } => f
                .debug_struct("IncomingCall")
                .field("chat_id", chat_id)
                .field("from", from)
                .finish(),
            Self::OutgoingRinging { chat_id } => f
                .debug_struct("OutgoingRinging")
                .field("chat_id", chat_id)
                .finish(),
            Self::CallConnected { chat_id } => f
                .debug_struct("CallConnected")
                .field("chat_id", chat_id)
                .finish(),
            Self::RemoteStreamAdded {
                chat_id, user_id, ..
            } => f
                .debug_struct("RemoteStreamAdded")
                .field("chat_id", chat_id)
                .field("user_id", user_id)
                .finish(),
            Self::RemoteStreamRemoved { chat_id, user_id } => f
                .debug_struct("RemoteStreamRemoved")
                .field("chat_id", chat_id)
                .field("user_id", user_id)
                .finish(),
            Self::CallEnded { chat_id, outcome } => f
                .debug_struct("CallEnded")
                .field("chat_id", chat_id)
                .field("outcome", outcome)
                .finish(),
        }
    }
}

/// A ringing or connected session with resources attached.
struct EngagedSession {
    role: CallRole,
    phase: CallPhase,
    started_at: DateTime<Utc>,
    connected_at: Option<Instant>,
    peers: PeerManager,
    local_media: Arc<dyn LocalMedia>,
    roster: PresenceRoster,
    loop_task: JoinHandle<()>,
}

enum Session {
    /// Ringing locally; nothing acquired yet.
    Incoming { request: CallSignal },
    /// Outgoing ringing or connected.
    Engaged(EngagedSession),
    /// Teardown in flight; cleared when it completes.
    Ending,
}

struct CallInner {
    chat_id: ChatId,
    chat_kind: ChatKind,
    members: Vec<UserId>,
    local_user: UserId,
    router: Arc<SignalRouter>,
    backend: Arc<dyn MediaBackend>,
    outcomes: Arc<dyn OutcomeSink>,
    events: broadcast::Sender<CallEvent>,
    config: CallConfig,
    session: RwLock<Option<Session>>,
}

/// The call state machine for one chat.
#[derive(Clone)]
pub struct ChatCall {
    inner: Arc<CallInner>,
}

impl ChatCall {
    /// Create the machine for one chat. `members` is the full member list
    /// including the local user; `events` is the application-facing event
    /// channel shared across chats.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        chat_id: ChatId,
        chat_kind: ChatKind,
        members: Vec<UserId>,
        local_user: UserId,
        router: Arc<SignalRouter>,
        backend: Arc<dyn MediaBackend>,
        outcomes: Arc<dyn OutcomeSink>,
        events: broadcast::Sender<CallEvent>,
        config: CallConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                chat_id,
                chat_kind,
                members,
                local_user,
                router,
                backend,
                outcomes,
                events,
                config,
                session: RwLock::new(None),
            }),
        }
    }

    /// Current phase.
    pub async fn phase(&self) -> CallPhase {
        match self.inner.session.read().await.as_ref() {
            None => CallPhase::Idle,
            Some(Session::Incoming { .. }) => CallPhase::Incoming,
            Some(Session::Engaged(s)) => s.phase,
            Some(Session::Ending) => CallPhase::Ending,
        }
    }

    /// Start a call in this chat.
    ///
    /// Sends a durable call request to every other member, acquires local
    /// media, and joins the chat's call topic. Direct chats enter Outgoing
    /// and wait for an accept; group chats go straight to Active.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Busy`] if a session already exists, or a media
    /// or signaling error if setup fails. On failure the already-sent
    /// requests are retracted with a best-effort call-end and a cancelled
    /// outcome is recorded.
    #[tracing::instrument(skip(self, constraints), fields(chat_id = %self.inner.chat_id))]
    pub async fn start_call(&self, constraints: MediaConstraints) -> Result<(), CallError> {
        let mut guard = self.inner.session.write().await;
        if guard.is_some() {
            return Err(CallError::Busy);
        }

        let targets = self.targets();
        let started_at = Utc::now();
        for target in &targets {
            self.inner
                .router
                .send(CallSignal::new(
                    self.inner.chat_id.clone(),
                    self.inner.local_user.clone(),
                    target.clone(),
                    SignalPayload::CallRequest,
                ))
                .await;
        }

        let local_media = match self
            .inner
            .backend
            .acquire_local_media(&constraints)
            .await
        {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(error = %e, "media acquisition failed, retracting call");
                self.retract_requests(&targets).await;
                self.record_outcome(CallOutcome::cancelled()).await;
                return Err(e.into());
            }
        };

        let topic = match self.inner.router.join_call_topic(&self.inner.chat_id).await {
            Ok(topic) => topic,
            Err(e) => {
                local_media.stop();
                self.retract_requests(&targets).await;
                self.record_outcome(CallOutcome::cancelled()).await;
                return Err(e.into());
            }
        };

        let (phase, connected_at) = match self.inner.chat_kind {
            ChatKind::Direct => (CallPhase::Outgoing, None),
            // A group call is a room; the starter is in it immediately.
            ChatKind::Group => (CallPhase::Active, Some(Instant::now())),
        };

        let session = self.engage(
            CallRole::Caller,
            phase,
            started_at,
            connected_at,
            local_media,
            topic,
        );
        *guard = Some(Session::Engaged(session));
        drop(guard);

        let event = match phase {
            CallPhase::Active => CallEvent::CallConnected {
                chat_id: self.inner.chat_id.clone(),
            },
            _ => CallEvent::OutgoingRinging {
                chat_id: self.inner.chat_id.clone(),
            },
        };
        let _ = self.inner.events.send(event);
        tracing::info!(?phase, "call started");
        Ok(())
    }

    /// Accept a ringing incoming call.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoCall`] if nothing is ringing,
    /// [`CallError::InvalidPhase`] outside Incoming, or a media error if
    /// acquisition fails; on media failure the caller is sent a reject and
    /// a rejected outcome is recorded.
    #[tracing::instrument(skip(self, constraints), fields(chat_id = %self.inner.chat_id))]
    pub async fn accept_call(&self, constraints: MediaConstraints) -> Result<(), CallError> {
        let mut guard = self.inner.session.write().await;
        let caller = match guard.as_ref() {
            None => return Err(CallError::NoCall),
            Some(Session::Incoming { request }) => request.from_user_id.clone(),
            Some(Session::Engaged(s)) => return Err(CallError::InvalidPhase(s.phase)),
            Some(Session::Ending) => return Err(CallError::InvalidPhase(CallPhase::Ending)),
        };

        self.inner
            .router
            .send(CallSignal::new(
                self.inner.chat_id.clone(),
                self.inner.local_user.clone(),
                caller.clone(),
                SignalPayload::CallAccept,
            ))
            .await;

        let local_media = match self
            .inner
            .backend
            .acquire_local_media(&constraints)
            .await
        {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(error = %e, "media acquisition failed, rejecting call");
                self.send_session(&caller, SignalPayload::CallReject).await;
                *guard = None;
                drop(guard);
                self.record_outcome(CallOutcome::rejected()).await;
                self.emit_ended(CallOutcome::rejected());
                return Err(e.into());
            }
        };

        let topic = match self.inner.router.join_call_topic(&self.inner.chat_id).await {
            Ok(topic) => topic,
            Err(e) => {
                local_media.stop();
                self.send_session(&caller, SignalPayload::CallReject).await;
                *guard = None;
                drop(guard);
                self.record_outcome(CallOutcome::rejected()).await;
                self.emit_ended(CallOutcome::rejected());
                return Err(e.into());
            }
        };

        let session = self.engage(
            CallRole::Callee,
            CallPhase::Active,
            Utc::now(),
            Some(Instant::now()),
            local_media,
            topic,
        );
        *guard = Some(Session::Engaged(session));
        drop(guard);

        let _ = self.inner.events.send(CallEvent::CallConnected {
            chat_id: self.inner.chat_id.clone(),
        });
        tracing::info!(%caller, "call accepted");
        Ok(())
    }

    /// Decline a ringing incoming call.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoCall`] if nothing is ringing, or
    /// [`CallError::InvalidPhase`] outside Incoming.
    #[tracing::instrument(skip(self), fields(chat_id = %self.inner.chat_id))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut guard = self.inner.session.write().await;
        let caller = match guard.as_ref() {
            None => return Err(CallError::NoCall),
            Some(Session::Incoming { request }) => request.from_user_id.clone(),
            Some(Session::Engaged(s)) => return Err(CallError::InvalidPhase(s.phase)),
            Some(Session::Ending) => return Err(CallError::InvalidPhase(CallPhase::Ending)),
        };
        *guard = None;
        drop(guard);

        self.send_session(&caller, SignalPayload::CallReject).await;
        self.record_outcome(CallOutcome::rejected()).await;
        self.emit_ended(CallOutcome::rejected());
        tracing::info!(%caller, "call rejected");
        Ok(())
    }

    /// End the call, whatever phase it is in. Idle is a no-op.
    ///
    /// Outgoing ringing records a cancelled outcome; Incoming ringing is
    /// treated as a reject; Active records completed with the connected
    /// duration.
    ///
    /// # Errors
    ///
    /// Currently infallible; teardown failures are logged.
    #[tracing::instrument(skip(self), fields(chat_id = %self.inner.chat_id))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut guard = self.inner.session.write().await;
        let session = match guard.take() {
            None => return Ok(()),
            Some(Session::Ending) => {
                *guard = Some(Session::Ending);
                return Ok(());
            }
            Some(session) => session,
        };

        match session {
            Session::Incoming { request } => {
                drop(guard);
                self.send_session(&request.from_user_id, SignalPayload::CallReject)
                    .await;
                self.record_outcome(CallOutcome::rejected()).await;
                self.emit_ended(CallOutcome::rejected());
            }
            Session::Engaged(engaged) => {
                let outcome = match engaged.connected_at {
                    Some(connected) => CallOutcome::completed(connected.elapsed().as_secs()),
                    None => CallOutcome::cancelled(),
                };
                *guard = Some(Session::Ending);
                drop(guard);

                for target in self.targets() {
                    self.send_session(&target, SignalPayload::CallEnd).await;
                }
                self.teardown(engaged, outcome).await;
            }
            Session::Ending => {}
        }
        tracing::info!("call ended locally");
        Ok(())
    }

    /// Toggle the local audio track; returns the new enabled state.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoCall`] without an engaged session.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.with_media(|media| {
            let enabled = !media.audio_enabled();
            media.set_audio_enabled(enabled);
            enabled
        })
        .await
    }

    /// Toggle the local video track; returns the new enabled state.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoCall`] without an engaged session.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.with_media(|media| {
            let enabled = !media.video_enabled();
            media.set_video_enabled(enabled);
            enabled
        })
        .await
    }

    /// Whether the local audio track is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoCall`] without an engaged session.
    pub async fn audio_enabled(&self) -> Result<bool, CallError> {
        self.with_media(|media| media.audio_enabled()).await
    }

    /// Whether the local video track is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NoCall`] without an engaged session.
    pub async fn video_enabled(&self) -> Result<bool, CallError> {
        self.with_media(|media| media.video_enabled()).await
    }

    /// Feed one durable session signal into the machine.
    ///
    /// The caller is responsible for id dedup; this method is idempotent
    /// against stale signals but not against replays of live ones.
    #[tracing::instrument(
        skip(self, signal),
        fields(chat_id = %self.inner.chat_id, kind = %signal.kind(), from = %signal.from_user_id)
    )]
    pub async fn handle_session_signal(&self, signal: CallSignal) {
        match &signal.payload {
            SignalPayload::CallRequest => self.on_call_request(signal).await,
            SignalPayload::CallAccept => self.on_call_accept(&signal.from_user_id).await,
            SignalPayload::CallReject => self.on_call_reject(&signal.from_user_id).await,
            SignalPayload::CallEnd => self.on_call_end(&signal.from_user_id).await,
            other => {
                tracing::warn!(kind = %other.kind(), "technical signal on session path, dropping");
            }
        }
    }

    async fn on_call_request(&self, request: CallSignal) {
        let mut guard = self.inner.session.write().await;
        match guard.as_ref() {
            None => {
                let from = request.from_user_id.clone();
                *guard = Some(Session::Incoming { request });
                drop(guard);
                let _ = self.inner.events.send(CallEvent::IncomingCall {
                    chat_id: self.inner.chat_id.clone(),
                    from: from.clone(),
                });
                tracing::info!(%from, "incoming call ringing");
            }
            Some(Session::Incoming { .. }) => {
                tracing::debug!("already ringing, ignoring extra call request");
            }
            Some(Session::Ending) => {
                tracing::debug!("call tearing down, ignoring request");
            }
            Some(Session::Engaged(engaged)) => {
                if self.inner.chat_kind == ChatKind::Group {
                    // The room already exists; the requester will join it
                    // through presence.
                    tracing::debug!("group call already engaged, ignoring request");
                    return;
                }
                if engaged.phase == CallPhase::Outgoing {
                    self.resolve_glare(guard, request).await;
                } else {
                    drop(guard);
                    self.send_session(&request.from_user_id, SignalPayload::CallReject)
                        .await;
                    tracing::info!(from = %request.from_user_id, "busy, rejecting call request");
                }
            }
        }
    }

    /// Both sides dialed each other at once. The earlier request wins;
    /// on identical timestamps the smaller user id wins. The loser
    /// abandons its own outgoing call and rings with the winner's request
    /// instead, so at most one call survives. No call-end is sent: the
    /// only other party here is the winner, whose outgoing call must keep
    /// ringing; the winner's busy reject to the losing request arrives
    /// after we are already ringing and is dropped as stale.
    async fn resolve_glare(
        &self,
        mut guard: tokio::sync::RwLockWriteGuard<'_, Option<Session>>,
        request: CallSignal,
    ) {
        let Some(Session::Engaged(engaged)) = guard.as_ref() else {
            return;
        };
        let ours = (engaged.started_at, &self.inner.local_user);
        let theirs = (request.created_at, &request.from_user_id);

        if theirs < ours {
            tracing::info!(from = %request.from_user_id, "glare: remote request wins");
            let Some(Session::Engaged(engaged)) = guard.take() else {
                return;
            };
            let from = request.from_user_id.clone();
            *guard = Some(Session::Incoming { request });
            drop(guard);

            self.teardown(engaged, CallOutcome::cancelled()).await;
            let _ = self.inner.events.send(CallEvent::IncomingCall {
                chat_id: self.inner.chat_id.clone(),
                from,
            });
        } else {
            drop(guard);
            tracing::info!(from = %request.from_user_id, "glare: local request wins");
            self.send_session(&request.from_user_id, SignalPayload::CallReject)
                .await;
        }
    }

    async fn on_call_accept(&self, from: &UserId) {
        let mut guard = self.inner.session.write().await;
        match guard.as_mut() {
            Some(Session::Engaged(engaged)) if engaged.phase == CallPhase::Outgoing => {
                engaged.phase = CallPhase::Active;
                engaged.connected_at = Some(Instant::now());
                drop(guard);
                let _ = self.inner.events.send(CallEvent::CallConnected {
                    chat_id: self.inner.chat_id.clone(),
                });
                tracing::info!(%from, "call accepted by remote");
            }
            Some(Session::Engaged(_)) => {
                tracing::debug!(%from, "duplicate accept, already active");
            }
            _ => {
                tracing::debug!(%from, "stale accept, no outgoing call");
            }
        }
    }

    async fn on_call_reject(&self, from: &UserId) {
        if self.inner.chat_kind == ChatKind::Group {
            // One member declining does not close the room.
            tracing::debug!(%from, "member declined group call");
            return;
        }
        let mut guard = self.inner.session.write().await;
        match guard.take() {
            Some(Session::Engaged(engaged)) if engaged.phase == CallPhase::Outgoing => {
                *guard = Some(Session::Ending);
                drop(guard);
                self.teardown(engaged, CallOutcome::rejected()).await;
                tracing::info!(%from, "call rejected by remote");
            }
            other => {
                *guard = other;
                tracing::debug!(%from, "stale reject");
            }
        }
    }

    async fn on_call_end(&self, from: &UserId) {
        let mut guard = self.inner.session.write().await;
        match guard.take() {
            None => {
                tracing::debug!(%from, "stale call end");
            }
            Some(Session::Ending) => {
                *guard = Some(Session::Ending);
                tracing::debug!(%from, "already tearing down");
            }
            Some(Session::Incoming { request }) if request.from_user_id == *from => {
                drop(guard);
                // Caller hung up before we answered.
                self.record_outcome(CallOutcome::missed()).await;
                self.emit_ended(CallOutcome::missed());
                tracing::info!(%from, "missed call");
            }
            Some(Session::Incoming { request }) => {
                // End from someone other than the ringing caller is stale.
                *guard = Some(Session::Incoming { request });
            }
            Some(Session::Engaged(engaged)) => {
                if self.inner.chat_kind == ChatKind::Group {
                    // One member left. Only the LinkClosed event decides
                    // whether the room collapses, so a racing presence
                    // leave cannot double-count the departure.
                    let peers = engaged.peers.clone();
                    *guard = Some(Session::Engaged(engaged));
                    drop(guard);
                    peers.remove_link(from).await;
                    return;
                }
                let outcome = match engaged.connected_at {
                    Some(connected) => CallOutcome::completed(connected.elapsed().as_secs()),
                    None => CallOutcome::cancelled(),
                };
                *guard = Some(Session::Ending);
                drop(guard);
                self.teardown(engaged, outcome).await;
                tracing::info!(%from, "call ended by remote");
            }
        }
    }

    /// Build the engaged session and spawn its event loop.
    fn engage(
        &self,
        role: CallRole,
        phase: CallPhase,
        started_at: DateTime<Utc>,
        connected_at: Option<Instant>,
        local_media: Arc<dyn LocalMedia>,
        topic: CallTopic,
    ) -> EngagedSession {
        let (peers, peer_rx) = PeerManager::new(
            self.inner.chat_id.clone(),
            self.inner.local_user.clone(),
            self.inner.backend.clone(),
            self.inner.router.clone(),
            local_media.clone(),
            self.inner.config.settle_delay,
        );
        let loop_task = tokio::spawn(session_loop(self.clone(), topic, peer_rx));
        EngagedSession {
            role,
            phase,
            started_at,
            connected_at,
            peers,
            local_media,
            roster: PresenceRoster::new(),
            loop_task,
        }
    }

    /// Release every session resource and record the outcome.
    ///
    /// Safe to call from within the session loop task: the loop abort is
    /// ordered last, after all cleanup awaits have completed.
    async fn teardown(&self, session: EngagedSession, outcome: CallOutcome) {
        tracing::debug!(
            chat_id = %self.inner.chat_id,
            role = ?session.role,
            status = outcome.status.as_str(),
            "tearing down session"
        );
        session.peers.close_all().await;
        session.local_media.stop();
        self.inner.router.leave_call_topic(&self.inner.chat_id).await;
        self.record_outcome(outcome.clone()).await;
        {
            // Clear the Ending marker, but never a session a concurrent
            // transition already installed (e.g. the glare loser's ring).
            let mut guard = self.inner.session.write().await;
            if matches!(guard.as_ref(), Some(Session::Ending)) {
                *guard = None;
            }
        }
        self.emit_ended(outcome);
        session.loop_task.abort();
    }

    async fn with_media<T>(
        &self,
        f: impl FnOnce(&Arc<dyn LocalMedia>) -> T,
    ) -> Result<T, CallError> {
        let guard = self.inner.session.read().await;
        match guard.as_ref() {
            Some(Session::Engaged(engaged)) => Ok(f(&engaged.local_media)),
            Some(Session::Incoming { .. }) => Err(CallError::InvalidPhase(CallPhase::Incoming)),
            Some(Session::Ending) => Err(CallError::InvalidPhase(CallPhase::Ending)),
            None => Err(CallError::NoCall),
        }
    }

    fn targets(&self) -> Vec<UserId> {
        self.inner
            .members
            .iter()
            .filter(|m| **m != self.inner.local_user)
            .cloned()
            .collect()
    }

    async fn send_session(&self, to: &UserId, payload: SignalPayload) {
        self.inner
            .router
            .send(CallSignal::new(
                self.inner.chat_id.clone(),
                self.inner.local_user.clone(),
                to.clone(),
                payload,
            ))
            .await;
    }

    async fn retract_requests(&self, targets: &[UserId]) {
        for target in targets {
            self.send_session(target, SignalPayload::CallEnd).await;
        }
    }

    async fn record_outcome(&self, outcome: CallOutcome) {
        if let Err(e) = self
            .inner
            .outcomes
            .append_outcome(&self.inner.chat_id, outcome)
            .await
        {
            tracing::warn!(chat_id = %self.inner.chat_id, error = %e, "failed to record call outcome");
        }
    }

    fn emit_ended(&self, outcome: CallOutcome) {
        let _ = self.inner.events.send(CallEvent::CallEnded {
            chat_id: self.inner.chat_id.clone(),
            outcome,
        });
    }

    async fn handle_technical(&self, signal: CallSignal) {
        let peers = {
            let guard = self.inner.session.read().await;
            match guard.as_ref() {
                Some(Session::Engaged(engaged)) => engaged.peers.clone(),
                _ => {
                    tracing::debug!(kind = %signal.kind(), "technical signal without session");
                    return;
                }
            }
        };
        let from = signal.from_user_id.clone();
        let result = match signal.payload {
            SignalPayload::Offer { sdp } => peers.handle_offer(&from, &sdp).await,
            SignalPayload::Answer { sdp } => peers.handle_answer(&from, &sdp).await,
            SignalPayload::IceCandidate(candidate) => {
                peers.handle_candidate(&from, candidate).await
            }
            other => {
                tracing::debug!(kind = %other.kind(), "session signal on technical path, dropping");
                return;
            }
        };
        if let Err(e) = result {
            tracing::warn!(%from, error = %e, "negotiation signal failed");
        }
    }

    /// Presence snapshot on the call topic: anyone announced has joined
    /// the call, so link to joiners (offering where the election picks
    /// us) and drop links to leavers.
    async fn handle_presence(&self, snapshot: Vec<crate::types::PresenceEntry>) {
        let (peers, diff) = {
            let mut guard = self.inner.session.write().await;
            match guard.as_mut() {
                Some(Session::Engaged(engaged)) => {
                    (engaged.peers.clone(), engaged.roster.update(snapshot))
                }
                _ => return,
            }
        };

        for user in diff.joined {
            if user == self.inner.local_user {
                continue;
            }
            let offer = initiates(&self.inner.local_user, &user);
            if let Err(e) = peers.ensure_link(&user, offer).await {
                tracing::warn!(%user, error = %e, "failed to link joined participant");
            }
        }
        for user in diff.left {
            if user == self.inner.local_user {
                continue;
            }
            peers.remove_link(&user).await;
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::StreamAdded { user, stream } => {
                let _ = self.inner.events.send(CallEvent::RemoteStreamAdded {
                    chat_id: self.inner.chat_id.clone(),
                    user_id: user,
                    stream,
                });
            }
            PeerEvent::StreamRemoved { user } => {
                let _ = self.inner.events.send(CallEvent::RemoteStreamRemoved {
                    chat_id: self.inner.chat_id.clone(),
                    user_id: user,
                });
            }
            PeerEvent::LinkClosed { user, remaining } => {
                let mut guard = self.inner.session.write().await;
                match guard.take() {
                    Some(Session::Engaged(engaged)) => {
                        // Link churn only ends a connected call. While we
                        // are still ringing (glare loser leaving the topic,
                        // a callee joining and bouncing) the links rebuild
                        // from presence once the remote joins again.
                        let ends_call = engaged.phase == CallPhase::Active
                            && (self.inner.chat_kind == ChatKind::Direct || remaining == 0);
                        if !ends_call {
                            *guard = Some(Session::Engaged(engaged));
                            return;
                        }
                        let outcome = match engaged.connected_at {
                            Some(connected) => {
                                CallOutcome::completed(connected.elapsed().as_secs())
                            }
                            None => CallOutcome::cancelled(),
                        };
                        *guard = Some(Session::Ending);
                        drop(guard);
                        tracing::info!(%user, "last peer link closed, ending call");
                        self.teardown(engaged, outcome).await;
                    }
                    other => {
                        *guard = other;
                    }
                }
            }
        }
    }
}

/// Drives one engaged session: technical signals off the call topic,
/// presence snapshots, and peer manager events.
async fn session_loop(
    chat: ChatCall,
    mut topic: CallTopic,
    mut peer_rx: mpsc::Receiver<PeerEvent>,
) {
    loop {
        tokio::select! {
            signal = topic.technical.recv() => match signal {
                Some(signal) => chat.handle_technical(signal).await,
                None => break,
            },
            snapshot = topic.presence.recv() => match snapshot {
                Some(snapshot) => chat.handle_presence(snapshot).await,
                None => break,
            },
            event = peer_rx.recv() => match event {
                Some(event) => chat.handle_peer_event(event).await,
                None => break,
            },
        }
    }
}
