//! Chat Call - real-time call signaling and peer connection orchestration
//!
//! This library layers voice and video calls onto a messaging application. It
//! owns everything between the UI and the media runtime:
//!
//! - **Call lifecycle**: one state machine per chat through Idle, ringing,
//!   Active and Ending, idempotent against duplicate signals
//! - **Two-channel signaling**: latency-sensitive negotiation over an
//!   ephemeral per-chat topic, session control over a durable store with a
//!   change feed and fallback polling
//! - **Peer bookkeeping**: one link per remote participant, ICE candidate
//!   queueing and deterministic per-pair initiator election
//! - **Direct and group calls**: explicit accept for one-to-one chats,
//!   join-by-presence rooms for groups
//!
//! # Examples
//!
//! ```rust,no_run
//! use chat_call_core::{CallService, ChatId, ChatKind, ChatProfile, MediaConstraints, UserId};
//! use chat_call_core::local::{LocalSignalHub, NullOutcomeSink, StaticChatDirectory, StubMediaBackend};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let hub = Arc::new(LocalSignalHub::new());
//! let directory = StaticChatDirectory::new().with_chat(
//!     ChatId::new("friends"),
//!     ChatProfile {
//!         kind: ChatKind::Direct,
//!         members: vec![UserId::new("alice"), UserId::new("bob")],
//!     },
//! );
//!
//! let service = CallService::builder()
//!     .local_user(UserId::new("alice"))
//!     .signal_store(hub.clone())
//!     .signal_broadcast(hub.clone())
//!     .presence_channel(hub.clone())
//!     .media_backend(Arc::new(StubMediaBackend::new()))
//!     .outcome_sink(Arc::new(NullOutcomeSink))
//!     .chat_directory(Arc::new(directory))
//!     .build()?;
//!
//! service.start().await?;
//! service
//!     .start_call(&ChatId::new("friends"), MediaConstraints::video_call())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and wire format
pub mod types;

/// Boundary traits for the media runtime
pub mod media;

/// Signal routing over ephemeral and durable channels
pub mod router;

/// Presence roster and initiator election
pub mod presence;

/// Per-session peer link management
pub mod peer;

/// Per-chat call state machine
pub mod call;

/// Fallback polling for durable call requests
pub mod poller;

/// Application-facing call service
pub mod service;

/// In-process transports and media stubs
pub mod local;

// Re-export main types at crate root
pub use call::{CallConfig, CallError, CallEvent, ChatCall, OutcomeSink};
pub use media::{
    ConnectionEvent, ConnectionHandle, LinkState, LocalMedia, MediaBackend, MediaError,
    NewConnection, RemoteMedia, SdpType,
};
pub use peer::{PeerEvent, PeerManager};
pub use poller::{CallActivity, FallbackPoller};
pub use presence::{initiates, PresenceDiff, PresenceRoster};
pub use router::{
    call_topic, CallTopic, PresenceChannel, SignalBroadcast, SignalError, SignalRouter,
    SignalStore,
};
pub use service::{CallService, CallServiceBuilder, ChatDirectory, ChatProfile};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallConfig, CallError, CallEvent, OutcomeSink};
    pub use crate::media::{MediaBackend, MediaError};
    pub use crate::router::{PresenceChannel, SignalBroadcast, SignalStore};
    pub use crate::service::{CallService, ChatDirectory, ChatProfile};
    pub use crate::types::{
        CallOutcome, CallPhase, CallSignal, ChatId, ChatKind, IceCandidate, MediaConstraints,
        OutcomeStatus, SignalId, SignalKind, SignalPayload, UserId,
    };
}
