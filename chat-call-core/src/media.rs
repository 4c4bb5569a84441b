//! Boundary traits for the real-time media runtime.
//!
//! The media transport itself (codec negotiation, ICE/DTLS/SRTP, bandwidth
//! adaptation) is out of scope and provided by a browser-style WebRTC
//! runtime. This module defines the seam: acquiring local capture tracks,
//! opening peer connection handles, and the events those handles emit back
//! into the orchestration layer.

use crate::types::{IceCandidate, MediaConstraints};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media-layer errors.
#[derive(Error, Debug)]
pub enum MediaError {
    /// Camera or microphone denied or unavailable. Fatal for the call.
    #[error("media acquisition failed: {0}")]
    Acquisition(String),

    /// The underlying runtime rejected an operation.
    #[error("media backend error: {0}")]
    Backend(String),

    /// Operation on a connection that is already closed.
    #[error("connection closed")]
    Closed,

    /// Negotiation ordering violation, e.g. answering without an offer.
    #[error("invalid negotiation state: {0}")]
    NegotiationState(&'static str),
}

/// Which side of the SDP exchange a remote description came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    /// Remote description is an offer.
    Offer,
    /// Remote description is an answer.
    Answer,
}

/// Connection-level state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Media is flowing.
    Connected,
    /// Transport lost; the link is torn down.
    Disconnected,
    /// Negotiation or transport failed; the link is torn down.
    Failed,
    /// Closed locally.
    Closed,
}

impl LinkState {
    /// States that terminate the peer link.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Handle to acquired local capture media (microphone/camera tracks).
///
/// Owned by the call session and attached read-only to every peer link.
/// Only the call state machine stops tracks, and only at teardown.
pub trait LocalMedia: Send + Sync {
    /// Enable or disable the audio track without renegotiation.
    fn set_audio_enabled(&self, enabled: bool);

    /// Enable or disable the video track without renegotiation.
    fn set_video_enabled(&self, enabled: bool);

    /// Whether the audio track is currently enabled.
    fn audio_enabled(&self) -> bool;

    /// Whether the video track is currently enabled.
    fn video_enabled(&self) -> bool;

    /// Stop all tracks and release the devices.
    fn stop(&self);
}

/// Handle to one remote participant's media stream, surfaced to the UI.
pub trait RemoteMedia: Send + Sync {
    /// Stable identifier of the remote stream.
    fn stream_id(&self) -> &str;
}

/// Events emitted by one peer connection handle.
pub enum ConnectionEvent {
    /// The remote side's stream arrived.
    RemoteStream(Arc<dyn RemoteMedia>),
    /// A local ICE candidate was discovered and must be signaled.
    LocalCandidate(IceCandidate),
    /// Connection state changed.
    StateChanged(LinkState),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoteStream(s) => f
                .debug_tuple("RemoteStream")
                .field(&s.stream_id())
                .finish(),
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// Handle to one peer-to-peer connection, the `RTCPeerConnection` analogue.
///
/// `create_offer` and `create_answer` also set the produced description
/// locally, so callers only ship the returned SDP to the remote side.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Attach local capture tracks to this connection.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed or the runtime rejects
    /// the tracks.
    async fn attach_local_media(&self, media: Arc<dyn LocalMedia>) -> Result<(), MediaError>;

    /// Create an SDP offer and set it as the local description.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is closed.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Create an SDP answer and set it as the local description.
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer has been applied first.
    async fn create_answer(&self) -> Result<String, MediaError>;

    /// Apply the remote side's description.
    ///
    /// # Errors
    ///
    /// Returns error if the SDP is rejected by the runtime.
    async fn set_remote_description(&self, sdp_type: SdpType, sdp: &str)
        -> Result<(), MediaError>;

    /// Apply one remote ICE candidate.
    ///
    /// Callers must only invoke this after the remote description is set;
    /// earlier candidates are queued by the peer manager.
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected by the runtime.
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Close the connection and release its resources. Idempotent.
    async fn close(&self);
}

/// A freshly opened peer connection and its event stream.
pub struct NewConnection {
    /// The connection handle.
    pub handle: Arc<dyn ConnectionHandle>,
    /// Events emitted by the runtime for this connection.
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Factory seam for the real-time media runtime.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Acquire local capture media matching the constraints.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::Acquisition`] if the devices are denied or
    /// unavailable; the caller aborts the call rather than retrying.
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Arc<dyn LocalMedia>, MediaError>;

    /// Open a new peer connection.
    ///
    /// # Errors
    ///
    /// Returns error if the runtime cannot allocate a connection.
    async fn create_connection(&self) -> Result<NewConnection, MediaError>;
}
