//! Core identifiers, signal records, and call lifecycle types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a chat (direct conversation or group room).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl ChatId {
    /// Create a chat id from anything string-like.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a participant.
///
/// Ordering is total and derived from the underlying string; the initiator
/// election in [`crate::presence`] relies on it being identical on every node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a user id from anything string-like.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a signal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalId(pub Uuid);

impl SignalId {
    /// Create a new random signal id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SignalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chat type, as reported by the chat subsystem.
///
/// Determines whether acceptance must be explicit (direct) or is implicit
/// via presence join (group, open room).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    /// Two-party conversation; the callee must accept explicitly.
    Direct,
    /// Open room; joining the call topic is acceptance.
    Group,
}

/// Role of the local participant within a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Dialed out.
    Caller,
    /// Answered an incoming request.
    Callee,
    /// Joined an already-running group call.
    Participant,
}

/// Call lifecycle phase.
///
/// Transitions are monotonic: `Idle -> {Outgoing, Incoming} -> Active ->
/// Ending -> Idle`. Group chats may skip the ringing handshake and go
/// `Outgoing -> Active` on presence alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// No call in this chat.
    Idle,
    /// Dialing, waiting for an accept.
    Outgoing,
    /// Ringing, waiting for the local user.
    Incoming,
    /// Connected; peer links may form and media flows.
    Active,
    /// Transient teardown.
    Ending,
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
            Self::Active => "active",
            Self::Ending => "ending",
        };
        write!(f, "{s}")
    }
}

/// ICE candidate payload exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string.
    pub candidate: String,
    /// SDP media id.
    pub sdp_mid: Option<String>,
    /// SDP media line index.
    pub sdp_mline_index: Option<u16>,
}

/// Discriminant of a signal, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
    /// ICE candidate.
    IceCandidate,
    /// Ring the callee(s).
    CallRequest,
    /// Callee accepted.
    CallAccept,
    /// Callee rejected.
    CallReject,
    /// Either side hung up.
    CallEnd,
}

impl SignalKind {
    /// Technical signals carry negotiation data and ride the ephemeral
    /// low-latency channel.
    #[must_use]
    pub fn is_technical(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    /// Session signals control the call lifecycle and ride the durable store.
    #[must_use]
    pub fn is_session(self) -> bool {
        !self.is_technical()
    }

    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::CallRequest => "call-request",
            Self::CallAccept => "call-accept",
            Self::CallReject => "call-reject",
            Self::CallEnd => "call-end",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Signal payload, tagged by kind.
///
/// One payload variant per kind so dispatch is exhaustive at compile time.
/// Serializes to the durable wire shape `{signal_type, signal_data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal_type", content = "signal_data", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// SDP offer for one peer link.
    Offer {
        /// SDP content.
        sdp: String,
    },
    /// SDP answer for one peer link.
    Answer {
        /// SDP content.
        sdp: String,
    },
    /// ICE candidate for one peer link.
    IceCandidate(IceCandidate),
    /// Ring the recipient.
    CallRequest,
    /// Accept an incoming request.
    CallAccept,
    /// Reject an incoming request (or signal busy).
    CallReject,
    /// Hang up.
    CallEnd,
}

impl SignalPayload {
    /// Kind discriminant of this payload.
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
            Self::CallRequest => SignalKind::CallRequest,
            Self::CallAccept => SignalKind::CallAccept,
            Self::CallReject => SignalKind::CallReject,
            Self::CallEnd => SignalKind::CallEnd,
        }
    }
}

/// One call signal between two participants.
///
/// Durable session signals are appended to the [`crate::router::SignalStore`]
/// and never mutated; technical signals use the same shape but are broadcast
/// ephemerally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    /// Record id, used for at-most-once consumption.
    pub id: SignalId,
    /// Chat the call belongs to.
    pub chat_id: ChatId,
    /// Sender.
    pub from_user_id: UserId,
    /// Recipient.
    pub to_user_id: UserId,
    /// Kind and payload.
    #[serde(flatten)]
    pub payload: SignalPayload,
    /// Creation timestamp (sender clock).
    pub created_at: DateTime<Utc>,
}

impl CallSignal {
    /// Create a signal with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(chat_id: ChatId, from: UserId, to: UserId, payload: SignalPayload) -> Self {
        Self {
            id: SignalId::new(),
            chat_id,
            from_user_id: from,
            to_user_id: to,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Kind discriminant of the payload.
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }
}

/// Ephemeral variant of [`CallSignal`]: same shape, no persistence,
/// at-most-once delivery while both parties are subscribed to the topic.
pub type SignalEnvelope = CallSignal;

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Capture microphone audio.
    pub audio: bool,
    /// Capture camera video.
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call.
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio.
    #[must_use]
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_only()
    }
}

/// Terminal outcome category of a call, written once to message history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Reached Active and was hung up normally.
    Completed,
    /// Rang but was never answered locally.
    Missed,
    /// Declined.
    Rejected,
    /// Abandoned by the caller before connecting.
    Cancelled,
}

impl OutcomeStatus {
    /// Wire name of this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Terminal outcome of a call, recorded exactly once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOutcome {
    /// Outcome category.
    pub status: OutcomeStatus,
    /// Connected duration, present only for completed calls.
    pub duration_seconds: Option<u64>,
}

impl CallOutcome {
    /// A completed call of the given duration.
    #[must_use]
    pub fn completed(duration_seconds: u64) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            duration_seconds: Some(duration_seconds),
        }
    }

    /// A call that rang but was never answered.
    #[must_use]
    pub fn missed() -> Self {
        Self {
            status: OutcomeStatus::Missed,
            duration_seconds: None,
        }
    }

    /// A declined call.
    #[must_use]
    pub fn rejected() -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            duration_seconds: None,
        }
    }

    /// A call abandoned by the caller before connecting.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            status: OutcomeStatus::Cancelled,
            duration_seconds: None,
        }
    }
}

/// One participant announced on a call topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Announced participant.
    pub user_id: UserId,
    /// When they joined the topic.
    pub joined_at: DateTime<Utc>,
}

impl PresenceEntry {
    /// Create an entry joined now.
    #[must_use]
    pub fn now(user_id: UserId) -> Self {
        Self {
            user_id,
            joined_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn signal_kind_classification() {
        assert!(SignalKind::Offer.is_technical());
        assert!(SignalKind::Answer.is_technical());
        assert!(SignalKind::IceCandidate.is_technical());
        assert!(SignalKind::CallRequest.is_session());
        assert!(SignalKind::CallAccept.is_session());
        assert!(SignalKind::CallReject.is_session());
        assert!(SignalKind::CallEnd.is_session());
    }

    #[test]
    fn payload_serializes_to_wire_shape() {
        let payload = SignalPayload::Offer {
            sdp: "v=0".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"signal_type\":\"offer\""));
        assert!(json.contains("\"signal_data\""));

        let request = serde_json::to_string(&SignalPayload::CallRequest).unwrap();
        assert!(request.contains("\"signal_type\":\"call-request\""));

        let ice = SignalPayload::IceCandidate(IceCandidate {
            candidate: "candidate:1 1 UDP 2122260223 192.168.1.1 12345 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        let json = serde_json::to_string(&ice).unwrap();
        assert!(json.contains("\"signal_type\":\"ice-candidate\""));
        let back: SignalPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ice);
    }

    #[test]
    fn call_signal_round_trip() {
        let signal = CallSignal::new(
            ChatId::new("chat-1"),
            UserId::new("alice"),
            UserId::new("bob"),
            SignalPayload::CallRequest,
        );
        assert_eq!(signal.kind(), SignalKind::CallRequest);

        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"chat_id\""));
        assert!(json.contains("\"from_user_id\""));
        assert!(json.contains("\"to_user_id\""));
        assert!(json.contains("\"created_at\""));
        let back: CallSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn outcome_constructors() {
        let done = CallOutcome::completed(37);
        assert_eq!(done.status, OutcomeStatus::Completed);
        assert_eq!(done.duration_seconds, Some(37));
        assert_eq!(CallOutcome::missed().duration_seconds, None);
        assert_eq!(OutcomeStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn user_ids_order_like_strings() {
        assert!(UserId::new("alice") < UserId::new("bob"));
        assert!(UserId::new("a") < UserId::new("ab"));
    }
}
