//! Fallback polling for durable call requests.
//!
//! The store change feed is the primary delivery path for session
//! signals, but a recipient that was offline when the feed event fired
//! would never ring. The poller periodically asks the store for the
//! newest call request addressed to the local user and re-injects it
//! into the normal dispatch path. Downstream id dedup makes the second
//! delivery harmless, and a freshness window keeps long-abandoned
//! requests from ringing hours later.

use crate::router::SignalRouter;
use crate::types::CallSignal;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Answers whether the local participant is already in a call.
///
/// The poller skips its tick while busy so an active call is never
/// interrupted by a rediscovered request.
#[async_trait]
pub trait CallActivity: Send + Sync {
    /// Whether any call session is currently non-idle.
    async fn in_call(&self) -> bool;
}

/// Periodically rediscovers durable call requests missed by the feed.
pub struct FallbackPoller {
    router: Arc<SignalRouter>,
    activity: Arc<dyn CallActivity>,
    interval: Duration,
    freshness: Duration,
    deliveries: mpsc::Sender<CallSignal>,
}

impl FallbackPoller {
    /// Create a poller that forwards discovered requests on `deliveries`.
    #[must_use]
    pub fn new(
        router: Arc<SignalRouter>,
        activity: Arc<dyn CallActivity>,
        interval: Duration,
        freshness: Duration,
        deliveries: mpsc::Sender<CallSignal>,
    ) -> Self {
        Self {
            router,
            activity,
            interval,
            freshness,
            deliveries,
        }
    }

    /// Run the poll loop until the delivery channel closes.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if self.deliveries.is_closed() {
                    break;
                }
                self.poll_once().await;
            }
        })
    }

    /// One poll tick: skip while in a call, fetch the newest request, and
    /// forward it if it is still fresh.
    pub async fn poll_once(&self) {
        if self.activity.in_call().await {
            return;
        }

        let request = match self.router.latest_call_request().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "call request poll failed");
                return;
            }
        };

        let Ok(max_age) = chrono::Duration::from_std(self.freshness) else {
            return;
        };
        let age = Utc::now().signed_duration_since(request.created_at);
        if age > max_age {
            tracing::trace!(
                id = %request.id,
                age_secs = age.num_seconds(),
                "ignoring stale call request"
            );
            return;
        }

        tracing::debug!(
            id = %request.id,
            from = %request.from_user_id,
            chat_id = %request.chat_id,
            "poller discovered call request"
        );
        let _ = self.deliveries.send(request).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::local::LocalSignalHub;
    use crate::types::{ChatId, SignalPayload, UserId};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubActivity(AtomicBool);

    #[async_trait]
    impl CallActivity for StubActivity {
        async fn in_call(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn poller_for(
        hub: &Arc<LocalSignalHub>,
        user: &str,
        busy: bool,
    ) -> (FallbackPoller, mpsc::Receiver<CallSignal>) {
        let router = Arc::new(SignalRouter::new(
            UserId::new(user),
            hub.clone(),
            hub.clone(),
            hub.clone(),
        ));
        let (tx, rx) = mpsc::channel(8);
        let poller = FallbackPoller::new(
            router,
            Arc::new(StubActivity(AtomicBool::new(busy))),
            Duration::from_millis(50),
            Duration::from_secs(10),
            tx,
        );
        (poller, rx)
    }

    async fn append_request(hub: &Arc<LocalSignalHub>, to: &str) -> CallSignal {
        let router = SignalRouter::new(
            UserId::new("alice"),
            hub.clone(),
            hub.clone(),
            hub.clone(),
        );
        let signal = CallSignal::new(
            ChatId::new("chat-1"),
            UserId::new("alice"),
            UserId::new(to),
            SignalPayload::CallRequest,
        );
        router.send(signal.clone()).await;
        signal
    }

    #[tokio::test]
    async fn fresh_request_is_delivered() {
        let hub = Arc::new(LocalSignalHub::new());
        let sent = append_request(&hub, "bob").await;

        let (poller, mut rx) = poller_for(&hub, "bob", false);
        poller.poll_once().await;

        let got = rx.try_recv().unwrap();
        assert_eq!(got.id, sent.id);
    }

    #[tokio::test]
    async fn stale_request_is_ignored() {
        let hub = Arc::new(LocalSignalHub::new());
        let mut signal = CallSignal::new(
            ChatId::new("chat-1"),
            UserId::new("alice"),
            UserId::new("bob"),
            SignalPayload::CallRequest,
        );
        // Backdated past the freshness window.
        signal.created_at = signal.created_at - chrono::Duration::seconds(60);
        let router = SignalRouter::new(
            UserId::new("alice"),
            hub.clone(),
            hub.clone(),
            hub.clone(),
        );
        router.send(signal).await;

        let (poller, mut rx) = poller_for(&hub, "bob", false);
        poller.poll_once().await;
        // The newest request is the backdated one; nothing may ring.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn busy_participant_is_not_polled() {
        let hub = Arc::new(LocalSignalHub::new());
        append_request(&hub, "bob").await;

        let (poller, mut rx) = poller_for(&hub, "bob", true);
        poller.poll_once().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nothing_pending_delivers_nothing() {
        let hub = Arc::new(LocalSignalHub::new());
        let (poller, mut rx) = poller_for(&hub, "bob", false);
        poller.poll_once().await;
        assert!(rx.try_recv().is_err());
    }
}
