//! Change-stream subscription as an owned, scoped resource.
//!
//! A [`ChangeFeed`] is the transport (external collaborator). It hands back a
//! [`FeedChannel`]: a receiver of raw payloads and a teardown hook. The board
//! wraps that in a [`Subscription`], which walks the state machine
//!
//! ```text
//! Unsubscribed ──connect──▶ Subscribing ──confirmed──▶ Subscribed
//!      ▲                         │ refused                  │
//!      └─────────────────────────┴────── unsubscribe/drop ──┘
//! ```
//!
//! and runs the teardown exactly once, on `unsubscribe` or on drop,
//! whichever comes first. Reconnects after a transport drop are the feed's
//! job; a subscription never retries.

pub mod memory;

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

use crate::error::ErrorCode;
use crate::event::RawChange;
use crate::model::ProjectId;

pub use memory::MemoryFeed;

/// Transport that delivers row-level change notifications for a project.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a subscription. Resolves once the transport confirms it.
    async fn subscribe(&self, project_id: &ProjectId) -> Result<FeedChannel, FeedError>;
}

/// Receiving end of a confirmed subscription.
pub struct FeedChannel {
    pub events: mpsc::UnboundedReceiver<RawChange>,
    pub teardown: Teardown,
}

impl fmt::Debug for FeedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedChannel").finish_non_exhaustive()
    }
}

/// One-shot hook that releases the transport side of a subscription.
pub struct Teardown(Option<Box<dyn FnOnce() + Send>>);

impl Teardown {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(release)))
    }

    #[must_use]
    pub const fn noop() -> Self {
        Self(None)
    }

    fn run(mut self) {
        if let Some(release) = self.0.take() {
            release();
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("subscription to project {project} was refused: {reason}")]
    Refused { project: ProjectId, reason: String },
    #[error("change feed transport unavailable: {0}")]
    Transport(String),
}

impl FeedError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::SubscriptionFailed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// A project-scoped subscription that tears itself down when dropped.
pub struct Subscription {
    project_id: ProjectId,
    state: SubscriptionState,
    events: Option<mpsc::UnboundedReceiver<RawChange>>,
    teardown: Option<Teardown>,
}

impl Subscription {
    #[must_use]
    pub const fn new(project_id: ProjectId) -> Self {
        Self {
            project_id,
            state: SubscriptionState::Unsubscribed,
            events: None,
            teardown: None,
        }
    }

    /// Subscribe through `feed`. A no-op when already subscribed.
    ///
    /// # Errors
    ///
    /// Returns the feed's error if the transport refuses; the subscription is
    /// left `Unsubscribed`.
    pub async fn connect(&mut self, feed: &dyn ChangeFeed) -> Result<(), FeedError> {
        if self.state == SubscriptionState::Subscribed {
            return Ok(());
        }

        self.state = SubscriptionState::Subscribing;
        tracing::debug!(project = %self.project_id, "subscribing to issue changes");

        match feed.subscribe(&self.project_id).await {
            Ok(channel) => {
                self.events = Some(channel.events);
                self.teardown = Some(channel.teardown);
                self.state = SubscriptionState::Subscribed;
                tracing::info!(project = %self.project_id, "subscribed to issue changes");
                Ok(())
            }
            Err(err) => {
                self.state = SubscriptionState::Unsubscribed;
                tracing::warn!(project = %self.project_id, error = %err, "issue change subscription failed");
                Err(err)
            }
        }
    }

    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    #[must_use]
    pub const fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// Wait for the next payload. `None` once unsubscribed or the feed closed.
    pub async fn recv(&mut self) -> Option<RawChange> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    /// Take a payload that is already waiting, without suspending.
    pub fn try_recv(&mut self) -> Option<RawChange> {
        self.events.as_mut().and_then(|events| events.try_recv().ok())
    }

    /// Release the subscription. Safe to call repeatedly.
    pub fn unsubscribe(&mut self) {
        if let Some(mut events) = self.events.take() {
            events.close();
        }
        if let Some(teardown) = self.teardown.take() {
            tracing::info!(project = %self.project_id, "unsubscribing from issue changes");
            teardown.run();
        }
        self.state = SubscriptionState::Unsubscribed;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("project_id", &self.project_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFeed {
        released: Arc<AtomicUsize>,
        refuse: bool,
    }

    #[async_trait]
    impl ChangeFeed for CountingFeed {
        async fn subscribe(&self, project_id: &ProjectId) -> Result<FeedChannel, FeedError> {
            if self.refuse {
                return Err(FeedError::Refused {
                    project: project_id.clone(),
                    reason: "not a member".into(),
                });
            }
            let (_tx, events) = mpsc::unbounded_channel();
            let released = Arc::clone(&self.released);
            Ok(FeedChannel {
                events,
                teardown: Teardown::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }),
            })
        }
    }

    #[tokio::test]
    async fn connect_then_drop_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let feed = CountingFeed {
            released: Arc::clone(&released),
            refuse: false,
        };

        let mut sub = Subscription::new(ProjectId::new("p1"));
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        sub.connect(&feed).await.expect("subscribe");
        assert_eq!(sub.state(), SubscriptionState::Subscribed);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        drop(sub);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drop_without_explicit_unsubscribe_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let feed = CountingFeed {
            released: Arc::clone(&released),
            refuse: false,
        };
        {
            let mut sub = Subscription::new(ProjectId::new("p1"));
            sub.connect(&feed).await.expect("subscribe");
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_subscription_returns_to_unsubscribed() {
        let feed = CountingFeed {
            released: Arc::new(AtomicUsize::new(0)),
            refuse: true,
        };
        let mut sub = Subscription::new(ProjectId::new("p1"));
        let err = sub.connect(&feed).await.expect_err("refused");
        assert_eq!(err.code(), ErrorCode::SubscriptionFailed);
        assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
        assert!(sub.try_recv().is_none());
        assert!(sub.recv().await.is_none());
    }
}
