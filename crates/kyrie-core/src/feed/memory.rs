//! In-process change feed.
//!
//! Fans published payloads out to every live subscriber of the payload's
//! project. DELETE payloads usually carry only the old id, so a payload with
//! no project goes to every subscriber; the listener treats unknown ids as
//! no-ops.
//!
//! The hub can be taken offline to model a dropped transport: payloads
//! published while offline are lost, and subscriptions resume receiving once
//! the hub is back online. `replay_recent` models the duplicate tail a real
//! transport redelivers after reconnecting.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{ChangeFeed, FeedChannel, FeedError, Teardown};
use crate::event::RawChange;
use crate::model::ProjectId;

/// Upper bound on remembered payloads used for replays.
const HISTORY_LIMIT: usize = 256;

#[derive(Debug)]
struct Subscriber {
    id: u64,
    project: ProjectId,
    tx: mpsc::UnboundedSender<RawChange>,
}

#[derive(Debug)]
struct Hub {
    next_id: u64,
    online: bool,
    refusing: bool,
    subscribers: Vec<Subscriber>,
    history: Vec<RawChange>,
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            next_id: 0,
            online: true,
            refusing: false,
            subscribers: Vec::new(),
            history: Vec::new(),
        }
    }
}

/// Shared, cloneable in-memory broadcast hub.
#[derive(Debug, Clone, Default)]
pub struct MemoryFeed {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `change` to matching subscribers. Returns how many received it.
    pub fn publish(&self, change: RawChange) -> usize {
        let mut hub = self.lock();
        if !hub.online {
            tracing::debug!(kind = %change.event_type, "feed offline; change not delivered");
            return 0;
        }

        let delivered = fan_out(&mut hub.subscribers, &change);
        hub.history.push(change);
        if hub.history.len() > HISTORY_LIMIT {
            let excess = hub.history.len() - HISTORY_LIMIT;
            hub.history.drain(..excess);
        }
        delivered
    }

    /// Redeliver the last `count` published payloads, oldest first.
    pub fn replay_recent(&self, count: usize) -> usize {
        let mut hub = self.lock();
        if !hub.online {
            return 0;
        }
        let start = hub.history.len().saturating_sub(count);
        let tail: Vec<RawChange> = hub.history[start..].to_vec();
        let mut delivered = 0;
        for change in &tail {
            delivered += fan_out(&mut hub.subscribers, change);
        }
        delivered
    }

    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Make future `subscribe` calls fail, e.g. for an unauthorized viewer.
    pub fn refuse_subscriptions(&self, refusing: bool) {
        self.lock().refusing = refusing;
    }

    #[must_use]
    pub fn subscriber_count(&self, project: &ProjectId) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|sub| &sub.project == project)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fan_out(subscribers: &mut Vec<Subscriber>, change: &RawChange) -> usize {
    let project = change.project_hint();
    let mut delivered = 0;
    subscribers.retain(|sub| {
        if project.is_some_and(|p| p != sub.project.as_str()) {
            return true;
        }
        if sub.tx.send(change.clone()).is_ok() {
            delivered += 1;
            true
        } else {
            false
        }
    });
    delivered
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn subscribe(&self, project_id: &ProjectId) -> Result<FeedChannel, FeedError> {
        let (tx, events) = mpsc::unbounded_channel();
        let id = {
            let mut hub = self.lock();
            if hub.refusing {
                return Err(FeedError::Refused {
                    project: project_id.clone(),
                    reason: "subscriptions disabled".to_string(),
                });
            }
            let id = hub.next_id;
            hub.next_id += 1;
            hub.subscribers.push(Subscriber {
                id,
                project: project_id.clone(),
                tx,
            });
            id
        };

        let hub = Arc::clone(&self.hub);
        Ok(FeedChannel {
            events,
            teardown: Teardown::new(move || {
                hub.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .subscribers
                    .retain(|sub| sub.id != id);
            }),
        })
    }
}
