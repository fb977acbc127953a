//! Remote change listener.
//!
//! Merges narrowed change events into a board's store:
//!
//! | event  | store primitive                                              |
//! |--------|--------------------------------------------------------------|
//! | INSERT | `upsert_fields`, assignee unknown unless the payload has one |
//! | UPDATE | `upsert_fields`, carried columns only                        |
//! | DELETE | `remove_one` with the id from the previous record            |
//!
//! The stream does not join assignees, so a payload without an `assignee`
//! key leaves the stored one alone. That also makes a redelivered INSERT for
//! a card already on the board indistinguishable from the first one.
//!
//! The listener never retries and never surfaces errors. Malformed payloads
//! are logged and counted; events for another project are ignored.

use serde::Serialize;

use crate::event::{ChangeEvent, RawChange};
use crate::feed::Subscription;
use crate::model::ProjectId;
use crate::store::{StoreHandle, UpsertOutcome};

/// What applying one change did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new card entered the board.
    Inserted,
    /// An existing card was overwritten.
    Updated,
    /// A card left the board.
    Deleted,
    /// A DELETE for an id that was not on the board, or a partial UPDATE
    /// for one that could not be inserted.
    Absent,
    /// The change belongs to another project.
    Ignored,
    /// The payload was malformed and discarded.
    Dropped,
    /// The board is gone; nothing was applied.
    Disposed,
}

/// Running counts of what the listener has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListenerStats {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub ignored: u64,
    pub dropped: u64,
}

impl ListenerStats {
    /// Events that reached the store.
    #[must_use]
    pub const fn applied(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    fn record(&mut self, applied: Applied) {
        match applied {
            Applied::Inserted => self.inserted += 1,
            Applied::Updated => self.updated += 1,
            Applied::Deleted => self.deleted += 1,
            Applied::Ignored => self.ignored += 1,
            Applied::Dropped => self.dropped += 1,
            Applied::Absent | Applied::Disposed => {}
        }
    }
}

/// Applies remote changes for one project to a board store.
#[derive(Debug, Clone)]
pub struct ChangeListener {
    project_id: ProjectId,
    store: StoreHandle,
    stats: ListenerStats,
}

impl ChangeListener {
    #[must_use]
    pub fn new(project_id: ProjectId, store: StoreHandle) -> Self {
        Self {
            project_id,
            store,
            stats: ListenerStats::default(),
        }
    }

    #[must_use]
    pub const fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    #[must_use]
    pub const fn stats(&self) -> ListenerStats {
        self.stats
    }

    /// Narrow and apply a payload as the transport delivered it.
    pub fn apply_raw(&mut self, raw: &RawChange) -> Applied {
        match ChangeEvent::try_from(raw) {
            Ok(event) => self.apply(event),
            Err(err) => {
                tracing::warn!(
                    project = %self.project_id,
                    code = err.code().code(),
                    error = %err,
                    "dropping malformed change payload"
                );
                self.stats.record(Applied::Dropped);
                Applied::Dropped
            }
        }
    }

    /// Apply a validated change.
    pub fn apply(&mut self, event: ChangeEvent) -> Applied {
        if event
            .project_id()
            .is_some_and(|project| project != &self.project_id)
        {
            tracing::debug!(
                project = %self.project_id,
                id = %event.issue_id(),
                kind = %event.kind(),
                "ignoring change for another project"
            );
            self.stats.record(Applied::Ignored);
            return Applied::Ignored;
        }

        let kind = event.kind();
        let id = event.issue_id().clone();
        let applied = self
            .store
            .with(|store| match event {
                ChangeEvent::Insert(fields) | ChangeEvent::Update(fields) => {
                    match store.upsert_fields(&fields) {
                        Some(UpsertOutcome::Inserted) => Applied::Inserted,
                        Some(UpsertOutcome::Merged) => Applied::Updated,
                        None => Applied::Absent,
                    }
                }
                ChangeEvent::Delete { id, .. } => {
                    if store.remove_one(&id).is_some() {
                        Applied::Deleted
                    } else {
                        Applied::Absent
                    }
                }
            })
            .unwrap_or(Applied::Disposed);

        tracing::debug!(project = %self.project_id, %id, %kind, ?applied, "applied remote change");
        self.stats.record(applied);
        applied
    }

    /// Apply every payload already waiting on `subscription` without
    /// suspending. Returns how many were taken.
    pub fn pump(&mut self, subscription: &mut Subscription) -> usize {
        let mut taken = 0;
        while let Some(raw) = subscription.try_recv() {
            taken += 1;
            if self.apply_raw(&raw) == Applied::Disposed {
                subscription.unsubscribe();
                break;
            }
        }
        taken
    }

    /// Apply payloads until the subscription closes or the board is disposed.
    ///
    /// Disposal releases the subscription before returning.
    pub async fn run(&mut self, subscription: &mut Subscription) {
        while let Some(raw) = subscription.recv().await {
            if self.apply_raw(&raw) == Applied::Disposed {
                break;
            }
        }
        subscription.unsubscribe();
        tracing::debug!(project = %self.project_id, stats = ?self.stats, "change listener stopped");
    }
}
