//! Local state store for one project's board.
//!
//! The store is an insertion-ordered set of [`Issue`]s keyed by id. New ids
//! are prepended so freshly created cards surface first. Every primitive is
//! idempotent and treats an unknown id as a no-op, because both the change
//! stream and reconnect races may redeliver events.
//!
//! The store itself is a plain value. A board session owns it behind an
//! `Arc<Mutex<_>>`; listeners and controllers only ever see a [`StoreHandle`],
//! a weak reference that turns every write into a no-op once the session is
//! disposed.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::model::{Issue, IssueFields, IssueId, IssuePatch};

/// How `upsert_one` treats a record that is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Incoming record replaces every field, including denormalized ones.
    Overwrite,
    /// Incoming row fields win; denormalized fields absent from the incoming
    /// record (the assignee join) keep their existing value.
    PreserveDenormalized,
}

/// What `upsert_one` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    issue: Issue,
    remote_rev: u64,
}

/// Insertion-ordered, id-keyed collection of board issues.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueStore {
    slots: Vec<Slot>,
}

impl IssueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_snapshot(records: Vec<Issue>) -> Self {
        let mut store = Self::new();
        store.replace_all(records);
        store
    }

    /// Discard all state and load a fresh snapshot, keeping snapshot order.
    ///
    /// A snapshot that repeats an id keeps the first copy.
    pub fn replace_all(&mut self, records: Vec<Issue>) {
        self.slots.clear();
        for issue in records {
            if self.position(issue.id()).is_some() {
                tracing::warn!(id = %issue.id(), "snapshot repeats issue id; keeping first copy");
                continue;
            }
            self.slots.push(Slot {
                issue,
                remote_rev: 0,
            });
        }
    }

    /// Insert `record` at the front if its id is new, otherwise merge it
    /// into the existing copy according to `policy`.
    ///
    /// Every call bumps the record's remote revision.
    pub fn upsert_one(&mut self, record: Issue, policy: MergePolicy) -> UpsertOutcome {
        match self.position(record.id()) {
            Some(index) => {
                let slot = &mut self.slots[index];
                let Issue { row, assignee } = record;
                slot.issue.row = row;
                match policy {
                    MergePolicy::Overwrite => slot.issue.assignee = assignee,
                    MergePolicy::PreserveDenormalized => {
                        if assignee.is_some() {
                            slot.issue.assignee = assignee;
                        }
                    }
                }
                slot.remote_rev = slot.remote_rev.saturating_add(1);
                UpsertOutcome::Merged
            }
            None => {
                self.slots.insert(
                    0,
                    Slot {
                        issue: record,
                        remote_rev: 1,
                    },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    /// Merge the columns a remote payload carried.
    ///
    /// A known id takes every carried column, the assignee included when the
    /// payload had one, and keeps the rest. An unknown id is inserted at the
    /// front if the payload is a complete row; otherwise nothing happens and
    /// `None` is returned. Every merge or insert bumps the remote revision.
    pub fn upsert_fields(&mut self, fields: &IssueFields) -> Option<UpsertOutcome> {
        if let Some(index) = self.position(&fields.id) {
            let slot = &mut self.slots[index];
            fields.merge_into(&mut slot.issue);
            slot.remote_rev = slot.remote_rev.saturating_add(1);
            return Some(UpsertOutcome::Merged);
        }
        let issue = fields.to_issue()?;
        Some(self.upsert_one(issue, MergePolicy::Overwrite))
    }

    /// Remove by id. Returns the removed issue, or `None` if it was absent.
    pub fn remove_one(&mut self, id: &IssueId) -> Option<Issue> {
        self.position(id).map(|index| self.slots.remove(index).issue)
    }

    /// Apply a partial write to an existing record. Never inserts.
    ///
    /// Returns `false` if the id is not on the board.
    pub fn patch_one(&mut self, id: &IssueId, patch: &IssuePatch) -> bool {
        match self.position(id) {
            Some(index) => {
                patch.apply_to(&mut self.slots[index].issue.row);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, id: &IssueId) -> Option<&Issue> {
        self.position(id).map(|index| &self.slots[index].issue)
    }

    /// Number of remote upserts applied to this record since it entered the store.
    #[must_use]
    pub fn remote_revision(&self, id: &IssueId) -> Option<u64> {
        self.position(id).map(|index| self.slots[index].remote_rev)
    }

    #[must_use]
    pub fn contains(&self, id: &IssueId) -> bool {
        self.position(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Issue> {
        self.slots.iter().map(|slot| &slot.issue)
    }

    /// Owned copy of the current contents in iteration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Issue> {
        self.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn position(&self, id: &IssueId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.issue.id() == id)
    }
}

/// Store shared by a single board session.
pub type SharedStore = Arc<Mutex<IssueStore>>;

/// Weak, disposal-fenced access to a session's store.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    inner: Weak<Mutex<IssueStore>>,
}

impl StoreHandle {
    #[must_use]
    pub fn new(store: &SharedStore) -> Self {
        Self {
            inner: Arc::downgrade(store),
        }
    }

    /// A handle that was never attached to a live store.
    #[must_use]
    pub const fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    /// Run `f` against the store, or return `None` if the session is gone.
    ///
    /// The lock is held only for the duration of `f`; never call this across
    /// an `.await`.
    pub fn with<R>(&self, f: impl FnOnce(&mut IssueStore) -> R) -> Option<R> {
        let store = self.inner.upgrade()?;
        let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&mut guard))
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.strong_count() > 0
    }
}
