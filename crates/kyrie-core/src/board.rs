//! Board session: one project's store and the parts that feed it.
//!
//! The session is the only strong owner of the store. Listeners and
//! controllers it hands out hold weak handles, so once the session is
//! disposed any late event or status-call continuation becomes a no-op.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::BoardConfig;
use crate::controller::{MoveController, Notifier, StatusUpdater, UpdateScope};
use crate::feed::{ChangeFeed, FeedError, Subscription};
use crate::listener::ChangeListener;
use crate::model::{BoardLanes, Issue, IssueId, IssuePatch, ProjectId};
use crate::store::{IssueStore, SharedStore, StoreHandle};

/// Reads a project's issues with assignees joined.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn load_issues(&self, project_id: &ProjectId) -> Result<Vec<Issue>>;
}

#[derive(Debug)]
pub struct BoardSession {
    project_id: ProjectId,
    store: SharedStore,
    config: BoardConfig,
}

impl BoardSession {
    /// Mount a board from an already-loaded snapshot.
    #[must_use]
    pub fn mount(project_id: ProjectId, snapshot: Vec<Issue>, config: BoardConfig) -> Self {
        tracing::debug!(project = %project_id, issues = snapshot.len(), "mounting board");
        Self {
            project_id,
            store: Arc::new(Mutex::new(IssueStore::from_snapshot(snapshot))),
            config,
        }
    }

    /// Load the snapshot from `source`, then mount.
    ///
    /// # Errors
    ///
    /// Returns the source's error with the project id attached.
    pub async fn mount_from(
        source: &dyn SnapshotSource,
        project_id: ProjectId,
        config: BoardConfig,
    ) -> Result<Self> {
        let snapshot = source
            .load_issues(&project_id)
            .await
            .with_context(|| format!("Failed to load board snapshot for project {project_id}"))?;
        Ok(Self::mount(project_id, snapshot, config))
    }

    #[must_use]
    pub const fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    #[must_use]
    pub const fn config(&self) -> &BoardConfig {
        &self.config
    }

    #[must_use]
    pub fn handle(&self) -> StoreHandle {
        StoreHandle::new(&self.store)
    }

    /// Read-only copy of the board in display order.
    #[must_use]
    pub fn issues(&self) -> Vec<Issue> {
        self.lock().snapshot()
    }

    #[must_use]
    pub fn issue(&self, id: &IssueId) -> Option<Issue> {
        self.lock().get(id).cloned()
    }

    #[must_use]
    pub fn lanes(&self) -> BoardLanes {
        BoardLanes::from_issues(self.lock().iter())
    }

    /// Card label such as `KYR-12`, using the configured project identifier.
    #[must_use]
    pub fn display_key(&self, issue: &Issue) -> String {
        issue.display_key(&self.config.project_identifier)
    }

    /// Write `patch` into the store now. Returns the patch that undoes it, or
    /// `None` if the issue is not on the board.
    pub fn optimistic_update(&self, id: &IssueId, patch: &IssuePatch) -> Option<IssuePatch> {
        let mut store = self.lock();
        let inverse = patch.inverse_for(&store.get(id)?.row);
        store.patch_one(id, patch);
        Some(inverse)
    }

    /// Restore fields captured by [`Self::optimistic_update`].
    pub fn rollback(&self, id: &IssueId, captured: &IssuePatch) -> bool {
        self.lock().patch_one(id, captured)
    }

    /// Replace the whole board with a fresh snapshot.
    pub fn reload(&self, snapshot: Vec<Issue>) {
        tracing::debug!(project = %self.project_id, issues = snapshot.len(), "reloading board");
        self.lock().replace_all(snapshot);
    }

    #[must_use]
    pub fn listener(&self) -> ChangeListener {
        ChangeListener::new(self.project_id.clone(), self.handle())
    }

    /// A move controller for this board, configured from the board settings.
    #[must_use]
    pub fn controller(
        &self,
        updater: Arc<dyn StatusUpdater>,
        notifier: Arc<dyn Notifier>,
        scope: UpdateScope,
    ) -> MoveController {
        MoveController::new(self.handle(), updater, notifier, scope).configured(&self.config)
    }

    /// Open a change subscription for this board's project.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] if the feed refuses the subscription.
    pub async fn subscribe(&self, feed: &dyn ChangeFeed) -> Result<Subscription, FeedError> {
        let mut subscription = Subscription::new(self.project_id.clone());
        subscription.connect(feed).await?;
        Ok(subscription)
    }

    /// Tear the board down. Outstanding handles stop affecting anything.
    pub fn dispose(self) {
        tracing::debug!(project = %self.project_id, "disposing board");
    }

    fn lock(&self) -> MutexGuard<'_, IssueStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
