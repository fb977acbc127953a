//! Optimistic move controller.
//!
//! A move of issue `i` to status `s1`:
//!
//! 1. no-op when `i` already sits in `s1` or is not on the board (no remote call);
//! 2. write `s1` into the store immediately and capture the previous value;
//! 3. call the status updater exactly once;
//! 4. on success leave the store alone and notify;
//! 5. on rejection or transport failure restore the captured value and notify.
//!
//! Steps 1–2 are [`MoveController::begin`], steps 4–5 are
//! [`MoveController::settle`]; [`MoveController::move_issue`] runs the three
//! in order with the remote call as its only suspension point. The store lock
//! is never held across that call.
//!
//! A remote UPDATE landing between begin and settle is last-write-wins by
//! arrival order. Under [`RollbackPolicy::Captured`] a failed move still
//! restores the captured value over it. [`RollbackPolicy::Guarded`] keeps the
//! remote value instead and reports [`MoveOutcome::Superseded`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::BoardConfig;
use crate::error::ErrorCode;
use crate::model::{IssueId, IssuePatch, Status};
use crate::store::StoreHandle;

/// What a failed move restores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// Always restore the status captured before the optimistic write.
    #[default]
    Captured,
    /// Restore only if no remote update touched the card since the write.
    Guarded,
}

/// Tenant path the status call is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateScope {
    pub workspace_slug: String,
    pub project_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub issue_id: IssueId,
    pub new_status: Status,
    pub scope: UpdateScope,
}

/// Answer of a status call that reached the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum UpdateOutcome {
    Success,
    Failure { message: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("status update request failed: {0}")]
    Request(String),
    #[error("status update timed out after {0:?}")]
    Timeout(Duration),
}

/// Remote call that persists a status change.
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn update_status(
        &self,
        request: &StatusUpdateRequest,
    ) -> Result<UpdateOutcome, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Error,
}

/// A transient message for the person who dragged the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    #[must_use]
    pub fn moved(to: Status) -> Self {
        Self {
            level: NotificationLevel::Success,
            message: format!("Moved to {}", to.spoken()),
        }
    }

    #[must_use]
    pub fn move_failed() -> Self {
        Self {
            level: NotificationLevel::Error,
            message: "Failed to move card".to_string(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Success => tracing::info!("{}", notification.message),
            NotificationLevel::Error => tracing::warn!("{}", notification.message),
        }
    }
}

/// Keeps every notification in memory, in emission order.
#[derive(Debug, Clone, Default)]
pub struct NotificationLog {
    entries: Arc<Mutex<Vec<Notification>>>,
}

impl NotificationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<Notification> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for NotificationLog {
    fn notify(&self, notification: Notification) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}

/// Why the server did not confirm a move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveFailure {
    Rejected { message: String },
    Transport { message: String },
}

impl MoveFailure {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Rejected { .. } => ErrorCode::StatusUpdateRejected,
            Self::Transport { .. } => ErrorCode::StatusUpdateTransport,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Rejected { message } | Self::Transport { message } => message,
        }
    }
}

/// Final result of one move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The card already had the target status.
    Unchanged,
    /// The card is not on this board.
    NotOnBoard,
    /// The server accepted the new status.
    Confirmed,
    /// The server refused; the captured status was restored.
    RolledBack(MoveFailure),
    /// The server refused, but a newer remote value was kept.
    Superseded(MoveFailure),
    /// The server refused, but the card left the board while the call was
    /// outstanding; nothing was restored.
    Removed(MoveFailure),
    /// The board was disposed before the move settled.
    Abandoned,
}

impl MoveOutcome {
    /// Whether a remote call was made for this move.
    #[must_use]
    pub const fn reached_server(&self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::RolledBack(_) | Self::Superseded(_) | Self::Removed(_)
        )
    }
}

/// A move whose optimistic write is in the store and whose remote call is
/// outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMove {
    pub issue_id: IssueId,
    pub from: Status,
    pub to: Status,
    rollback: IssuePatch,
    revision: u64,
}

/// Result of [`MoveController::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveStart {
    Pending(PendingMove),
    Skipped(MoveOutcome),
}

/// Runs optimistic status moves against one board.
pub struct MoveController {
    store: StoreHandle,
    updater: Arc<dyn StatusUpdater>,
    notifier: Arc<dyn Notifier>,
    scope: UpdateScope,
    policy: RollbackPolicy,
    success_notifications: bool,
}

impl MoveController {
    #[must_use]
    pub fn new(
        store: StoreHandle,
        updater: Arc<dyn StatusUpdater>,
        notifier: Arc<dyn Notifier>,
        scope: UpdateScope,
    ) -> Self {
        Self {
            store,
            updater,
            notifier,
            scope,
            policy: RollbackPolicy::default(),
            success_notifications: true,
        }
    }

    /// Take the rollback policy and notification settings from `config`.
    #[must_use]
    pub fn configured(mut self, config: &BoardConfig) -> Self {
        self.policy = config.rollback_policy;
        self.success_notifications = config.success_notifications;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn policy(&self) -> RollbackPolicy {
        self.policy
    }

    /// Move `id` to `to`, reconciling with the server's answer.
    pub async fn move_issue(&self, id: &IssueId, to: Status) -> MoveOutcome {
        let pending = match self.begin(id, to) {
            MoveStart::Pending(pending) => pending,
            MoveStart::Skipped(outcome) => return outcome,
        };
        let request = self.request(&pending);
        let result = self.updater.update_status(&request).await;
        self.settle(pending, result)
    }

    /// Apply the optimistic write and capture what a rollback restores.
    pub fn begin(&self, id: &IssueId, to: Status) -> MoveStart {
        let started = self.store.with(|store| {
            let Some(issue) = store.get(id) else {
                return MoveStart::Skipped(MoveOutcome::NotOnBoard);
            };
            let from = issue.status();
            if from == to {
                return MoveStart::Skipped(MoveOutcome::Unchanged);
            }

            let patch = IssuePatch::status(to);
            let rollback = patch.inverse_for(&issue.row);
            store.patch_one(id, &patch);
            let revision = store.remote_revision(id).unwrap_or_default();
            MoveStart::Pending(PendingMove {
                issue_id: id.clone(),
                from,
                to,
                rollback,
                revision,
            })
        });

        let start = started.unwrap_or(MoveStart::Skipped(MoveOutcome::Abandoned));
        match &start {
            MoveStart::Pending(pending) => tracing::debug!(
                id = %pending.issue_id,
                from = %pending.from,
                to = %pending.to,
                "optimistic move applied"
            ),
            MoveStart::Skipped(outcome) => {
                tracing::debug!(%id, %to, ?outcome, "move skipped");
            }
        }
        start
    }

    /// The status call that confirms `pending`.
    #[must_use]
    pub fn request(&self, pending: &PendingMove) -> StatusUpdateRequest {
        StatusUpdateRequest {
            issue_id: pending.issue_id.clone(),
            new_status: pending.to,
            scope: self.scope.clone(),
        }
    }

    /// Reconcile the store with the server's answer for `pending`.
    pub fn settle(
        &self,
        pending: PendingMove,
        result: Result<UpdateOutcome, TransportError>,
    ) -> MoveOutcome {
        let failure = match result {
            Ok(UpdateOutcome::Success) => {
                if !self.store.is_live() {
                    tracing::debug!(id = %pending.issue_id, "move confirmed after board disposal");
                    return MoveOutcome::Abandoned;
                }
                tracing::info!(id = %pending.issue_id, to = %pending.to, "move confirmed");
                if self.success_notifications {
                    self.notifier.notify(Notification::moved(pending.to));
                }
                return MoveOutcome::Confirmed;
            }
            Ok(UpdateOutcome::Failure { message }) => MoveFailure::Rejected { message },
            Err(err) => MoveFailure::Transport {
                message: err.to_string(),
            },
        };

        let policy = self.policy;
        let rollback = self.store.with(|store| {
            let Some(rev) = store.remote_revision(&pending.issue_id) else {
                return Rollback::Removed;
            };
            if policy == RollbackPolicy::Guarded && rev != pending.revision {
                return Rollback::Skipped;
            }
            store.patch_one(&pending.issue_id, &pending.rollback);
            Rollback::Restored
        });

        let Some(rollback) = rollback else {
            tracing::debug!(id = %pending.issue_id, "move failed after board disposal");
            return MoveOutcome::Abandoned;
        };

        tracing::warn!(
            id = %pending.issue_id,
            from = %pending.from,
            to = %pending.to,
            code = failure.code().code(),
            reason = failure.message(),
            ?rollback,
            "move failed"
        );
        self.notifier.notify(Notification::move_failed());

        match rollback {
            Rollback::Restored => MoveOutcome::RolledBack(failure),
            Rollback::Skipped => MoveOutcome::Superseded(failure),
            Rollback::Removed => MoveOutcome::Removed(failure),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Rollback {
    Restored,
    Skipped,
    Removed,
}

impl std::fmt::Debug for MoveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveController")
            .field("scope", &self.scope)
            .field("policy", &self.policy)
            .field("success_notifications", &self.success_notifications)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Issue, IssueRow};
    use crate::store::{IssueStore, MergePolicy, SharedStore};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        answers: Mutex<VecDeque<Result<UpdateOutcome, TransportError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<Result<UpdateOutcome, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl StatusUpdater for Scripted {
        async fn update_status(
            &self,
            _request: &StatusUpdateRequest,
        ) -> Result<UpdateOutcome, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .expect("answers")
                .pop_front()
                .unwrap_or(Ok(UpdateOutcome::Success))
        }
    }

    fn issue(id: &str, status: Status) -> Issue {
        let row: IssueRow = serde_json::from_value(json!({
            "id": id,
            "project_id": "p1",
            "workspace_id": "w1",
            "sequence_id": 1,
            "status": status,
            "title": "t",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        }))
        .expect("row");
        Issue::from_row(row)
    }

    fn setup(
        answers: Vec<Result<UpdateOutcome, TransportError>>,
    ) -> (SharedStore, Arc<Scripted>, NotificationLog, MoveController) {
        let store: SharedStore = Arc::new(Mutex::new(IssueStore::from_snapshot(vec![
            issue("1", Status::Todo),
            issue("2", Status::Done),
        ])));
        let updater = Scripted::new(answers);
        let log = NotificationLog::new();
        let controller = MoveController::new(
            StoreHandle::new(&store),
            updater.clone(),
            Arc::new(log.clone()),
            UpdateScope::default(),
        );
        (store, updater, log, controller)
    }

    fn status_of(store: &SharedStore, id: &str) -> Option<Status> {
        store.lock().expect("lock").get(&IssueId::new(id)).map(Issue::status)
    }

    #[tokio::test]
    async fn unchanged_status_makes_no_call() {
        let (store, updater, log, controller) = setup(vec![]);
        let before = store.lock().expect("lock").clone();

        let outcome = controller.move_issue(&IssueId::new("1"), Status::Todo).await;
        assert_eq!(outcome, MoveOutcome::Unchanged);
        assert!(!outcome.reached_server());
        assert_eq!(
            controller.move_issue(&IssueId::new("ghost"), Status::Done).await,
            MoveOutcome::NotOnBoard
        );

        assert_eq!(updater.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*store.lock().expect("lock"), before);
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn confirmed_move_keeps_new_status_and_notifies() {
        let (store, updater, log, controller) = setup(vec![Ok(UpdateOutcome::Success)]);

        let outcome = controller.move_issue(&IssueId::new("1"), Status::InProgress).await;
        assert_eq!(outcome, MoveOutcome::Confirmed);
        assert_eq!(status_of(&store, "1"), Some(Status::InProgress));
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.entries(), vec![Notification::moved(Status::InProgress)]);
        assert_eq!(log.entries()[0].message, "Moved to in progress");
    }

    #[tokio::test]
    async fn rejected_move_restores_previous_status() {
        let (store, updater, log, controller) = setup(vec![Ok(UpdateOutcome::Failure {
            message: "not a member".into(),
        })]);

        let outcome = controller.move_issue(&IssueId::new("1"), Status::Done).await;
        let MoveOutcome::RolledBack(failure) = outcome else {
            panic!("expected rollback, got {outcome:?}");
        };
        assert_eq!(failure.code(), ErrorCode::StatusUpdateRejected);
        assert_eq!(failure.message(), "not a member");
        assert_eq!(status_of(&store, "1"), Some(Status::Todo));
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.entries(), vec![Notification::move_failed()]);
    }

    #[tokio::test]
    async fn transport_failure_is_treated_like_rejection() {
        let (store, _updater, _log, controller) =
            setup(vec![Err(TransportError::Timeout(Duration::from_secs(5)))]);

        let outcome = controller.move_issue(&IssueId::new("2"), Status::Canceled).await;
        assert!(matches!(
            outcome,
            MoveOutcome::RolledBack(MoveFailure::Transport { .. })
        ));
        assert_eq!(status_of(&store, "2"), Some(Status::Done));
    }

    #[test]
    fn captured_rollback_clobbers_interleaved_remote_update() {
        let (store, _updater, _log, controller) = setup(vec![]);
        let MoveStart::Pending(pending) = controller.begin(&IssueId::new("1"), Status::Done) else {
            panic!("expected pending move");
        };

        store
            .lock()
            .expect("lock")
            .upsert_one(issue("1", Status::InProgress), MergePolicy::PreserveDenormalized);

        let outcome = controller.settle(
            pending,
            Ok(UpdateOutcome::Failure {
                message: "denied".into(),
            }),
        );
        assert!(matches!(outcome, MoveOutcome::RolledBack(_)));
        assert_eq!(status_of(&store, "1"), Some(Status::Todo));
    }

    #[test]
    fn guarded_rollback_keeps_newer_remote_value() {
        let (store, _updater, log, controller) = setup(vec![]);
        let controller = controller.with_policy(RollbackPolicy::Guarded);
        let MoveStart::Pending(pending) = controller.begin(&IssueId::new("1"), Status::Done) else {
            panic!("expected pending move");
        };

        store
            .lock()
            .expect("lock")
            .upsert_one(issue("1", Status::InProgress), MergePolicy::PreserveDenormalized);

        let outcome = controller.settle(pending, Err(TransportError::Request("reset".into())));
        assert!(matches!(outcome, MoveOutcome::Superseded(_)));
        assert_eq!(status_of(&store, "1"), Some(Status::InProgress));
        assert_eq!(log.entries(), vec![Notification::move_failed()]);
    }

    #[test]
    fn guarded_rollback_restores_when_untouched() {
        let (store, _updater, _log, controller) = setup(vec![]);
        let controller = controller.with_policy(RollbackPolicy::Guarded);
        let MoveStart::Pending(pending) = controller.begin(&IssueId::new("2"), Status::Todo) else {
            panic!("expected pending move");
        };
        let outcome = controller.settle(
            pending,
            Ok(UpdateOutcome::Failure {
                message: "denied".into(),
            }),
        );
        assert!(matches!(outcome, MoveOutcome::RolledBack(_)));
        assert_eq!(status_of(&store, "2"), Some(Status::Done));
    }

    #[test]
    fn failed_move_on_deleted_card_reports_removed() {
        for policy in [RollbackPolicy::Captured, RollbackPolicy::Guarded] {
            let (store, _updater, log, controller) = setup(vec![]);
            let controller = controller.with_policy(policy);
            let MoveStart::Pending(pending) = controller.begin(&IssueId::new("1"), Status::Done)
            else {
                panic!("expected pending move");
            };

            store.lock().expect("lock").remove_one(&IssueId::new("1"));

            let outcome = controller.settle(
                pending,
                Ok(UpdateOutcome::Failure {
                    message: "denied".into(),
                }),
            );
            assert!(matches!(outcome, MoveOutcome::Removed(_)), "{policy:?}: {outcome:?}");
            assert!(outcome.reached_server());
            assert_eq!(status_of(&store, "1"), None);
            assert_eq!(store.lock().expect("lock").len(), 1);
            assert_eq!(log.entries(), vec![Notification::move_failed()]);
        }
    }

    #[test]
    fn settle_after_disposal_is_a_no_op() {
        let (store, _updater, log, controller) = setup(vec![]);
        let MoveStart::Pending(pending) = controller.begin(&IssueId::new("1"), Status::Done) else {
            panic!("expected pending move");
        };
        drop(store);

        let outcome = controller.settle(
            pending,
            Ok(UpdateOutcome::Failure {
                message: "denied".into(),
            }),
        );
        assert_eq!(outcome, MoveOutcome::Abandoned);
        assert!(log.entries().is_empty());
        assert_eq!(
            controller.begin(&IssueId::new("1"), Status::Done),
            MoveStart::Skipped(MoveOutcome::Abandoned)
        );
    }

    #[tokio::test]
    async fn success_notifications_can_be_disabled() {
        let (_store, _updater, log, controller) = setup(vec![]);
        let config = BoardConfig {
            success_notifications: false,
            ..BoardConfig::default()
        };
        let controller = controller.configured(&config);

        let outcome = controller.move_issue(&IssueId::new("1"), Status::Done).await;
        assert_eq!(outcome, MoveOutcome::Confirmed);
        assert!(log.entries().is_empty());
    }

    #[test]
    fn update_outcome_wire_shape() {
        let failure: UpdateOutcome =
            serde_json::from_value(json!({"outcome": "failure", "message": "nope"}))
                .expect("outcome");
        assert_eq!(
            failure,
            UpdateOutcome::Failure {
                message: "nope".into()
            }
        );
        assert_eq!(
            serde_json::to_value(UpdateOutcome::Success).expect("serialize"),
            json!({"outcome": "success"})
        );
    }
}
