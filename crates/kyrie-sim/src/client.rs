//! A simulated board viewer.
//!
//! Each client runs the real engine: a [`BoardSession`] mounted from a server
//! snapshot, a [`ChangeListener`] fed through its own subscription on a
//! [`MemoryFeed`], and a [`MoveController`] driven through `begin`/`settle` so
//! the network decides when status calls come back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kyrie_core::config::BoardConfig;
use kyrie_core::controller::{
    MoveController, MoveOutcome, MoveStart, Notification, NotificationLog, PendingMove,
    StatusUpdateRequest, StatusUpdater, TransportError, UpdateOutcome, UpdateScope,
};
use kyrie_core::event::{ChangeEvent, RawChange};
use kyrie_core::feed::{MemoryFeed, Subscription};
use kyrie_core::listener::{Applied, ChangeListener, ListenerStats};
use kyrie_core::model::{Assignee, Issue, IssueId, ProjectId};
use kyrie_core::store::IssueStore;
use kyrie_core::BoardSession;
use serde::Serialize;

use crate::rng::SimRng;
use crate::server::other_status;

pub type ClientId = usize;

/// Status calls go through the simulated network, never through the controller.
struct NetworkOnly;

#[async_trait]
impl StatusUpdater for NetworkOnly {
    async fn update_status(
        &self,
        _request: &StatusUpdateRequest,
    ) -> Result<UpdateOutcome, TransportError> {
        Err(TransportError::Request(
            "simulated status calls are routed by the network".to_string(),
        ))
    }
}

/// Per-client move accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MoveStats {
    pub started: u64,
    pub confirmed: u64,
    pub rolled_back: u64,
    pub superseded: u64,
    pub removed: u64,
    pub abandoned: u64,
}

/// The change last applied and the store right after it.
#[derive(Debug, Clone, PartialEq)]
pub struct LastDelivery {
    pub change: RawChange,
    pub store_after: IssueStore,
}

/// Immutable snapshot of a client at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientState {
    pub id: ClientId,
    pub project_id: ProjectId,
    pub issues: Vec<Issue>,
    /// Issues whose failed-move rollback overwrote a newer remote value and
    /// have not seen a remote change since.
    pub clobbered: BTreeSet<IssueId>,
    /// Assignees known from the mount snapshot.
    pub mounted_assignees: BTreeMap<IssueId, Assignee>,
    pub last_delivery: Option<LastDelivery>,
    pub notifications: Vec<Notification>,
    pub moves: MoveStats,
    pub listener: ListenerStats,
}

pub struct SimClient {
    id: ClientId,
    board: BoardSession,
    listener: ChangeListener,
    feed: MemoryFeed,
    subscription: Subscription,
    controller: MoveController,
    notifications: NotificationLog,
    /// Remote revision of each issue with an outstanding move, taken at begin.
    in_flight: BTreeMap<IssueId, Option<u64>>,
    clobbered: BTreeSet<IssueId>,
    mounted_assignees: BTreeMap<IssueId, Assignee>,
    last_delivery: Option<LastDelivery>,
    moves: MoveStats,
}

impl SimClient {
    /// Mount a board from `snapshot` and subscribe it to a private feed.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be opened.
    pub fn mount(
        id: ClientId,
        project_id: ProjectId,
        snapshot: Vec<Issue>,
        config: BoardConfig,
        runtime: &tokio::runtime::Runtime,
    ) -> Result<Self> {
        let mounted_assignees = snapshot
            .iter()
            .filter_map(|issue| {
                issue
                    .assignee
                    .clone()
                    .map(|assignee| (issue.id().clone(), assignee))
            })
            .collect();

        let board = BoardSession::mount(project_id, snapshot, config);
        let feed = MemoryFeed::new();
        let subscription = runtime
            .block_on(board.subscribe(&feed))
            .with_context(|| format!("client {id} could not subscribe"))?;
        let notifications = NotificationLog::new();
        let controller = board.controller(
            Arc::new(NetworkOnly),
            Arc::new(notifications.clone()),
            UpdateScope {
                workspace_slug: "sim".to_string(),
                project_identifier: board.config().project_identifier.clone(),
            },
        );
        let listener = board.listener();

        Ok(Self {
            id,
            board,
            listener,
            feed,
            subscription,
            controller,
            notifications,
            in_flight: BTreeMap::new(),
            clobbered: BTreeSet::new(),
            mounted_assignees,
            last_delivery: None,
            moves: MoveStats::default(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub fn has_pending_moves(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Drag a random card to a random other lane.
    ///
    /// Cards with a move already in flight are left alone: two overlapping
    /// rejected moves on one card settle to whichever captured value lands last.
    pub fn begin_random_move(&mut self, rng: &mut SimRng) -> Option<(PendingMove, StatusUpdateRequest)> {
        let candidates: Vec<Issue> = self
            .board
            .issues()
            .into_iter()
            .filter(|issue| !self.in_flight.contains_key(issue.id()))
            .collect();
        let issue = rng.pick(&candidates)?;
        let to = other_status(issue.status(), rng);
        let id = issue.id().clone();

        let revision = self.revision(&id);
        match self.controller.begin(&id, to) {
            MoveStart::Pending(pending) => {
                self.moves.started += 1;
                self.in_flight.insert(id, revision);
                let request = self.controller.request(&pending);
                Some((pending, request))
            }
            MoveStart::Skipped(_) => None,
        }
    }

    /// Apply the answer to a move this client started.
    pub fn settle(
        &mut self,
        pending: PendingMove,
        result: Result<UpdateOutcome, TransportError>,
    ) -> MoveOutcome {
        let id = pending.issue_id.clone();
        let at_begin = self.in_flight.remove(&id).flatten();
        let raced = self.revision(&id) != at_begin;

        let outcome = self.controller.settle(pending, result);
        match &outcome {
            MoveOutcome::Confirmed => self.moves.confirmed += 1,
            MoveOutcome::RolledBack(_) => {
                self.moves.rolled_back += 1;
                if raced {
                    tracing::debug!(client = self.id, %id, "rollback overwrote a remote update");
                    self.clobbered.insert(id);
                }
            }
            MoveOutcome::Superseded(_) => self.moves.superseded += 1,
            MoveOutcome::Removed(_) => self.moves.removed += 1,
            MoveOutcome::Abandoned => self.moves.abandoned += 1,
            MoveOutcome::Unchanged | MoveOutcome::NotOnBoard => {}
        }
        outcome
    }

    /// Hand `changes` to the transport and let the listener drain them.
    pub fn deliver(&mut self, changes: Vec<RawChange>) -> usize {
        for change in changes {
            self.feed.publish(change);
        }
        self.drain()
    }

    /// Redeliver the last `count` changes, as a reconnecting transport does.
    pub fn replay(&mut self, count: usize) -> usize {
        self.feed.replay_recent(count);
        self.drain()
    }

    fn drain(&mut self) -> usize {
        let mut taken = 0;
        while let Some(change) = self.subscription.try_recv() {
            taken += 1;
            let applied = self.listener.apply_raw(&change);
            if matches!(applied, Applied::Inserted | Applied::Updated | Applied::Deleted) {
                if let Ok(event) = ChangeEvent::try_from(&change) {
                    self.clobbered.remove(event.issue_id());
                }
            }
            if let Some(store_after) = self.board.handle().with(|store| store.clone()) {
                self.last_delivery = Some(LastDelivery { change, store_after });
            }
        }
        taken
    }

    fn revision(&self, id: &IssueId) -> Option<u64> {
        self.board.handle().with(|store| store.remote_revision(id)).flatten()
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        ClientState {
            id: self.id,
            project_id: self.board.project_id().clone(),
            issues: self.board.issues(),
            clobbered: self.clobbered.clone(),
            mounted_assignees: self.mounted_assignees.clone(),
            last_delivery: self.last_delivery.clone(),
            notifications: self.notifications.entries(),
            moves: self.moves,
            listener: self.listener.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::SimServer;
    use kyrie_core::controller::RollbackPolicy;
    use kyrie_core::model::Status;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
    }

    fn client(policy: RollbackPolicy) -> (SimServer, SimClient, SimRng) {
        let mut rng = SimRng::new(5);
        let server = SimServer::new(ProjectId::new("sim"), 4, 0, &mut rng);
        let config = BoardConfig {
            rollback_policy: policy,
            ..BoardConfig::default()
        };
        let client = SimClient::mount(0, ProjectId::new("sim"), server.snapshot(), config, &runtime())
            .expect("mount");
        (server, client, rng)
    }

    #[test]
    fn accepted_move_converges_after_echo() {
        let (mut server, mut client, mut rng) = client(RollbackPolicy::Captured);
        let (pending, request) = client.begin_random_move(&mut rng).expect("move");
        let (outcome, echo) = server.update_status(&request, 1, &mut rng);

        assert_eq!(client.settle(pending, Ok(outcome)), MoveOutcome::Confirmed);
        client.deliver(echo.into_iter().collect());

        let mut mine = client.state().issues;
        let mut theirs = server.snapshot();
        mine.sort_by(|a, b| a.id().cmp(b.id()));
        theirs.sort_by(|a, b| a.id().cmp(b.id()));
        assert_eq!(mine, theirs);
    }

    #[test]
    fn captured_rollback_over_remote_update_is_flagged_then_healed() {
        let (server, mut client, mut rng) = client(RollbackPolicy::Captured);
        let (pending, _request) = client.begin_random_move(&mut rng).expect("move");
        let id = pending.issue_id.clone();

        let mut row = server.get(&id).expect("issue").row.clone();
        row.status = if pending.from == Status::Canceled { Status::Todo } else { Status::Canceled };
        client.deliver(vec![RawChange::update(&row)]);

        let outcome = client.settle(
            pending,
            Ok(UpdateOutcome::Failure {
                message: "denied".into(),
            }),
        );
        assert!(matches!(outcome, MoveOutcome::RolledBack(_)));
        assert!(client.state().clobbered.contains(&id));

        client.deliver(vec![RawChange::update(&row)]);
        assert!(client.state().clobbered.is_empty());
    }

    #[test]
    fn replay_redelivers_through_the_subscription() {
        let (mut server, mut client, mut rng) = client(RollbackPolicy::Captured);
        let change = server.create(2, &mut rng);
        assert_eq!(client.deliver(vec![change]), 1);
        assert_eq!(client.replay(5), 1);

        let state = client.state();
        assert_eq!(state.listener.inserted, 1);
        assert_eq!(state.listener.updated, 1);
        assert_eq!(state.issues.len(), 5);
        assert!(state.last_delivery.is_some());
    }

    #[test]
    fn busy_cards_are_not_moved_twice() {
        let (_server, mut client, mut rng) = client(RollbackPolicy::Guarded);
        let mut moved = BTreeSet::new();
        while let Some((pending, _)) = client.begin_random_move(&mut rng) {
            assert!(moved.insert(pending.issue_id), "card moved while in flight");
        }
        assert_eq!(moved.len(), 4);
        assert!(client.has_pending_moves());
    }
}
