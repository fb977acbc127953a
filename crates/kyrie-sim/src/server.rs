//! Authoritative issue table the simulated clients sync against.
//!
//! Every accepted write produces the row-level change payload storage would
//! push to subscribers. Payloads never carry the joined assignee; only
//! snapshots do.

use chrono::{DateTime, Utc};
use kyrie_core::controller::{StatusUpdateRequest, UpdateOutcome};
use kyrie_core::event::RawChange;
use kyrie_core::model::{Assignee, Issue, IssueId, IssueRow, ProjectId, Status, next_sequence_id};

use crate::rng::SimRng;

/// Base wall time of a simulation; each round advances it by one second.
const EPOCH_SECS: i64 = 1_735_689_600;

const PEOPLE: [(&str, &str); 3] = [
    ("Ana Lima", "ana@example.com"),
    ("Bo Chen", "bo@example.com"),
    ("Cy Okafor", "cy@example.com"),
];

#[derive(Debug, Clone)]
pub struct SimServer {
    project_id: ProjectId,
    issues: Vec<Issue>,
    next_id: u64,
    reject_rate_percent: u8,
}

impl SimServer {
    /// A project seeded with `initial` issues, roughly half of them assigned.
    #[must_use]
    pub fn new(project_id: ProjectId, initial: usize, reject_rate_percent: u8, rng: &mut SimRng) -> Self {
        let mut server = Self {
            project_id,
            issues: Vec::with_capacity(initial),
            next_id: 0,
            reject_rate_percent,
        };
        for _ in 0..initial {
            let issue = server.fresh_issue(0, rng);
            server.issues.push(issue);
        }
        server
    }

    #[must_use]
    pub const fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    /// What a snapshot read returns: every row with its assignee joined.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Issue> {
        self.issues.clone()
    }

    #[must_use]
    pub fn get(&self, id: &IssueId) -> Option<&Issue> {
        self.issues.iter().find(|issue| issue.id() == id)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<IssueId> {
        self.issues.iter().map(|issue| issue.id().clone()).collect()
    }

    /// Create an issue as another user would.
    pub fn create(&mut self, round: u64, rng: &mut SimRng) -> RawChange {
        let issue = self.fresh_issue(round, rng);
        let change = RawChange::insert(&issue.row);
        tracing::trace!(id = %issue.id(), round, "server created issue");
        self.issues.push(issue);
        change
    }

    /// Delete a random issue.
    pub fn delete_random(&mut self, rng: &mut SimRng) -> Option<RawChange> {
        let index = rng.index(self.issues.len())?;
        let removed = self.issues.remove(index);
        tracing::trace!(id = %removed.id(), "server deleted issue");
        Some(RawChange::delete(removed.id()))
    }

    /// Move a random issue to a random other status, bypassing any client.
    pub fn edit_random(&mut self, round: u64, rng: &mut SimRng) -> Option<RawChange> {
        let index = rng.index(self.issues.len())?;
        let current = self.issues[index].status();
        let to = other_status(current, rng);
        let row = &mut self.issues[index].row;
        row.status = to;
        row.updated_at = wall_time(round);
        Some(RawChange::update(row))
    }

    /// Handle a client's status call. Returns the answer and, when the write
    /// was accepted, the change to broadcast.
    pub fn update_status(
        &mut self,
        request: &StatusUpdateRequest,
        round: u64,
        rng: &mut SimRng,
    ) -> (UpdateOutcome, Option<RawChange>) {
        let Some(issue) = self.issues.iter_mut().find(|issue| issue.id() == &request.issue_id) else {
            return (
                UpdateOutcome::Failure {
                    message: "Issue not found".to_string(),
                },
                None,
            );
        };
        if rng.chance(self.reject_rate_percent) {
            return (
                UpdateOutcome::Failure {
                    message: "You do not have permission to edit this issue".to_string(),
                },
                None,
            );
        }

        issue.row.status = request.new_status;
        issue.row.updated_at = wall_time(round);
        (UpdateOutcome::Success, Some(RawChange::update(&issue.row)))
    }

    fn fresh_issue(&mut self, round: u64, rng: &mut SimRng) -> Issue {
        let n = self.next_id;
        self.next_id += 1;
        let now = wall_time(round);
        let row = IssueRow {
            id: IssueId::new(format!("iss-{n:04}")),
            project_id: self.project_id.clone(),
            workspace_id: "ws-sim".to_string(),
            sequence_id: next_sequence_id(&self.issues),
            status: *rng.pick(&Status::ALL).unwrap_or(&Status::Backlog),
            title: format!("Simulated issue {n}"),
            description: None,
            priority: None,
            assignee_id: None,
            cycle_id: None,
            module_id: None,
            due_date: None,
            created_at: now,
            updated_at: now,
        };
        let assignee = if rng.chance(50) {
            rng.pick(&PEOPLE).map(|(name, email)| Assignee {
                full_name: Some((*name).to_string()),
                email: (*email).to_string(),
            })
        } else {
            None
        };
        let mut issue = Issue::from_row(row);
        if let Some(assignee) = assignee {
            issue.row.assignee_id = Some(assignee.email.clone());
            issue.assignee = Some(assignee);
        }
        issue
    }
}

/// A status different from `current`.
pub fn other_status(current: Status, rng: &mut SimRng) -> Status {
    let others: Vec<Status> = Status::ALL.into_iter().filter(|s| *s != current).collect();
    rng.pick(&others).copied().unwrap_or(current)
}

fn wall_time(round: u64) -> DateTime<Utc> {
    let offset = i64::try_from(round).unwrap_or(i64::MAX);
    DateTime::from_timestamp(EPOCH_SECS.saturating_add(offset), 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kyrie_core::controller::UpdateScope;
    use kyrie_core::event::ChangeEvent;

    fn server(reject: u8) -> (SimServer, SimRng) {
        let mut rng = SimRng::new(3);
        (SimServer::new(ProjectId::new("sim"), 6, reject, &mut rng), rng)
    }

    #[test]
    fn seeded_issues_have_unique_ids_and_sequences() {
        let (server, _) = server(0);
        let snapshot = server.snapshot();
        assert_eq!(snapshot.len(), 6);
        let seqs: Vec<u64> = snapshot.iter().map(|i| i.row.sequence_id).collect();
        assert_eq!(seqs, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn create_emits_insert_without_assignee() {
        let (mut server, mut rng) = server(0);
        let change = server.create(4, &mut rng);
        let ChangeEvent::Insert(fields) = ChangeEvent::try_from(&change).expect("insert") else {
            panic!("expected insert");
        };
        assert_eq!(fields.sequence_id, Some(7));
        assert_eq!(fields.assignee, None);
        assert!(server.get(&fields.id).is_some());
    }

    #[test]
    fn accepted_update_broadcasts_new_row() {
        let (mut server, mut rng) = server(0);
        let id = server.ids()[0].clone();
        let to = other_status(server.get(&id).expect("issue").status(), &mut rng);
        let request = StatusUpdateRequest {
            issue_id: id.clone(),
            new_status: to,
            scope: UpdateScope::default(),
        };
        let (outcome, change) = server.update_status(&request, 9, &mut rng);
        assert_eq!(outcome, UpdateOutcome::Success);
        assert_eq!(server.get(&id).map(Issue::status), Some(to));
        let event = ChangeEvent::try_from(&change.expect("broadcast")).expect("update");
        assert_eq!(event.issue_id(), &id);
    }

    #[test]
    fn rejection_and_missing_issue_leave_table_alone() {
        let (mut server, mut rng) = server(100);
        let before = server.snapshot();
        let request = StatusUpdateRequest {
            issue_id: server.ids()[0].clone(),
            new_status: Status::Canceled,
            scope: UpdateScope::default(),
        };
        let (outcome, change) = server.update_status(&request, 1, &mut rng);
        assert!(matches!(outcome, UpdateOutcome::Failure { .. }));
        assert!(change.is_none());

        let missing = StatusUpdateRequest {
            issue_id: IssueId::new("nope"),
            ..request
        };
        let (outcome, _) = server.update_status(&missing, 1, &mut rng);
        assert_eq!(
            outcome,
            UpdateOutcome::Failure {
                message: "Issue not found".into()
            }
        );
        assert_eq!(server.snapshot(), before);
    }
}
