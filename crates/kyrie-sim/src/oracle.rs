use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use kyrie_core::controller::NotificationLevel;
use kyrie_core::listener::ChangeListener;
use kyrie_core::model::{BoardLanes, Issue, IssueId};
use kyrie_core::store::{SharedStore, StoreHandle};

use crate::client::{ClientId, ClientState};

// ── Core result types ─────────────────────────────────────────────────────────

/// Outcome of one or more invariant checks.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OracleResult {
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
    /// Issues left out of the convergence check because a captured rollback
    /// overwrote a newer remote value. Not a failure; reported for triage.
    pub clobbered: Vec<(ClientId, IssueId)>,
}

impl OracleResult {
    fn pass() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
            clobbered: Vec::new(),
        }
    }

    #[must_use]
    fn merge(mut self, other: Self) -> Self {
        self.passed &= other.passed;
        self.violations.extend(other.violations);
        self.clobbered.extend(other.clobbered);
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    /// The same id appears twice on one board.
    DuplicateId { client: ClientId, id: IssueId },

    /// A card sits in a lane other than its status, or lanes lost a card.
    LaneMismatch {
        client: ClientId,
        id: Option<IssueId>,
        detail: String,
    },

    /// A card known with an assignee at mount lost it, or shows someone else.
    AssigneeLost {
        client: ClientId,
        id: IssueId,
        expected: Option<String>,
        found: Option<String>,
    },

    /// After quiescence a client disagrees with the server.
    Divergence {
        client: ClientId,
        id: IssueId,
        detail: String,
    },

    /// Re-applying the last delivered change mutated the store.
    Idempotence { client: ClientId, id: Option<IssueId> },

    /// Notifications do not match the settled moves.
    Notifications {
        client: ClientId,
        expected_failures: u64,
        failures: u64,
        expected_successes: u64,
        successes: u64,
    },
}

// ── Oracle ────────────────────────────────────────────────────────────────────

/// Checks board invariants after a simulation run has quiesced.
///
/// 1. **Unique ids** (`check_unique_ids`).
/// 2. **Lane consistency** (`check_lanes`): a card's lane is its status.
/// 3. **Assignee preservation** (`check_assignees`).
/// 4. **Convergence** (`check_convergence`): every client equals the server,
///    except clobbered issues, which are reported separately.
/// 5. **Idempotence** (`check_idempotence`): re-applying the last delivered
///    change is a no-op.
/// 6. **Notification accounting** (`check_notifications`).
pub struct BoardOracle;

impl BoardOracle {
    #[must_use]
    pub fn check_unique_ids(clients: &[ClientState]) -> OracleResult {
        let mut violations = Vec::new();
        for client in clients {
            let mut seen = BTreeSet::new();
            for issue in &client.issues {
                if !seen.insert(issue.id()) {
                    violations.push(InvariantViolation::DuplicateId {
                        client: client.id,
                        id: issue.id().clone(),
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_lanes(clients: &[ClientState]) -> OracleResult {
        let mut violations = Vec::new();
        for client in clients {
            let lanes = BoardLanes::from_issues(&client.issues);
            if lanes.total() != client.issues.len() {
                violations.push(InvariantViolation::LaneMismatch {
                    client: client.id,
                    id: None,
                    detail: format!(
                        "lanes hold {} cards, board holds {}",
                        lanes.total(),
                        client.issues.len()
                    ),
                });
            }
            for lane in &lanes.lanes {
                for issue in lane.issues.iter().filter(|i| i.status() != lane.status) {
                    violations.push(InvariantViolation::LaneMismatch {
                        client: client.id,
                        id: Some(issue.id().clone()),
                        detail: format!("status {} shown in lane {}", issue.status(), lane.status),
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_assignees(server: &[Issue], clients: &[ClientState]) -> OracleResult {
        let truth: BTreeMap<&IssueId, &Issue> = server.iter().map(|i| (i.id(), i)).collect();
        let mut violations = Vec::new();

        for client in clients {
            for issue in &client.issues {
                let expected = truth
                    .get(issue.id())
                    .and_then(|i| i.assignee.as_ref())
                    .map(|a| a.email.clone());
                let found = issue.assignee.as_ref().map(|a| a.email.clone());

                let known_at_mount = client.mounted_assignees.contains_key(issue.id());
                let wrong_person = found.is_some() && found != expected;
                let lost = known_at_mount && found.is_none();
                if wrong_person || lost {
                    violations.push(InvariantViolation::AssigneeLost {
                        client: client.id,
                        id: issue.id().clone(),
                        expected,
                        found,
                    });
                }
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Compare every client's rows with the server's. Assignees are checked
    /// separately because change payloads never carry them.
    #[must_use]
    pub fn check_convergence(server: &[Issue], clients: &[ClientState]) -> OracleResult {
        let truth: BTreeMap<&IssueId, &Issue> = server.iter().map(|i| (i.id(), i)).collect();
        let mut result = OracleResult::pass();

        for client in clients {
            let local: BTreeMap<&IssueId, &Issue> =
                client.issues.iter().map(|i| (i.id(), i)).collect();
            let mut violations = Vec::new();

            for (id, theirs) in &truth {
                match local.get(id) {
                    None => violations.push(InvariantViolation::Divergence {
                        client: client.id,
                        id: (*id).clone(),
                        detail: "missing on client".to_string(),
                    }),
                    Some(mine) if mine.row != theirs.row => {
                        if client.clobbered.contains(*id) {
                            result.clobbered.push((client.id, (*id).clone()));
                        } else {
                            violations.push(InvariantViolation::Divergence {
                                client: client.id,
                                id: (*id).clone(),
                                detail: describe_row_diff(mine, theirs),
                            });
                        }
                    }
                    Some(_) => {}
                }
            }
            for id in local.keys().filter(|id| !truth.contains_key(*id)) {
                violations.push(InvariantViolation::Divergence {
                    client: client.id,
                    id: (*id).clone(),
                    detail: "deleted on server, still on client".to_string(),
                });
            }

            result = result.merge(OracleResult::from_violations(violations));
        }
        result
    }

    #[must_use]
    pub fn check_idempotence(clients: &[ClientState]) -> OracleResult {
        let mut violations = Vec::new();
        for client in clients {
            let Some(last) = &client.last_delivery else {
                continue;
            };
            let store: SharedStore = Arc::new(Mutex::new(last.store_after.clone()));
            let mut listener = ChangeListener::new(client.project_id.clone(), StoreHandle::new(&store));
            listener.apply_raw(&last.change);

            let after = store
                .lock()
                .map(|guard| guard.snapshot())
                .unwrap_or_default();
            if after != last.store_after.snapshot() {
                violations.push(InvariantViolation::Idempotence {
                    client: client.id,
                    id: last
                        .change
                        .new
                        .get("id")
                        .or_else(|| last.change.old.get("id"))
                        .and_then(|v| v.as_str())
                        .map(IssueId::new),
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    /// Every failed move produced exactly one error notification; confirmed
    /// moves produced success notifications when enabled.
    #[must_use]
    pub fn check_notifications(clients: &[ClientState], success_enabled: bool) -> OracleResult {
        let mut violations = Vec::new();
        for client in clients {
            let failures = count_level(client, NotificationLevel::Error);
            let successes = count_level(client, NotificationLevel::Success);
            let expected_failures =
                client.moves.rolled_back + client.moves.superseded + client.moves.removed;
            let expected_successes = if success_enabled { client.moves.confirmed } else { 0 };
            if failures != expected_failures || successes != expected_successes {
                violations.push(InvariantViolation::Notifications {
                    client: client.id,
                    expected_failures,
                    failures,
                    expected_successes,
                    successes,
                });
            }
        }
        OracleResult::from_violations(violations)
    }

    #[must_use]
    pub fn check_all(server: &[Issue], clients: &[ClientState], success_notifications: bool) -> OracleResult {
        Self::check_unique_ids(clients)
            .merge(Self::check_lanes(clients))
            .merge(Self::check_assignees(server, clients))
            .merge(Self::check_convergence(server, clients))
            .merge(Self::check_idempotence(clients))
            .merge(Self::check_notifications(clients, success_notifications))
    }
}

fn count_level(client: &ClientState, level: NotificationLevel) -> u64 {
    let count = client.notifications.iter().filter(|n| n.level == level).count();
    u64::try_from(count).unwrap_or(u64::MAX)
}

fn describe_row_diff(mine: &Issue, theirs: &Issue) -> String {
    if mine.status() == theirs.status() {
        format!(
            "row fields differ (updated_at {} vs server {})",
            mine.row.updated_at, theirs.row.updated_at
        )
    } else {
        format!("status {} vs server {}", mine.status(), theirs.status())
    }
}
