//! Grouping of board issues into status lanes.
//!
//! A card's lane is a pure function of its `status`; within a lane cards
//! keep the store's iteration order (newest inserts first).

use serde::Serialize;

use super::issue::{Issue, Status};

/// One board column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lane {
    pub status: Status,
    pub title: &'static str,
    pub issues: Vec<Issue>,
}

impl Lane {
    #[must_use]
    pub fn len(&self) -> usize {
        self.issues.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

/// All five lanes in fixed column order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardLanes {
    pub lanes: Vec<Lane>,
}

impl BoardLanes {
    #[must_use]
    pub fn from_issues<'a>(issues: impl IntoIterator<Item = &'a Issue>) -> Self {
        let mut lanes: Vec<Lane> = Status::ALL
            .iter()
            .map(|&status| Lane {
                status,
                title: status.title(),
                issues: Vec::new(),
            })
            .collect();

        for issue in issues {
            if let Some(lane) = lanes.iter_mut().find(|lane| lane.status == issue.status()) {
                lane.issues.push(issue.clone());
            }
        }

        Self { lanes }
    }

    #[must_use]
    pub fn lane(&self, status: Status) -> Option<&Lane> {
        self.lanes.iter().find(|lane| lane.status == status)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.lanes.iter().map(Lane::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::issue::IssueRow;
    use serde_json::json;

    fn issue(id: &str, status: &str) -> Issue {
        let row: IssueRow = serde_json::from_value(json!({
            "id": id,
            "project_id": "p",
            "workspace_id": "w",
            "sequence_id": 1,
            "status": status,
            "title": id,
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        }))
        .expect("row");
        Issue::from_row(row)
    }

    #[test]
    fn lanes_follow_fixed_column_order() {
        let lanes = BoardLanes::from_issues(std::iter::empty());
        let order: Vec<_> = lanes.lanes.iter().map(|lane| lane.title).collect();
        assert_eq!(order, ["Backlog", "Todo", "In Progress", "Done", "Canceled"]);
        assert_eq!(lanes.total(), 0);
    }

    #[test]
    fn cards_land_in_their_status_lane_in_store_order() {
        let issues = [
            issue("a", "done"),
            issue("b", "todo"),
            issue("c", "done"),
            issue("d", "in-progress"),
        ];
        let lanes = BoardLanes::from_issues(&issues);

        let done: Vec<_> = lanes
            .lane(Status::Done)
            .expect("done lane")
            .issues
            .iter()
            .map(|i| i.id().as_str())
            .collect();
        assert_eq!(done, ["a", "c"]);
        assert_eq!(lanes.lane(Status::Todo).map(Lane::len), Some(1));
        assert_eq!(lanes.lane(Status::InProgress).map(Lane::len), Some(1));
        assert!(lanes.lane(Status::Canceled).is_some_and(Lane::is_empty));
        assert_eq!(lanes.total(), 4);
    }
}
