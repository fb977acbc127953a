//! Change-stream payloads and their narrowing into typed events.
//!
//! Row-level change notifications arrive untyped: a kind tag plus `new` and
//! `old` JSON records. [`ChangeEvent::try_from`] validates one at the
//! boundary; nothing past this module handles raw JSON.
//!
//! # Wire shape
//!
//! ```json
//! {"schema": "public", "table": "issues", "eventType": "UPDATE",
//!  "new": {"id": "…", "project_id": "…", "status": "done", …},
//!  "old": {"id": "…"}}
//! ```
//!
//! INSERT must carry a complete row in `new`. UPDATE needs only `new.id`;
//! the other columns it carries overwrite the stored ones and the rest stand.
//! DELETE only needs `old.id`; storage usually sends nothing else for deleted
//! rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

use crate::error::ErrorCode;
use crate::model::{IssueFields, IssueId, IssueRow, ProjectId};

/// Table whose changes the board consumes.
pub const ISSUES_TABLE: &str = "issues";

/// A change notification exactly as the transport delivers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub new: Value,
    #[serde(default)]
    pub old: Value,
}

impl RawChange {
    /// Build an INSERT notification for `row`.
    #[must_use]
    pub fn insert(row: &IssueRow) -> Self {
        Self::with_records(ChangeKind::Insert, record_of(row), Value::Object(serde_json::Map::new()))
    }

    /// Build an UPDATE notification for `row`.
    #[must_use]
    pub fn update(row: &IssueRow) -> Self {
        let old = serde_json::json!({ "id": row.id });
        Self::with_records(ChangeKind::Update, record_of(row), old)
    }

    /// Build a DELETE notification carrying only the previous id.
    #[must_use]
    pub fn delete(id: &IssueId) -> Self {
        let old = serde_json::json!({ "id": id });
        Self::with_records(ChangeKind::Delete, Value::Object(serde_json::Map::new()), old)
    }

    /// Project the change belongs to, if the payload names one.
    #[must_use]
    pub fn project_hint(&self) -> Option<&str> {
        self.new
            .get("project_id")
            .or_else(|| self.old.get("project_id"))
            .and_then(Value::as_str)
    }

    fn with_records(kind: ChangeKind, new: Value, old: Value) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            schema: Some("public".to_string()),
            table: Some(ISSUES_TABLE.to_string()),
            new,
            old,
        }
    }
}

fn record_of(row: &IssueRow) -> Value {
    serde_json::to_value(row).unwrap_or(Value::Null)
}

/// The three row-level change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            _ => Err(PayloadError::UnknownKind(s.to_string())),
        }
    }
}

/// A validated change to one issue.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A new row; every required column is present.
    Insert(IssueFields),
    /// The columns of an existing row that changed.
    Update(IssueFields),
    Delete {
        id: IssueId,
        project_id: Option<ProjectId>,
    },
}

impl ChangeEvent {
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }

    #[must_use]
    pub const fn issue_id(&self) -> &IssueId {
        match self {
            Self::Insert(fields) | Self::Update(fields) => &fields.id,
            Self::Delete { id, .. } => id,
        }
    }

    /// Owning project, when the payload carried one.
    #[must_use]
    pub const fn project_id(&self) -> Option<&ProjectId> {
        match self {
            Self::Insert(fields) | Self::Update(fields) => fields.project_id.as_ref(),
            Self::Delete { project_id, .. } => project_id.as_ref(),
        }
    }
}

impl TryFrom<&RawChange> for ChangeEvent {
    type Error = PayloadError;

    fn try_from(raw: &RawChange) -> Result<Self, Self::Error> {
        if let Some(table) = raw.table.as_deref() {
            if table != ISSUES_TABLE {
                return Err(PayloadError::WrongTable(table.to_string()));
            }
        }

        let kind: ChangeKind = raw.event_type.parse()?;
        match kind {
            ChangeKind::Insert => {
                let fields = parse_fields(kind, &raw.new)?;
                if let Some(column) = fields.missing_column() {
                    return Err(PayloadError::IncompleteRow { kind, column });
                }
                Ok(Self::Insert(fields))
            }
            ChangeKind::Update => parse_fields(kind, &raw.new).map(Self::Update),
            ChangeKind::Delete => {
                let old = raw
                    .old
                    .as_object()
                    .ok_or(PayloadError::MissingRecord { kind })?;
                let id = old
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .ok_or(PayloadError::MissingId { kind })?;
                let project_id = old
                    .get("project_id")
                    .and_then(Value::as_str)
                    .map(ProjectId::new);
                Ok(Self::Delete {
                    id: IssueId::new(id),
                    project_id,
                })
            }
        }
    }
}

impl TryFrom<RawChange> for ChangeEvent {
    type Error = PayloadError;

    fn try_from(raw: RawChange) -> Result<Self, Self::Error> {
        Self::try_from(&raw)
    }
}

fn parse_fields(kind: ChangeKind, record: &Value) -> Result<IssueFields, PayloadError> {
    let object = record
        .as_object()
        .filter(|object| !object.is_empty())
        .ok_or(PayloadError::MissingRecord { kind })?;
    if object
        .get("id")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty)
    {
        return Err(PayloadError::MissingId { kind });
    }
    IssueFields::deserialize(record).map_err(|source| PayloadError::InvalidRow { kind, source })
}

/// Reasons a raw change cannot enter the board.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown change kind '{0}'")]
    UnknownKind(String),
    #[error("change for table '{0}' is not an issue change")]
    WrongTable(String),
    #[error("{kind} payload has no record")]
    MissingRecord { kind: ChangeKind },
    #[error("{kind} payload has no issue id")]
    MissingId { kind: ChangeKind },
    #[error("{kind} payload lacks required column '{column}'")]
    IncompleteRow {
        kind: ChangeKind,
        column: &'static str,
    },
    #[error("{kind} payload is not a valid issue row: {source}")]
    InvalidRow {
        kind: ChangeKind,
        #[source]
        source: serde_json::Error,
    },
}

impl PayloadError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::MalformedPayload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;
    use serde_json::json;

    fn row_value(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "project_id": "proj-1",
            "workspace_id": "ws-1",
            "sequence_id": 3,
            "status": status,
            "title": "Wire up billing",
            "priority": "none",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00Z"
        })
    }

    fn raw(event_type: &str, new: Value, old: Value) -> RawChange {
        serde_json::from_value(json!({
            "schema": "public",
            "table": "issues",
            "eventType": event_type,
            "new": new,
            "old": old,
        }))
        .expect("raw change")
    }

    #[test]
    fn insert_narrows_to_row() {
        let event = ChangeEvent::try_from(raw("INSERT", row_value("a", "todo"), json!({})))
            .expect("insert");
        let ChangeEvent::Insert(fields) = event else {
            panic!("expected insert");
        };
        assert_eq!(fields.id.as_str(), "a");
        assert_eq!(fields.status, Some(Status::Todo));
        assert_eq!(fields.assignee, None);
    }

    #[test]
    fn update_narrows_to_row() {
        let event = ChangeEvent::try_from(raw(
            "update",
            row_value("a", "done"),
            json!({"id": "a"}),
        ))
        .expect("update");
        assert_eq!(event.kind(), ChangeKind::Update);
        assert_eq!(event.issue_id().as_str(), "a");
        assert_eq!(event.project_id().map(ProjectId::as_str), Some("proj-1"));
    }

    #[test]
    fn delete_reads_id_from_old_record() {
        let event =
            ChangeEvent::try_from(raw("DELETE", json!({}), json!({"id": "a"}))).expect("delete");
        assert_eq!(
            event,
            ChangeEvent::Delete {
                id: IssueId::new("a"),
                project_id: None
            }
        );
    }

    #[test]
    fn delete_without_id_is_malformed() {
        let err = ChangeEvent::try_from(raw("DELETE", json!({}), json!({}))).expect_err("no id");
        assert!(matches!(err, PayloadError::MissingId { kind: ChangeKind::Delete }));
        assert_eq!(err.code(), ErrorCode::MalformedPayload);

        let err =
            ChangeEvent::try_from(raw("DELETE", json!({}), Value::Null)).expect_err("no record");
        assert!(matches!(err, PayloadError::MissingRecord { .. }));
    }

    #[test]
    fn partial_update_carries_only_sent_columns() {
        let event = ChangeEvent::try_from(raw(
            "UPDATE",
            json!({"id": "a", "project_id": "proj-1", "status": "done"}),
            json!({"id": "a"}),
        ))
        .expect("partial update");
        let ChangeEvent::Update(fields) = event else {
            panic!("expected update");
        };
        assert_eq!(fields.status, Some(Status::Done));
        assert_eq!(fields.title, None);
        assert_eq!(fields.assignee, None);
    }

    #[test]
    fn update_keeps_explicit_assignee() {
        let mut new = row_value("a", "todo");
        new["assignee"] = json!({"full_name": "Bo", "email": "bo@example.com"});
        let ChangeEvent::Update(fields) =
            ChangeEvent::try_from(raw("UPDATE", new, json!({}))).expect("update")
        else {
            panic!("expected update");
        };
        assert_eq!(
            fields.assignee.flatten().map(|a| a.email),
            Some("bo@example.com".to_string())
        );
    }

    #[test]
    fn incomplete_or_invalid_rows_are_rejected() {
        let err = ChangeEvent::try_from(raw("INSERT", json!({"id": "a", "status": "done"}), json!({})))
            .expect_err("partial insert");
        assert!(matches!(
            err,
            PayloadError::IncompleteRow { kind: ChangeKind::Insert, column: "project_id" }
        ));

        let err = ChangeEvent::try_from(raw("UPDATE", json!({"status": "done"}), json!({})))
            .expect_err("update without id");
        assert!(matches!(err, PayloadError::MissingId { kind: ChangeKind::Update }));

        let err = ChangeEvent::try_from(raw("UPDATE", json!({"id": "a", "status": "triage"}), json!({})))
            .expect_err("unknown lane");
        assert!(matches!(err, PayloadError::InvalidRow { .. }));

        let err = ChangeEvent::try_from(raw("INSERT", row_value("a", "triage"), json!({})))
            .expect_err("unknown lane");
        assert!(matches!(err, PayloadError::InvalidRow { .. }));

        let err = ChangeEvent::try_from(raw("INSERT", json!({}), json!({}))).expect_err("empty");
        assert!(matches!(err, PayloadError::MissingRecord { .. }));
    }

    #[test]
    fn unknown_kind_and_table_are_rejected() {
        let err = ChangeEvent::try_from(raw("TRUNCATE", json!({}), json!({}))).expect_err("kind");
        assert!(matches!(err, PayloadError::UnknownKind(_)));

        let mut other = raw("INSERT", row_value("a", "todo"), json!({}));
        other.table = Some("cycles".into());
        let err = ChangeEvent::try_from(&other).expect_err("table");
        assert_eq!(err.to_string(), "change for table 'cycles' is not an issue change");
    }

    #[test]
    fn constructors_produce_narrowable_payloads() {
        let row: IssueRow = serde_json::from_value(row_value("a", "in-progress")).expect("row");

        let insert = RawChange::insert(&row);
        assert_eq!(insert.project_hint(), Some("proj-1"));
        assert_eq!(
            ChangeEvent::try_from(&insert).expect("insert"),
            ChangeEvent::Insert(IssueFields::from(row.clone()))
        );
        assert_eq!(
            ChangeEvent::try_from(&RawChange::update(&row)).expect("update"),
            ChangeEvent::Update(IssueFields::from(row.clone()))
        );
        assert_eq!(
            ChangeEvent::try_from(&RawChange::delete(&row.id)).expect("delete").kind(),
            ChangeKind::Delete
        );
    }
}
