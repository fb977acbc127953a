use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, str::FromStr};

/// Opaque issue identifier assigned by storage at creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(String);

impl IssueId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IssueId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Identifier of the project that owns a board.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// The five board lanes an issue can sit in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    #[default]
    Backlog,
    Todo,
    InProgress,
    Done,
    Canceled,
}

impl Status {
    /// All statuses in board column order.
    pub const ALL: [Self; 5] = [
        Self::Backlog,
        Self::Todo,
        Self::InProgress,
        Self::Done,
        Self::Canceled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::Canceled => "canceled",
        }
    }

    /// Column heading shown above the lane.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Backlog => "Backlog",
            Self::Todo => "Todo",
            Self::InProgress => "In Progress",
            Self::Done => "Done",
            Self::Canceled => "Canceled",
        }
    }

    /// Lowercase prose form, e.g. `in progress`.
    #[must_use]
    pub fn spoken(self) -> String {
        self.as_str().replace('-', " ")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "backlog" => Ok(Self::Backlog),
            "todo" => Ok(Self::Todo),
            "in-progress" | "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(ParseEnumError {
                expected: "status",
                got: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
    None,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "none" => Ok(Self::None),
            _ => Err(ParseEnumError {
                expected: "priority",
                got: s.to_string(),
            }),
        }
    }
}

/// Denormalized assignee profile joined onto an issue at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
    #[serde(default)]
    pub full_name: Option<String>,
    pub email: String,
}

impl Assignee {
    /// Name to show on a card, falling back to the email address.
    #[must_use]
    pub fn label(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.email)
    }
}

/// The columns of an `issues` row, exactly as the change stream carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueRow {
    pub id: IssueId,
    pub project_id: ProjectId,
    pub workspace_id: String,
    pub sequence_id: u64,
    #[serde(default, deserialize_with = "status_or_backlog")]
    pub status: Status,
    pub title: String,
    #[serde(default)]
    pub description: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub cycle_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// Storage allows a null status; the board shows those cards under Backlog.
fn status_or_backlog<'de, D>(deserializer: D) -> Result<Status, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Status>::deserialize(deserializer)?.unwrap_or_default())
}

/// An issue as held by the board: the row plus joined read-time data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(flatten)]
    pub row: IssueRow,
    #[serde(default)]
    pub assignee: Option<Assignee>,
}

impl Issue {
    /// Wrap a bare row whose assignee is unknown.
    #[must_use]
    pub const fn from_row(row: IssueRow) -> Self {
        Self {
            row,
            assignee: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &IssueId {
        &self.row.id
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.row.status
    }

    /// Human-facing key such as `KYR-12`.
    #[must_use]
    pub fn display_key(&self, project_identifier: &str) -> String {
        format!("{project_identifier}-{}", self.row.sequence_id)
    }
}

/// The columns a change payload actually carried.
///
/// `None` means the key was absent and the stored value stands. Nullable
/// columns use `Option<Option<_>>` so an explicit `null` clears the value.
/// The same holds for `assignee`: the change stream normally omits the join,
/// but a payload that carries it (even as `null`) overwrites it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[allow(clippy::option_option)] // absent and explicit null differ
pub struct IssueFields {
    pub id: IssueId,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub sequence_id: Option<u64>,
    #[serde(default, deserialize_with = "present_status")]
    pub status: Option<Status>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<serde_json::Value>>,
    #[serde(default, deserialize_with = "present")]
    pub priority: Option<Option<Priority>>,
    #[serde(default, deserialize_with = "present")]
    pub assignee_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub cycle_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub module_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "present")]
    pub assignee: Option<Option<Assignee>>,
}

// A key that is present deserializes to `Some`, even when its value is null.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

fn present_status<'de, D>(deserializer: D) -> Result<Option<Status>, D::Error>
where
    D: Deserializer<'de>,
{
    status_or_backlog(deserializer).map(Some)
}

impl IssueFields {
    /// First required column the payload lacks, if any.
    #[must_use]
    pub const fn missing_column(&self) -> Option<&'static str> {
        if self.project_id.is_none() {
            Some("project_id")
        } else if self.workspace_id.is_none() {
            Some("workspace_id")
        } else if self.sequence_id.is_none() {
            Some("sequence_id")
        } else if self.title.is_none() {
            Some("title")
        } else if self.created_at.is_none() {
            Some("created_at")
        } else if self.updated_at.is_none() {
            Some("updated_at")
        } else {
            None
        }
    }

    /// Build a whole record, or `None` if a required column is missing.
    ///
    /// An absent status reads as `Backlog` and an absent assignee as unknown,
    /// matching how a full row deserializes.
    #[must_use]
    pub fn to_issue(&self) -> Option<Issue> {
        let row = IssueRow {
            id: self.id.clone(),
            project_id: self.project_id.clone()?,
            workspace_id: self.workspace_id.clone()?,
            sequence_id: self.sequence_id?,
            status: self.status.unwrap_or_default(),
            title: self.title.clone()?,
            description: self.description.clone().flatten(),
            priority: self.priority.flatten(),
            assignee_id: self.assignee_id.clone().flatten(),
            cycle_id: self.cycle_id.clone().flatten(),
            module_id: self.module_id.clone().flatten(),
            due_date: self.due_date.flatten(),
            created_at: self.created_at?,
            updated_at: self.updated_at?,
        };
        Some(Issue {
            row,
            assignee: self.assignee.clone().flatten(),
        })
    }

    /// Overwrite every column of `issue` that this payload carried.
    pub fn merge_into(&self, issue: &mut Issue) {
        fn set<T: Clone>(slot: &mut T, value: Option<&T>) {
            if let Some(value) = value {
                slot.clone_from(value);
            }
        }

        let row = &mut issue.row;
        set(&mut row.project_id, self.project_id.as_ref());
        set(&mut row.workspace_id, self.workspace_id.as_ref());
        set(&mut row.sequence_id, self.sequence_id.as_ref());
        set(&mut row.status, self.status.as_ref());
        set(&mut row.title, self.title.as_ref());
        set(&mut row.description, self.description.as_ref());
        set(&mut row.priority, self.priority.as_ref());
        set(&mut row.assignee_id, self.assignee_id.as_ref());
        set(&mut row.cycle_id, self.cycle_id.as_ref());
        set(&mut row.module_id, self.module_id.as_ref());
        set(&mut row.due_date, self.due_date.as_ref());
        set(&mut row.created_at, self.created_at.as_ref());
        set(&mut row.updated_at, self.updated_at.as_ref());
        set(&mut issue.assignee, self.assignee.as_ref());
    }
}

impl From<IssueRow> for IssueFields {
    /// Every row column present, assignee absent.
    fn from(row: IssueRow) -> Self {
        Self {
            id: row.id,
            project_id: Some(row.project_id),
            workspace_id: Some(row.workspace_id),
            sequence_id: Some(row.sequence_id),
            status: Some(row.status),
            title: Some(row.title),
            description: Some(row.description),
            priority: Some(row.priority),
            assignee_id: Some(row.assignee_id),
            cycle_id: Some(row.cycle_id),
            module_id: Some(row.module_id),
            due_date: Some(row.due_date),
            created_at: Some(row.created_at),
            updated_at: Some(row.updated_at),
            assignee: None,
        }
    }
}

/// A partial set of field writes applied to an existing issue.
///
/// Used for optimistic edits and their rollbacks; a patch never creates a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl IssuePatch {
    #[must_use]
    pub const fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            title: None,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.status.is_none() && self.title.is_none()
    }

    /// Write every field set in this patch into `row`.
    ///
    /// Returns `true` if any value actually changed.
    pub fn apply_to(&self, row: &mut IssueRow) -> bool {
        let mut changed = false;
        if let Some(status) = self.status {
            if row.status != status {
                row.status = status;
                changed = true;
            }
        }
        if let Some(title) = &self.title {
            if &row.title != title {
                row.title.clone_from(title);
                changed = true;
            }
        }
        changed
    }

    /// Capture the current values of the fields this patch would touch.
    #[must_use]
    pub fn inverse_for(&self, row: &IssueRow) -> Self {
        Self {
            status: self.status.map(|_| row.status),
            title: self.title.as_ref().map(|_| row.title.clone()),
        }
    }
}

/// Next display number for a new issue in a project: highest existing + 1.
#[must_use]
pub fn next_sequence_id<'a>(issues: impl IntoIterator<Item = &'a Issue>) -> u64 {
    issues
        .into_iter()
        .map(|issue| issue.row.sequence_id)
        .max()
        .map_or(1, |max| max.saturating_add(1))
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}
