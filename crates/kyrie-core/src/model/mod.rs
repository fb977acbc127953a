pub mod issue;
pub mod lanes;

pub use issue::{
    Assignee, Issue, IssueFields, IssueId, IssuePatch, IssueRow, ParseEnumError, Priority, ProjectId, Status,
    next_sequence_id,
};
pub use lanes::{BoardLanes, Lane};
