use std::fmt;

/// Machine-readable error codes shared by the engine, the simulator and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    SnapshotUnreadable,
    IssueNotFound,
    InvalidStatus,
    MalformedPayload,
    SubscriptionFailed,
    StatusUpdateRejected,
    StatusUpdateTransport,
    BoardDisposed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1002",
            Self::SnapshotUnreadable => "E1003",
            Self::IssueNotFound => "E2001",
            Self::InvalidStatus => "E2005",
            Self::MalformedPayload => "E3001",
            Self::SubscriptionFailed => "E4001",
            Self::StatusUpdateRejected => "E4002",
            Self::StatusUpdateTransport => "E4003",
            Self::BoardDisposed => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::SnapshotUnreadable => "Board snapshot could not be read",
            Self::IssueNotFound => "Issue not found on board",
            Self::InvalidStatus => "Invalid status value",
            Self::MalformedPayload => "Malformed change payload",
            Self::SubscriptionFailed => "Change subscription failed",
            Self::StatusUpdateRejected => "Status update rejected",
            Self::StatusUpdateTransport => "Status update transport failure",
            Self::BoardDisposed => "Board already disposed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .kyrie/config.toml and retry."),
            Self::SnapshotUnreadable => {
                Some("Provide a JSON array of issues with id, project_id and status.")
            }
            Self::IssueNotFound | Self::BoardDisposed => None,
            Self::InvalidStatus => {
                Some("Use one of: backlog, todo, in-progress, done, canceled.")
            }
            Self::MalformedPayload => Some("The event was dropped; the next snapshot reconciles."),
            Self::SubscriptionFailed => Some("Reload the board to resubscribe."),
            Self::StatusUpdateRejected | Self::StatusUpdateTransport => {
                Some("The card was moved back. Drag it again to retry.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
