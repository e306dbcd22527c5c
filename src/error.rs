use std::fmt;

/// Failure of a remote store, live feed or validation step.
///
/// Every variant except [`StoreError::Stale`] may reach the render boundary.
/// `Stale` marks work that was superseded by newer navigation and is dropped
/// inside the controller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("already exists: {path}")]
    Conflict { path: String },
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid {kind} document: {reason}")]
    ValidationFailed { kind: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("result superseded by newer navigation")]
    Stale,
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not-found",
            StoreError::Conflict { .. } => "conflict",
            StoreError::Unauthorized => "unauthorized",
            StoreError::ValidationFailed { .. } => "validation-failed",
            StoreError::Transport(_) => "transport",
            StoreError::Stale => "stale",
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::Stale)
    }

    pub(crate) fn validation(kind: impl fmt::Display, reason: impl fmt::Display) -> Self {
        StoreError::ValidationFailed {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

impl From<url::ParseError> for StoreError {
    fn from(err: url::ParseError) -> Self {
        StoreError::Transport(format!("invalid url: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Login,
    Logout,
    RefreshWorkspaces,
    OpenWorkspace,
    OpenChannel,
    RefreshChannel,
    PostMessage,
    ToggleReaction,
    CreateWorkspace,
    DeleteWorkspace,
    CreateChannel,
    DeleteChannel,
    Subscribe,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Login => "login",
            Operation::Logout => "logout",
            Operation::RefreshWorkspaces => "refresh workspaces",
            Operation::OpenWorkspace => "open workspace",
            Operation::OpenChannel => "open channel",
            Operation::RefreshChannel => "refresh channel",
            Operation::PostMessage => "post message",
            Operation::ToggleReaction => "toggle reaction",
            Operation::CreateWorkspace => "create workspace",
            Operation::DeleteWorkspace => "delete workspace",
            Operation::CreateChannel => "create channel",
            Operation::DeleteChannel => "delete channel",
            Operation::Subscribe => "subscribe",
        }
    }

    fn subject(&self) -> &'static str {
        match self {
            Operation::RefreshWorkspaces
            | Operation::OpenWorkspace
            | Operation::CreateWorkspace
            | Operation::DeleteWorkspace => "Workspace",
            Operation::OpenChannel
            | Operation::RefreshChannel
            | Operation::CreateChannel
            | Operation::DeleteChannel
            | Operation::Subscribe => "Channel",
            Operation::PostMessage | Operation::ToggleReaction => "Post",
            Operation::Login | Operation::Logout => "Session",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the controller was doing, and to which resource, when an error occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: Operation,
    pub target: String,
}

impl ErrorContext {
    pub fn new(operation: Operation, target: impl Into<String>) -> Self {
        Self {
            operation,
            target: target.into(),
        }
    }

    pub fn user_message(&self, error: &StoreError) -> String {
        let subject = self.operation.subject();
        match error {
            StoreError::Conflict { .. } => match self.operation {
                Operation::CreateWorkspace | Operation::CreateChannel => {
                    format!("{subject} already exists.")
                }
                _ => format!("Could not {}: the request was rejected.", self.operation),
            },
            StoreError::NotFound { .. } => format!("{subject} does not exist."),
            StoreError::Unauthorized => "Your session has expired. Please log in again.".to_string(),
            StoreError::ValidationFailed { .. } => {
                format!("Could not {}: received malformed data.", self.operation)
            }
            StoreError::Transport(_) | StoreError::Stale => {
                format!("An error occurred while trying to {}: {error}", self.operation)
            }
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operation, self.target)
    }
}
