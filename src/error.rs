//! Crate-level error types: the failure taxonomy routed through the handler
//! chain, plus the errors raised at the crate's seams.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The operation that was in progress when conflicts were detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictOperation {
    Merge,
    Pull,
    CherryPick,
}

impl fmt::Display for ConflictOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Merge => "merge",
            Self::Pull => "pull",
            Self::CherryPick => "cherry-pick",
        })
    }
}

/// A failure raised by an operation, tagged at the point of failure.
///
/// Every variant is a discriminant that error handlers match on. Handlers
/// never inspect message text to decide whether an error is theirs; the
/// `Git`, `Network` and `Unexpected` variants exist for failures that no
/// specialised handler is expected to claim.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AppError {
    /// The remote rejected the supplied credentials.
    #[error("authentication failed for {host}")]
    AuthenticationFailed { host: String },

    /// The configured external editor could not be launched.
    #[error("could not launch editor '{editor}': {message}")]
    EditorLaunchFailed { editor: String, message: String },

    /// The configured shell could not be opened.
    #[error("could not open shell '{shell}': {message}")]
    ShellOpenFailed { shell: String, message: String },

    /// A merge, pull or cherry-pick stopped on conflicting files.
    #[error("{operation} stopped with {} conflicted file(s)", .files.len())]
    MergeConflicts {
        operation: ConflictOperation,
        files: Vec<String>,
    },

    /// Git LFS filters are missing from the user's git configuration.
    #[error("git LFS attributes are not configured")]
    LfsAttributeMismatch,

    /// The push was rejected because the remote has newer commits.
    #[error("push rejected: the remote contains commits that are not present locally")]
    PushNeedsPull,

    /// The repository could not be found on disk.
    #[error("repository not found at {}", .path.display())]
    RepositoryMissing { path: PathBuf },

    /// Checking out or pulling would overwrite uncommitted local changes.
    #[error("local changes to {} file(s) would be overwritten", .files.len())]
    LocalChangesOverwritten { files: Vec<String> },

    /// A rebase stopped on conflicting files.
    #[error("rebase stopped with conflicts")]
    RebaseConflicts { base_branch: Option<String> },

    /// The remote refused a push that modifies a workflow file.
    #[error("push refused: updating '{path}' requires the workflow scope")]
    WorkflowUpdateRefused { path: String },

    /// An `upstream` remote already exists and points somewhere else.
    #[error("a remote named '{remote}' already exists")]
    UpstreamAlreadyExists { remote: String },

    /// The remote host could not be reached.
    #[error("network error: {message}")]
    Network { message: String },

    /// A git invocation failed in a way no handler recognises.
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    /// Anything else, tagged with a caller-chosen kind (e.g. `"DiskFull"`).
    #[error("{kind}: {message}")]
    Unexpected { kind: String, message: String },
}

impl AppError {
    /// Build an [`AppError::Unexpected`] from a kind tag and a message.
    pub fn unexpected(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unexpected {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Build an [`AppError::Network`] error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Stable, kebab-case discriminant of this error.
    ///
    /// For [`AppError::Unexpected`] the caller-supplied kind is returned, so
    /// reports keep the tag chosen at the point of failure.
    pub fn kind(&self) -> &str {
        match self {
            Self::AuthenticationFailed { .. } => "authentication-failed",
            Self::EditorLaunchFailed { .. } => "editor-launch-failed",
            Self::ShellOpenFailed { .. } => "shell-open-failed",
            Self::MergeConflicts { .. } => "merge-conflicts",
            Self::LfsAttributeMismatch => "lfs-attribute-mismatch",
            Self::PushNeedsPull => "push-needs-pull",
            Self::RepositoryMissing { .. } => "repository-missing",
            Self::LocalChangesOverwritten { .. } => "local-changes-overwritten",
            Self::RebaseConflicts { .. } => "rebase-conflicts",
            Self::WorkflowUpdateRefused { .. } => "workflow-update-refused",
            Self::UpstreamAlreadyExists { .. } => "upstream-already-exists",
            Self::Network { .. } => "network",
            Self::Git { .. } => "git",
            Self::Unexpected { kind, .. } => kind.as_str(),
        }
    }
}

/// Error raised by an error handler while deciding what to do.
///
/// A fault never replaces the error being handled: the chain logs it and
/// moves on to the next handler with the error it already had.
#[derive(Debug, thiserror::Error)]
#[error("error handler '{handler}' failed: {message}")]
pub struct HandlerFault {
    /// Name of the handler that failed.
    pub handler: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl HandlerFault {
    pub fn new(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// Error returned by a [`TokenStore`](crate::TokenStore).
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The backing credential store refused access.
    #[error("credential store access denied: {0}")]
    AccessDenied(String),

    /// The backing credential store is not available on this system.
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        AppError::unexpected("CredentialStore", err.to_string())
    }
}

/// Error raised while decoding host events or talking to the lifecycle
/// synchronizer.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The synchronizer task has exited, so signals can no longer be routed.
    #[error("lifecycle synchronizer is no longer running")]
    Closed,

    /// The synchronizer task panicked.
    #[error("lifecycle synchronizer task failed: {0}")]
    Join(String),

    /// The host sent an event name this crate does not know.
    #[error("unknown host event '{0}'")]
    UnknownEvent(String),

    /// A host event payload could not be decoded.
    #[error("invalid host event payload: {0}")]
    InvalidPayload(String),
}

/// How an error that went through the dispatcher ended.
///
/// Every error routed through the dispatcher ends in exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorOutcome {
    /// A registered handler claimed the error.
    #[error("recovered by error handler '{handler}'")]
    Recovered { handler: String },

    /// The error was reported to the sink as non-fatal.
    #[error("reported as non-fatal")]
    ReportedNonFatal,

    /// No handler claimed the error; it was reported as fatal and the
    /// process-level fatal signal was raised.
    #[error("unhandled '{kind}' error escalated")]
    Escalated { kind: String },
}
