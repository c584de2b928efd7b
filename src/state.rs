//! The application state snapshot and the UI-level state it is built from.
//!
//! [`AppState`] is assembled by [`AppStore`](crate::AppStore) from the
//! constituent stores and replaced wholesale on every publish. Nothing in
//! this module performs I/O.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, ConflictOperation};
use crate::model::{Account, CloningRepository, Issue, PullRequest, Repository, RepositoryId};

/// Zoom factor the window starts with.
pub const DEFAULT_ZOOM_FACTOR: f64 = 1.0;

/// The tab shown for a selected repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepositorySection {
    #[default]
    Changes,
    History,
}

impl RepositorySection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Changes => "changes",
            Self::History => "history",
        }
    }
}

/// What the main window is currently showing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Selection {
    #[default]
    None,
    Repository {
        id: RepositoryId,
        section: RepositorySection,
    },
    CloningRepository {
        id: RepositoryId,
    },
}

impl Selection {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Repository { .. } => "repository",
            Self::CloningRepository { .. } => "cloning-repository",
        }
    }

    /// The repository this selection points at, if any.
    pub fn repository_id(&self) -> Option<RepositoryId> {
        match self {
            Self::None => None,
            Self::Repository { id, .. } | Self::CloningRepository { id } => Some(*id),
        }
    }
}

/// A modal dialog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Popup {
    GitAuthenticationFailed {
        repository: Option<RepositoryId>,
        host: String,
    },
    ExternalEditorFailed {
        editor: String,
        message: String,
    },
    OpenShellFailed {
        shell: String,
        message: String,
    },
    MergeConflicts {
        repository: RepositoryId,
        operation: ConflictOperation,
        files: Vec<String>,
    },
    LfsAttributeMismatch,
    PushNeedsPull {
        repository: RepositoryId,
    },
    LocalChangesOverwritten {
        repository: RepositoryId,
        operation: Option<String>,
        files: Vec<String>,
    },
    RebaseConflicts {
        repository: RepositoryId,
        base_branch: Option<String>,
    },
    PushRejectedWorkflowScope {
        repository: RepositoryId,
        rejected_path: String,
    },
    UpstreamAlreadyExists {
        repository: RepositoryId,
        existing_remote: String,
    },
    CloneRepository {
        url: String,
    },
    AddRepository {
        path: PathBuf,
    },
    SignIn,
}

impl Popup {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GitAuthenticationFailed { .. } => "git-authentication-failed",
            Self::ExternalEditorFailed { .. } => "external-editor-failed",
            Self::OpenShellFailed { .. } => "open-shell-failed",
            Self::MergeConflicts { .. } => "merge-conflicts",
            Self::LfsAttributeMismatch => "lfs-attribute-mismatch",
            Self::PushNeedsPull { .. } => "push-needs-pull",
            Self::LocalChangesOverwritten { .. } => "local-changes-overwritten",
            Self::RebaseConflicts { .. } => "rebase-conflicts",
            Self::PushRejectedWorkflowScope { .. } => "push-rejected-workflow-scope",
            Self::UpstreamAlreadyExists { .. } => "upstream-already-exists",
            Self::CloneRepository { .. } => "clone-repository",
            Self::AddRepository { .. } => "add-repository",
            Self::SignIn => "sign-in",
        }
    }
}

/// A non-modal notice shown above the main content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Banner {
    SuccessfulMerge {
        our_branch: String,
        their_branch: Option<String>,
    },
    MergeConflictsFound {
        repository: RepositoryId,
    },
    RebaseConflictsFound {
        repository: RepositoryId,
    },
    UpdateAvailable {
        version: String,
    },
}

impl Banner {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SuccessfulMerge { .. } => "successful-merge",
            Self::MergeConflictsFound { .. } => "merge-conflicts-found",
            Self::RebaseConflictsFound { .. } => "rebase-conflicts-found",
            Self::UpdateAvailable { .. } => "update-available",
        }
    }
}

/// An open drop-down menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Foldout {
    RepositoryList,
    BranchList,
    AppMenu,
    AddMenu,
}

impl Foldout {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RepositoryList => "repository-list",
            Self::BranchList => "branch-list",
            Self::AppMenu => "app-menu",
            Self::AddMenu => "add-menu",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowMode {
    #[default]
    Normal,
    Maximized,
    Minimized,
    FullScreen,
    Hidden,
}

impl fmt::Display for WindowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::Maximized => "maximized",
            Self::Minimized => "minimized",
            Self::FullScreen => "full-screen",
            Self::Hidden => "hidden",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub focused: bool,
    pub mode: WindowMode,
    pub zoom_factor: f64,
    pub access_key_highlight: bool,
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            focused: false,
            mode: WindowMode::Normal,
            zoom_factor: DEFAULT_ZOOM_FACTOR,
            access_key_highlight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// The first-run welcome flow is being shown.
    pub welcome_flow: bool,
    /// Follow the operating system's light/dark theme.
    pub auto_switch_theme: bool,
}

/// An error presented to the user and not yet dismissed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub id: u64,
    pub error: AppError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignInState {
    #[default]
    Idle,
    /// Waiting for the OAuth callback carrying `state`.
    Authenticating { endpoint: String, state: String },
}

/// Usage counters bumped on successful operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub counters: BTreeMap<String, u64>,
}

impl UsageStats {
    pub fn record(&mut self, metric: &str) {
        *self.counters.entry(metric.to_owned()).or_default() += 1;
    }

    pub fn count(&self, metric: &str) -> u64 {
        self.counters.get(metric).copied().unwrap_or(0)
    }
}

/// State owned by the application store itself (as opposed to the
/// account, repository, and sync stores).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiState {
    pub selection: Selection,
    pub popup: Option<Popup>,
    pub banner: Option<Banner>,
    pub foldout: Option<Foldout>,
    /// Active non-fatal errors, oldest first.
    pub errors: Vec<ErrorEntry>,
    pub window: WindowState,
    pub flags: FeatureFlags,
    next_error_id: u64,
}

impl UiState {
    /// Default UI state with the given feature flags.
    pub fn with_flags(flags: FeatureFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Append an error to the active list and return its id.
    pub fn push_error(&mut self, error: AppError) -> u64 {
        self.next_error_id += 1;
        let id = self.next_error_id;
        self.errors.push(ErrorEntry { id, error });
        id
    }

    /// Remove the error with `id`. Returns `false` if it was not present.
    pub fn clear_error(&mut self, id: u64) -> bool {
        let before = self.errors.len();
        self.errors.retain(|entry| entry.id != id);
        self.errors.len() != before
    }
}

/// A state change requested by an error handler.
///
/// Handlers never touch the stores; they describe the change and the
/// dispatcher applies it.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    ShowPopup(Popup),
    ShowBanner(Banner),
    PresentError(AppError),
    MarkRepositoryMissing(RepositoryId),
}

/// The canonical application state at one point in time.
///
/// Every field is shared with the store that owns it, so building a
/// snapshot is cheap and a published snapshot never changes afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppState {
    /// Aggregate revision this snapshot was built from.
    pub revision: u64,
    pub ui: Arc<UiState>,
    pub repositories: Arc<Vec<Repository>>,
    pub accounts: Arc<Vec<Account>>,
    pub cloning: Arc<Vec<CloningRepository>>,
    pub pull_requests: Arc<HashMap<RepositoryId, Vec<PullRequest>>>,
    pub issues: Arc<HashMap<RepositoryId, Vec<Issue>>>,
    pub sign_in: Arc<SignInState>,
    pub stats: Arc<UsageStats>,
}

impl AppState {
    pub fn selection(&self) -> Selection {
        self.ui.selection
    }

    pub fn popup(&self) -> Option<&Popup> {
        self.ui.popup.as_ref()
    }

    pub fn banner(&self) -> Option<&Banner> {
        self.ui.banner.as_ref()
    }

    pub fn repository(&self, id: RepositoryId) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.id == id)
    }

    /// The selected repository, if the selection is a repository.
    pub fn selected_repository(&self) -> Option<&Repository> {
        match self.ui.selection {
            Selection::Repository { id, .. } => self.repository(id),
            _ => None,
        }
    }
}
