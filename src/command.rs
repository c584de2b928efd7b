//! Operations accepted by the dispatcher and the context carried alongside
//! them into the error handler chain.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{Account, NewRepository, Repository, RepositoryId};
use crate::state::{Banner, Foldout, Popup, RepositorySection};

/// Per-invocation metadata handed to every error handler.
///
/// Built by the dispatcher for each failing operation and discarded once the
/// error reaches a terminal outcome.
///
/// # Examples
///
/// ```
/// use deskcore::{DispatchContext, NewRepository, AppStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = AppStore::builder().open();
/// let repo = store.add_repository(NewRepository::new("desk", "/src/desk"));
///
/// let ctx = DispatchContext::new("push")
///     .with_repository(repo.clone())
///     .in_background();
///
/// assert_eq!(ctx.repository.as_ref().map(|r| r.id), Some(repo.id));
/// assert!(ctx.background);
/// # }
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchContext {
    /// Name of the operation that failed.
    pub operation: &'static str,
    /// Repository the failing operation targeted.
    pub repository: Option<Repository>,
    /// Account the failing operation acted as.
    pub account: Option<Account>,
    /// Set for work the user did not directly ask for (periodic fetches,
    /// refreshes).
    pub background: bool,
}

impl DispatchContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            ..Self::default()
        }
    }

    /// Set the target repository.
    ///
    /// # Arguments
    ///
    /// * `repository` - The repository the operation acted on. Handlers that
    ///   need a repository to describe their popup pass errors through when
    ///   this is unset.
    ///
    /// # Returns
    ///
    /// The updated `DispatchContext`.
    pub fn with_repository(mut self, repository: Repository) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_account(mut self, account: Account) -> Self {
        self.account = Some(account);
        self
    }

    /// Mark the operation as background work.
    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }
}

/// A git operation run against one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RepositoryOperation {
    Fetch,
    Pull,
    Push,
    Merge { branch: String },
    Rebase { base_branch: String },
    Checkout { branch: String },
    AddUpstreamRemote { url: String },
    OpenInEditor,
    OpenInShell,
}

impl RepositoryOperation {
    /// Stable name, used for logging, usage counters and the dispatch
    /// context.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Merge { .. } => "merge",
            Self::Rebase { .. } => "rebase",
            Self::Checkout { .. } => "checkout",
            Self::AddUpstreamRemote { .. } => "add-upstream-remote",
            Self::OpenInEditor => "open-in-editor",
            Self::OpenInShell => "open-in-shell",
        }
    }
}

/// An application-level operation routed through
/// [`Dispatcher::dispatch`](crate::Dispatcher::dispatch).
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    SelectRepository(RepositoryId),
    SetRepositorySection(RepositorySection),
    ShowPopup(Popup),
    ClosePopup,
    ShowBanner(Banner),
    ClearBanner,
    ShowFoldout(Foldout),
    CloseFoldout,
    PresentError(crate::AppError),
    ClearError(u64),
    AddRepository(NewRepository),
    RemoveRepository(RepositoryId),
    /// Run a git operation against a repository.
    Repository {
        repository: RepositoryId,
        operation: RepositoryOperation,
        /// Work the user did not directly ask for.
        background: bool,
    },
    CloneRepository {
        url: String,
        path: PathBuf,
    },
    /// Start an OAuth sign-in against `endpoint`.
    BeginSignIn {
        endpoint: String,
    },
    /// Finish an OAuth sign-in with the callback's code and state.
    CompleteSignIn {
        code: String,
        state: String,
    },
    SignOut {
        login: String,
        endpoint: String,
    },
    SetWelcomeFlow(bool),
    SetAutoSwitchTheme(bool),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SelectRepository(_) => "select-repository",
            Self::SetRepositorySection(_) => "set-repository-section",
            Self::ShowPopup(_) => "show-popup",
            Self::ClosePopup => "close-popup",
            Self::ShowBanner(_) => "show-banner",
            Self::ClearBanner => "clear-banner",
            Self::ShowFoldout(_) => "show-foldout",
            Self::CloseFoldout => "close-foldout",
            Self::PresentError(_) => "present-error",
            Self::ClearError(_) => "clear-error",
            Self::AddRepository(_) => "add-repository",
            Self::RemoveRepository(_) => "remove-repository",
            Self::Repository { operation, .. } => operation.name(),
            Self::CloneRepository { .. } => "clone-repository",
            Self::BeginSignIn { .. } => "begin-sign-in",
            Self::CompleteSignIn { .. } => "complete-sign-in",
            Self::SignOut { .. } => "sign-out",
            Self::SetWelcomeFlow(_) => "set-welcome-flow",
            Self::SetAutoSwitchTheme(_) => "set-auto-switch-theme",
        }
    }
}
