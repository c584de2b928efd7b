//! Domain records held by the constituent stores.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identity of a repository (or a repository being cloned) inside the
/// application. Assigned by [`AppStore`](crate::AppStore).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(pub u64);

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository the user has added to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub path: PathBuf,
    /// URL of the default remote, if one is configured.
    pub remote_url: Option<String>,
    /// API endpoint of the hosting service, for hosted repositories.
    pub endpoint: Option<String>,
    /// Set when the repository could no longer be found on disk.
    pub missing: bool,
}

impl Repository {
    pub(crate) fn from_new(id: RepositoryId, new: NewRepository) -> Self {
        Self {
            id,
            name: new.name,
            path: new.path,
            remote_url: new.remote_url,
            endpoint: new.endpoint,
            missing: false,
        }
    }
}

/// A repository that has not been assigned an id yet.
///
/// # Examples
///
/// ```
/// use deskcore::NewRepository;
///
/// let repo = NewRepository::new("deskcore", "/src/deskcore")
///     .with_remote("https://github.com/octo/deskcore.git")
///     .with_endpoint("https://api.github.com");
///
/// assert_eq!(repo.name, "deskcore");
/// assert!(repo.remote_url.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRepository {
    pub name: String,
    pub path: PathBuf,
    pub remote_url: Option<String>,
    pub endpoint: Option<String>,
}

impl NewRepository {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            remote_url: None,
            endpoint: None,
        }
    }

    pub fn with_remote(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// A clone in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloningRepository {
    pub id: RepositoryId,
    pub url: String,
    pub path: PathBuf,
    /// Fraction complete, between `0.0` and `1.0`.
    pub progress: f64,
}

/// A signed-in user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
    pub endpoint: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

impl Account {
    pub fn new(login: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            endpoint: endpoint.into(),
            name: None,
            email: None,
            avatar_url: None,
        }
    }

    /// Key under which this account's token lives in the
    /// [`TokenStore`](crate::TokenStore).
    pub fn token_service(&self) -> String {
        token_service(&self.endpoint)
    }
}

/// Service name used to file tokens for an endpoint.
pub(crate) fn token_service(endpoint: &str) -> String {
    format!("deskcore - {endpoint}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub head_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
}

/// Working-tree summary produced by a repository refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub current_branch: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub changed_files: u32,
}

/// User information derived for a repository from the signed-in accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub login: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

impl From<&Account> for UserInfo {
    fn from(account: &Account) -> Self {
        Self {
            login: account.login.clone(),
            name: account.name.clone(),
            email: account.email.clone(),
            avatar_url: account.avatar_url.clone(),
        }
    }
}

/// Normalise a remote URL for comparison: case-insensitive, ignoring a
/// trailing `/` and `.git` suffix.
pub(crate) fn normalize_remote_url(url: &str) -> String {
    let lower = url.trim().to_ascii_lowercase();
    let trimmed = lower.trim_end_matches('/');
    trimmed.strip_suffix(".git").unwrap_or(trimmed).to_owned()
}
