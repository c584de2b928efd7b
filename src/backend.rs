//! Collaborators injected into the dispatcher.
//!
//! The dispatcher sequences work and routes failures; the work itself (git,
//! hosting API calls, the OS credential store) happens behind these traits.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::command::RepositoryOperation;
use crate::error::{AppError, CredentialError};
use crate::model::{Account, Issue, NewRepository, PullRequest, Repository, RepositoryId, RepositoryStatus};
use crate::store::AppStore;

/// Runs git and hosting-service operations for a repository.
///
/// Every failure must already be classified into an [`AppError`] variant
/// at this boundary; handlers match on the variant.
#[async_trait]
pub trait RepositoryBackend: Send + Sync {
    /// Re-read the repository's working tree state.
    async fn refresh(&self, repository: &Repository) -> Result<RepositoryStatus, AppError>;

    async fn execute(
        &self,
        repository: &Repository,
        operation: &RepositoryOperation,
    ) -> Result<(), AppError>;

    /// Clone `url` into `path`, reporting progress as it goes.
    ///
    /// # Returns
    ///
    /// The cloned repository, ready to be added to the store.
    async fn clone_repository(
        &self,
        url: &str,
        path: &Path,
        progress: CloneProgress,
    ) -> Result<NewRepository, AppError>;

    async fn pull_requests(&self, repository: &Repository) -> Result<Vec<PullRequest>, AppError>;

    async fn issues(&self, repository: &Repository) -> Result<Vec<Issue>, AppError>;
}

/// An account and token obtained from a completed OAuth exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedInAccount {
    pub account: Account,
    pub token: String,
}

/// Exchanges an OAuth authorization code for an account.
#[async_trait]
pub trait SignInBackend: Send + Sync {
    async fn exchange_code(&self, endpoint: &str, code: &str) -> Result<SignedInAccount, AppError>;
}

/// Key/value credential storage, keyed by service and account.
///
/// The dispatcher never persists secrets itself; every token goes through
/// this interface.
pub trait TokenStore: Send + Sync {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>, CredentialError>;

    fn set(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialError>;

    /// Delete a token. Returns `false` if there was none.
    fn delete(&self, service: &str, account: &str) -> Result<bool, CredentialError>;
}

/// In-memory [`TokenStore`], for tests and for hosts without a keychain.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<(String, String), String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<String>, CredentialError> {
        Ok(self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(service.to_owned(), account.to_owned()))
            .cloned())
    }

    fn set(&self, service: &str, account: &str, token: &str) -> Result<(), CredentialError> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((service.to_owned(), account.to_owned()), token.to_owned());
        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<bool, CredentialError> {
        Ok(self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(service.to_owned(), account.to_owned()))
            .is_some())
    }
}

/// Progress reporter handed to [`RepositoryBackend::clone_repository`].
///
/// Writes into the cloning store, so observers see progress in the
/// published snapshot.
#[derive(Debug, Clone)]
pub struct CloneProgress {
    store: AppStore,
    id: RepositoryId,
}

impl CloneProgress {
    pub(crate) fn new(store: AppStore, id: RepositoryId) -> Self {
        Self { store, id }
    }

    /// Id of the clone in the cloning store.
    pub fn id(&self) -> RepositoryId {
        self.id
    }

    /// Record progress. `fraction` is clamped to `0.0..=1.0`.
    pub fn report(&self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        let id = self.id;
        self.store.cloning().update(|cloning| {
            if let Some(entry) = cloning.iter_mut().find(|c| c.id == id) {
                entry.progress = fraction;
            }
        });
    }
}
