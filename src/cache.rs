//! Repository-keyed derived state.
//!
//! [`StateCache`] never holds primary truth. User information is derived
//! from the accounts store on demand and memoised against the store's
//! version; refresh results are kept only if they belong to the most
//! recently initiated refresh for their repository.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{Account, Repository, RepositoryId, RepositoryStatus, UserInfo};
use crate::store::{Store, StoreCell};

/// Per-key generation counter for superseding asynchronous results.
///
/// Every asynchronous result applied back to keyed state is tagged with the
/// generation returned by [`begin`](Self::begin) when the work started. A
/// result is applied only if no newer generation has been handed out for
/// its key since, so the last-initiated operation wins regardless of
/// completion order.
///
/// # Examples
///
/// ```
/// use deskcore::Generations;
///
/// let generations = Generations::new();
/// let first = generations.begin("repo");
/// let second = generations.begin("repo");
///
/// assert!(!generations.is_current(&"repo", first));
/// assert!(generations.is_current(&"repo", second));
/// ```
#[derive(Debug)]
pub struct Generations<K> {
    counters: Mutex<HashMap<K, u64>>,
}

impl<K> Default for Generations<K> {
    fn default() -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash> Generations<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new operation for `key`, superseding any in flight.
    ///
    /// # Returns
    ///
    /// The generation to tag the operation's result with. Generations for
    /// a key start at 1 and increase by one per call.
    pub fn begin(&self, key: K) -> u64 {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = counters.entry(key).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Whether `generation` is still the latest one handed out for `key`.
    pub fn is_current(&self, key: &K, generation: u64) -> bool {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|latest| *latest == generation)
    }

    /// Run `apply` if `generation` is still the latest for `key`.
    ///
    /// The counters stay locked while `apply` runs, so a newer operation
    /// cannot begin and land its result between the check and the write.
    /// `apply` must not call back into this `Generations`.
    ///
    /// # Returns
    ///
    /// `Some` with the result of `apply`, or `None` if the generation was
    /// superseded and `apply` did not run.
    pub fn apply_if_current<R>(
        &self,
        key: &K,
        generation: u64,
        apply: impl FnOnce() -> R,
    ) -> Option<R> {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if counters.get(key) != Some(&generation) {
            return None;
        }
        Some(apply())
    }

    /// Drop the counter for `key`. Results still in flight for it become
    /// stale.
    pub fn forget(&self, key: &K) {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

struct MemoizedUsers {
    accounts_version: u64,
    endpoint: Option<String>,
    users: Arc<Vec<UserInfo>>,
}

/// Derived per-repository overlay on top of the state aggregate.
pub struct StateCache {
    accounts: Arc<StoreCell<Vec<Account>>>,
    users: Mutex<HashMap<RepositoryId, MemoizedUsers>>,
    refreshes: Generations<RepositoryId>,
    statuses: Mutex<HashMap<RepositoryId, RepositoryStatus>>,
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("accounts_version", &self.accounts.version())
            .finish_non_exhaustive()
    }
}

impl StateCache {
    /// Create a cache deriving from the given accounts store.
    pub fn new(accounts: Arc<StoreCell<Vec<Account>>>) -> Self {
        Self {
            accounts,
            users: Mutex::new(HashMap::new()),
            refreshes: Generations::new(),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Users known for `repository`: every signed-in account on the
    /// repository's endpoint, sorted by login.
    ///
    /// The result is memoised per repository and recomputed whenever the
    /// accounts store or the repository's endpoint changes. Repositories
    /// without an endpoint have no users.
    ///
    /// # Arguments
    ///
    /// * `repository` - The repository to derive users for. Only its id and
    ///   endpoint are consulted.
    ///
    /// # Returns
    ///
    /// A shared list; repeated calls without intervening account changes
    /// return the same `Arc`.
    pub fn users_for_repository(&self, repository: &Repository) -> Arc<Vec<UserInfo>> {
        let version = self.accounts.version();
        let mut memo = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = memo.get(&repository.id)
            && entry.accounts_version == version
            && entry.endpoint == repository.endpoint
        {
            return Arc::clone(&entry.users);
        }

        let users = Arc::new(derive_users(
            &self.accounts.state(),
            repository.endpoint.as_deref(),
        ));
        tracing::trace!(
            repository = %repository.id,
            accounts_version = version,
            users = users.len(),
            "derived repository users"
        );
        memo.insert(
            repository.id,
            MemoizedUsers {
                accounts_version: version,
                endpoint: repository.endpoint.clone(),
                users: Arc::clone(&users),
            },
        );
        users
    }

    /// Mark the start of a refresh for `id`.
    ///
    /// # Returns
    ///
    /// The generation to pass to [`complete_refresh`](Self::complete_refresh).
    pub fn begin_refresh(&self, id: RepositoryId) -> u64 {
        self.refreshes.begin(id)
    }

    /// Apply a refresh result if it is still the latest for `id`.
    ///
    /// # Returns
    ///
    /// `true` if the status was stored, `false` if a newer refresh had been
    /// initiated and the result was discarded.
    pub fn complete_refresh(
        &self,
        id: RepositoryId,
        generation: u64,
        status: RepositoryStatus,
    ) -> bool {
        let applied = self.refreshes.apply_if_current(&id, generation, || {
            self.statuses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, status);
        });
        if applied.is_none() {
            tracing::debug!(repository = %id, generation, "discarding superseded refresh result");
        }
        applied.is_some()
    }

    /// Whether `generation` is still the latest refresh for `id`.
    pub fn is_current_refresh(&self, id: RepositoryId, generation: u64) -> bool {
        self.refreshes.is_current(&id, generation)
    }

    /// Last applied refresh status for `id`.
    pub fn status(&self, id: RepositoryId) -> Option<RepositoryStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Drop everything cached for `id`.
    pub fn forget(&self, id: RepositoryId) {
        self.refreshes.forget(&id);
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

fn derive_users(accounts: &[Account], endpoint: Option<&str>) -> Vec<UserInfo> {
    let Some(endpoint) = endpoint else {
        return Vec::new();
    };
    let mut users: Vec<UserInfo> = accounts
        .iter()
        .filter(|account| account.endpoint == endpoint)
        .map(UserInfo::from)
        .collect();
    users.sort_by(|a, b| a.login.cmp(&b.login));
    users
}
