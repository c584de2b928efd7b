//! Constituent stores and the [`AppStore`] aggregate that composes them into
//! one published [`AppState`] snapshot.
//!
//! Each constituent store is a [`StoreCell`]: it owns its state behind a
//! `watch` channel and can be read and subscribed to on its own. Updating a
//! cell bumps a shared revision and wakes a background publisher task, which
//! assembles a new snapshot. Several updates made in the same synchronous
//! turn therefore produce a single snapshot.
//!
//! Cell updates and snapshot assembly share one publish lock. A change that
//! spans several cells goes through [`AppStore::batch`], which holds the
//! lock for the whole change, so no snapshot can observe it half-applied on
//! any runtime flavour.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::model::{
    Account, CloningRepository, Issue, NewRepository, PullRequest, Repository, RepositoryId,
    normalize_remote_url,
};
use crate::state::{AppState, FeatureFlags, Mutation, Selection, SignInState, UiState, UsageStats};

/// Read side of a constituent store.
///
/// The aggregate only relies on this surface; what a store does to produce
/// its state is its own business.
pub trait Store: Send + Sync {
    /// The state this store owns.
    type State: Send + Sync + 'static;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// The current state. Never blocks on other stores.
    fn state(&self) -> Arc<Self::State>;

    /// Receive every future replacement of the state.
    fn subscribe(&self) -> watch::Receiver<Arc<Self::State>>;
}

/// Shared dirty marker and publish lock between the cells and the
/// publisher.
#[derive(Debug, Default)]
struct UpdateNotifier {
    revision: AtomicU64,
    wake: Notify,
    /// Publish lock; holds the revision of the last published snapshot.
    published: Mutex<u64>,
}

impl UpdateNotifier {
    fn lock(&self) -> MutexGuard<'_, u64> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_dirty(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
        // `notify_one` stores a single permit, so a burst of updates wakes
        // the publisher once.
        self.wake.notify_one();
    }
}

/// A constituent store holding one piece of state.
///
/// Updates are copy-on-write: readers holding an earlier `Arc<T>` keep a
/// consistent value, and subscribers receive the new `Arc<T>` wholesale.
#[derive(Debug)]
pub struct StoreCell<T> {
    name: &'static str,
    tx: watch::Sender<Arc<T>>,
    version: AtomicU64,
    notifier: Arc<UpdateNotifier>,
}

impl<T: Clone + Send + Sync + 'static> StoreCell<T> {
    fn new(name: &'static str, initial: T, notifier: Arc<UpdateNotifier>) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self {
            name,
            tx,
            version: AtomicU64::new(0),
            notifier,
        }
    }

    /// Mutate the state in place and schedule a snapshot publish.
    ///
    /// Takes the publish lock, so `f` must not call back into the store.
    /// To change several cells at once use [`AppStore::batch`].
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let _guard = self.notifier.lock();
        self.update_locked(f);
    }

    /// Replace the state wholesale and schedule a snapshot publish.
    pub fn replace(&self, value: T) {
        let _guard = self.notifier.lock();
        self.replace_locked(value);
    }

    fn update_locked(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(|state| f(Arc::make_mut(state)));
        self.bump();
    }

    fn replace_locked(&self, value: T) {
        self.tx.send_replace(Arc::new(value));
        self.bump();
    }

    /// Number of updates applied to this cell so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.notifier.mark_dirty();
    }
}

impl<T: Clone + Send + Sync + 'static> Store for StoreCell<T> {
    type State = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn state(&self) -> Arc<T> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

type PullRequestMap = HashMap<RepositoryId, Vec<PullRequest>>;
type IssueMap = HashMap<RepositoryId, Vec<Issue>>;

struct StoreInner {
    accounts: Arc<StoreCell<Vec<Account>>>,
    repositories: StoreCell<Vec<Repository>>,
    pull_requests: StoreCell<PullRequestMap>,
    issues: StoreCell<IssueMap>,
    sign_in: StoreCell<SignInState>,
    statistics: StoreCell<UsageStats>,
    cloning: StoreCell<Vec<CloningRepository>>,
    ui: StoreCell<UiState>,
    notifier: Arc<UpdateNotifier>,
    snapshot_tx: watch::Sender<Arc<AppState>>,
    next_id: AtomicU64,
    publisher: Mutex<Option<JoinHandle<()>>>,
}

impl StoreInner {
    fn assemble(&self, revision: u64) -> AppState {
        AppState {
            revision,
            ui: self.ui.state(),
            repositories: self.repositories.state(),
            accounts: self.accounts.state(),
            cloning: self.cloning.state(),
            pull_requests: self.pull_requests.state(),
            issues: self.issues.state(),
            sign_in: self.sign_in.state(),
            stats: self.statistics.state(),
        }
    }

    /// Publish a snapshot if any cell changed since the last publish.
    ///
    /// No cell can change while the lock is held, so the snapshot matches
    /// `revision` exactly.
    fn flush(&self) -> bool {
        let mut published = self.notifier.lock();
        let revision = self.notifier.revision.load(Ordering::Acquire);
        if revision == *published {
            return false;
        }
        let snapshot = self.assemble(revision);
        *published = revision;
        self.snapshot_tx.send_replace(Arc::new(snapshot));
        tracing::trace!(revision, "published state snapshot");
        true
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let publisher = self
            .publisher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = publisher {
            task.abort();
        }
    }
}

/// Waits for dirty notifications and publishes coalesced snapshots until the
/// store is dropped.
async fn run_publisher(store: Weak<StoreInner>, notifier: Arc<UpdateNotifier>) {
    loop {
        notifier.wake.notified().await;
        let Some(inner) = store.upgrade() else {
            break;
        };
        inner.flush();
    }
}

/// Scoped access to the cells while the publish lock is held.
///
/// Obtained from [`AppStore::batch`]. No snapshot can be assembled while a
/// `Batch` is alive, so a multi-store change is never observed half-done.
/// A `Batch` cannot flush; the snapshot is published after the batch ends.
pub struct Batch<'a> {
    inner: &'a StoreInner,
}

/// A cell reached through a [`Batch`]. Updates reuse the batch's lock.
pub struct BatchCell<'a, T> {
    cell: &'a StoreCell<T>,
}

impl<T: Clone + Send + Sync + 'static> BatchCell<'_, T> {
    pub fn state(&self) -> Arc<T> {
        self.cell.state()
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.cell.update_locked(f);
    }

    pub fn replace(&self, value: T) {
        self.cell.replace_locked(value);
    }
}

impl<'a> Batch<'a> {
    pub fn ui(&self) -> BatchCell<'a, UiState> {
        BatchCell { cell: &self.inner.ui }
    }

    pub fn repositories(&self) -> BatchCell<'a, Vec<Repository>> {
        BatchCell {
            cell: &self.inner.repositories,
        }
    }

    pub fn accounts(&self) -> BatchCell<'a, Vec<Account>> {
        BatchCell {
            cell: &*self.inner.accounts,
        }
    }

    pub fn cloning(&self) -> BatchCell<'a, Vec<CloningRepository>> {
        BatchCell {
            cell: &self.inner.cloning,
        }
    }

    pub fn pull_requests(&self) -> BatchCell<'a, PullRequestMap> {
        BatchCell {
            cell: &self.inner.pull_requests,
        }
    }

    pub fn issues(&self) -> BatchCell<'a, IssueMap> {
        BatchCell {
            cell: &self.inner.issues,
        }
    }

    pub fn sign_in(&self) -> BatchCell<'a, SignInState> {
        BatchCell {
            cell: &self.inner.sign_in,
        }
    }

    pub fn statistics(&self) -> BatchCell<'a, UsageStats> {
        BatchCell {
            cell: &self.inner.statistics,
        }
    }

    /// Add a repository, or return the existing one at the same path.
    pub fn add_repository(&self, new: NewRepository) -> Repository {
        if let Some(existing) = self
            .inner
            .repositories
            .state()
            .iter()
            .find(|r| r.path == new.path)
        {
            return existing.clone();
        }
        let id = RepositoryId(self.inner.next_id.fetch_add(1, Ordering::AcqRel));
        let repository = Repository::from_new(id, new);
        let added = repository.clone();
        self.repositories().update(move |repos| repos.push(added));
        tracing::debug!(repository = %repository.id, path = %repository.path.display(), "repository added");
        repository
    }
}

/// The state store aggregate.
///
/// Owns the constituent stores and the single "current" [`AppState`].
/// `Clone` is cheap; all clones share the same stores.
#[derive(Clone)]
pub struct AppStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for AppStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppStore")
            .field("revision", &self.inner.notifier.revision.load(Ordering::Relaxed))
            .finish()
    }
}

impl AppStore {
    pub fn builder() -> AppStoreBuilder {
        AppStoreBuilder::new()
    }

    /// The most recently published snapshot.
    pub fn state(&self) -> Arc<AppState> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Subscribe to snapshot publications.
    ///
    /// The receiver starts out having seen the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppState>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Snapshot publications as a `Stream`, starting with the current one.
    pub fn updates(&self) -> WatchStream<Arc<AppState>> {
        WatchStream::new(self.subscribe())
    }

    pub fn ui(&self) -> &StoreCell<UiState> {
        &self.inner.ui
    }

    pub fn repositories(&self) -> &StoreCell<Vec<Repository>> {
        &self.inner.repositories
    }

    pub fn accounts(&self) -> &StoreCell<Vec<Account>> {
        &self.inner.accounts
    }

    /// Shared handle to the accounts store, for derived caches.
    pub fn shared_accounts(&self) -> Arc<StoreCell<Vec<Account>>> {
        Arc::clone(&self.inner.accounts)
    }

    pub fn cloning(&self) -> &StoreCell<Vec<CloningRepository>> {
        &self.inner.cloning
    }

    pub fn pull_requests(&self) -> &StoreCell<PullRequestMap> {
        &self.inner.pull_requests
    }

    pub fn issues(&self) -> &StoreCell<IssueMap> {
        &self.inner.issues
    }

    pub fn sign_in(&self) -> &StoreCell<SignInState> {
        &self.inner.sign_in
    }

    pub fn statistics(&self) -> &StoreCell<UsageStats> {
        &self.inner.statistics
    }

    /// Run `f` with the publish lock held.
    ///
    /// Every cell update made through the [`Batch`] lands in the same
    /// snapshot. The lock is not reentrant: `f` must go through the `Batch`
    /// only. Updating a cell through this `AppStore`, calling
    /// [`flush`](Self::flush), or starting another batch from inside `f`
    /// deadlocks.
    pub fn batch<R>(&self, f: impl FnOnce(&Batch<'_>) -> R) -> R {
        let _guard = self.inner.notifier.lock();
        f(&Batch { inner: &self.inner })
    }

    /// Publish a snapshot now if anything changed since the last one.
    ///
    /// Returns `true` if a snapshot was published.
    pub fn flush(&self) -> bool {
        self.inner.flush()
    }

    /// Allocate a fresh repository id.
    pub fn next_repository_id(&self) -> RepositoryId {
        RepositoryId(self.inner.next_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Current truth for one repository, read from the repositories store.
    pub fn repository(&self, id: RepositoryId) -> Option<Repository> {
        self.inner
            .repositories
            .state()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub fn find_repository_by_path(&self, path: &Path) -> Option<Repository> {
        self.inner
            .repositories
            .state()
            .iter()
            .find(|r| r.path == path)
            .cloned()
    }

    /// Find a repository whose remote matches `url`, ignoring case, a
    /// trailing slash, and a `.git` suffix.
    pub fn find_repository_by_remote(&self, url: &str) -> Option<Repository> {
        let wanted = normalize_remote_url(url);
        self.inner
            .repositories
            .state()
            .iter()
            .find(|r| {
                r.remote_url
                    .as_deref()
                    .is_some_and(|remote| normalize_remote_url(remote) == wanted)
            })
            .cloned()
    }

    /// Add a repository, or return the existing one at the same path.
    pub fn add_repository(&self, new: NewRepository) -> Repository {
        self.batch(|batch| batch.add_repository(new))
    }

    /// Remove a repository together with its synced data, clearing the
    /// selection if it pointed at it.
    pub fn remove_repository(&self, id: RepositoryId) -> Option<Repository> {
        let removed = self.repository(id)?;
        self.batch(|batch| {
            batch.repositories().update(|repos| repos.retain(|r| r.id != id));
            batch.pull_requests().update(|prs| {
                prs.remove(&id);
            });
            batch.issues().update(|issues| {
                issues.remove(&id);
            });
            if batch.ui().state().selection.repository_id() == Some(id) {
                batch.ui().update(|ui| ui.selection = Selection::None);
            }
        });
        tracing::debug!(repository = %id, "repository removed");
        Some(removed)
    }

    /// Apply handler-requested mutations as one batch.
    pub(crate) fn apply(&self, mutations: Vec<Mutation>) {
        self.batch(|batch| {
            for mutation in mutations {
                match mutation {
                    Mutation::ShowPopup(popup) => batch.ui().update(|ui| ui.popup = Some(popup)),
                    Mutation::ShowBanner(banner) => {
                        batch.ui().update(|ui| ui.banner = Some(banner))
                    }
                    Mutation::PresentError(error) => batch.ui().update(|ui| {
                        ui.push_error(error);
                    }),
                    Mutation::MarkRepositoryMissing(id) => {
                        batch.repositories().update(|repos| {
                            if let Some(repo) = repos.iter_mut().find(|r| r.id == id) {
                                repo.missing = true;
                            }
                        })
                    }
                }
            }
        });
    }
}

/// Builder for an [`AppStore`] with initial contents.
///
/// # Examples
///
/// ```
/// use deskcore::{AppStore, NewRepository};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = AppStore::builder()
///     .repository(NewRepository::new("deskcore", "/src/deskcore"))
///     .open();
/// assert_eq!(store.state().repositories.len(), 1);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct AppStoreBuilder {
    repositories: Vec<NewRepository>,
    accounts: Vec<Account>,
    flags: FeatureFlags,
}

impl AppStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repository(mut self, repository: NewRepository) -> Self {
        self.repositories.push(repository);
        self
    }

    pub fn account(mut self, account: Account) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn flags(mut self, flags: FeatureFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Build the store and start its publisher task.
    ///
    /// Outside a tokio runtime no publisher is started; snapshots are then
    /// only published by explicit [`AppStore::flush`] calls.
    pub fn open(self) -> AppStore {
        let notifier = Arc::new(UpdateNotifier::default());
        let mut next_id = 1;
        let repositories = self
            .repositories
            .into_iter()
            .map(|new| {
                let id = RepositoryId(next_id);
                next_id += 1;
                Repository::from_new(id, new)
            })
            .collect();
        let ui = UiState::with_flags(self.flags);

        let inner = StoreInner {
            accounts: Arc::new(StoreCell::new(
                "accounts",
                self.accounts,
                Arc::clone(&notifier),
            )),
            repositories: StoreCell::new("repositories", repositories, Arc::clone(&notifier)),
            pull_requests: StoreCell::new(
                "pull-requests",
                HashMap::new(),
                Arc::clone(&notifier),
            ),
            issues: StoreCell::new("issues", HashMap::new(), Arc::clone(&notifier)),
            sign_in: StoreCell::new("sign-in", SignInState::Idle, Arc::clone(&notifier)),
            statistics: StoreCell::new("statistics", UsageStats::default(), Arc::clone(&notifier)),
            cloning: StoreCell::new("cloning", Vec::new(), Arc::clone(&notifier)),
            ui: StoreCell::new("ui", ui, Arc::clone(&notifier)),
            notifier: Arc::clone(&notifier),
            snapshot_tx: watch::channel(Arc::new(AppState::default())).0,
            next_id: AtomicU64::new(next_id),
            publisher: Mutex::new(None),
        };
        // The initial snapshot reflects the builder's contents at revision 0.
        inner.snapshot_tx.send_replace(Arc::new(inner.assemble(0)));

        let inner = Arc::new(inner);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(run_publisher(Arc::downgrade(&inner), notifier));
                *inner.publisher.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
            }
            Err(_) => {
                tracing::warn!("no tokio runtime; snapshots publish only on explicit flush");
            }
        }
        AppStore { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Popup, RepositorySection};

    fn store_with_repo() -> AppStore {
        AppStore::builder()
            .repository(
                NewRepository::new("desk", "/src/desk")
                    .with_remote("https://github.com/octo/desk.git"),
            )
            .open()
    }

    #[tokio::test]
    async fn initial_snapshot_contains_builder_contents() {
        let store = AppStore::builder()
            .repository(NewRepository::new("a", "/a"))
            .repository(NewRepository::new("b", "/b"))
            .account(Account::new("octocat", "https://api.github.com"))
            .open();

        let state = store.state();
        assert_eq!(state.revision, 0);
        assert_eq!(state.repositories.len(), 2);
        assert_eq!(state.accounts.len(), 1);
        assert_ne!(state.repositories[0].id, state.repositories[1].id);
    }

    #[tokio::test]
    async fn flush_publishes_only_when_dirty() {
        let store = store_with_repo();
        assert!(!store.flush(), "nothing changed yet");

        store.ui().update(|ui| ui.flags.welcome_flow = true);
        assert!(store.flush());
        assert!(store.state().ui.flags.welcome_flow);
        assert!(!store.flush(), "already published");
    }

    #[tokio::test]
    async fn updates_in_one_turn_are_coalesced_into_one_snapshot() {
        let store = store_with_repo();
        let id = store.state().repositories[0].id;
        let mut rx = store.subscribe();

        // Two constituent stores mutate without yielding in between.
        store.ui().update(|ui| {
            ui.selection = Selection::Repository {
                id,
                section: RepositorySection::Changes,
            }
        });
        store.ui().update(|ui| ui.popup = Some(Popup::PushNeedsPull { repository: id }));
        store
            .statistics()
            .update(|stats| stats.record("push-needs-pull"));

        rx.changed().await.expect("publisher should publish");
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.selection().repository_id(), Some(id));
        assert_eq!(snapshot.popup().map(Popup::kind), Some("push-needs-pull"));
        assert_eq!(snapshot.stats.count("push-needs-pull"), 1);

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(
            !rx.has_changed().expect("sender alive"),
            "no intermediate or duplicate snapshot should follow"
        );
    }

    #[tokio::test]
    async fn published_snapshots_are_never_mutated() {
        let store = store_with_repo();
        let before = store.state();

        store.ui().update(|ui| ui.window.focused = true);
        store.flush();

        assert!(!before.ui.window.focused, "old snapshot must be untouched");
        assert!(store.state().ui.window.focused);
    }

    #[tokio::test]
    async fn cells_are_independent() {
        let store = store_with_repo();
        let repos_before = store.repositories().state();

        store
            .accounts()
            .update(|accounts| accounts.push(Account::new("hubot", "https://api.github.com")));

        assert!(Arc::ptr_eq(&repos_before, &store.repositories().state()));
        assert_eq!(store.accounts().version(), 1);
        assert_eq!(store.repositories().version(), 0);
    }

    #[tokio::test]
    async fn cell_subscription_receives_replacements() {
        let store = store_with_repo();
        let mut rx = store.sign_in().subscribe();

        store.sign_in().replace(SignInState::Authenticating {
            endpoint: "https://api.github.com".into(),
            state: "xyz".into(),
        });

        rx.changed().await.expect("sender alive");
        assert!(matches!(
            **rx.borrow(),
            SignInState::Authenticating { ref state, .. } if state == "xyz"
        ));
    }

    #[tokio::test]
    async fn add_repository_dedupes_by_path() {
        let store = store_with_repo();
        let existing = store.state().repositories[0].clone();

        let again = store.add_repository(NewRepository::new("other-name", "/src/desk"));
        assert_eq!(again.id, existing.id);

        let added = store.add_repository(NewRepository::new("new", "/src/new"));
        assert_ne!(added.id, existing.id);
        assert_eq!(store.repositories().state().len(), 2);
    }

    #[tokio::test]
    async fn find_repository_by_remote_normalizes_urls() {
        let store = store_with_repo();
        let found = store
            .find_repository_by_remote("https://GITHUB.com/octo/desk/")
            .expect("remote should match");
        assert_eq!(found.name, "desk");
        assert!(store.find_repository_by_remote("https://github.com/octo/other").is_none());
    }

    #[tokio::test]
    async fn remove_repository_clears_selection_and_synced_data() {
        let store = store_with_repo();
        let id = store.state().repositories[0].id;
        store.ui().update(|ui| {
            ui.selection = Selection::Repository {
                id,
                section: RepositorySection::History,
            }
        });
        store.pull_requests().update(|prs| {
            prs.insert(id, Vec::new());
        });

        let removed = store.remove_repository(id).expect("repository exists");
        store.flush();

        assert_eq!(removed.id, id);
        let state = store.state();
        assert!(state.repositories.is_empty());
        assert_eq!(state.selection(), Selection::None);
        assert!(!state.pull_requests.contains_key(&id));
        assert!(store.remove_repository(id).is_none());
    }

    #[tokio::test]
    async fn apply_lands_all_mutations_in_one_snapshot() {
        let store = store_with_repo();
        let id = store.state().repositories[0].id;
        let revision_before = store.state().revision;

        store.apply(vec![
            Mutation::MarkRepositoryMissing(id),
            Mutation::PresentError(crate::AppError::network("offline")),
        ]);
        assert!(store.flush());
        assert!(!store.flush());

        let state = store.state();
        assert!(state.revision > revision_before);
        assert!(state.repositories[0].missing);
        assert_eq!(state.ui.errors.len(), 1);
    }

    #[test]
    fn open_without_runtime_still_publishes_on_flush() {
        let store = store_with_repo();
        store.ui().update(|ui| ui.flags.auto_switch_theme = true);
        assert!(store.flush());
        assert!(store.state().ui.flags.auto_switch_theme);
    }

    #[test]
    fn builder_flags_land_in_the_initial_snapshot() {
        let store = AppStore::builder()
            .flags(FeatureFlags {
                welcome_flow: true,
                ..FeatureFlags::default()
            })
            .open();

        let state = store.state();
        assert!(state.ui.flags.welcome_flow);
        assert!(state.ui.errors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batches_are_never_observed_half_applied_across_threads() {
        let store = AppStore::builder().open();
        let mut updates = store.subscribe();

        let writer = {
            let store = store.clone();
            tokio::task::spawn_blocking(move || {
                for n in 1..=2000u64 {
                    store.batch(|batch| {
                        batch.statistics().update(|stats| stats.record("paired"));
                        batch.ui().update(|ui| ui.flags.welcome_flow = n % 2 == 1);
                    });
                }
            })
        };

        let mut seen = 0;
        loop {
            let snapshot = updates.borrow_and_update().clone();
            // Odd counts always come with the flag set, even counts without.
            let count = snapshot.stats.count("paired");
            assert_eq!(
                snapshot.ui.flags.welcome_flow,
                count % 2 == 1,
                "torn snapshot at revision {}",
                snapshot.revision
            );
            seen += 1;
            if count == 2000 {
                break;
            }
            if updates.changed().await.is_err() {
                break;
            }
        }
        writer.await.expect("writer should not panic");
        assert!(seen > 0);
        assert!(!store.flush(), "the publisher already caught up");
    }
}
