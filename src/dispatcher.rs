//! The dispatcher: single entry point for application-level operations.
//!
//! Every operation runs against the [`AppStore`] and the injected backends.
//! A failure is threaded through the [`HandlerChain`] in registration order;
//! whatever no handler claims is reported as fatal through the [`Reporter`].
//! Each error ends in exactly one [`ErrorOutcome`].

use std::future::Future;
use std::sync::Arc;

use tracing::Instrument;

use crate::backend::{CloneProgress, MemoryTokenStore, RepositoryBackend, SignInBackend, TokenStore};
use crate::cache::{Generations, StateCache};
use crate::command::{DispatchContext, Operation, RepositoryOperation};
use crate::config::DispatcherConfig;
use crate::crash::{ErrorSink, FatalSignal, RejectionOutcome, Reporter};
use crate::error::{AppError, ErrorOutcome};
use crate::handler::{ChainOutcome, ErrorHandler, HandlerChain};
use crate::handlers::default_handlers;
use crate::lifecycle::UrlAction;
use crate::model::{CloningRepository, RepositoryId, token_service};
use crate::state::{AppState, Banner, Popup, RepositorySection, Selection, SignInState, WindowMode};
use crate::store::{AppStore, Batch, Store};

struct DispatcherInner {
    store: AppStore,
    cache: StateCache,
    chain: HandlerChain,
    reporter: Reporter,
    backend: Option<Arc<dyn RepositoryBackend>>,
    sign_in: Option<Arc<dyn SignInBackend>>,
    tokens: Arc<dyn TokenStore>,
    pull_request_generations: Generations<RepositoryId>,
    issue_generations: Generations<RepositoryId>,
    config: DispatcherConfig,
}

/// Routes operations, sequences their effects on the stores, and owns the
/// error handler chain.
///
/// `Clone` is cheap; clones share everything.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.inner.chain)
            .field("reporting", &self.inner.config.reporting)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Dispatcher`].
///
/// Error handlers can only be registered here, so the chain is fixed once
/// the dispatcher exists.
///
/// # Examples
///
/// ```
/// use deskcore::{AppStore, DispatcherBuilder, DispatcherConfig, Operation};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let dispatcher = DispatcherBuilder::new(AppStore::builder().open())
///     .config(DispatcherConfig::default())
///     .with_default_handlers()
///     .build();
///
/// dispatcher
///     .dispatch(Operation::SetWelcomeFlow(true))
///     .await
///     .expect("flag update should succeed");
/// assert!(dispatcher.state().ui.flags.welcome_flow);
/// # }
/// ```
pub struct DispatcherBuilder {
    store: AppStore,
    backend: Option<Arc<dyn RepositoryBackend>>,
    sign_in: Option<Arc<dyn SignInBackend>>,
    tokens: Option<Arc<dyn TokenStore>>,
    sink: Option<Arc<dyn ErrorSink>>,
    config: DispatcherConfig,
    chain: HandlerChain,
}

impl DispatcherBuilder {
    pub fn new(store: AppStore) -> Self {
        Self {
            store,
            backend: None,
            sign_in: None,
            tokens: None,
            sink: None,
            config: DispatcherConfig::default(),
            chain: HandlerChain::new(),
        }
    }

    pub fn backend(mut self, backend: Arc<dyn RepositoryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn sign_in_backend(mut self, backend: Arc<dyn SignInBackend>) -> Self {
        self.sign_in = Some(backend);
        self
    }

    /// Credential storage for account tokens. Defaults to a
    /// [`MemoryTokenStore`].
    pub fn token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Where unrecovered and non-fatal errors are reported. Without a sink,
    /// reports are only logged.
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Append a handler to the chain.
    ///
    /// # Arguments
    ///
    /// * `handler` - Tried after every handler registered before it. There
    ///   is no de-duplication.
    ///
    /// # Returns
    ///
    /// The updated builder.
    pub fn register_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.chain.register(Arc::new(handler));
        self
    }

    /// Append the built-in handlers from [`handlers`](crate::handlers).
    pub fn with_default_handlers(mut self) -> Self {
        for handler in default_handlers() {
            self.chain.register(handler);
        }
        self
    }

    pub fn build(self) -> Dispatcher {
        let reporter = Reporter::new(&self.config, self.sink, self.store.subscribe());
        let cache = StateCache::new(self.store.shared_accounts());
        tracing::info!(
            handlers = self.chain.len(),
            development = self.config.is_development(),
            "dispatcher ready"
        );
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                store: self.store,
                cache,
                chain: self.chain,
                reporter,
                backend: self.backend,
                sign_in: self.sign_in,
                tokens: self
                    .tokens
                    .unwrap_or_else(|| Arc::new(MemoryTokenStore::new())),
                pull_request_generations: Generations::new(),
                issue_generations: Generations::new(),
                config: self.config,
            }),
        }
    }
}

impl Dispatcher {
    pub fn builder(store: AppStore) -> DispatcherBuilder {
        DispatcherBuilder::new(store)
    }

    pub fn store(&self) -> &AppStore {
        &self.inner.store
    }

    pub fn cache(&self) -> &StateCache {
        &self.inner.cache
    }

    pub fn reporter(&self) -> &Reporter {
        &self.inner.reporter
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// The current published snapshot.
    pub fn state(&self) -> Arc<AppState> {
        self.inner.store.state()
    }

    /// Names of the registered error handlers, in precedence order.
    pub fn handler_names(&self) -> Vec<String> {
        self.inner.chain.names().map(str::to_owned).collect()
    }

    pub fn subscribe_fatal(&self) -> tokio::sync::watch::Receiver<Option<Arc<FatalSignal>>> {
        self.inner.reporter.subscribe_fatal()
    }

    /// Execute an operation.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the operation succeeded.
    ///
    /// # Errors
    ///
    /// The [`ErrorOutcome`] of the failure. A failure a handler recovered
    /// from is still an `Err` ([`ErrorOutcome::Recovered`]) so callers can
    /// tell the operation did not happen.
    pub async fn dispatch(&self, operation: Operation) -> Result<(), ErrorOutcome> {
        let name = operation.name();
        let ctx = self.context_for(&operation);
        let span = tracing::info_span!("dispatch", operation = name);
        let result = self.execute(operation).instrument(span).await;
        self.settle(result, ctx)
    }

    /// Run any fallible work through the same error path as
    /// [`dispatch`](Self::dispatch).
    pub async fn perform<T, F>(&self, ctx: DispatchContext, work: F) -> Result<T, ErrorOutcome>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        let result = work.await;
        match result {
            Ok(value) => {
                self.inner.store.flush();
                Ok(value)
            }
            Err(error) => Err(self.post_error(error, ctx)),
        }
    }

    /// Thread an error through the handler chain.
    ///
    /// A claimed error has its handler's mutations applied as one batch.
    /// An unclaimed one is reported as fatal, with the crash context built
    /// from the snapshot as of this call, and raises the fatal signal.
    pub fn post_error(&self, error: AppError, ctx: DispatchContext) -> ErrorOutcome {
        let kind = error.kind().to_owned();
        match self.inner.chain.run(error, &ctx) {
            ChainOutcome::Handled { handler, mutations } => {
                self.inner.store.apply(mutations);
                self.inner.store.flush();
                tracing::info!(handler = %handler, kind = %kind, operation = ctx.operation, "error recovered");
                ErrorOutcome::Recovered { handler }
            }
            ChainOutcome::Unhandled(error) => {
                self.inner.store.flush();
                tracing::warn!(kind = error.kind(), operation = ctx.operation, "error unclaimed by every handler");
                self.inner.reporter.report_fatal(&error);
                ErrorOutcome::Escalated {
                    kind: error.kind().to_owned(),
                }
            }
        }
    }

    /// Report an error as non-fatal without consulting the chain.
    pub fn report_non_fatal(&self, error: &AppError) -> ErrorOutcome {
        self.inner.store.flush();
        self.inner.reporter.report_non_fatal(error);
        ErrorOutcome::ReportedNonFatal
    }

    /// Record an unhandled asynchronous rejection.
    pub fn record_unhandled_rejection(&self, message: impl Into<String>) -> RejectionOutcome {
        self.inner.store.flush();
        self.inner.reporter.record_unhandled_rejection(message)
    }

    pub fn set_app_focus_state(&self, focused: bool) {
        self.inner.store.ui().update(|ui| ui.window.focused = focused);
        self.inner.store.flush();
    }

    pub fn set_access_key_highlight_state(&self, highlighted: bool) {
        self.inner
            .store
            .ui()
            .update(|ui| ui.window.access_key_highlight = highlighted);
        self.inner.store.flush();
    }

    pub fn set_window_mode(&self, mode: WindowMode) {
        self.inner.store.ui().update(|ui| ui.window.mode = mode);
        self.inner.store.flush();
    }

    /// Set the window zoom factor. Non-finite or non-positive factors are
    /// ignored.
    pub fn set_zoom_factor(&self, zoom_factor: f64) {
        if !zoom_factor.is_finite() || zoom_factor <= 0.0 {
            tracing::warn!(zoom_factor, "ignoring invalid zoom factor");
            return;
        }
        self.inner
            .store
            .ui()
            .update(|ui| ui.window.zoom_factor = zoom_factor);
        self.inner.store.flush();
    }

    /// Re-synchronise one repository's working tree status.
    ///
    /// The refresh is initiated when this is called, not when the returned
    /// future is first polled. If several refreshes of the same repository
    /// race, only the result of the most recently initiated one is applied.
    /// A successful refresh clears the repository's `missing` flag.
    pub fn refresh_repository(
        &self,
        id: RepositoryId,
    ) -> impl Future<Output = Result<(), ErrorOutcome>> + Send + 'static {
        let generation = self.inner.cache.begin_refresh(id);
        let this = self.clone();
        async move {
            let Some(repository) = this.inner.store.repository(id) else {
                tracing::debug!("refresh skipped: repository not found");
                return Ok(());
            };
            let ctx = DispatchContext::new("refresh")
                .with_repository(repository.clone())
                .in_background();
            let backend = match this.backend() {
                Ok(backend) => backend,
                Err(error) => return Err(this.post_error(error, ctx)),
            };

            match backend.refresh(&repository).await {
                Ok(status) => {
                    if this.inner.cache.complete_refresh(id, generation, status) {
                        this.clear_missing(id);
                    }
                    this.inner.store.flush();
                    Ok(())
                }
                Err(error) if !this.inner.cache.is_current_refresh(id, generation) => {
                    tracing::debug!(kind = error.kind(), "discarding error from superseded refresh");
                    Ok(())
                }
                Err(error) => Err(this.post_error(error, ctx)),
            }
        }
        .instrument(tracing::debug_span!("refresh", repository = %id, generation))
    }

    /// Reload the open pull requests of a repository. Last initiated wins.
    pub fn refresh_pull_requests(
        &self,
        id: RepositoryId,
    ) -> impl Future<Output = Result<(), ErrorOutcome>> + Send + 'static {
        let generation = self.inner.pull_request_generations.begin(id);
        let this = self.clone();
        async move {
            let Some(repository) = this.inner.store.repository(id) else {
                return Ok(());
            };
            let ctx = DispatchContext::new("refresh-pull-requests")
                .with_repository(repository.clone())
                .in_background();
            let backend = match this.backend() {
                Ok(backend) => backend,
                Err(error) => return Err(this.post_error(error, ctx)),
            };

            let result = backend.pull_requests(&repository).await;
            let store = &this.inner.store;
            let settled = this.inner.pull_request_generations.apply_if_current(&id, generation, || {
                result.map(|pull_requests| {
                    store.pull_requests().update(|prs| {
                        prs.insert(id, pull_requests);
                    })
                })
            });
            match settled {
                None => {
                    tracing::debug!("discarding superseded pull request refresh");
                    Ok(())
                }
                Some(Ok(())) => {
                    store.flush();
                    Ok(())
                }
                Some(Err(error)) => Err(this.post_error(error, ctx)),
            }
        }
        .instrument(tracing::debug_span!("refresh_pull_requests", repository = %id, generation))
    }

    /// Reload the open issues of a repository. Last initiated wins.
    pub fn refresh_issues(
        &self,
        id: RepositoryId,
    ) -> impl Future<Output = Result<(), ErrorOutcome>> + Send + 'static {
        let generation = self.inner.issue_generations.begin(id);
        let this = self.clone();
        async move {
            let Some(repository) = this.inner.store.repository(id) else {
                return Ok(());
            };
            let ctx = DispatchContext::new("refresh-issues")
                .with_repository(repository.clone())
                .in_background();
            let backend = match this.backend() {
                Ok(backend) => backend,
                Err(error) => return Err(this.post_error(error, ctx)),
            };

            let result = backend.issues(&repository).await;
            let store = &this.inner.store;
            let settled = this.inner.issue_generations.apply_if_current(&id, generation, || {
                result.map(|issues| {
                    store.issues().update(|all| {
                        all.insert(id, issues);
                    })
                })
            });
            match settled {
                None => {
                    tracing::debug!("discarding superseded issue refresh");
                    Ok(())
                }
                Some(Ok(())) => {
                    store.flush();
                    Ok(())
                }
                Some(Err(error)) => Err(this.post_error(error, ctx)),
            }
        }
        .instrument(tracing::debug_span!("refresh_issues", repository = %id, generation))
    }

    /// Route an external activation to the matching operation.
    ///
    /// Unknown actions are logged and dropped.
    pub async fn dispatch_url_action(&self, action: UrlAction) -> Result<(), ErrorOutcome> {
        match action {
            UrlAction::Oauth { code, state } => {
                self.dispatch(Operation::CompleteSignIn { code, state }).await
            }
            UrlAction::OpenRepositoryFromUrl { url, branch, .. } => {
                match self.inner.store.find_repository_by_remote(&url) {
                    Some(repository) => {
                        self.dispatch(Operation::SelectRepository(repository.id)).await?;
                        match branch {
                            Some(branch) => {
                                self.dispatch(Operation::Repository {
                                    repository: repository.id,
                                    operation: RepositoryOperation::Checkout { branch },
                                    background: false,
                                })
                                .await
                            }
                            None => Ok(()),
                        }
                    }
                    None => self.dispatch(Operation::ShowPopup(Popup::CloneRepository { url })).await,
                }
            }
            UrlAction::OpenRepositoryFromPath { path } => {
                match self.inner.store.find_repository_by_path(&path) {
                    Some(repository) => self.dispatch(Operation::SelectRepository(repository.id)).await,
                    None => self.dispatch(Operation::ShowPopup(Popup::AddRepository { path })).await,
                }
            }
            UrlAction::Unknown { name } => {
                tracing::warn!(action = %name, "dropping unknown url action");
                Ok(())
            }
        }
    }

    fn settle(&self, result: Result<(), AppError>, ctx: DispatchContext) -> Result<(), ErrorOutcome> {
        let settled = match result {
            Ok(()) => Ok(()),
            Err(error) => Err(self.post_error(error, ctx)),
        };
        self.inner.store.flush();
        settled
    }

    fn context_for(&self, operation: &Operation) -> DispatchContext {
        let ctx = DispatchContext::new(operation.name());
        match operation {
            Operation::Repository {
                repository,
                background,
                ..
            } => {
                let ctx = match self.inner.store.repository(*repository) {
                    Some(repository) => ctx.with_repository(repository),
                    None => ctx,
                };
                if *background { ctx.in_background() } else { ctx }
            }
            Operation::SignOut { login, endpoint } => {
                let account = self
                    .inner
                    .store
                    .accounts()
                    .state()
                    .iter()
                    .find(|a| &a.login == login && &a.endpoint == endpoint)
                    .cloned();
                match account {
                    Some(account) => ctx.with_account(account),
                    None => ctx,
                }
            }
            _ => ctx,
        }
    }

    fn backend(&self) -> Result<Arc<dyn RepositoryBackend>, AppError> {
        self.inner
            .backend
            .clone()
            .ok_or_else(|| AppError::unexpected("BackendUnavailable", "no repository backend configured"))
    }

    fn clear_missing(&self, id: RepositoryId) {
        let store = &self.inner.store;
        if store.repository(id).is_some_and(|r| r.missing) {
            store.repositories().update(|repos| {
                if let Some(repo) = repos.iter_mut().find(|r| r.id == id) {
                    repo.missing = false;
                }
            });
            tracing::info!(repository = %id, "repository found again");
        }
    }

    fn record_usage(batch: &Batch<'_>, metric: &str) {
        batch.statistics().update(|stats| stats.record(metric));
    }

    async fn execute(&self, operation: Operation) -> Result<(), AppError> {
        let store = &self.inner.store;
        tracing::debug!("dispatching");
        match operation {
            Operation::SelectRepository(id) => {
                self.select(id);
                Ok(())
            }
            Operation::SetRepositorySection(section) => {
                store.ui().update(|ui| {
                    if let Selection::Repository { id, .. } = ui.selection {
                        ui.selection = Selection::Repository { id, section };
                    }
                });
                Ok(())
            }
            Operation::ShowPopup(popup) => {
                store.ui().update(|ui| ui.popup = Some(popup));
                Ok(())
            }
            Operation::ClosePopup => {
                store.ui().update(|ui| ui.popup = None);
                Ok(())
            }
            Operation::ShowBanner(banner) => {
                store.ui().update(|ui| ui.banner = Some(banner));
                Ok(())
            }
            Operation::ClearBanner => {
                store.ui().update(|ui| ui.banner = None);
                Ok(())
            }
            Operation::ShowFoldout(foldout) => {
                store.ui().update(|ui| ui.foldout = Some(foldout));
                Ok(())
            }
            Operation::CloseFoldout => {
                store.ui().update(|ui| ui.foldout = None);
                Ok(())
            }
            Operation::PresentError(error) => {
                store.ui().update(|ui| {
                    ui.push_error(error);
                });
                Ok(())
            }
            Operation::ClearError(id) => {
                store.ui().update(|ui| {
                    if !ui.clear_error(id) {
                        tracing::debug!(error_id = id, "error already cleared");
                    }
                });
                Ok(())
            }
            Operation::AddRepository(new) => {
                store.batch(|batch| {
                    let repository = batch.add_repository(new);
                    Self::select_in(batch, repository.id);
                    Self::record_usage(batch, "add-repository");
                });
                Ok(())
            }
            Operation::RemoveRepository(id) => {
                if store.remove_repository(id).is_some() {
                    self.inner.cache.forget(id);
                    self.inner.pull_request_generations.forget(&id);
                    self.inner.issue_generations.forget(&id);
                }
                Ok(())
            }
            Operation::Repository {
                repository,
                operation,
                ..
            } => self.run_repository_operation(repository, operation).await,
            Operation::CloneRepository { url, path } => self.clone_repository(url, path).await,
            Operation::BeginSignIn { endpoint } => {
                let state = uuid::Uuid::new_v4().simple().to_string();
                store.batch(|batch| {
                    batch.sign_in().replace(SignInState::Authenticating { endpoint, state });
                    batch.ui().update(|ui| ui.popup = Some(Popup::SignIn));
                });
                Ok(())
            }
            Operation::CompleteSignIn { code, state } => self.complete_sign_in(code, state).await,
            Operation::SignOut { login, endpoint } => {
                // The account stays signed in unless its token is gone.
                self.inner.tokens.delete(&token_service(&endpoint), &login)?;
                store.accounts().update(|accounts| {
                    accounts.retain(|a| !(a.login == login && a.endpoint == endpoint));
                });
                tracing::info!(%login, %endpoint, "signed out");
                Ok(())
            }
            Operation::SetWelcomeFlow(enabled) => {
                store.ui().update(|ui| ui.flags.welcome_flow = enabled);
                Ok(())
            }
            Operation::SetAutoSwitchTheme(enabled) => {
                store.ui().update(|ui| ui.flags.auto_switch_theme = enabled);
                Ok(())
            }
        }
    }

    fn select(&self, id: RepositoryId) {
        self.inner.store.batch(|batch| Self::select_in(batch, id));
    }

    fn select_in(batch: &Batch<'_>, id: RepositoryId) {
        let selection = if batch.repositories().state().iter().any(|r| r.id == id) {
            let section = match batch.ui().state().selection {
                Selection::Repository { id: current, section } if current == id => section,
                _ => RepositorySection::default(),
            };
            Selection::Repository { id, section }
        } else if batch.cloning().state().iter().any(|c| c.id == id) {
            Selection::CloningRepository { id }
        } else {
            tracing::warn!(repository = %id, "cannot select unknown repository");
            return;
        };
        batch.ui().update(|ui| ui.selection = selection);
    }

    async fn run_repository_operation(
        &self,
        id: RepositoryId,
        operation: RepositoryOperation,
    ) -> Result<(), AppError> {
        let repository = self
            .inner
            .store
            .repository(id)
            .ok_or_else(|| AppError::unexpected("UnknownRepository", format!("no repository with id {id}")))?;
        self.backend()?.execute(&repository, &operation).await?;

        let merge_banner = match &operation {
            RepositoryOperation::Merge { branch } => Some(Banner::SuccessfulMerge {
                our_branch: self
                    .inner
                    .cache
                    .status(id)
                    .and_then(|status| status.current_branch)
                    .unwrap_or_else(|| "HEAD".to_owned()),
                their_branch: Some(branch.clone()),
            }),
            _ => None,
        };
        self.inner.store.batch(|batch| {
            Self::record_usage(batch, operation.name());
            if let Some(banner) = merge_banner {
                batch.ui().update(|ui| ui.banner = Some(banner));
            }
        });

        let changes_working_tree = matches!(
            operation,
            RepositoryOperation::Fetch
                | RepositoryOperation::Pull
                | RepositoryOperation::Push
                | RepositoryOperation::Merge { .. }
                | RepositoryOperation::Rebase { .. }
                | RepositoryOperation::Checkout { .. }
        );
        if changes_working_tree {
            // Refresh failures go through their own error path.
            let _ = self.refresh_repository(id).await;
        }
        Ok(())
    }

    async fn clone_repository(&self, url: String, path: std::path::PathBuf) -> Result<(), AppError> {
        let store = &self.inner.store;
        let backend = self.backend()?;
        let id = store.next_repository_id();
        store.batch(|batch| {
            batch.cloning().update(|cloning| {
                cloning.push(CloningRepository {
                    id,
                    url: url.clone(),
                    path: path.clone(),
                    progress: 0.0,
                })
            });
            batch.ui().update(|ui| ui.selection = Selection::CloningRepository { id });
        });
        store.flush();
        tracing::info!(clone = %id, %url, "clone started");

        let result = backend
            .clone_repository(&url, &path, CloneProgress::new(store.clone(), id))
            .await;

        let repository = store.batch(|batch| {
            let cloned = result.map(|new| batch.add_repository(new));
            batch.cloning().update(|cloning| cloning.retain(|c| c.id != id));
            batch.ui().update(|ui| {
                if ui.selection == (Selection::CloningRepository { id }) {
                    ui.selection = match &cloned {
                        Ok(repository) => Selection::Repository {
                            id: repository.id,
                            section: RepositorySection::default(),
                        },
                        Err(_) => Selection::None,
                    };
                }
            });
            if cloned.is_ok() {
                Self::record_usage(batch, "clone");
            }
            cloned
        })?;
        tracing::info!(clone = %id, repository = %repository.id, "clone finished");
        Ok(())
    }

    async fn complete_sign_in(&self, code: String, state: String) -> Result<(), AppError> {
        let store = &self.inner.store;
        let endpoint = match &*store.sign_in().state() {
            SignInState::Authenticating {
                endpoint,
                state: expected,
            } if *expected == state => endpoint.clone(),
            _ => {
                tracing::warn!("dropping oauth callback that matches no pending sign-in");
                return Ok(());
            }
        };
        let sign_in = self
            .inner
            .sign_in
            .clone()
            .ok_or_else(|| AppError::unexpected("SignInUnavailable", "no sign-in backend configured"))?;

        let signed_in = match sign_in.exchange_code(&endpoint, &code).await {
            Ok(signed_in) => signed_in,
            Err(error) => {
                store.sign_in().replace(SignInState::Idle);
                return Err(error);
            }
        };

        // A newer sign-in may have started while the code was exchanged.
        let still_pending = matches!(
            &*store.sign_in().state(),
            SignInState::Authenticating { state: current, .. } if *current == state
        );
        if !still_pending {
            tracing::warn!("discarding superseded sign-in result");
            return Ok(());
        }

        let account = signed_in.account;
        self.inner
            .tokens
            .set(&account.token_service(), &account.login, &signed_in.token)?;
        store.batch(|batch| {
            batch.accounts().update(|accounts| {
                accounts.retain(|a| !(a.login == account.login && a.endpoint == account.endpoint));
                accounts.push(account.clone());
            });
            batch.sign_in().replace(SignInState::Idle);
            batch.ui().update(|ui| {
                if ui.popup == Some(Popup::SignIn) {
                    ui.popup = None;
                }
            });
            Self::record_usage(batch, "sign-in");
        });
        tracing::info!(login = %account.login, endpoint = %account.endpoint, "signed in");
        Ok(())
    }
}
