//! End-to-end behaviour of the dispatcher, its error handler chain and the
//! state aggregate, through the public API only.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deskcore::{
    AppError, AppState, AppStore, Banner, CloneProgress, CrashContext, CrashEnvironment,
    DispatchContext, Dispatcher, DispatcherBuilder, DispatcherConfig, ErrorOutcome, ErrorSink, HandlerFault, Issue,
    LifecycleSignal, Mutation, NewRepository, Operation, Popup, PullRequest, Repository,
    RepositoryBackend, RepositoryId, RepositoryOperation, RepositoryStatus, Resolution, Selection, UrlAction,
    capture_crash_context, handler_fn, spawn_lifecycle_sync,
};
use tokio::sync::oneshot;

#[derive(Default)]
struct Sink {
    reports: Mutex<Vec<(AppError, CrashContext, bool)>>,
}

impl Sink {
    fn reports(&self) -> Vec<(AppError, CrashContext, bool)> {
        self.reports.lock().expect("sink lock").clone()
    }
}

impl ErrorSink for Sink {
    fn report(&self, error: &AppError, context: &CrashContext, non_fatal: bool) {
        self.reports
            .lock()
            .expect("sink lock")
            .push((error.clone(), context.clone(), non_fatal));
    }
}

/// Backend whose push result and refresh results are scripted per test.
#[derive(Default)]
struct Backend {
    push_error: Mutex<Option<AppError>>,
    refreshes: Mutex<VecDeque<(oneshot::Receiver<()>, RepositoryStatus)>>,
}

impl Backend {
    fn failing_push(error: AppError) -> Self {
        Self {
            push_error: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    fn gated_refresh(&self, branch: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.refreshes.lock().expect("lock").push_back((
            rx,
            RepositoryStatus {
                current_branch: Some(branch.to_owned()),
                ..RepositoryStatus::default()
            },
        ));
        tx
    }
}

#[async_trait]
impl RepositoryBackend for Backend {
    async fn refresh(&self, _repository: &Repository) -> Result<RepositoryStatus, AppError> {
        let scripted = self.refreshes.lock().expect("lock").pop_front();
        match scripted {
            Some((gate, status)) => {
                let _ = gate.await;
                Ok(status)
            }
            None => Ok(RepositoryStatus::default()),
        }
    }

    async fn execute(
        &self,
        _repository: &Repository,
        operation: &RepositoryOperation,
    ) -> Result<(), AppError> {
        match (operation, self.push_error.lock().expect("lock").clone()) {
            (RepositoryOperation::Push, Some(error)) => Err(error),
            _ => Ok(()),
        }
    }

    async fn clone_repository(
        &self,
        url: &str,
        path: &Path,
        progress: CloneProgress,
    ) -> Result<NewRepository, AppError> {
        progress.report(1.0);
        Ok(NewRepository::new("cloned", path).with_remote(url))
    }

    async fn pull_requests(&self, _repository: &Repository) -> Result<Vec<PullRequest>, AppError> {
        Ok(Vec::new())
    }

    async fn issues(&self, _repository: &Repository) -> Result<Vec<Issue>, AppError> {
        Ok(Vec::new())
    }
}

struct App {
    dispatcher: Dispatcher,
    sink: Arc<Sink>,
    backend: Arc<Backend>,
}

fn app(backend: Backend, register: impl FnOnce(DispatcherBuilder) -> DispatcherBuilder) -> App {
    let store = AppStore::builder()
        .repository(
            NewRepository::new("desk", "/src/desk")
                .with_remote("https://github.com/octo/desk.git"),
        )
        .open();
    let sink = Arc::new(Sink::default());
    let backend = Arc::new(backend);
    let builder = Dispatcher::builder(store)
        .config(DispatcherConfig {
            install_id: "install-under-test".into(),
            ..DispatcherConfig::default()
        })
        .backend(Arc::clone(&backend) as Arc<dyn RepositoryBackend>)
        .error_sink(Arc::clone(&sink) as Arc<dyn ErrorSink>);
    App {
        dispatcher: register(builder).build(),
        sink,
        backend,
    }
}

fn repo_id(app: &App) -> RepositoryId {
    app.dispatcher.state().repositories[0].id
}

fn push(app: &App) -> Operation {
    Operation::Repository {
        repository: repo_id(app),
        operation: RepositoryOperation::Push,
        background: false,
    }
}

#[tokio::test]
async fn push_rejected_for_newer_commits_opens_popup_and_skips_sink() {
    let app = app(Backend::failing_push(AppError::PushNeedsPull), |b| b.with_default_handlers());
    let repo = repo_id(&app);

    let outcome = app.dispatcher.dispatch(push(&app)).await;

    assert!(matches!(outcome, Err(ErrorOutcome::Recovered { .. })));
    assert_eq!(
        app.dispatcher.state().popup(),
        Some(&Popup::PushNeedsPull { repository: repo })
    );
    assert!(app.sink.reports().is_empty());
}

#[tokio::test]
async fn unrecognised_error_reaches_sink_once_as_fatal_with_context() {
    let app = app(
        Backend::failing_push(AppError::unexpected("DiskFull", "no space left on device")),
        |b| b.with_default_handlers(),
    );
    let mut fatal = app.dispatcher.subscribe_fatal();

    let outcome = app.dispatcher.dispatch(push(&app)).await;

    assert_eq!(
        outcome,
        Err(ErrorOutcome::Escalated {
            kind: "DiskFull".into()
        })
    );
    let reports = app.sink.reports();
    assert_eq!(reports.len(), 1);
    let (error, context, non_fatal) = &reports[0];
    assert_eq!(error.kind(), "DiskFull");
    assert!(!non_fatal);
    assert!(!context.is_empty());
    assert_eq!(context.get("repository_count"), Some("1"));
    assert!(context.get("os").is_some());
    assert_eq!(context.get("install_id"), Some("install-under-test"));

    assert!(fatal.has_changed().expect("reporter alive"));
    let signal = fatal.borrow_and_update().clone().expect("fatal signal raised");
    assert_eq!(signal.error.kind(), "DiskFull");
}

#[tokio::test]
async fn first_registered_handler_takes_precedence() {
    let invoked_b = Arc::new(Mutex::new(false));
    let seen = Arc::clone(&invoked_b);
    let app = app(Backend::failing_push(AppError::PushNeedsPull), move |b| {
        b.register_error_handler(handler_fn("a", |error, _| {
            Ok(match error {
                AppError::PushNeedsPull => Resolution::Handled(vec![Mutation::ShowBanner(
                    Banner::UpdateAvailable {
                        version: "from-a".into(),
                    },
                )]),
                _ => Resolution::Pass,
            })
        }))
        .register_error_handler(handler_fn("b", move |error, _| {
            *seen.lock().expect("lock") = true;
            Ok(match error {
                AppError::PushNeedsPull => Resolution::Handled(vec![Mutation::ShowBanner(
                    Banner::UpdateAvailable {
                        version: "from-b".into(),
                    },
                )]),
                _ => Resolution::Pass,
            })
        }))
    });

    let outcome = app.dispatcher.dispatch(push(&app)).await;

    assert_eq!(outcome, Err(ErrorOutcome::Recovered { handler: "a".into() }));
    assert_eq!(
        app.dispatcher.state().banner(),
        Some(&Banner::UpdateAvailable {
            version: "from-a".into()
        })
    );
    assert!(!*invoked_b.lock().expect("lock"), "b is never invoked");
}

#[tokio::test]
async fn faulting_handler_never_masks_the_original_error() {
    let app = app(
        Backend::failing_push(AppError::unexpected("DiskFull", "no space left on device")),
        |b| {
            b.register_error_handler(handler_fn("broken", |_, _| {
                Err(HandlerFault::new("broken", "could not decide"))
            }))
            .register_error_handler(handler_fn("exploding", |_, _| -> Result<Resolution, HandlerFault> {
                panic!("handler bug")
            }))
            .with_default_handlers()
        },
    );

    let outcome = app.dispatcher.dispatch(push(&app)).await;

    assert_eq!(
        outcome,
        Err(ErrorOutcome::Escalated {
            kind: "DiskFull".into()
        })
    );
    let reports = app.sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].0,
        AppError::unexpected("DiskFull", "no space left on device")
    );
}

#[tokio::test]
async fn last_initiated_refresh_wins_regardless_of_completion_order() {
    let app = app(Backend::default(), |b| b.with_default_handlers());
    let repo = repo_id(&app);
    let first_gate = app.backend.gated_refresh("first");
    let second_gate = app.backend.gated_refresh("second");

    // Each refresh takes the next scripted result once it first runs.
    let first = tokio::spawn(app.dispatcher.refresh_repository(repo));
    tokio::task::yield_now().await;
    let second = tokio::spawn(app.dispatcher.refresh_repository(repo));
    tokio::task::yield_now().await;

    // The older refresh completes last.
    second_gate.send(()).expect("second refresh pending");
    second.await.expect("join").expect("refresh");
    first_gate.send(()).expect("first refresh pending");
    first.await.expect("join").expect("refresh");

    let status = app.dispatcher.cache().status(repo).expect("status applied");
    assert_eq!(status.current_branch.as_deref(), Some("second"));
}

#[tokio::test]
async fn same_turn_mutations_are_observed_as_one_snapshot() {
    let app = app(Backend::default(), |b| b.with_default_handlers());
    let repo = repo_id(&app);
    let store = app.dispatcher.store();
    let mut updates = store.subscribe();

    // Operation A opens a popup, operation B changes the selection; neither
    // yields in between.
    store
        .ui()
        .update(|ui| ui.popup = Some(Popup::PushNeedsPull { repository: repo }));
    store.ui().update(|ui| {
        ui.selection = Selection::Repository {
            id: repo,
            section: Default::default(),
        }
    });

    updates.changed().await.expect("store alive");
    let snapshot = updates.borrow_and_update().clone();
    assert_eq!(snapshot.selection().repository_id(), Some(repo));
    assert!(snapshot.popup().is_some());

    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(!updates.has_changed().expect("store alive"));
}

#[test]
fn empty_snapshot_produces_only_baseline_crash_keys() {
    let environment = CrashEnvironment {
        os: "linux-x86_64".into(),
        install_id: "install-1".into(),
    };
    let context = capture_crash_context(Some(&AppState::default()), &environment, None);
    let keys: Vec<_> = context.keys().collect();
    assert_eq!(keys, ["install_id", "os"]);
}

#[tokio::test]
async fn lifecycle_signals_drive_the_dispatcher() {
    let app = app(Backend::default(), |b| b.with_default_handlers());
    let repo = repo_id(&app);
    let lifecycle = spawn_lifecycle_sync(app.dispatcher.clone());

    lifecycle.send(LifecycleSignal::Focus).await.expect("send");
    lifecycle
        .send(LifecycleSignal::UrlAction(UrlAction::OpenRepositoryFromUrl {
            url: "https://github.com/octo/desk".into(),
            branch: None,
            pr: None,
            filepath: None,
        }))
        .await
        .expect("send");
    lifecycle
        .send(LifecycleSignal::UrlAction(UrlAction::OpenRepositoryFromUrl {
            url: "https://github.com/octo/unknown".into(),
            branch: None,
            pr: None,
            filepath: None,
        }))
        .await
        .expect("send");
    lifecycle.shutdown().await.expect("shutdown");

    let state = app.dispatcher.state();
    assert!(state.ui.window.focused);
    assert_eq!(state.selection().repository_id(), Some(repo));
    assert_eq!(
        state.popup(),
        Some(&Popup::CloneRepository {
            url: "https://github.com/octo/unknown".into()
        })
    );
}

#[tokio::test]
async fn clone_then_perform_share_the_error_path() {
    let app = app(Backend::default(), |b| b.with_default_handlers());

    app.dispatcher
        .dispatch(Operation::CloneRepository {
            url: "https://github.com/octo/cloned".into(),
            path: PathBuf::from("/src/cloned"),
        })
        .await
        .expect("clone should succeed");
    let state = app.dispatcher.state();
    assert_eq!(state.repositories.len(), 2);
    assert_eq!(state.selected_repository().map(|r| r.name.as_str()), Some("cloned"));

    let outcome = app
        .dispatcher
        .perform(DispatchContext::new("open-editor"), async {
            Err::<(), _>(AppError::EditorLaunchFailed {
                editor: "code".into(),
                message: "not installed".into(),
            })
        })
        .await;
    assert_eq!(
        outcome,
        Err(ErrorOutcome::Recovered {
            handler: "external-editor".into()
        })
    );
    assert_eq!(
        app.dispatcher.state().popup().map(Popup::kind),
        Some("external-editor-failed")
    );
}
