//! Crash context capture and terminal error reporting.
//!
//! [`capture_crash_context`] turns a state snapshot into flat diagnostic
//! key/value pairs. Each field is derived by an independent extractor
//! behind its own panic boundary, so a bug in one never prevents the
//! report from being sent.
//!
//! [`Reporter`] is the terminal end of the error path: it owns the error
//! sink, the latest-snapshot receiver the context is built from, the record
//! of unhandled rejections, and the once-only process-level fatal signal.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::{DispatcherConfig, ReportingMode};
use crate::error::AppError;
use crate::state::{AppState, DEFAULT_ZOOM_FACTOR, Selection, WindowMode};

/// Flat diagnostic key/value pairs attached to an error report.
///
/// Rebuilt from scratch for every report and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CrashContext(BTreeMap<String, String>);

impl CrashContext {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn insert(&mut self, key: &str, value: String) {
        self.0.insert(key.to_owned(), value);
    }
}

/// Facts about the installation included in every report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashEnvironment {
    pub os: String,
    pub install_id: String,
}

/// The most recent unhandled asynchronous rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

type Field = (&'static str, String);
type Extractor = fn(&AppState) -> Vec<Field>;

const EXTRACTORS: &[Extractor] = &[
    banner,
    popup,
    selection,
    foldout,
    welcome_flow,
    window_zoom,
    error_count,
    repository_count,
    window_state,
    window_focused,
    account_count,
];

fn banner(state: &AppState) -> Vec<Field> {
    state
        .banner()
        .map(|b| ("banner", b.kind().to_owned()))
        .into_iter()
        .collect()
}

fn popup(state: &AppState) -> Vec<Field> {
    state
        .popup()
        .map(|p| ("popup", p.kind().to_owned()))
        .into_iter()
        .collect()
}

fn selection(state: &AppState) -> Vec<Field> {
    match state.selection() {
        Selection::None => Vec::new(),
        Selection::Repository { section, .. } => vec![
            ("selection", "repository".to_owned()),
            ("selection_section", section.as_str().to_owned()),
        ],
        other => vec![("selection", other.kind().to_owned())],
    }
}

fn foldout(state: &AppState) -> Vec<Field> {
    state
        .ui
        .foldout
        .map(|f| ("foldout", f.kind().to_owned()))
        .into_iter()
        .collect()
}

fn welcome_flow(state: &AppState) -> Vec<Field> {
    flag("welcome_flow", state.ui.flags.welcome_flow)
}

fn window_zoom(state: &AppState) -> Vec<Field> {
    let zoom = state.ui.window.zoom_factor;
    if (zoom - DEFAULT_ZOOM_FACTOR).abs() < f64::EPSILON {
        return Vec::new();
    }
    vec![("window_zoom", zoom.to_string())]
}

fn error_count(state: &AppState) -> Vec<Field> {
    count("error_count", state.ui.errors.len())
}

fn repository_count(state: &AppState) -> Vec<Field> {
    count("repository_count", state.repositories.len())
}

fn account_count(state: &AppState) -> Vec<Field> {
    count("account_count", state.accounts.len())
}

fn window_state(state: &AppState) -> Vec<Field> {
    match state.ui.window.mode {
        WindowMode::Normal => Vec::new(),
        mode => vec![("window_state", mode.to_string())],
    }
}

fn window_focused(state: &AppState) -> Vec<Field> {
    flag("window_focused", state.ui.window.focused)
}

fn flag(key: &'static str, value: bool) -> Vec<Field> {
    if value { vec![(key, "true".to_owned())] } else { Vec::new() }
}

fn count(key: &'static str, n: usize) -> Vec<Field> {
    if n > 0 { vec![(key, n.to_string())] } else { Vec::new() }
}

/// Build the diagnostic context for a report.
///
/// Always contains `os` and `install_id`. Every other key is emitted only
/// when its value differs from the default, so a default snapshot (or no
/// snapshot at all) yields just the two baseline keys.
///
/// # Arguments
///
/// * `state` - The latest published snapshot, if one exists yet.
/// * `environment` - Installation facts for the baseline keys.
/// * `rejection` - The most recent unhandled rejection, if any.
pub fn capture_crash_context(
    state: Option<&AppState>,
    environment: &CrashEnvironment,
    rejection: Option<&RejectionRecord>,
) -> CrashContext {
    capture_with(EXTRACTORS, state, environment, rejection)
}

fn capture_with(
    extractors: &[Extractor],
    state: Option<&AppState>,
    environment: &CrashEnvironment,
    rejection: Option<&RejectionRecord>,
) -> CrashContext {
    let mut context = CrashContext::default();
    context.insert("os", environment.os.clone());
    context.insert("install_id", environment.install_id.clone());

    if let Some(rejection) = rejection {
        context.insert("last_unhandled_rejection", rejection.message.clone());
        context.insert("last_unhandled_rejection_at", rejection.at.to_rfc3339());
    }

    let Some(state) = state else {
        return context;
    };
    for extractor in extractors {
        match catch_unwind(AssertUnwindSafe(|| extractor(state))) {
            Ok(fields) => {
                for (key, value) in fields {
                    context.insert(key, value);
                }
            }
            Err(_) => tracing::trace!("crash context field extractor panicked; field skipped"),
        }
    }
    context
}

/// Consumer of error reports.
///
/// Reports are fire-and-forget: the reporter never retries, and a sink
/// that wants retries owns them.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &AppError, context: &CrashContext, non_fatal: bool);
}

/// Raised once, the first time an error reaches the end of the chain
/// unrecovered. The host is expected to terminate or restart the process.
#[derive(Debug, Clone, PartialEq)]
pub struct FatalSignal {
    pub error: AppError,
    pub context: CrashContext,
    pub at: DateTime<Utc>,
}

/// Result of recording an unhandled rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOutcome {
    /// Recorded and reported as non-fatal.
    Recorded,
    /// The configured threshold was reached and the fatal signal raised.
    Escalated,
}

#[derive(Debug, Default)]
struct RejectionLog {
    last: Option<RejectionRecord>,
    count: u32,
}

/// Terminal reporting end of the error path.
pub struct Reporter {
    sink: Option<Arc<dyn ErrorSink>>,
    snapshot: watch::Receiver<Arc<AppState>>,
    environment: CrashEnvironment,
    mode: ReportingMode,
    escalate_rejections_after: Option<u32>,
    rejections: Mutex<RejectionLog>,
    fatal_tx: watch::Sender<Option<Arc<FatalSignal>>>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("has_sink", &self.sink.is_some())
            .field("environment", &self.environment)
            .field("mode", &self.mode)
            .field("escalate_rejections_after", &self.escalate_rejections_after)
            .finish_non_exhaustive()
    }
}

impl Reporter {
    /// Create a reporter.
    ///
    /// # Arguments
    ///
    /// * `config` - Reporting mode, environment facts and rejection policy.
    /// * `sink` - Where reports go in production mode. Without one, reports
    ///   are logged.
    /// * `snapshot` - Receiver of the aggregate's published snapshots; the
    ///   crash context is always built from the latest one.
    pub fn new(
        config: &DispatcherConfig,
        sink: Option<Arc<dyn ErrorSink>>,
        snapshot: watch::Receiver<Arc<AppState>>,
    ) -> Self {
        let (fatal_tx, _) = watch::channel(None);
        Self {
            sink,
            snapshot,
            environment: config.environment(),
            mode: config.reporting,
            escalate_rejections_after: config.escalate_rejections_after,
            rejections: Mutex::new(RejectionLog::default()),
            fatal_tx,
        }
    }

    /// Crash context for the latest published snapshot.
    pub fn capture(&self) -> CrashContext {
        let state = self.snapshot.borrow().clone();
        let rejection = self
            .rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
            .clone();
        capture_crash_context(Some(&state), &self.environment, rejection.as_ref())
    }

    /// Report an unrecovered error and raise the fatal signal.
    pub fn report_fatal(&self, error: &AppError) {
        let context = self.capture();
        self.deliver(error, &context, false);
        self.raise_fatal(error, context);
    }

    /// Report an error without escalating.
    pub fn report_non_fatal(&self, error: &AppError) {
        let context = self.capture();
        self.deliver(error, &context, true);
    }

    /// Record an unhandled asynchronous rejection.
    ///
    /// The rejection is kept as the most recent one, reported as non-fatal,
    /// and escalated to the fatal signal only if a threshold is configured
    /// and has been reached.
    pub fn record_unhandled_rejection(&self, message: impl Into<String>) -> RejectionOutcome {
        let message = message.into();
        let count = {
            let mut log = self.rejections.lock().unwrap_or_else(PoisonError::into_inner);
            log.count += 1;
            log.last = Some(RejectionRecord {
                message: message.clone(),
                at: Utc::now(),
            });
            log.count
        };
        tracing::warn!(count, %message, "unhandled rejection");

        let error = AppError::unexpected("UnhandledRejection", message);
        let context = self.capture();
        self.deliver(&error, &context, true);

        match self.escalate_rejections_after {
            Some(threshold) if count >= threshold => {
                self.raise_fatal(&error, context);
                RejectionOutcome::Escalated
            }
            _ => RejectionOutcome::Recorded,
        }
    }

    /// Number of unhandled rejections recorded so far.
    pub fn rejection_count(&self) -> u32 {
        self.rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count
    }

    /// Watch for the fatal signal. Holds `None` until it is raised.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<Arc<FatalSignal>>> {
        self.fatal_tx.subscribe()
    }

    /// The fatal signal, if it has been raised.
    pub fn fatal(&self) -> Option<Arc<FatalSignal>> {
        self.fatal_tx.borrow().clone()
    }

    fn deliver(&self, error: &AppError, context: &CrashContext, non_fatal: bool) {
        match (self.mode, &self.sink) {
            (ReportingMode::Development, _) => {
                tracing::error!(
                    kind = error.kind(),
                    error = ?error,
                    context = ?context,
                    non_fatal,
                    "error not reported in development mode"
                );
            }
            (ReportingMode::Production, Some(sink)) => {
                let sent = catch_unwind(AssertUnwindSafe(|| sink.report(error, context, non_fatal)));
                if sent.is_err() {
                    tracing::error!(kind = error.kind(), "error sink panicked while reporting");
                }
            }
            (ReportingMode::Production, None) => {
                tracing::error!(kind = error.kind(), error = %error, non_fatal, "no error sink configured");
            }
        }
    }

    fn raise_fatal(&self, error: &AppError, context: CrashContext) {
        let raised = self.fatal_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(Arc::new(FatalSignal {
                error: error.clone(),
                context,
                at: Utc::now(),
            }));
            true
        });
        if raised {
            tracing::error!(kind = error.kind(), error = %error, "fatal signal raised");
        } else {
            tracing::debug!(kind = error.kind(), "fatal signal already raised");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::RecordingSink;
    use super::*;
    use crate::model::{Account, NewRepository, Repository, RepositoryId};
    use crate::state::{Banner, Popup, RepositorySection, UiState};

    fn environment() -> CrashEnvironment {
        CrashEnvironment {
            os: "linux-x86_64".into(),
            install_id: "install-1".into(),
        }
    }

    fn busy_state() -> AppState {
        let mut ui = UiState::default();
        ui.selection = Selection::Repository {
            id: RepositoryId(1),
            section: RepositorySection::History,
        };
        ui.popup = Some(Popup::PushNeedsPull {
            repository: RepositoryId(1),
        });
        ui.banner = Some(Banner::UpdateAvailable {
            version: "3.1".into(),
        });
        ui.window.zoom_factor = 1.25;
        ui.window.mode = WindowMode::Minimized;
        ui.push_error(AppError::network("offline"));
        AppState {
            ui: Arc::new(ui),
            repositories: Arc::new(vec![Repository::from_new(
                RepositoryId(1),
                NewRepository::new("desk", "/src/desk"),
            )]),
            accounts: Arc::new(vec![Account::new("octocat", "https://api.github.com")]),
            ..AppState::default()
        }
    }

    #[test]
    fn default_snapshot_yields_only_baseline_keys() {
        let context = capture_crash_context(Some(&AppState::default()), &environment(), None);
        assert_eq!(context.keys().collect::<Vec<_>>(), ["install_id", "os"]);
        assert_eq!(context.get("os"), Some("linux-x86_64"));
    }

    #[test]
    fn missing_snapshot_yields_only_baseline_keys() {
        let context = capture_crash_context(None, &environment(), None);
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn populated_snapshot_emits_non_default_fields() {
        let context = capture_crash_context(Some(&busy_state()), &environment(), None);
        assert_eq!(context.get("popup"), Some("push-needs-pull"));
        assert_eq!(context.get("banner"), Some("update-available"));
        assert_eq!(context.get("selection"), Some("repository"));
        assert_eq!(context.get("selection_section"), Some("history"));
        assert_eq!(context.get("window_zoom"), Some("1.25"));
        assert_eq!(context.get("window_state"), Some("minimized"));
        assert_eq!(context.get("error_count"), Some("1"));
        assert_eq!(context.get("repository_count"), Some("1"));
        assert_eq!(context.get("account_count"), Some("1"));
        assert!(!context.contains_key("window_focused"));
        assert!(!context.contains_key("foldout"));
    }

    #[test]
    fn rejection_is_included_when_present() {
        let rejection = RejectionRecord {
            message: "promise went nowhere".into(),
            at: Utc::now(),
        };
        let context = capture_crash_context(None, &environment(), Some(&rejection));
        assert_eq!(context.get("last_unhandled_rejection"), Some("promise went nowhere"));
        assert!(context.contains_key("last_unhandled_rejection_at"));
    }

    #[test]
    fn panicking_extractor_only_loses_its_own_field() {
        fn broken(_: &AppState) -> Vec<Field> {
            panic!("extractor bug")
        }
        let context = capture_with(&[broken, repository_count], Some(&busy_state()), &environment(), None);
        assert_eq!(context.get("repository_count"), Some("1"));
        assert_eq!(context.len(), 3);
    }

    fn reporter(config: DispatcherConfig, sink: Arc<RecordingSink>) -> Reporter {
        let (_tx, rx) = watch::channel(Arc::new(busy_state()));
        Reporter::new(&config, Some(sink as Arc<dyn ErrorSink>), rx)
    }

    #[test]
    fn fatal_report_reaches_sink_and_raises_signal_once() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = reporter(DispatcherConfig::default(), Arc::clone(&sink));
        let first = AppError::unexpected("DiskFull", "no space");

        reporter.report_fatal(&first);
        reporter.report_fatal(&AppError::unexpected("Other", "later"));

        let reports = sink.reports();
        assert_eq!(reports.len(), 2);
        assert!(!reports[0].2, "fatal reports are not non-fatal");
        assert_eq!(reports[0].1.get("repository_count"), Some("1"));
        let signal = reporter.fatal().expect("fatal signal should be raised");
        assert_eq!(signal.error, first, "the first fatal error is kept");
    }

    #[test]
    fn development_mode_skips_the_sink_but_still_signals() {
        let sink = Arc::new(RecordingSink::default());
        let config = DispatcherConfig {
            reporting: ReportingMode::Development,
            ..DispatcherConfig::default()
        };
        let reporter = reporter(config, Arc::clone(&sink));

        reporter.report_fatal(&AppError::unexpected("DiskFull", "no space"));
        reporter.report_non_fatal(&AppError::network("offline"));

        assert!(sink.reports().is_empty());
        assert!(reporter.fatal().is_some());
    }

    #[test]
    fn rejections_are_non_fatal_without_a_threshold() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = reporter(DispatcherConfig::default(), Arc::clone(&sink));

        for _ in 0..5 {
            assert_eq!(reporter.record_unhandled_rejection("boom"), RejectionOutcome::Recorded);
        }

        assert_eq!(reporter.rejection_count(), 5);
        assert!(reporter.fatal().is_none());
        let reports = sink.reports();
        assert!(reports.iter().all(|(_, _, non_fatal)| *non_fatal));
        assert_eq!(reports[0].1.get("last_unhandled_rejection"), Some("boom"));
    }

    #[test]
    fn rejections_escalate_at_the_configured_threshold() {
        let sink = Arc::new(RecordingSink::default());
        let config = DispatcherConfig {
            escalate_rejections_after: Some(2),
            ..DispatcherConfig::default()
        };
        let reporter = reporter(config, sink);
        let mut fatal = reporter.subscribe_fatal();

        assert_eq!(reporter.record_unhandled_rejection("one"), RejectionOutcome::Recorded);
        assert!(!fatal.has_changed().expect("sender alive"));
        assert_eq!(reporter.record_unhandled_rejection("two"), RejectionOutcome::Escalated);
        assert!(fatal.has_changed().expect("sender alive"));
        let signal = fatal.borrow_and_update().clone().expect("signal raised");
        assert_eq!(signal.error.kind(), "UnhandledRejection");
    }

    #[test]
    fn panicking_sink_does_not_break_reporting() {
        struct PanickingSink;
        impl ErrorSink for PanickingSink {
            fn report(&self, _: &AppError, _: &CrashContext, _: bool) {
                panic!("sink bug");
            }
        }
        let (_tx, rx) = watch::channel(Arc::new(AppState::default()));
        let reporter = Reporter::new(&DispatcherConfig::default(), Some(Arc::new(PanickingSink)), rx);

        reporter.report_fatal(&AppError::unexpected("DiskFull", "no space"));
        assert!(reporter.fatal().is_some());
    }
}
