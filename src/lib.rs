//! Action dispatch and error-recovery core for a multi-store desktop
//! application.
//!
//! The [`Dispatcher`] is the single entry point for application-level
//! operations. It runs them against the [`AppStore`] aggregate, threads
//! failures through an ordered chain of [`ErrorHandler`]s, and reports what
//! no handler claims through a [`Reporter`] that attaches a
//! [`CrashContext`] built from the latest state snapshot.

mod backend;
mod cache;
mod command;
mod config;
mod crash;
mod dispatcher;
mod error;
mod handler;
pub mod handlers;
mod lifecycle;
mod model;
mod state;
mod store;

pub use backend::{
    CloneProgress, MemoryTokenStore, RepositoryBackend, SignInBackend, SignedInAccount, TokenStore,
};
pub use cache::{Generations, StateCache};
pub use command::{DispatchContext, Operation, RepositoryOperation};
pub use config::{
    DispatcherConfig, ENV_DEV_MODE, ENV_ESCALATE_REJECTIONS_AFTER, ENV_INSTALL_ID, ReportingMode,
};
pub use crash::{
    CrashContext, CrashEnvironment, ErrorSink, FatalSignal, RejectionOutcome, RejectionRecord,
    Reporter, capture_crash_context,
};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{AppError, ConflictOperation, CredentialError, ErrorOutcome, HandlerFault, LifecycleError};
pub use handler::{ChainOutcome, ErrorHandler, FnHandler, HandlerChain, Resolution, handler_fn};
pub use lifecycle::{LifecycleHandle, LifecycleSignal, UrlAction, spawn_lifecycle_sync};
pub use model::{
    Account, CloningRepository, Issue, NewRepository, PullRequest, Repository, RepositoryId,
    RepositoryStatus, UserInfo,
};
pub use state::{
    AppState, Banner, DEFAULT_ZOOM_FACTOR, ErrorEntry, FeatureFlags, Foldout, Mutation, Popup,
    RepositorySection, Selection, SignInState, UiState, UsageStats, WindowMode, WindowState,
};
pub use store::{AppStore, AppStoreBuilder, Batch, BatchCell, Store, StoreCell};
