//! Built-in error handlers.
//!
//! Each handler claims exactly one [`AppError`] shape and turns it into the
//! popup, banner or state change that lets the user recover. Anything else
//! is passed through unchanged.

use std::sync::Arc;

use crate::command::DispatchContext;
use crate::error::{AppError, HandlerFault};
use crate::handler::{ErrorHandler, Resolution};
use crate::model::RepositoryId;
use crate::state::{Mutation, Popup};

/// The built-in handlers, in the order they are registered by
/// [`DispatcherBuilder::with_default_handlers`](crate::DispatcherBuilder::with_default_handlers).
pub fn default_handlers() -> Vec<Arc<dyn ErrorHandler>> {
    vec![
        Arc::new(BackgroundTaskHandler),
        Arc::new(MissingRepositoryHandler),
        Arc::new(AuthenticationHandler),
        Arc::new(ExternalEditorHandler),
        Arc::new(OpenShellHandler),
        Arc::new(MergeConflictsHandler),
        Arc::new(LfsAttributeMismatchHandler),
        Arc::new(UpstreamAlreadyExistsHandler),
        Arc::new(PushNeedsPullHandler),
        Arc::new(RebaseConflictsHandler),
        Arc::new(LocalChangesOverwrittenHandler),
        Arc::new(WorkflowUpdateRefusedHandler),
    ]
}

/// Show `popup` for the context's repository, or pass if there is none.
fn popup_for_repository(
    ctx: &DispatchContext,
    popup: impl FnOnce(RepositoryId) -> Popup,
) -> Resolution {
    match &ctx.repository {
        Some(repository) => Resolution::Handled(vec![Mutation::ShowPopup(popup(repository.id))]),
        None => Resolution::Pass,
    }
}

/// Swallows network failures of background work; the user did not ask for
/// it and will retry when they do.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackgroundTaskHandler;

impl ErrorHandler for BackgroundTaskHandler {
    fn name(&self) -> &str {
        "background-task"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        if !ctx.background {
            return Ok(Resolution::Pass);
        }
        Ok(match error {
            AppError::Network { message } => {
                tracing::info!(operation = ctx.operation, %message, "ignoring background network failure");
                Resolution::swallow()
            }
            _ => Resolution::Pass,
        })
    }
}

/// Flags the repository as missing so the UI can offer to locate it.
#[derive(Debug, Clone, Copy, Default)]
pub struct MissingRepositoryHandler;

impl ErrorHandler for MissingRepositoryHandler {
    fn name(&self) -> &str {
        "missing-repository"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        let AppError::RepositoryMissing { .. } = error else {
            return Ok(Resolution::Pass);
        };
        let Some(repository) = &ctx.repository else {
            return Ok(Resolution::Pass);
        };
        let mut mutations = vec![Mutation::MarkRepositoryMissing(repository.id)];
        // Background refreshes of a vanished repository only flag it.
        if !ctx.background {
            mutations.push(Mutation::PresentError(error.clone()));
        }
        Ok(Resolution::Handled(mutations))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuthenticationHandler;

impl ErrorHandler for AuthenticationHandler {
    fn name(&self) -> &str {
        "authentication"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::AuthenticationFailed { host } => {
                Resolution::Handled(vec![Mutation::ShowPopup(Popup::GitAuthenticationFailed {
                    repository: ctx.repository.as_ref().map(|r| r.id),
                    host: host.clone(),
                })])
            }
            _ => Resolution::Pass,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalEditorHandler;

impl ErrorHandler for ExternalEditorHandler {
    fn name(&self) -> &str {
        "external-editor"
    }

    fn handle(&self, error: &AppError, _ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::EditorLaunchFailed { editor, message } => {
                Resolution::Handled(vec![Mutation::ShowPopup(Popup::ExternalEditorFailed {
                    editor: editor.clone(),
                    message: message.clone(),
                })])
            }
            _ => Resolution::Pass,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenShellHandler;

impl ErrorHandler for OpenShellHandler {
    fn name(&self) -> &str {
        "open-shell"
    }

    fn handle(&self, error: &AppError, _ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::ShellOpenFailed { shell, message } => {
                Resolution::Handled(vec![Mutation::ShowPopup(Popup::OpenShellFailed {
                    shell: shell.clone(),
                    message: message.clone(),
                })])
            }
            _ => Resolution::Pass,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeConflictsHandler;

impl ErrorHandler for MergeConflictsHandler {
    fn name(&self) -> &str {
        "merge-conflicts"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::MergeConflicts { operation, files } => {
                popup_for_repository(ctx, |repository| Popup::MergeConflicts {
                    repository,
                    operation: *operation,
                    files: files.clone(),
                })
            }
            _ => Resolution::Pass,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LfsAttributeMismatchHandler;

impl ErrorHandler for LfsAttributeMismatchHandler {
    fn name(&self) -> &str {
        "lfs-attribute-mismatch"
    }

    fn handle(&self, error: &AppError, _ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::LfsAttributeMismatch => {
                Resolution::Handled(vec![Mutation::ShowPopup(Popup::LfsAttributeMismatch)])
            }
            _ => Resolution::Pass,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamAlreadyExistsHandler;

impl ErrorHandler for UpstreamAlreadyExistsHandler {
    fn name(&self) -> &str {
        "upstream-already-exists"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::UpstreamAlreadyExists { remote } => {
                popup_for_repository(ctx, |repository| Popup::UpstreamAlreadyExists {
                    repository,
                    existing_remote: remote.clone(),
                })
            }
            _ => Resolution::Pass,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PushNeedsPullHandler;

impl ErrorHandler for PushNeedsPullHandler {
    fn name(&self) -> &str {
        "push-needs-pull"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::PushNeedsPull => {
                popup_for_repository(ctx, |repository| Popup::PushNeedsPull { repository })
            }
            _ => Resolution::Pass,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RebaseConflictsHandler;

impl ErrorHandler for RebaseConflictsHandler {
    fn name(&self) -> &str {
        "rebase-conflicts"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::RebaseConflicts { base_branch } => {
                popup_for_repository(ctx, |repository| Popup::RebaseConflicts {
                    repository,
                    base_branch: base_branch.clone(),
                })
            }
            _ => Resolution::Pass,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalChangesOverwrittenHandler;

impl ErrorHandler for LocalChangesOverwrittenHandler {
    fn name(&self) -> &str {
        "local-changes-overwritten"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::LocalChangesOverwritten { files } => {
                popup_for_repository(ctx, |repository| Popup::LocalChangesOverwritten {
                    repository,
                    operation: Some(ctx.operation.to_owned()),
                    files: files.clone(),
                })
            }
            _ => Resolution::Pass,
        })
    }
}

/// Pushes touching `.github/workflows` need the `workflow` OAuth scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowUpdateRefusedHandler;

impl ErrorHandler for WorkflowUpdateRefusedHandler {
    fn name(&self) -> &str {
        "workflow-update-refused"
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        Ok(match error {
            AppError::WorkflowUpdateRefused { path } => {
                popup_for_repository(ctx, |repository| Popup::PushRejectedWorkflowScope {
                    repository,
                    rejected_path: path.clone(),
                })
            }
            _ => Resolution::Pass,
        })
    }
}
