//! The error handler chain.
//!
//! Handlers are tried in registration order. Each one either passes the
//! error on unchanged, replaces it with a reclassified error for the rest of
//! the chain, or claims it by describing the state mutations that recover
//! from it. Handlers never touch the stores; the dispatcher applies their
//! mutations.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::command::DispatchContext;
use crate::error::{AppError, HandlerFault};
use crate::state::Mutation;

/// What a handler decided to do with an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Not mine; the next handler sees the same error.
    Pass,
    /// Continue down the chain with a different error.
    Replace(AppError),
    /// Claimed. The chain stops and the mutations are applied as one batch.
    Handled(Vec<Mutation>),
}

impl Resolution {
    /// Claim the error without changing any state.
    pub fn swallow() -> Self {
        Self::Handled(Vec::new())
    }
}

/// A named recovery step in the chain.
///
/// Implementations decide synchronously and match on the error's variant,
/// never on its message text.
pub trait ErrorHandler: Send + Sync {
    /// Name used in logs and in [`ErrorOutcome::Recovered`](crate::ErrorOutcome::Recovered).
    fn name(&self) -> &str;

    /// Decide what to do with `error`.
    ///
    /// # Errors
    ///
    /// A [`HandlerFault`] is logged and treated as [`Resolution::Pass`]; it
    /// never replaces `error`.
    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault>;
}

/// An [`ErrorHandler`] backed by a closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

impl<F> ErrorHandler for FnHandler<F>
where
    F: Fn(&AppError, &DispatchContext) -> Result<Resolution, HandlerFault> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, error: &AppError, ctx: &DispatchContext) -> Result<Resolution, HandlerFault> {
        (self.f)(error, ctx)
    }
}

/// Adapt a closure into an [`ErrorHandler`].
///
/// # Examples
///
/// ```
/// use deskcore::{AppError, DispatchContext, ErrorHandler, Resolution, handler_fn};
///
/// let quiet_network = handler_fn("quiet-network", |error, _ctx| {
///     Ok(match error {
///         AppError::Network { .. } => Resolution::swallow(),
///         _ => Resolution::Pass,
///     })
/// });
///
/// let ctx = DispatchContext::new("fetch");
/// let resolution = quiet_network
///     .handle(&AppError::network("timed out"), &ctx)
///     .expect("handler should not fault");
/// assert_eq!(resolution, Resolution::swallow());
/// ```
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(&AppError, &DispatchContext) -> Result<Resolution, HandlerFault> + Send + Sync,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

/// Result of running an error through the whole chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// `handler` claimed the error and asked for `mutations`.
    Handled {
        handler: String,
        mutations: Vec<Mutation>,
    },
    /// Nobody claimed it. Carries the error as the last handler left it.
    Unhandled(AppError),
}

/// Ordered sequence of error handlers.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. No de-duplication; earlier handlers get first
    /// refusal.
    pub fn register(&mut self, handler: Arc<dyn ErrorHandler>) {
        tracing::debug!(handler = handler.name(), position = self.handlers.len(), "error handler registered");
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Names of the registered handlers, in precedence order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.name())
    }

    /// Thread `error` through the handlers in registration order.
    ///
    /// A handler that returns a fault or panics is skipped: the error it
    /// was given continues to the next handler untouched.
    pub fn run(&self, error: AppError, ctx: &DispatchContext) -> ChainOutcome {
        let mut current = error;
        for handler in &self.handlers {
            let name = handler.name();
            let decided = catch_unwind(AssertUnwindSafe(|| handler.handle(&current, ctx)));
            match decided {
                Ok(Ok(Resolution::Pass)) => {}
                Ok(Ok(Resolution::Replace(next))) => {
                    tracing::debug!(
                        handler = name,
                        from = current.kind(),
                        to = next.kind(),
                        "error reclassified"
                    );
                    current = next;
                }
                Ok(Ok(Resolution::Handled(mutations))) => {
                    tracing::debug!(
                        handler = name,
                        kind = current.kind(),
                        mutations = mutations.len(),
                        "error handled"
                    );
                    return ChainOutcome::Handled {
                        handler: name.to_owned(),
                        mutations,
                    };
                }
                Ok(Err(fault)) => {
                    tracing::warn!(handler = name, error = %fault, "error handler faulted; skipping");
                }
                Err(_panic) => {
                    tracing::warn!(handler = name, kind = current.kind(), "error handler panicked; skipping");
                }
            }
        }
        ChainOutcome::Unhandled(current)
    }
}
