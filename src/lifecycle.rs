//! Focus/lifecycle synchronizer.
//!
//! Bridges signals from the host environment (window focus, external URL
//! activations, window state changes) into dispatcher calls. The
//! synchronizer runs as a tokio task that owns the receiving end of an
//! `mpsc` channel and processes signals one at a time, in arrival order.
//!
//! Public API: [`LifecycleSignal`] (decoded host events), [`UrlAction`]
//! (deep-link activations), [`LifecycleHandle`] and [`spawn_lifecycle_sync`].

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::dispatcher::Dispatcher;
use crate::error::LifecycleError;
use crate::state::WindowMode;

/// Capacity of the signal channel.
const SIGNAL_BUFFER: usize = 32;

/// An externally triggered activation, tagged by `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlAction {
    /// OAuth callback completing a sign-in.
    Oauth { code: String, state: String },
    /// Open (or offer to clone) the repository at `url`.
    OpenRepositoryFromUrl {
        url: String,
        branch: Option<String>,
        pr: Option<String>,
        filepath: Option<String>,
    },
    /// Open (or offer to add) the repository at `path`.
    OpenRepositoryFromPath { path: PathBuf },
    /// An action this version does not recognise. Dropped by the dispatcher.
    Unknown { name: String },
}

#[derive(Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
enum KnownUrlAction {
    Oauth {
        code: String,
        state: String,
    },
    OpenRepositoryFromUrl {
        url: String,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        pr: Option<String>,
        #[serde(default)]
        filepath: Option<String>,
    },
    OpenRepositoryFromPath {
        path: PathBuf,
    },
}

const KNOWN_URL_ACTIONS: &[&str] = &["oauth", "open-repository-from-url", "open-repository-from-path"];

impl From<KnownUrlAction> for UrlAction {
    fn from(action: KnownUrlAction) -> Self {
        match action {
            KnownUrlAction::Oauth { code, state } => Self::Oauth { code, state },
            KnownUrlAction::OpenRepositoryFromUrl {
                url,
                branch,
                pr,
                filepath,
            } => Self::OpenRepositoryFromUrl {
                url,
                branch,
                pr,
                filepath,
            },
            KnownUrlAction::OpenRepositoryFromPath { path } => Self::OpenRepositoryFromPath { path },
        }
    }
}

impl UrlAction {
    /// Decode an action from its JSON form, e.g.
    /// `{"name": "open-repository-from-path", "path": "/src/desk"}`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidPayload`] if the payload has no `name`, or
    /// names a known action with missing or mistyped fields. Unknown names
    /// decode to [`UrlAction::Unknown`].
    pub fn parse(payload: &Value) -> Result<Self, LifecycleError> {
        match KnownUrlAction::deserialize(payload) {
            Ok(known) => Ok(known.into()),
            Err(err) => match payload.get("name").and_then(Value::as_str) {
                Some(name) if !KNOWN_URL_ACTIONS.contains(&name) => Ok(Self::Unknown {
                    name: name.to_owned(),
                }),
                _ => Err(LifecycleError::InvalidPayload(err.to_string())),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Oauth { .. } => "oauth",
            Self::OpenRepositoryFromUrl { .. } => "open-repository-from-url",
            Self::OpenRepositoryFromPath { .. } => "open-repository-from-path",
            Self::Unknown { name } => name.as_str(),
        }
    }
}

/// A signal from the host environment.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleSignal {
    Focus,
    Blur,
    UrlAction(UrlAction),
    WindowMode(WindowMode),
    ZoomFactor(f64),
}

impl LifecycleSignal {
    /// Decode a host event.
    ///
    /// # Arguments
    ///
    /// * `name` - One of `focus`, `blur`, `url-action`,
    ///   `window-state-changed` or `zoom-factor-changed`.
    /// * `payload` - The event's JSON payload, if it has one. `url-action`
    ///   expects `{"action": {...}}` (a bare action is accepted too);
    ///   `window-state-changed` a mode string or `{"state": ...}`;
    ///   `zoom-factor-changed` a number or `{"zoom_factor": ...}`.
    ///
    /// # Errors
    ///
    /// * [`LifecycleError::UnknownEvent`] - `name` is not a known event.
    /// * [`LifecycleError::InvalidPayload`] - the payload is missing or
    ///   malformed.
    pub fn from_host_event(name: &str, payload: Option<&Value>) -> Result<Self, LifecycleError> {
        let require_payload = || {
            payload.ok_or_else(|| LifecycleError::InvalidPayload(format!("'{name}' requires a payload")))
        };
        match name {
            "focus" => Ok(Self::Focus),
            "blur" => Ok(Self::Blur),
            "url-action" => {
                let payload = require_payload()?;
                let action = payload.get("action").unwrap_or(payload);
                UrlAction::parse(action).map(Self::UrlAction)
            }
            "window-state-changed" => {
                let payload = require_payload()?;
                let state = payload.get("state").unwrap_or(payload);
                WindowMode::deserialize(state)
                    .map(Self::WindowMode)
                    .map_err(|err| LifecycleError::InvalidPayload(err.to_string()))
            }
            "zoom-factor-changed" => {
                let payload = require_payload()?;
                payload
                    .get("zoom_factor")
                    .unwrap_or(payload)
                    .as_f64()
                    .map(Self::ZoomFactor)
                    .ok_or_else(|| LifecycleError::InvalidPayload("zoom factor must be a number".into()))
            }
            other => Err(LifecycleError::UnknownEvent(other.to_owned())),
        }
    }
}

enum LifecycleMessage {
    Signal(LifecycleSignal),
    Shutdown,
}

/// Handle to a running lifecycle synchronizer.
#[derive(Debug)]
pub struct LifecycleHandle {
    sender: mpsc::Sender<LifecycleMessage>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for LifecycleMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(signal) => f.debug_tuple("Signal").field(signal).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl LifecycleHandle {
    /// Queue a signal. Signals are applied in the order they are sent.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Closed`] if the synchronizer has stopped.
    pub async fn send(&self, signal: LifecycleSignal) -> Result<(), LifecycleError> {
        self.sender
            .send(LifecycleMessage::Signal(signal))
            .await
            .map_err(|_| LifecycleError::Closed)
    }

    /// Decode a host event and queue it.
    ///
    /// # Errors
    ///
    /// Decoding errors from [`LifecycleSignal::from_host_event`], or
    /// [`LifecycleError::Closed`].
    pub async fn send_host_event(&self, name: &str, payload: Option<&Value>) -> Result<(), LifecycleError> {
        let signal = LifecycleSignal::from_host_event(name, payload)?;
        self.send(signal).await
    }

    /// Whether the synchronizer task is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Stop the synchronizer after the signals already queued are applied.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::Join`] if the task panicked.
    pub async fn shutdown(self) -> Result<(), LifecycleError> {
        // A closed channel means the task already exited; joining reports why.
        let _ = self.sender.send(LifecycleMessage::Shutdown).await;
        self.task
            .await
            .map_err(|err| LifecycleError::Join(err.to_string()))
    }
}

async fn apply(dispatcher: &Dispatcher, signal: LifecycleSignal) {
    match signal {
        LifecycleSignal::Focus => dispatcher.set_app_focus_state(true),
        LifecycleSignal::Blur => {
            dispatcher.set_app_focus_state(false);
            dispatcher.set_access_key_highlight_state(false);
        }
        LifecycleSignal::WindowMode(mode) => dispatcher.set_window_mode(mode),
        LifecycleSignal::ZoomFactor(zoom_factor) => dispatcher.set_zoom_factor(zoom_factor),
        LifecycleSignal::UrlAction(action) => {
            let name = action.name().to_owned();
            if let Err(outcome) = dispatcher.dispatch_url_action(action).await {
                tracing::debug!(action = %name, %outcome, "url action failed");
            }
        }
    }
}

async fn run_lifecycle(dispatcher: Dispatcher, mut rx: mpsc::Receiver<LifecycleMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            LifecycleMessage::Signal(signal) => {
                let span = tracing::debug_span!("lifecycle_signal", signal = ?signal);
                apply(&dispatcher, signal).instrument(span).await;
            }
            LifecycleMessage::Shutdown => break,
        }
    }
    tracing::debug!("lifecycle synchronizer stopped");
}

/// Start a lifecycle synchronizer feeding `dispatcher`.
///
/// Must be called inside a tokio runtime. The task stops on
/// [`LifecycleHandle::shutdown`] or when the handle is dropped.
pub fn spawn_lifecycle_sync(dispatcher: Dispatcher) -> LifecycleHandle {
    let (sender, rx) = mpsc::channel(SIGNAL_BUFFER);
    let task = tokio::spawn(run_lifecycle(dispatcher, rx));
    LifecycleHandle { sender, task }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::NewRepository;
    use crate::state::Popup;
    use crate::store::AppStore;

    fn dispatcher() -> Dispatcher {
        let store = AppStore::builder()
            .repository(NewRepository::new("desk", "/src/desk"))
            .open();
        Dispatcher::builder(store).with_default_handlers().build()
    }

    #[test]
    fn decodes_focus_and_blur() {
        assert_eq!(LifecycleSignal::from_host_event("focus", None).expect("decode"), LifecycleSignal::Focus);
        assert_eq!(LifecycleSignal::from_host_event("blur", None).expect("decode"), LifecycleSignal::Blur);
    }

    #[test]
    fn decodes_url_action_inside_action_envelope() {
        let payload = json!({"action": {"name": "oauth", "code": "c0de", "state": "s1"}});
        let signal = LifecycleSignal::from_host_event("url-action", Some(&payload)).expect("decode");
        assert_eq!(
            signal,
            LifecycleSignal::UrlAction(UrlAction::Oauth {
                code: "c0de".into(),
                state: "s1".into()
            })
        );
    }

    #[test]
    fn decodes_open_from_url_with_optional_fields() {
        let action = UrlAction::parse(&json!({
            "name": "open-repository-from-url",
            "url": "https://github.com/octo/desk",
            "branch": "topic"
        }))
        .expect("decode");
        assert_eq!(
            action,
            UrlAction::OpenRepositoryFromUrl {
                url: "https://github.com/octo/desk".into(),
                branch: Some("topic".into()),
                pr: None,
                filepath: None,
            }
        );
    }

    #[test]
    fn unknown_action_names_are_kept_for_the_dispatcher_to_drop() {
        let action = UrlAction::parse(&json!({"name": "launch-rockets", "count": 3})).expect("decode");
        assert_eq!(
            action,
            UrlAction::Unknown {
                name: "launch-rockets".into()
            }
        );
    }

    #[test]
    fn malformed_known_action_is_rejected() {
        let err = UrlAction::parse(&json!({"name": "oauth", "code": "c0de"})).expect_err("state is required");
        assert!(matches!(err, LifecycleError::InvalidPayload(_)));
        assert!(matches!(
            UrlAction::parse(&json!({"code": "c0de"})),
            Err(LifecycleError::InvalidPayload(_))
        ));
    }

    #[test]
    fn decodes_window_state_and_zoom() {
        assert_eq!(
            LifecycleSignal::from_host_event("window-state-changed", Some(&json!("full-screen"))).expect("decode"),
            LifecycleSignal::WindowMode(WindowMode::FullScreen)
        );
        assert_eq!(
            LifecycleSignal::from_host_event("window-state-changed", Some(&json!({"state": "minimized"})))
                .expect("decode"),
            LifecycleSignal::WindowMode(WindowMode::Minimized)
        );
        assert_eq!(
            LifecycleSignal::from_host_event("zoom-factor-changed", Some(&json!({"zoom_factor": 1.1})))
                .expect("decode"),
            LifecycleSignal::ZoomFactor(1.1)
        );
    }

    #[test]
    fn rejects_unknown_events_and_missing_payloads() {
        assert!(matches!(
            LifecycleSignal::from_host_event("resize", None),
            Err(LifecycleError::UnknownEvent(name)) if name == "resize"
        ));
        assert!(matches!(
            LifecycleSignal::from_host_event("url-action", None),
            Err(LifecycleError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn signals_are_applied_in_arrival_order() {
        let dispatcher = dispatcher();
        let handle = spawn_lifecycle_sync(dispatcher.clone());
        assert!(handle.is_alive());

        handle.send(LifecycleSignal::Focus).await.expect("send");
        handle
            .send(LifecycleSignal::WindowMode(WindowMode::Maximized))
            .await
            .expect("send");
        handle.send(LifecycleSignal::Blur).await.expect("send");
        handle.shutdown().await.expect("shutdown should succeed");

        let window = dispatcher.state().ui.window;
        assert!(!window.focused, "blur arrived last");
        assert_eq!(window.mode, WindowMode::Maximized);
    }

    #[tokio::test]
    async fn url_action_events_reach_the_dispatcher() {
        let dispatcher = dispatcher();
        let handle = spawn_lifecycle_sync(dispatcher.clone());

        handle
            .send_host_event(
                "url-action",
                Some(&json!({"action": {"name": "open-repository-from-path", "path": "/src/other"}})),
            )
            .await
            .expect("send");
        handle
            .send_host_event("url-action", Some(&json!({"action": {"name": "launch-rockets"}})))
            .await
            .expect("unknown actions are forwarded and dropped");
        handle.shutdown().await.expect("shutdown should succeed");

        assert_eq!(
            dispatcher.state().popup(),
            Some(&Popup::AddRepository {
                path: PathBuf::from("/src/other")
            })
        );
        assert!(dispatcher.reporter().fatal().is_none());
    }

    #[tokio::test]
    async fn known_repository_path_is_selected() {
        let dispatcher = dispatcher();
        let id = dispatcher.state().repositories[0].id;
        let handle = spawn_lifecycle_sync(dispatcher.clone());

        handle
            .send(LifecycleSignal::UrlAction(UrlAction::OpenRepositoryFromPath {
                path: PathBuf::from("/src/desk"),
            }))
            .await
            .expect("send");
        handle.shutdown().await.expect("shutdown should succeed");

        assert_eq!(dispatcher.state().selection().repository_id(), Some(id));
    }
}
