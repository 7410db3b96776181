//! Connection lifecycle event hooks.
//!
//! Everything here is wiring the embedding application provides at
//! construction time: optional callbacks fired as the channel moves through
//! its lifecycle. They are distinct from the typed message handlers in
//! [`crate::dispatch`] — lifecycle hooks describe the connection itself,
//! dispatch handlers consume the events flowing over it.
//!
//! The `on_auth_failure` hook is the injected replacement for any global
//! "log the user out" side effect: when the server rejects the bearer token
//! the client disconnects and fires this hook, and the application decides
//! what to do next.
//!
//! # Example
//!
//! ```rust
//! use recall_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|| println!("Connected to Recall!"))
//!     .on_disconnect(|reason| println!("Disconnected: {}", reason))
//!     .on_auth_failure(|| println!("Session expired, logging out"));
//! ```

use std::fmt;
use std::sync::Arc;

use crate::state::ConnectionState;

/// Why the channel closed, as reported to `on_disconnect`.
#[derive(Debug, Clone)]
pub struct DisconnectReason {
    /// Human-readable description.
    pub message: String,
    /// WebSocket close code when one was observed (1000 = normal).
    pub code: Option<u16>,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// What went wrong, as reported to `on_error`.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    /// Human-readable description.
    pub message: String,
    /// `true` when auto-reconnect may recover (transport loss); `false` for
    /// terminal failures (auth rejection, retries exhausted).
    pub recoverable: bool,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Optional lifecycle callbacks, registered builder-style.
///
/// All hooks run on the connection task, so keep them short; anything
/// long-running should hand off to its own task. Hooks must be
/// `Send + Sync + 'static`.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(crate) on_disconnect: Option<Arc<dyn Fn(DisconnectReason) + Send + Sync>>,
    pub(crate) on_state_change: Option<Arc<dyn Fn(ConnectionState) + Send + Sync>>,
    pub(crate) on_error: Option<Arc<dyn Fn(ConnectionError) + Send + Sync>>,
    pub(crate) on_auth_failure: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(crate) on_send: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub(crate) on_receive: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut registered = Vec::new();
        for (name, present) in [
            ("on_connect", self.on_connect.is_some()),
            ("on_disconnect", self.on_disconnect.is_some()),
            ("on_state_change", self.on_state_change.is_some()),
            ("on_error", self.on_error.is_some()),
            ("on_auth_failure", self.on_auth_failure.is_some()),
            ("on_send", self.on_send.is_some()),
            ("on_receive", self.on_receive.is_some()),
        ] {
            if present {
                registered.push(name);
            }
        }
        f.debug_struct("EventHandlers")
            .field("registered", &registered)
            .finish()
    }
}

impl EventHandlers {
    /// No hooks registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fired when the channel reaches CONNECTED — on the initial connect and
    /// again after every successful reconnect.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Fired when the channel closes, with the reason.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Fired on every [`ConnectionState`] transition, with the new state.
    pub fn on_state_change(
        mut self,
        f: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Fired on connection errors. Check [`ConnectionError::recoverable`] to
    /// tell transient transport loss from terminal failures.
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Fired when the server rejects the bearer token.
    ///
    /// The client has already forced a disconnect and will not retry — a
    /// stale token cannot succeed. Clear the session and reauthenticate here.
    pub fn on_auth_failure(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_auth_failure = Some(Arc::new(f));
        self
    }

    /// Debug hook: every raw outbound frame, post-encode.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    /// Debug hook: every raw inbound text frame, pre-decode.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_state_change(&self, state: ConnectionState) {
        if let Some(cb) = &self.on_state_change {
            cb(state);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_auth_failure(&self) {
        if let Some(cb) = &self.on_auth_failure {
            cb();
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }
}
