//! Main realtime client with builder pattern.
//!
//! Provides the application-facing interface for the persistent
//! notification channel: connect/disconnect, topic subscriptions, typed
//! handler registration, and gated sends.

use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connection::{
    apply_event, connection_task, join_envelope, leave_envelope, resolve_ws_url,
    validate_base_url, ConnCmd, ConnectionShared,
};
use crate::dispatch::HandlerId;
use crate::envelope::{Envelope, EventType};
use crate::error::{RecallLinkError, Result};
use crate::event_handlers::EventHandlers;
use crate::options::ConnectionOptions;
use crate::state::{ConnectionEvent, ConnectionState};

/// Command channel depth between the client and the connection task.
const CMD_CHANNEL_CAPACITY: usize = 256;

/// Handle to the currently spawned connection task.
struct ActiveConnection {
    cmd_tx: mpsc::Sender<ConnCmd>,
    _task: JoinHandle<()>,
}

/// Realtime notification client for the Recall backend.
///
/// One `LiveClient` owns at most one live socket at a time. Construct it at
/// the application's composition root and inject it where needed; there is
/// no global singleton.
///
/// # Examples
///
/// ```rust,no_run
/// use recall_link::{EventType, LiveClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = LiveClient::builder()
///     .base_url("https://api.recall.example.com/live")
///     .build()?;
///
/// client.on(EventType::from("JOB_PROGRESS"), |envelope| {
///     println!("progress: {}", envelope.payload);
/// });
///
/// client.connect("bearer-token").await?;
/// client.subscribe("job-42").await?;
/// # Ok(())
/// # }
/// ```
pub struct LiveClient {
    base_url: String,
    options: ConnectionOptions,
    hooks: EventHandlers,
    shared: Arc<ConnectionShared>,
    active: Mutex<Option<ActiveConnection>>,
}

impl LiveClient {
    /// Create a builder for custom configuration.
    pub fn builder() -> LiveClientBuilder {
        LiveClientBuilder::new()
    }

    /// Open the channel, authenticating with the given bearer token
    /// (carried as a `token` query parameter on the connection URL).
    ///
    /// Resolves once the connection reaches CONNECTED; fails on an
    /// immediate open failure or the connect timeout. Rejects while a
    /// connection is already active — at most one live socket at a time.
    pub async fn connect(&self, token: &str) -> Result<()> {
        let ready_rx = {
            let mut active = self.active.lock().await;

            match self.shared.state.load() {
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting => {
                    return Err(RecallLinkError::WebSocketError(
                        "connect() called while a connection is active".to_string(),
                    ));
                }
                ConnectionState::Disconnected | ConnectionState::Error => {}
            }

            let url = resolve_ws_url(&self.base_url, token)?;
            // Any previous task has already terminated (terminal state).
            active.take();

            apply_event(&self.shared, &self.hooks, ConnectionEvent::ConnectRequested);

            let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(connection_task(
                cmd_rx,
                url,
                self.options.clone(),
                self.hooks.clone(),
                self.shared.clone(),
                ready_tx,
            ));
            *active = Some(ActiveConnection { cmd_tx, _task: task });
            ready_rx
        };

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(RecallLinkError::InternalError(
                "Connection task exited before signalling readiness".to_string(),
            )),
        }
    }

    /// Close the channel with code 1000 and cancel any pending reconnect.
    ///
    /// Idempotent; returns once the socket and timers are torn down. The
    /// subscription set is cleared — a later `connect()` starts a fresh
    /// session. Handler registrations are kept.
    pub async fn disconnect(&self) {
        let conn = self.active.lock().await.take();
        let Some(conn) = conn else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if conn
            .cmd_tx
            .send(ConnCmd::Disconnect { ack_tx })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        // If the task had already reached a terminal state (auth rejection,
        // retries exhausted) the send fails and there is nothing to tear
        // down; still drop any leftover session state.
        self.shared.registry.lock().unwrap().clear();
    }

    /// Send an envelope of the given type.
    ///
    /// The envelope is stamped with the current time and a fresh
    /// correlation id. While the connection is not OPEN the message is
    /// dropped with a warning — there is no outbound queue and no
    /// retry-on-reconnect for arbitrary sends.
    pub async fn send(&self, event_type: impl Into<EventType>, payload: JsonValue) -> Result<()> {
        let envelope =
            Envelope::new(event_type.into(), payload).with_id(Uuid::new_v4().to_string());
        self.send_gated(envelope).await
    }

    /// Subscribe to a topic (a job id, group id, ...).
    ///
    /// Sends a JOIN envelope and records the topic; the registry replays
    /// JOIN for every member after each (re)connection, so subscriptions
    /// survive reconnects without caller intervention. Subscribing to a
    /// topic already present is a no-op on the wire.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let newly_added = self.shared.registry.lock().unwrap().insert(topic);
        if !newly_added {
            log::debug!("Already subscribed to '{}'", topic);
            return Ok(());
        }
        log::debug!("Subscribed to '{}'", topic);
        self.send_gated(join_envelope(topic)).await
    }

    /// Unsubscribe from a topic. Unsubscribing an absent topic is a no-op.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let removed = self.shared.registry.lock().unwrap().remove(topic);
        if !removed {
            return Ok(());
        }
        log::debug!("Unsubscribed from '{}'", topic);
        self.send_gated(leave_envelope(topic)).await
    }

    /// Register a handler for a message type. Returns the id to pass to
    /// [`off`](LiveClient::off).
    pub fn on(
        &self,
        event_type: impl Into<EventType>,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> HandlerId {
        self.shared.dispatcher.on(event_type.into(), handler)
    }

    /// Remove a previously registered handler.
    pub fn off(&self, event_type: impl Into<EventType>, id: HandlerId) -> bool {
        self.shared.dispatcher.off(&event_type.into(), id)
    }

    /// Whether the channel is currently CONNECTED.
    pub fn is_connected(&self) -> bool {
        self.shared.state.load() == ConnectionState::Connected
    }

    /// Current lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    /// Snapshot of the active subscriptions, in insertion order.
    pub fn topics(&self) -> Vec<String> {
        self.shared.registry.lock().unwrap().snapshot()
    }

    /// Hand an envelope to the connection task if the socket is open;
    /// otherwise log and drop it.
    async fn send_gated(&self, envelope: Envelope) -> Result<()> {
        if self.shared.state.load() != ConnectionState::Connected {
            log::warn!(
                "Dropping '{}' send while not connected",
                envelope.event_type
            );
            return Ok(());
        }

        let cmd_tx = {
            let active = self.active.lock().await;
            active.as_ref().map(|conn| conn.cmd_tx.clone())
        };

        match cmd_tx {
            Some(cmd_tx) => {
                if cmd_tx.send(ConnCmd::Send(envelope)).await.is_err() {
                    log::warn!("Dropping send: connection task is not running");
                }
            }
            None => {
                log::warn!(
                    "Dropping '{}' send: no active connection",
                    envelope.event_type
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveClient")
            .field("base_url", &self.base_url)
            .field("state", &self.shared.state.load())
            .finish()
    }
}

/// Builder for [`LiveClient`].
#[derive(Debug, Default)]
pub struct LiveClientBuilder {
    base_url: Option<String>,
    options: ConnectionOptions,
    hooks: EventHandlers,
}

impl LiveClientBuilder {
    fn new() -> Self {
        Self {
            base_url: None,
            options: ConnectionOptions::default(),
            hooks: EventHandlers::new(),
        }
    }

    /// Set the server base URL (`http(s)` URLs are rewritten to `ws(s)`).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the connection options.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the lifecycle event handlers.
    pub fn event_handlers(mut self, hooks: EventHandlers) -> Self {
        self.hooks = hooks;
        self
    }

    /// Validate the configuration and build the client.
    pub fn build(self) -> Result<LiveClient> {
        let base_url = self.base_url.ok_or_else(|| {
            RecallLinkError::ConfigurationError("base_url is required".to_string())
        })?;
        validate_base_url(&base_url)?;

        Ok(LiveClient {
            base_url,
            options: self.options,
            hooks: self.hooks,
            shared: Arc::new(ConnectionShared::new()),
            active: Mutex::new(None),
        })
    }
}
