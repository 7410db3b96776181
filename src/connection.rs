//! Background connection task for the realtime channel.
//!
//! One tokio task owns the WebSocket stream and everything timed:
//!
//! - connect/reconnect/disconnect lifecycle, driven through the transition
//!   table in [`crate::state`]
//! - automatic reconnection with exponential backoff after abnormal closes
//! - replay of every active subscription, in insertion order, immediately
//!   after each successful (re)connection and before any other outbound
//!   traffic for that epoch
//! - keepalive `PING` envelopes while connected
//! - the outbound gate: sends are transmitted only while the socket is
//!   open, otherwise logged and dropped
//!
//! The public API communicates with the task over a command channel, so the
//! socket, timers, and retry state never need locks. Cancelling a pending
//! reconnect is inherent: the backoff sleep races the command channel in
//! the same `select!`, and a disconnect command wins over a later timer.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as JsonValue};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
};
use url::Url;

use crate::backoff::{RetryPolicy, RetryState};
use crate::dispatch::EventDispatcher;
use crate::envelope::{Envelope, EventType};
use crate::error::{RecallLinkError, Result};
use crate::event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
use crate::options::ConnectionOptions;
use crate::registry::SubscriptionRegistry;
use crate::state::{transition, ConnectionEvent, ConnectionState, StateCell};

pub(crate) type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Stand-in period for a disabled heartbeat timer.
/// ~100 years is far enough into the future to be effectively "never".
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// State shared between [`crate::client::LiveClient`] and the connection task.
///
/// The task is the only writer of `state`; the registries are mutated by
/// the client and read by the task (locked briefly, never across an await).
pub(crate) struct ConnectionShared {
    pub(crate) state: StateCell,
    pub(crate) registry: Mutex<SubscriptionRegistry>,
    pub(crate) dispatcher: EventDispatcher,
}

impl ConnectionShared {
    pub(crate) fn new() -> Self {
        Self {
            state: StateCell::new(ConnectionState::Disconnected),
            registry: Mutex::new(SubscriptionRegistry::new()),
            dispatcher: EventDispatcher::new(),
        }
    }
}

/// Commands sent from the public API to the connection task.
pub(crate) enum ConnCmd {
    /// Transmit an envelope, subject to the outbound gate.
    Send(Envelope),
    /// Close with code 1000 and shut the task down; acknowledged once the
    /// socket and timers are gone.
    Disconnect { ack_tx: oneshot::Sender<()> },
}

/// Apply a state-machine event, emitting the state-change hook when the
/// state actually moves. Returns `None` for events that are not meaningful
/// in the current state.
pub(crate) fn apply_event(
    shared: &ConnectionShared,
    hooks: &EventHandlers,
    event: ConnectionEvent,
) -> Option<ConnectionState> {
    let current = shared.state.load();
    let next = transition(current, event)?;
    if next != current {
        shared.state.store(next);
        log::debug!("Connection state: {} -> {}", current, next);
        hooks.emit_state_change(next);
    }
    Some(next)
}

/// Build the connection URL: `<ws-base>?token=<bearer-token>`.
///
/// `http(s)` base URLs are rewritten to `ws(s)`.
pub(crate) fn resolve_ws_url(base_url: &str, token: &str) -> Result<String> {
    let mut url = validate_base_url(base_url)?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.to_string())
}

/// Parse and validate a base URL, rewriting the scheme for WebSocket use.
pub(crate) fn validate_base_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url.trim()).map_err(|e| {
        RecallLinkError::ConfigurationError(format!("Invalid base URL '{}': {}", base_url, e))
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RecallLinkError::ConfigurationError(format!(
                "Unsupported base URL scheme '{}'; expected http(s) or ws(s)",
                other
            )));
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        RecallLinkError::ConfigurationError("Failed to set WebSocket URL scheme".to_string())
    })?;

    if url.host_str().is_none() {
        return Err(RecallLinkError::ConfigurationError(
            "Base URL must include a host".to_string(),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(RecallLinkError::ConfigurationError(
            "Base URL must not include username/password credentials".to_string(),
        ));
    }

    url.set_fragment(None);
    Ok(url)
}

/// The JOIN envelope announcing interest in a topic.
pub(crate) fn join_envelope(topic: &str) -> Envelope {
    Envelope::new(EventType::GroupJoin, json!({ "topic": topic }))
}

/// The LEAVE envelope withdrawing interest in a topic.
pub(crate) fn leave_envelope(topic: &str) -> Envelope {
    Envelope::new(EventType::GroupLeave, json!({ "topic": topic }))
}

/// Open the socket, guarded by the connect timeout.
async fn open_socket(url: &str, timeout: Duration) -> Result<WsStream> {
    log::debug!("Opening WebSocket connection");
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(RecallLinkError::WebSocketError(format!(
            "Connection failed: {}",
            e
        ))),
        Err(_) => Err(RecallLinkError::TimeoutError(format!(
            "Connect timeout ({:?})",
            timeout
        ))),
    }
}

/// Encode and transmit one envelope over an open socket.
async fn send_envelope(ws: &mut WsStream, hooks: &EventHandlers, envelope: &Envelope) -> Result<()> {
    let raw = envelope.encode()?;
    ws.send(Message::Text(raw.clone())).await.map_err(|e| {
        RecallLinkError::WebSocketError(format!(
            "Failed to send '{}': {}",
            envelope.event_type, e
        ))
    })?;
    hooks.emit_send(&raw);
    Ok(())
}

/// Resend JOIN for every current subscription, in insertion order.
///
/// Runs immediately after every successful (re)connection and before any
/// queued caller traffic. The server may see duplicate JOINs for
/// subscriptions it had not forgotten; JOIN is idempotent server-side.
async fn replay_subscriptions(
    ws: &mut WsStream,
    shared: &ConnectionShared,
    hooks: &EventHandlers,
) -> Result<()> {
    let topics = shared.registry.lock().unwrap().snapshot();
    if topics.is_empty() {
        return Ok(());
    }
    log::info!("Replaying {} subscription(s) after connect", topics.len());
    for topic in &topics {
        send_envelope(ws, hooks, &join_envelope(topic)).await?;
    }
    Ok(())
}

/// How one connected epoch ended.
enum EpochEnd {
    /// `disconnect()` was called; acknowledge after teardown.
    ManualDisconnect { ack: oneshot::Sender<()> },
    /// The client handle was dropped.
    CommandChannelClosed,
    /// An AUTH_ERROR envelope arrived.
    AuthRejected,
    /// The server closed with code 1000.
    NormalClose(DisconnectReason),
    /// Transport error, stream end, or close with code ≠ 1000.
    AbnormalClose(DisconnectReason),
}

/// One epoch of a connected socket: multiplex commands, inbound frames,
/// and the heartbeat until the socket dies or the caller shuts down.
async fn run_epoch(
    mut ws: WsStream,
    cmd_rx: &mut mpsc::Receiver<ConnCmd>,
    shared: &ConnectionShared,
    hooks: &EventHandlers,
    heartbeat_period: Option<Duration>,
) -> EpochEnd {
    let period = heartbeat_period.unwrap_or(FAR_FUTURE);
    // First tick after one full period, not immediately.
    let mut heartbeat = interval_at(TokioInstant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Send(envelope)) => {
                    if let Err(e) = send_envelope(&mut ws, hooks, &envelope).await {
                        return EpochEnd::AbnormalClose(DisconnectReason::new(format!(
                            "Send failed: {}",
                            e
                        )));
                    }
                }
                Some(ConnCmd::Disconnect { ack_tx }) => {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        }))
                        .await;
                    return EpochEnd::ManualDisconnect { ack: ack_tx };
                }
                None => {
                    let _ = ws.close(None).await;
                    return EpochEnd::CommandChannelClosed;
                }
            },

            _ = heartbeat.tick(), if heartbeat_period.is_some() => {
                log::debug!("Heartbeat: sending ping");
                let ping = Envelope::new(EventType::Ping, JsonValue::Null);
                if let Err(e) = send_envelope(&mut ws, hooks, &ping).await {
                    return EpochEnd::AbnormalClose(DisconnectReason::new(format!(
                        "Keepalive ping failed: {}",
                        e
                    )));
                }
            }

            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    hooks.emit_receive(&text);
                    match Envelope::decode(&text) {
                        Ok(envelope) => {
                            shared.dispatcher.dispatch(&envelope);
                            if envelope.event_type == EventType::AuthError {
                                // The one message type permitted a
                                // cross-cutting side effect: force an
                                // immediate disconnect, no retry.
                                let _ = ws
                                    .close(Some(CloseFrame {
                                        code: CloseCode::Normal,
                                        reason: "auth rejected".into(),
                                    }))
                                    .await;
                                return EpochEnd::AuthRejected;
                            }
                        }
                        Err(e) => {
                            log::warn!("Dropping malformed frame: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    log::debug!("Dropping unexpected binary frame ({} bytes)", data.len());
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    log::debug!("Protocol pong received");
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(f) => {
                            let code: u16 = f.code.into();
                            let reason = DisconnectReason::with_code(f.reason.to_string(), code);
                            if code == 1000 {
                                EpochEnd::NormalClose(reason)
                            } else {
                                EpochEnd::AbnormalClose(reason)
                            }
                        }
                        None => EpochEnd::AbnormalClose(DisconnectReason::new(
                            "Server closed connection without a code",
                        )),
                    };
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    return EpochEnd::AbnormalClose(DisconnectReason::new(format!(
                        "WebSocket error: {}",
                        e
                    )));
                }
                None => {
                    return EpochEnd::AbnormalClose(DisconnectReason::new(
                        "WebSocket stream ended",
                    ));
                }
            }
        }
    }
}

/// Outcome of waiting out one backoff delay.
enum RetryOutcome {
    /// The timer fired; state has moved to CONNECTING.
    Fire,
    /// `disconnect()` (or client drop) superseded the pending retry.
    Disconnected { ack: Option<oneshot::Sender<()>> },
    /// The retry budget is spent; state has settled in ERROR.
    GaveUp,
}

/// Wait out one backoff delay, still serving commands: sends are dropped
/// (the gate is closed), a disconnect cancels the pending retry.
async fn schedule_retry(
    cmd_rx: &mut mpsc::Receiver<ConnCmd>,
    shared: &ConnectionShared,
    hooks: &EventHandlers,
    policy: &RetryPolicy,
    retries: &mut RetryState,
) -> RetryOutcome {
    if retries.exhausted(policy) {
        apply_event(shared, hooks, ConnectionEvent::RetriesExhausted);
        log::error!(
            "Reconnection attempts exhausted ({} of {})",
            retries.attempts(),
            policy.max_attempts
        );
        hooks.emit_error(ConnectionError::new(
            format!("Reconnection attempts exhausted ({})", policy.max_attempts),
            false,
        ));
        return RetryOutcome::GaveUp;
    }

    let attempt = retries.next_attempt();
    let delay = policy.delay_for(attempt);
    log::info!(
        "Scheduling reconnect attempt {} of {} in {:?}",
        attempt,
        policy.max_attempts,
        delay
    );

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCmd::Send(envelope)) => {
                    log::warn!(
                        "Dropping '{}' send while not connected",
                        envelope.event_type
                    );
                }
                Some(ConnCmd::Disconnect { ack_tx }) => {
                    return RetryOutcome::Disconnected { ack: Some(ack_tx) };
                }
                None => {
                    return RetryOutcome::Disconnected { ack: None };
                }
            },

            _ = &mut sleep => {
                apply_event(shared, hooks, ConnectionEvent::RetryTimerFired);
                return RetryOutcome::Fire;
            }
        }
    }
}

/// Tear down after a disconnect: clear session state and acknowledge.
fn finish_disconnect(shared: &ConnectionShared, ack: Option<oneshot::Sender<()>>) {
    shared.registry.lock().unwrap().clear();
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

/// The connection task. Spawned by `LiveClient::connect()` with the state
/// already at CONNECTING; runs until a terminal state is reached.
pub(crate) async fn connection_task(
    mut cmd_rx: mpsc::Receiver<ConnCmd>,
    url: String,
    options: ConnectionOptions,
    hooks: EventHandlers,
    shared: std::sync::Arc<ConnectionShared>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let policy = options.retry_policy();
    let heartbeat_period = options.heartbeat_interval();
    let mut retries = RetryState::new();
    let mut ready_tx = Some(ready_tx);

    loop {
        // ── Open (state is CONNECTING here) ─────────────────────────────
        let ws = match open_socket(&url, options.connect_timeout()).await {
            Ok(ws) => ws,
            Err(e) => {
                if let Some(tx) = ready_tx.take() {
                    // Initial connect: terminal, the caller gets the error.
                    log::error!("Initial connection failed: {}", e);
                    apply_event(&shared, &hooks, ConnectionEvent::OpenFailed);
                    hooks.emit_error(ConnectionError::new(e.to_string(), false));
                    let _ = tx.send(Err(e));
                    return;
                }
                log::warn!(
                    "Reconnection attempt {} failed: {}",
                    retries.attempts(),
                    e
                );
                hooks.emit_error(ConnectionError::new(e.to_string(), true));
                apply_event(&shared, &hooks, ConnectionEvent::AbnormalClose);
                match schedule_retry(&mut cmd_rx, &shared, &hooks, &policy, &mut retries).await {
                    RetryOutcome::Fire => continue,
                    RetryOutcome::Disconnected { ack } => {
                        apply_event(&shared, &hooks, ConnectionEvent::DisconnectRequested);
                        finish_disconnect(&shared, ack);
                        return;
                    }
                    RetryOutcome::GaveUp => return,
                }
            }
        };

        // ── Connected epoch ─────────────────────────────────────────────
        apply_event(&shared, &hooks, ConnectionEvent::SocketOpened);
        retries.reset();
        hooks.emit_connect();
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }

        let mut ws = ws;
        let end = match replay_subscriptions(&mut ws, &shared, &hooks).await {
            Ok(()) => run_epoch(ws, &mut cmd_rx, &shared, &hooks, heartbeat_period).await,
            Err(e) => EpochEnd::AbnormalClose(DisconnectReason::new(format!(
                "Resubscribe failed: {}",
                e
            ))),
        };

        // ── Epoch teardown ──────────────────────────────────────────────
        match end {
            EpochEnd::ManualDisconnect { ack } => {
                apply_event(&shared, &hooks, ConnectionEvent::DisconnectRequested);
                hooks.emit_disconnect(DisconnectReason::with_code("Client disconnected", 1000));
                finish_disconnect(&shared, Some(ack));
                return;
            }
            EpochEnd::CommandChannelClosed => {
                apply_event(&shared, &hooks, ConnectionEvent::DisconnectRequested);
                hooks.emit_disconnect(DisconnectReason::new("Client handle dropped"));
                finish_disconnect(&shared, None);
                return;
            }
            EpochEnd::AuthRejected => {
                log::warn!("Authentication rejected by server, disconnecting");
                apply_event(&shared, &hooks, ConnectionEvent::AuthRejected);
                hooks.emit_error(ConnectionError::new(
                    "Authentication rejected by server",
                    false,
                ));
                hooks.emit_auth_failure();
                hooks.emit_disconnect(DisconnectReason::new("Authentication rejected"));
                finish_disconnect(&shared, None);
                return;
            }
            EpochEnd::NormalClose(reason) => {
                apply_event(&shared, &hooks, ConnectionEvent::NormalClose);
                hooks.emit_disconnect(reason);
                finish_disconnect(&shared, None);
                return;
            }
            EpochEnd::AbnormalClose(reason) => {
                log::warn!("Connection lost: {}", reason);
                apply_event(&shared, &hooks, ConnectionEvent::AbnormalClose);
                hooks.emit_disconnect(reason);

                if !options.auto_reconnect {
                    apply_event(&shared, &hooks, ConnectionEvent::RetriesExhausted);
                    hooks.emit_error(ConnectionError::new(
                        "Connection lost and auto-reconnect is disabled",
                        false,
                    ));
                    return;
                }

                match schedule_retry(&mut cmd_rx, &shared, &hooks, &policy, &mut retries).await {
                    RetryOutcome::Fire => continue,
                    RetryOutcome::Disconnected { ack } => {
                        apply_event(&shared, &hooks, ConnectionEvent::DisconnectRequested);
                        finish_disconnect(&shared, ack);
                        return;
                    }
                    RetryOutcome::GaveUp => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ws_url_rewrites_http_schemes() {
        let url = resolve_ws_url("http://localhost:3000/live", "tok").unwrap();
        assert_eq!(url, "ws://localhost:3000/live?token=tok");

        let url = resolve_ws_url("https://recall.example.com/live", "tok").unwrap();
        assert_eq!(url, "wss://recall.example.com/live?token=tok");
    }

    #[test]
    fn test_resolve_ws_url_keeps_ws_schemes() {
        let url = resolve_ws_url("ws://127.0.0.1:9000", "abc").unwrap();
        assert!(url.starts_with("ws://127.0.0.1:9000"));
        assert!(url.ends_with("token=abc"));
    }

    #[test]
    fn test_resolve_ws_url_encodes_token() {
        let url = resolve_ws_url("ws://localhost:9000", "a b+c").unwrap();
        assert!(url.contains("token=a+b%2Bc"));
    }

    #[test]
    fn test_resolve_ws_url_rejects_bad_input() {
        assert!(resolve_ws_url("ftp://example.com", "t").is_err());
        assert!(resolve_ws_url("not a url", "t").is_err());
        assert!(resolve_ws_url("ws://user:pass@example.com", "t").is_err());
    }

    #[test]
    fn test_join_leave_envelopes() {
        let join = join_envelope("group-7");
        assert_eq!(join.event_type, EventType::GroupJoin);
        assert_eq!(join.payload["topic"], json!("group-7"));

        let leave = leave_envelope("group-7");
        assert_eq!(leave.event_type, EventType::GroupLeave);
        assert_eq!(leave.payload["topic"], json!("group-7"));
    }
}
