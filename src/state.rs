//! Connection lifecycle states and the transition table.
//!
//! The state machine is expressed as a pure function over
//! (current state, event) pairs so that every legal transition is visible
//! in one place and unit-testable without a socket. The connection task
//! drives it and performs the associated side effects (opening sockets,
//! arming timers, replaying subscriptions).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of the realtime connection.
///
/// Owned by the connection task; all other components read it, never
/// mutate it. `Disconnected` and `Error` are terminal until
/// `connect()` is called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket. Initial state, and the result of a manual disconnect.
    Disconnected,
    /// Socket handshake in flight.
    Connecting,
    /// Socket open and authenticated; traffic flows.
    Connected,
    /// Abnormal close observed; a retry timer is pending.
    Reconnecting,
    /// Open failure or retries exhausted; requires a fresh `connect()`.
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// Events that drive the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionEvent {
    /// `connect()` was called.
    ConnectRequested,
    /// The socket handshake completed.
    SocketOpened,
    /// The socket handshake failed or timed out.
    OpenFailed,
    /// The socket closed normally (code 1000).
    NormalClose,
    /// The socket closed abnormally (code ≠ 1000, or a transport error).
    AbnormalClose,
    /// The pending retry timer fired.
    RetryTimerFired,
    /// The retry budget is spent.
    RetriesExhausted,
    /// An AUTH_ERROR envelope arrived.
    AuthRejected,
    /// `disconnect()` was called.
    DisconnectRequested,
}

/// The legal-transition table.
///
/// Returns the successor state, or `None` when the event is not meaningful
/// in the current state (stale timer fires, duplicate requests); callers
/// must ignore `None` rather than treat it as a failure.
pub(crate) fn transition(
    state: ConnectionState,
    event: ConnectionEvent,
) -> Option<ConnectionState> {
    use ConnectionEvent::*;
    use ConnectionState::*;

    match (state, event) {
        (Disconnected | Error, ConnectRequested) => Some(Connecting),
        (Connecting, SocketOpened) => Some(Connected),
        (Connecting, OpenFailed) => Some(Error),
        (Connected, NormalClose) => Some(Disconnected),
        (Connected, AbnormalClose) => Some(Reconnecting),
        (Reconnecting, RetryTimerFired) => Some(Connecting),
        (Reconnecting, RetriesExhausted) => Some(Error),
        // A reconnect attempt that fails to open goes back to waiting.
        (Connecting, AbnormalClose) => Some(Reconnecting),
        (Connected | Reconnecting, AuthRejected) => Some(Disconnected),
        (Connecting | Connected | Reconnecting, DisconnectRequested) => Some(Disconnected),
        _ => None,
    }
}

/// Lock-free cell holding the current [`ConnectionState`].
///
/// The connection task is the only writer; `LiveClient` accessors read it
/// from any task.
#[derive(Debug)]
pub(crate) struct StateCell {
    bits: AtomicU8,
}

impl StateCell {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self {
            bits: AtomicU8::new(Self::encode(state)),
        }
    }

    pub(crate) fn load(&self) -> ConnectionState {
        Self::decode(self.bits.load(Ordering::SeqCst))
    }

    /// Store a new state, returning the previous one.
    pub(crate) fn store(&self, state: ConnectionState) -> ConnectionState {
        Self::decode(self.bits.swap(Self::encode(state), Ordering::SeqCst))
    }

    fn encode(state: ConnectionState) -> u8 {
        match state {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Error => 4,
        }
    }

    fn decode(bits: u8) -> ConnectionState {
        match bits {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            _ => ConnectionState::Error,
        }
    }
}
