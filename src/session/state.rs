//! Connection state machine and the status it exposes.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{Result, WasimError};

/// Internal lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    /// Opening the link.
    Initializing,
    /// Link up, no session.
    LinkEstablished,
    /// Session handshake in flight.
    Negotiating,
    SessionActive,
    ShuttingDown,
}

impl ConnectionState {
    fn can_move_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Idle, Initializing)
                | (Initializing, LinkEstablished | Idle | ShuttingDown)
                | (LinkEstablished, Negotiating | ShuttingDown)
                | (Negotiating, SessionActive | LinkEstablished | ShuttingDown)
                | (SessionActive, LinkEstablished | ShuttingDown)
                | (ShuttingDown, Idle)
        )
    }
}

/// Externally visible status bit set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientStatus(pub u8);

impl ClientStatus {
    pub const IDLE: ClientStatus = ClientStatus(0);
    pub const INITIALIZING: ClientStatus = ClientStatus(0x01);
    pub const SIM_CONNECTED: ClientStatus = ClientStatus(0x02);
    pub const CONNECTING: ClientStatus = ClientStatus(0x04);
    pub const CONNECTED: ClientStatus = ClientStatus(0x08);
    pub const SHUTTING_DOWN: ClientStatus = ClientStatus(0x10);

    /// Check whether every bit of `other` is set.
    #[inline]
    pub fn contains(self, other: ClientStatus) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    fn for_state(state: ConnectionState, previous: ClientStatus) -> ClientStatus {
        match state {
            ConnectionState::Idle => Self::IDLE,
            ConnectionState::Initializing => Self::INITIALIZING,
            ConnectionState::LinkEstablished => Self::SIM_CONNECTED,
            ConnectionState::Negotiating => Self::SIM_CONNECTED | Self::CONNECTING,
            ConnectionState::SessionActive => Self::SIM_CONNECTED | Self::CONNECTED,
            ConnectionState::ShuttingDown => previous | Self::SHUTTING_DOWN,
        }
    }
}

impl std::ops::BitOr for ClientStatus {
    type Output = ClientStatus;

    fn bitor(self, rhs: Self) -> Self::Output {
        ClientStatus(self.0 | rhs.0)
    }
}

impl fmt::Debug for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(ClientStatus, &str); 5] = [
            (ClientStatus::INITIALIZING, "INITIALIZING"),
            (ClientStatus::SIM_CONNECTED, "SIM_CONNECTED"),
            (ClientStatus::CONNECTING, "CONNECTING"),
            (ClientStatus::CONNECTED, "CONNECTED"),
            (ClientStatus::SHUTTING_DOWN, "SHUTTING_DOWN"),
        ];
        if self.0 == 0 {
            return f.write_str("IDLE");
        }
        let names: Vec<_> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(" | "))
    }
}

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventType {
    SimConnecting,
    SimConnected,
    SimDisconnecting,
    SimDisconnected,
    ServerConnecting,
    ServerConnected,
    ServerDisconnected,
}

/// Lifecycle notification, emitted when the visible status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEvent {
    pub event_type: ClientEventType,
    pub status: ClientStatus,
    pub message: String,
}

fn describe(from: ConnectionState, to: ConnectionState) -> (ClientEventType, &'static str) {
    use ConnectionState::*;
    match (from, to) {
        (_, Initializing) => (ClientEventType::SimConnecting, "Connecting to the simulator"),
        (Initializing, LinkEstablished) => (ClientEventType::SimConnected, "Link established"),
        (Initializing, Idle) => (ClientEventType::SimDisconnected, "Link could not be opened"),
        (_, Negotiating) => (ClientEventType::ServerConnecting, "Connecting to the server"),
        (_, SessionActive) => (ClientEventType::ServerConnected, "Server session active"),
        (Negotiating, LinkEstablished) => {
            (ClientEventType::ServerDisconnected, "Server session failed")
        }
        (_, LinkEstablished) => (ClientEventType::ServerDisconnected, "Server session ended"),
        (_, ShuttingDown) => (ClientEventType::SimDisconnecting, "Closing the link"),
        (_, Idle) => (ClientEventType::SimDisconnected, "Link closed"),
    }
}

/// Serializes state transitions.
#[derive(Default)]
pub(crate) struct StateMachine {
    inner: Mutex<(ConnectionState, ClientStatus)>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.inner.lock().0
    }

    pub(crate) fn status(&self) -> ClientStatus {
        self.inner.lock().1
    }

    /// Move to `to`, returning the event to emit if the visible status
    /// changed. Transitions not in the lifecycle fail with
    /// [`WasimError::Fail`].
    pub(crate) fn transition(&self, to: ConnectionState) -> Result<Option<ClientEvent>> {
        apply(&mut self.inner.lock(), to)
    }

    /// Like [`StateMachine::transition`], but only from `expected`.
    /// Returns `Ok(None)` without changing anything otherwise.
    pub(crate) fn transition_from(
        &self,
        expected: ConnectionState,
        to: ConnectionState,
    ) -> Result<Option<ClientEvent>> {
        let mut inner = self.inner.lock();
        if inner.0 != expected {
            return Ok(None);
        }
        apply(&mut inner, to)
    }
}

fn apply(
    inner: &mut (ConnectionState, ClientStatus),
    to: ConnectionState,
) -> Result<Option<ClientEvent>> {
    let (from, previous) = *inner;
    if !from.can_move_to(to) {
        return Err(WasimError::Fail(format!(
            "cannot move from {from:?} to {to:?}"
        )));
    }

    let status = ClientStatus::for_state(to, previous);
    *inner = (to, status);
    if status == previous {
        return Ok(None);
    }

    let (event_type, message) = describe(from, to);
    Ok(Some(ClientEvent {
        event_type,
        status,
        message: message.to_string(),
    }))
}
