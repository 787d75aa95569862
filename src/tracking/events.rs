//! Registered calculator events.
//!
//! An event is a piece of calculator code stored on the server under a
//! caller-chosen id, later fired by id. The registry remembers which events
//! the server has confirmed so it can replay them after a reconnect and
//! queue removals made while offline.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::codec::{Command, STRSZ_CMD, STRSZ_ENAME};
use crate::error::{Result, WasimError};
use crate::protocol::CommandId;

/// Calculator code registered with the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisteredEvent {
    pub event_id: u32,
    /// Calculator code; empty means "remove".
    pub code: String,
    /// Optional name the server exposes the event under.
    pub name: String,
}

impl RegisteredEvent {
    pub fn new(event_id: u32, code: impl Into<String>) -> Self {
        Self {
            event_id,
            code: code.into(),
            name: String::new(),
        }
    }

    pub fn named(event_id: u32, code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            event_id,
            code: code.into(),
            name: name.into(),
        }
    }
}

/// Outcome of starting a removal.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Removal {
    /// The server never saw the event; it is gone.
    Local,
    /// The server must be told. Send the command, then call `finish_remove`.
    Notify(Command),
}

struct TrackedEvent {
    event: RegisteredEvent,
    confirmed: bool,
}

impl TrackedEvent {
    fn pending_removal(&self) -> bool {
        self.event.code.is_empty()
    }

    fn register_command(&self, resend_name: bool) -> Command {
        let event = &self.event;
        let with_name = (!self.confirmed || resend_name) && !event.name.is_empty();
        let text = if with_name && !event.code.is_empty() {
            format!("{}${}", event.name, event.code)
        } else {
            event.code.clone()
        };
        Command::with_text(CommandId::Register, event.event_id, text)
    }
}

#[derive(Default)]
pub(crate) struct EventRegistry {
    events: RwLock<BTreeMap<u32, TrackedEvent>>,
}

impl EventRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add or change an event.
    ///
    /// Returns the command that registers it with the server, or `None` if
    /// nothing changed. `code` must not be empty; removal goes through
    /// [`EventRegistry::begin_remove`].
    pub(crate) fn upsert(&self, event: RegisteredEvent) -> Result<Option<Command>> {
        if event.code.is_empty() {
            return Err(WasimError::invalid("event code is empty"));
        }
        if event.name.len() >= STRSZ_ENAME {
            return Err(WasimError::invalid(format!(
                "event name exceeds {} bytes",
                STRSZ_ENAME - 1
            )));
        }
        let name_len = if event.name.is_empty() {
            0
        } else {
            event.name.len() + 1
        };
        if event.code.len() + name_len >= STRSZ_CMD {
            return Err(WasimError::invalid(format!(
                "event code and name exceed {} bytes",
                STRSZ_CMD - 1
            )));
        }

        let mut events = self.events.write();
        match events.get_mut(&event.event_id) {
            Some(tracked) => {
                if tracked.confirmed
                    && !tracked.pending_removal()
                    && !event.name.is_empty()
                    && event.name != tracked.event.name
                {
                    return Err(WasimError::invalid(format!(
                        "event {} is already registered as '{}' and cannot be renamed",
                        event.event_id, tracked.event.name
                    )));
                }
                if tracked.event.code == event.code && tracked.event.name == event.name {
                    return Ok(None);
                }
                if !event.name.is_empty() {
                    tracked.event.name = event.name;
                }
                tracked.event.code = event.code;
                Ok(Some(tracked.register_command(false)))
            }
            None => {
                let tracked = TrackedEvent {
                    event,
                    confirmed: false,
                };
                let command = tracked.register_command(false);
                events.insert(tracked.event.event_id, tracked);
                Ok(Some(command))
            }
        }
    }

    /// Record that the server accepted the registration for `id`.
    pub(crate) fn mark_confirmed(&self, id: u32) {
        if let Some(tracked) = self.events.write().get_mut(&id) {
            tracked.confirmed = true;
        }
    }

    pub(crate) fn begin_remove(&self, id: u32) -> Result<Removal> {
        let mut events = self.events.write();
        let Some(tracked) = events.get_mut(&id) else {
            return Err(WasimError::invalid(format!("event {id} is not registered")));
        };
        if !tracked.confirmed {
            events.remove(&id);
            return Ok(Removal::Local);
        }
        tracked.event.code.clear();
        Ok(Removal::Notify(tracked.register_command(false)))
    }

    pub(crate) fn finish_remove(&self, id: u32) {
        let mut events = self.events.write();
        if events.get(&id).is_some_and(TrackedEvent::pending_removal) {
            events.remove(&id);
        }
    }

    /// Active (not pending removal) event.
    pub(crate) fn get(&self, id: u32) -> Option<RegisteredEvent> {
        self.events
            .read()
            .get(&id)
            .filter(|tracked| !tracked.pending_removal())
            .map(|tracked| tracked.event.clone())
    }

    pub(crate) fn list(&self) -> Vec<RegisteredEvent> {
        self.events
            .read()
            .values()
            .filter(|tracked| !tracked.pending_removal())
            .map(|tracked| tracked.event.clone())
            .collect()
    }

    /// Commands that bring a fresh session up to date: registrations (with
    /// names resent) first, then queued removals.
    pub(crate) fn resync_commands(&self) -> (Vec<Command>, Vec<Command>) {
        let events = self.events.read();
        let (removals, active): (Vec<_>, Vec<_>) =
            events.values().partition(|tracked| tracked.pending_removal());
        (
            active
                .iter()
                .map(|tracked| tracked.register_command(true))
                .collect(),
            removals
                .iter()
                .map(|tracked| tracked.register_command(false))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_sends_name_and_code() {
        let registry = EventRegistry::new();
        let command = registry
            .upsert(RegisteredEvent::named(7, "1 (>K:AP_MASTER)", "ApToggle"))
            .unwrap()
            .unwrap();
        assert_eq!(command.command_id, CommandId::Register);
        assert_eq!(command.u_data, 7);
        assert_eq!(command.s_data, "ApToggle$1 (>K:AP_MASTER)");
    }

    #[test]
    fn test_same_code_is_noop() {
        let registry = EventRegistry::new();
        registry.upsert(RegisteredEvent::new(1, "code")).unwrap();
        assert!(registry.upsert(RegisteredEvent::new(1, "code")).unwrap().is_none());
    }

    #[test]
    fn test_confirmed_event_sends_code_only() {
        let registry = EventRegistry::new();
        registry
            .upsert(RegisteredEvent::named(1, "a", "Name"))
            .unwrap();
        registry.mark_confirmed(1);

        let command = registry
            .upsert(RegisteredEvent::named(1, "b", "Name"))
            .unwrap()
            .unwrap();
        assert_eq!(command.s_data, "b");
    }

    #[test]
    fn test_rename_after_confirmation_rejected() {
        let registry = EventRegistry::new();
        registry
            .upsert(RegisteredEvent::named(1, "a", "First"))
            .unwrap();
        registry.mark_confirmed(1);

        let err = registry
            .upsert(RegisteredEvent::named(1, "b", "Second"))
            .unwrap_err();
        assert!(matches!(err, WasimError::InvalidArgument(_)));
        assert_eq!(registry.get(1).unwrap().code, "a");
    }

    #[test]
    fn test_length_limits() {
        let registry = EventRegistry::new();
        let code = "x".repeat(STRSZ_CMD - 5);
        assert!(registry
            .upsert(RegisteredEvent::named(1, code.clone(), "abcd"))
            .is_err());
        assert!(registry.upsert(RegisteredEvent::new(1, code)).is_ok());
        assert!(registry
            .upsert(RegisteredEvent::named(2, "c", "n".repeat(STRSZ_ENAME)))
            .is_err());
    }

    #[test]
    fn test_remove_unconfirmed_is_local() {
        let registry = EventRegistry::new();
        registry.upsert(RegisteredEvent::new(1, "code")).unwrap();
        assert_eq!(registry.begin_remove(1).unwrap(), Removal::Local);
        assert!(registry.get(1).is_none());
        assert!(registry.begin_remove(1).is_err());
    }

    #[test]
    fn test_remove_confirmed_queues_until_finished() {
        let registry = EventRegistry::new();
        registry
            .upsert(RegisteredEvent::named(1, "code", "Name"))
            .unwrap();
        registry.mark_confirmed(1);

        let Removal::Notify(command) = registry.begin_remove(1).unwrap() else {
            panic!("expected a notify removal");
        };
        assert_eq!(command.s_data, "");
        assert!(registry.get(1).is_none());

        let (upserts, removals) = registry.resync_commands();
        assert!(upserts.is_empty());
        assert_eq!(removals.len(), 1);

        registry.finish_remove(1);
        let (_, removals) = registry.resync_commands();
        assert!(removals.is_empty());
    }

    #[test]
    fn test_resync_resends_names() {
        let registry = EventRegistry::new();
        registry
            .upsert(RegisteredEvent::named(1, "code", "Name"))
            .unwrap();
        registry.mark_confirmed(1);

        let (upserts, _) = registry.resync_commands();
        assert_eq!(upserts[0].s_data, "Name$code");
        assert_eq!(registry.resync_commands(), registry.resync_commands());
    }
}
