//! Token correlation for commands that expect a response.
//!
//! Every tracked command gets a token that is unique among the waiting
//! commands of the same kind. Responses name the kind they answer in
//! `u_data`, so a data request acknowledged under its request id never
//! meets a `Get` that happens to hold the same number. The dispatch task
//! hands each `Ack`/`Nak` to [`CommandCorrelator::fulfill`], which wakes the
//! one waiter registered for that kind and token. A waiter always ends in
//! exactly one of: response, timeout, predicate completion, or link/session
//! loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{oneshot, watch};

use crate::codec::Command;
use crate::error::{Result, WasimError};
use crate::protocol::CommandId;
use crate::transport::BoxFuture;

type Key = (CommandId, u32);

struct PendingEntry {
    generation: u64,
    reply: oneshot::Sender<Command>,
}

/// How long a tracked command may wait.
pub(crate) enum WaitLimit<'a> {
    /// Fail with [`WasimError::Timeout`] after a fixed duration.
    Timeout(Duration),
    /// Stop when the future completes, failing with the error it yields.
    Predicate(BoxFuture<'a, WasimError>),
}

/// Registry of in-flight tracked commands, keyed by command kind and token.
pub(crate) struct CommandCorrelator {
    pending: RwLock<HashMap<Key, PendingEntry>>,
    next_token: AtomicU32,
    next_generation: AtomicU64,
}

impl CommandCorrelator {
    pub(crate) fn new() -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            next_token: AtomicU32::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Next token from the counter. Never 0.
    pub(crate) fn next_token(&self) -> u32 {
        loop {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            if token != 0 {
                return token;
            }
        }
    }

    /// Register a waiter for a response to a `kind` command.
    ///
    /// `token == 0` picks a fresh token that is not in use. A caller-chosen
    /// token that is already waiting is rejected.
    pub(crate) fn register(&self, kind: CommandId, token: u32) -> Result<PendingCommand<'_>> {
        let (tx, rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let entry = PendingEntry {
            generation,
            reply: tx,
        };

        let mut pending = self.pending.write();
        let token = if token == 0 {
            let mut candidate = self.next_token();
            while pending.contains_key(&(kind, candidate)) {
                candidate = self.next_token();
            }
            candidate
        } else if pending.contains_key(&(kind, token)) {
            return Err(WasimError::invalid(format!(
                "token {token} already has a {kind:?} command waiting"
            )));
        } else {
            token
        };
        pending.insert((kind, token), entry);

        Ok(PendingCommand {
            key: (kind, token),
            generation,
            rx,
            correlator: self,
        })
    }

    /// Deliver a response to the waiter registered for its kind and token.
    ///
    /// The entry is removed before delivery, so a second response with the
    /// same token finds nothing. Returns `true` if a waiter received it.
    pub(crate) fn fulfill(&self, response: &Command) -> bool {
        let Some(kind) = response.responds_to() else {
            return false;
        };
        let Some(entry) = self.pending.write().remove(&(kind, response.token)) else {
            return false;
        };
        entry.reply.send(response.clone()).is_ok()
    }

    /// Drop every waiter. Each one wakes with [`WasimError::NotConnected`].
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<_> = self.pending.write().drain().collect();
        drained.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.read().len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, kind: CommandId, token: u32) -> bool {
        self.pending.read().contains_key(&(kind, token))
    }

    fn remove_if_current(&self, key: Key, generation: u64) {
        let mut pending = self.pending.write();
        if pending
            .get(&key)
            .is_some_and(|entry| entry.generation == generation)
        {
            pending.remove(&key);
        }
    }
}

/// A registered waiter. Dropping it removes its entry.
pub(crate) struct PendingCommand<'a> {
    key: Key,
    generation: u64,
    rx: oneshot::Receiver<Command>,
    correlator: &'a CommandCorrelator,
}

impl PendingCommand<'_> {
    pub(crate) fn token(&self) -> u32 {
        self.key.1
    }

    /// Wait for the response.
    ///
    /// `alive` is the link or session flag the command depends on; it
    /// turning `false` ends the wait with [`WasimError::NotConnected`].
    pub(crate) async fn wait(
        mut self,
        limit: WaitLimit<'_>,
        mut alive: watch::Receiver<bool>,
    ) -> Result<Command> {
        let lost = async move {
            let _ = alive.wait_for(|up| !*up).await;
        };
        let rx = &mut self.rx;

        match limit {
            WaitLimit::Timeout(duration) => tokio::select! {
                biased;
                reply = rx => reply.map_err(|_| WasimError::NotConnected),
                _ = lost => Err(WasimError::NotConnected),
                _ = tokio::time::sleep(duration) => Err(WasimError::Timeout(duration)),
            },
            WaitLimit::Predicate(done) => tokio::select! {
                biased;
                reply = rx => reply.map_err(|_| WasimError::NotConnected),
                _ = lost => Err(WasimError::NotConnected),
                err = done => Err(err),
            },
        }
    }
}

impl Drop for PendingCommand<'_> {
    fn drop(&mut self) {
        self.correlator
            .remove_if_current(self.key, self.generation);
    }
}
