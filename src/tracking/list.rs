//! Chunked list results.
//!
//! A list request is answered by any number of `List` commands, one item
//! each, followed by an `Ack` or `Nak` with the request's token. Only one
//! list may be in flight per client.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::codec::Command;
use crate::error::{Result, WasimError};
use crate::protocol::{CommandId, LookupItemType};

/// How a list request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOutcome {
    /// Terminated by an `Ack`.
    Complete,
    /// Terminated by a `Nak`, with its reason.
    Rejected(String),
    /// No chunk arrived within the timeout.
    Timeout,
    /// The session ended first.
    Disconnected,
}

/// Items gathered by a list request. Partial results are kept on failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ListResult {
    pub item_type: LookupItemType,
    pub outcome: ListOutcome,
    /// `(id, name)` pairs in arrival order.
    pub items: Vec<(i32, String)>,
}

impl ListResult {
    pub fn is_complete(&self) -> bool {
        self.outcome == ListOutcome::Complete
    }
}

struct ActiveList {
    item_type: LookupItemType,
    token: u32,
    items: Vec<(i32, String)>,
    last_chunk: Instant,
}

#[derive(Default)]
pub(crate) struct ListAggregator {
    active: Mutex<Option<ActiveList>>,
}

impl ListAggregator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the single list slot for the request tracked under `token`.
    pub(crate) fn begin(&self, item_type: LookupItemType, token: u32) -> Result<ListGuard<'_>> {
        if !matches!(
            item_type,
            LookupItemType::LocalVariable
                | LookupItemType::DataRequest
                | LookupItemType::RegisteredEvent
        ) {
            return Err(WasimError::invalid(format!(
                "{item_type:?} items cannot be listed"
            )));
        }

        let mut active = self.active.lock();
        if let Some(list) = active.as_ref() {
            return Err(WasimError::invalid(format!(
                "a {:?} list is already in progress",
                list.item_type
            )));
        }
        *active = Some(ActiveList {
            item_type,
            token,
            items: Vec::new(),
            last_chunk: Instant::now(),
        });
        Ok(ListGuard {
            aggregator: self,
            item_type,
            token,
        })
    }

    /// Add a `List` chunk. Returns `false` if no list with its token is
    /// active.
    pub(crate) fn push_chunk(&self, chunk: &Command) -> bool {
        debug_assert_eq!(chunk.command_id, CommandId::List);
        let mut active = self.active.lock();
        match active.as_mut() {
            Some(list) if list.token == chunk.token => {
                list.items.push((chunk.u_data as i32, chunk.s_data.clone()));
                list.last_chunk = Instant::now();
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Release the slot if `token` still owns it.
    fn release(&self, token: u32) -> Option<ActiveList> {
        let mut active = self.active.lock();
        match active.as_ref() {
            Some(list) if list.token == token => active.take(),
            _ => None,
        }
    }

    fn last_chunk(&self) -> Option<Instant> {
        self.active.lock().as_ref().map(|list| list.last_chunk)
    }

    /// Completes once `timeout` has passed with no chunk. The deadline moves
    /// forward with every chunk.
    pub(crate) async fn inactivity(&self, timeout: Duration) -> WasimError {
        while let Some(last) = self.last_chunk() {
            let deadline = last + timeout;
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }
        WasimError::Timeout(timeout)
    }
}

/// Holds the list slot. Dropping it without [`ListGuard::finish`] frees it.
///
/// A guard only ever releases the entry carrying its own token.
pub(crate) struct ListGuard<'a> {
    aggregator: &'a ListAggregator,
    item_type: LookupItemType,
    token: u32,
}

impl ListGuard<'_> {
    /// Release the slot and return everything gathered so far.
    pub(crate) fn finish(self, outcome: ListOutcome) -> ListResult {
        let items = self
            .aggregator
            .release(self.token)
            .map(|list| list.items)
            .unwrap_or_default();
        ListResult {
            item_type: self.item_type,
            outcome,
            items,
        }
    }
}

impl Drop for ListGuard<'_> {
    fn drop(&mut self) {
        self.aggregator.release(self.token);
    }
}
