//! Observer slots.
//!
//! Each slot holds at most one callback. Callbacks run on the dispatch task
//! (or on the caller's task for lifecycle events raised by connect and
//! disconnect); a panicking callback is logged and does not stop dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::{Command, LogRecord};
use crate::session::ClientEvent;
use crate::tracking::{DataRequestRecord, ListResult};

pub type ClientEventCallback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;
pub type ListResultsCallback = Arc<dyn Fn(&ListResult) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(&DataRequestRecord) + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(&LogRecord) + Send + Sync>;
/// Receives every command seen on the response channel, or every
/// `Ack`/`Nak`, depending on the slot.
pub type CommandCallback = Arc<dyn Fn(&Command) + Send + Sync>;

struct Slot<T: ?Sized>(RwLock<Option<Arc<T>>>);

impl<T: ?Sized> Default for Slot<T> {
    fn default() -> Self {
        Slot(RwLock::new(None))
    }
}

impl<T: ?Sized> Slot<T> {
    fn set(&self, callback: Option<Arc<T>>) {
        *self.0.write() = callback;
    }

    /// The lock is released before the callback runs, so a callback may
    /// replace itself.
    fn get(&self) -> Option<Arc<T>> {
        self.0.read().clone()
    }
}

#[derive(Default)]
pub(crate) struct Callbacks {
    client_event: Slot<dyn Fn(&ClientEvent) + Send + Sync>,
    list_results: Slot<dyn Fn(&ListResult) + Send + Sync>,
    data: Slot<dyn Fn(&DataRequestRecord) + Send + Sync>,
    log: Slot<dyn Fn(&LogRecord) + Send + Sync>,
    command_result: Slot<dyn Fn(&Command) + Send + Sync>,
    response: Slot<dyn Fn(&Command) + Send + Sync>,
}

impl Callbacks {
    pub(crate) fn set_client_event(&self, callback: Option<ClientEventCallback>) {
        self.client_event.set(callback);
    }

    pub(crate) fn set_list_results(&self, callback: Option<ListResultsCallback>) {
        self.list_results.set(callback);
    }

    pub(crate) fn set_data(&self, callback: Option<DataCallback>) {
        self.data.set(callback);
    }

    pub(crate) fn set_log(&self, callback: Option<LogCallback>) {
        self.log.set(callback);
    }

    pub(crate) fn set_command_result(&self, callback: Option<CommandCallback>) {
        self.command_result.set(callback);
    }

    pub(crate) fn set_response(&self, callback: Option<CommandCallback>) {
        self.response.set(callback);
    }

    pub(crate) fn client_event(&self, event: &ClientEvent) {
        if let Some(callback) = self.client_event.get() {
            guarded("client event", || callback(event));
        }
    }

    pub(crate) fn list_results(&self, result: &ListResult) {
        if let Some(callback) = self.list_results.get() {
            guarded("list results", || callback(result));
        }
    }

    pub(crate) fn data(&self, record: &DataRequestRecord) {
        if let Some(callback) = self.data.get() {
            guarded("data", || callback(record));
        }
    }

    pub(crate) fn log(&self, record: &LogRecord) {
        if let Some(callback) = self.log.get() {
            guarded("log", || callback(record));
        }
    }

    pub(crate) fn command_result(&self, command: &Command) {
        if let Some(callback) = self.command_result.get() {
            guarded("command result", || callback(command));
        }
    }

    pub(crate) fn response(&self, command: &Command) {
        if let Some(callback) = self.response.get() {
            guarded("response", || callback(command));
        }
    }
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(target: "wasim_client::callbacks", kind, "Callback panicked");
    }
}
