//! Client-side bookkeeping: in-flight commands, subscriptions, registered
//! events and list results.

mod correlator;
mod events;
mod list;
mod requests;

pub(crate) use correlator::{CommandCorrelator, WaitLimit};
pub(crate) use events::{EventRegistry, Removal};
pub(crate) use list::ListAggregator;
pub(crate) use requests::{RequestRegistry, Upsert};

pub use events::RegisteredEvent;
pub use list::{ListOutcome, ListResult};
pub use requests::{DataRequestRecord, SyncStatus};
