//! `taskproc-hooks`: lifecycle events emitted by the scheduler and the
//! listener set that observes them.
//!
//! Listeners register under a name for the [`EventKind`]s they care about.
//! Emission is synchronous on the scheduler's task, so handlers must be cheap;
//! a [`ChannelListener`] hands events off to another task when they are not.

pub mod listener;
pub mod types;

pub use listener::{ChannelListener, Listener, ListenerSet, LoggingListener};
pub use types::{EventKind, SchedulerEvent};
