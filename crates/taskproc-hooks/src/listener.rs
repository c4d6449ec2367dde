use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::types::{EventKind, SchedulerEvent};

/// Handlers slower than this are reported, since they stall the timing loop.
const SLOW_LISTENER_MS: u64 = 50;

/// Synchronous event observer.
///
/// Runs on the scheduler's own task: keep it short and non-blocking.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &SchedulerEvent);
}

impl<F> Listener for F
where
    F: Fn(&SchedulerEvent) + Send + Sync,
{
    fn on_event(&self, event: &SchedulerEvent) {
        self(event)
    }
}

struct Registration {
    name: String,
    kinds: Vec<EventKind>,
    listener: Arc<dyn Listener>,
}

/// Registry of named listeners, each subscribed to a subset of event kinds.
///
/// Shared as `Arc<ListenerSet>` between the engine, the dispatcher and
/// whoever registers listeners.
pub struct ListenerSet {
    listeners: RwLock<Vec<Registration>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self { listeners: RwLock::new(Vec::new()) }
    }

    /// Subscribe `listener` to `kinds`. A name that is already registered is
    /// replaced.
    pub fn register(&self, name: impl Into<String>, kinds: &[EventKind], listener: Arc<dyn Listener>) {
        let name = name.into();
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        listeners.retain(|r| r.name != name);
        debug!(%name, kinds = kinds.len(), "listener registered");
        listeners.push(Registration { name, kinds: kinds.to_vec(), listener });
    }

    /// Subscribe `listener` to every event kind.
    pub fn register_all(&self, name: impl Into<String>, listener: Arc<dyn Listener>) {
        self.register(name, &EventKind::ALL, listener);
    }

    /// Remove a listener by name. Silent no-op if the name is not found.
    pub fn unregister(&self, name: &str) {
        let mut listeners = self.listeners.write().expect("listener registry poisoned");
        let before = listeners.len();
        listeners.retain(|r| r.name != name);
        if listeners.len() < before {
            debug!(name, "listener unregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().expect("listener registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every subscribed listener in registration order.
    ///
    /// A panicking listener is logged and skipped; it never reaches the caller.
    pub fn emit(&self, event: &SchedulerEvent) {
        let kind = event.kind();
        let listeners = self.listeners.read().expect("listener registry poisoned");

        for reg in listeners.iter().filter(|r| r.kinds.contains(&kind)) {
            let t = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| reg.listener.on_event(event)));
            let elapsed_ms = t.elapsed().as_millis() as u64;

            if outcome.is_err() {
                error!(listener = %reg.name, ?kind, "listener panicked while handling event");
            } else if elapsed_ms > SLOW_LISTENER_MS {
                warn!(listener = %reg.name, ?kind, duration_ms = elapsed_ms, "slow listener");
            } else {
                trace!(listener = %reg.name, ?kind, duration_ms = elapsed_ms, "listener completed");
            }
        }
    }
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards events into an unbounded channel so a separate task can consume
/// them without holding up the scheduler.
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Listener for ChannelListener {
    fn on_event(&self, event: &SchedulerEvent) {
        // Receiver gone means nobody is interested any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Renders every event through `tracing`: fires at debug, misfires and skips
/// at warn, completions at trace, failures at error.
pub struct LoggingListener;

impl Listener for LoggingListener {
    fn on_event(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::TriggerFired { job, trigger, scheduled_fire_time, .. } => {
                debug!(%job, %trigger, scheduled = %scheduled_fire_time, "trigger fired");
            }
            SchedulerEvent::TriggerMisfired { job, trigger, instruction, missed_fire_time } => {
                warn!(%job, %trigger, %instruction, missed = %missed_fire_time, "trigger misfired");
            }
            SchedulerEvent::TriggerComplete { job, trigger, instruction, .. } => {
                trace!(%job, %trigger, %instruction, "trigger complete");
            }
            SchedulerEvent::JobExecuted {
                job,
                duration_ms,
                error: Some(err),
                refire_immediately,
                unschedule_firing_trigger,
                unschedule_all_triggers_of_job,
                ..
            } => {
                error!(
                    %job,
                    duration_ms,
                    refire_immediately,
                    unschedule_firing_trigger,
                    unschedule_all_triggers_of_job,
                    "job failed: {err}"
                );
            }
            // Successful runs are not logged here.
            SchedulerEvent::JobExecuted { error: None, .. } => {}
            SchedulerEvent::FireSkipped { job, trigger, .. } => {
                warn!(%job, %trigger, "fire skipped: job is still running");
            }
            SchedulerEvent::SchedulerError { message, cause, fatal } => {
                error!(fatal, %cause, "scheduler error: {message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskproc_core::types::{JobId, TriggerKey};
    use uuid::Uuid;

    fn skipped() -> SchedulerEvent {
        SchedulerEvent::FireSkipped {
            job: JobId::from("a"),
            trigger: TriggerKey::new("DEFAULT", "a"),
            fire_id: Uuid::nil(),
        }
    }

    fn fault() -> SchedulerEvent {
        SchedulerEvent::SchedulerError { message: "m".into(), cause: "c".into(), fatal: false }
    }

    #[test]
    fn listener_only_sees_subscribed_kinds() {
        let set = ListenerSet::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        set.register(
            "skips",
            &[EventKind::FireSkipped],
            Arc::new(move |_: &SchedulerEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        set.emit(&skipped());
        set.emit(&fault());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let set = ListenerSet::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        set.register_all("bad", Arc::new(|_: &SchedulerEvent| panic!("listener bug")));
        set.register_all(
            "good",
            Arc::new(move |_: &SchedulerEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        set.emit(&fault());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_same_name_replaces() {
        let set = ListenerSet::new();
        set.register_all("log", Arc::new(LoggingListener));
        set.register_all("log", Arc::new(LoggingListener));
        assert_eq!(set.len(), 1);
        set.unregister("log");
        assert!(set.is_empty());
        // unknown name is a no-op
        set.unregister("log");
    }

    #[test]
    fn channel_listener_forwards_clones() {
        let set = ListenerSet::new();
        let (listener, mut rx) = ChannelListener::new();
        set.register_all("chan", Arc::new(listener));

        set.emit(&skipped());
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind(), EventKind::FireSkipped);
        assert!(rx.try_recv().is_err());
    }
}
