use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use taskproc_core::config::SchedulerConfig;
use taskproc_core::types::{CompletionInstruction, GroupName, JobId, MisfirePolicy, TriggerKey};
use taskproc_hooks::{ListenerSet, SchedulerEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    dispatcher::{Dispatcher, JobOutcome},
    error::{Result, SchedulerError},
    job::{JobContext, JobRegistry},
    types::{Schedule, Trigger, TriggerState},
};

/// Commands queued ahead of the engine task before senders wait.
const COMMAND_BUFFER: usize = 256;

/// Engine tuning, usually derived from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub misfire_threshold: chrono::Duration,
    pub idle_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for EngineConfig {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            worker_count: cfg.worker_count,
            misfire_threshold: chrono::Duration::seconds(cfg.misfire_threshold_secs as i64),
            idle_wait: Duration::from_secs(cfg.idle_wait_secs.max(1)),
        }
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub started: bool,
    pub triggers: usize,
    pub executing: usize,
}

enum Command {
    Start {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        wait: bool,
        reply: oneshot::Sender<()>,
    },
    AddOrReplace {
        schedule: Schedule,
        reply: oneshot::Sender<Result<Option<DateTime<Utc>>>>,
    },
    Remove {
        key: TriggerKey,
        reply: oneshot::Sender<bool>,
    },
    Pause {
        job: JobId,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        job: JobId,
        reply: oneshot::Sender<bool>,
    },
    Trigger {
        key: TriggerKey,
        reply: oneshot::Sender<Option<Trigger>>,
    },
    Triggers {
        group: Option<GroupName>,
        reply: oneshot::Sender<Vec<Trigger>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Control surface of a running engine. Cheap to clone; every call is a
/// message to the engine task, which owns all trigger state.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| SchedulerError::EngineStopped)?;
        rx.await.map_err(|_| SchedulerError::EngineStopped)
    }

    /// Leave standby and begin firing triggers.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Stop firing. With `wait_for_running_jobs` the call returns only after
    /// every in-flight execution has completed and been reported; without it
    /// running jobs are left to finish on their own, unobserved.
    ///
    /// While running jobs drain, queries, removals and pause/resume are still
    /// answered. `add_or_replace` fails with [`SchedulerError::EngineStopped`].
    pub async fn shutdown(&self, wait_for_running_jobs: bool) -> Result<()> {
        self.request(|reply| Command::Shutdown { wait: wait_for_running_jobs, reply }).await
    }

    /// Install `schedule`, atomically replacing any trigger with the same
    /// key. Returns the first fire time, or `None` for a disabled schedule
    /// (which removes the existing trigger instead).
    pub async fn add_or_replace(&self, schedule: Schedule) -> Result<Option<DateTime<Utc>>> {
        self.request(|reply| Command::AddOrReplace { schedule, reply }).await?
    }

    /// Remove the trigger for `job` in `group`. False if there was none.
    pub async fn remove(&self, group: &GroupName, job: &JobId) -> Result<bool> {
        let key = TriggerKey { group: group.clone(), job: job.clone() };
        self.request(|reply| Command::Remove { key, reply }).await
    }

    /// Pause every trigger of `job`. False if it has none to pause.
    pub async fn pause(&self, job: &JobId) -> Result<bool> {
        let job = job.clone();
        self.request(|reply| Command::Pause { job, reply }).await
    }

    /// Resume every paused trigger of `job`. False if none was paused.
    pub async fn resume(&self, job: &JobId) -> Result<bool> {
        let job = job.clone();
        self.request(|reply| Command::Resume { job, reply }).await
    }

    pub async fn trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let key = key.clone();
        self.request(|reply| Command::Trigger { key, reply }).await
    }

    /// Snapshot of all triggers, or those of one group, ordered by key.
    pub async fn triggers(&self, group: Option<&GroupName>) -> Result<Vec<Trigger>> {
        let group = group.cloned();
        self.request(|reply| Command::Triggers { group, reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// A handle that does not keep the engine alive.
    pub fn downgrade(&self) -> WeakSchedulerHandle {
        WeakSchedulerHandle { tx: self.tx.downgrade() }
    }
}

/// Non-owning counterpart of [`SchedulerHandle`], for holders that live
/// inside the engine's own job registry. Once every strong handle is dropped
/// the engine stops, whatever weak handles remain.
#[derive(Clone)]
pub struct WeakSchedulerHandle {
    tx: mpsc::WeakSender<Command>,
}

impl WeakSchedulerHandle {
    /// `None` once every strong handle is gone.
    pub fn upgrade(&self) -> Option<SchedulerHandle> {
        self.tx.upgrade().map(|tx| SchedulerHandle { tx })
    }
}

/// Builds and spawns the engine task.
pub struct SchedulerEngine {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    listeners: Arc<ListenerSet>,
    clock: Arc<dyn Clock>,
}

impl SchedulerEngine {
    pub fn new(config: EngineConfig, registry: Arc<JobRegistry>, listeners: Arc<ListenerSet>) -> Self {
        Self { config, registry, listeners, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the engine task in standby and return its handle.
    ///
    /// Commands are served immediately; nothing fires until
    /// [`SchedulerHandle::start`]. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let listeners = Arc::clone(&self.listeners);
        let engine = EngineLoop {
            dispatcher: Dispatcher::new(Arc::clone(&self.registry), self.config.worker_count),
            config: self.config,
            listeners: self.listeners,
            clock: self.clock,
            commands: rx,
            triggers: HashMap::new(),
            in_flight: JoinSet::new(),
            executions: HashMap::new(),
            started: false,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
            next_generation: 0,
        };

        // Supervisor: a panic in the timing loop is the one fatal condition.
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(engine.run()).await {
                let fatal = SchedulerError::Fatal(e.to_string());
                error!("{fatal}");
                listeners.emit(&SchedulerEvent::SchedulerError {
                    message: "timing loop terminated; scheduling has stopped".to_string(),
                    cause: fatal.to_string(),
                    fatal: true,
                });
            }
        });

        SchedulerHandle { tx }
    }
}

/// One acquisition of a trigger, carried alongside its execution.
#[derive(Clone)]
struct Acquisition {
    key: TriggerKey,
    generation: u64,
    ctx: JobContext,
}

enum Flow {
    Continue,
    Exit,
}

/// The engine task: sole owner of the trigger map.
struct EngineLoop {
    config: EngineConfig,
    dispatcher: Dispatcher,
    listeners: Arc<ListenerSet>,
    clock: Arc<dyn Clock>,
    commands: mpsc::Receiver<Command>,
    triggers: HashMap<TriggerKey, Trigger>,
    in_flight: JoinSet<JobOutcome>,
    executions: HashMap<tokio::task::Id, Acquisition>,
    started: bool,
    /// Set once a shutdown is requested. The loop keeps serving commands
    /// while running jobs drain, but installs and fires nothing new.
    shutting_down: bool,
    /// Shutdown callers answered when the loop exits.
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    next_generation: u64,
}

impl EngineLoop {
    async fn run(mut self) {
        info!("scheduler engine ready (standby)");

        loop {
            if self.started {
                self.fire_due();
            }
            let sleep_for = self.sleep_duration();

            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        info!("all scheduler handles dropped");
                        self.in_flight.detach_all();
                        break;
                    };
                    if let Flow::Exit = self.handle_command(cmd) {
                        break;
                    }
                }
                Some(joined) = self.in_flight.join_next_with_id() => {
                    self.on_execution_finished(joined);
                    if self.shutting_down && self.in_flight.is_empty() {
                        debug!("running jobs drained");
                        break;
                    }
                }
                _ = tokio::time::sleep(sleep_for.unwrap_or_default()), if sleep_for.is_some() => {}
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!("scheduler engine stopped");
    }

    /// How long to sleep before the next due trigger, capped by the idle
    /// wait. `None` in standby: only commands can wake the loop then.
    fn sleep_duration(&self) -> Option<Duration> {
        if !self.started {
            return None;
        }
        let earliest = self
            .triggers
            .values()
            .filter(|t| t.is_scheduled())
            .filter_map(|t| t.next_fire_time)
            .min();
        let wait = match earliest {
            Some(at) => (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO),
            None => self.config.idle_wait,
        };
        Some(wait.min(self.config.idle_wait))
    }

    fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Start { reply } => {
                if self.shutting_down {
                    warn!("start ignored: scheduler is shutting down");
                } else if !self.started {
                    self.started = true;
                    info!(triggers = self.triggers.len(), "scheduler started");
                }
                let _ = reply.send(());
            }
            Command::Shutdown { wait, reply } => {
                if !self.shutting_down {
                    info!(wait, executing = self.in_flight.len(), "scheduler shutting down");
                }
                self.started = false;
                self.shutting_down = true;
                self.shutdown_waiters.push(reply);
                if !wait {
                    self.in_flight.detach_all();
                    self.executions.clear();
                }
                // running jobs may still call back into the engine, so the
                // drain happens in the main loop rather than here
                if self.in_flight.is_empty() {
                    return Flow::Exit;
                }
            }
            Command::AddOrReplace { schedule, reply } => {
                let result = if self.shutting_down {
                    debug!(trigger = %schedule.key(), "schedule rejected: scheduler is shutting down");
                    Err(SchedulerError::EngineStopped)
                } else {
                    self.add_or_replace(schedule)
                };
                let _ = reply.send(result);
            }
            Command::Remove { key, reply } => {
                let removed = self.triggers.remove(&key).is_some();
                if removed {
                    info!(trigger = %key, "trigger removed");
                }
                let _ = reply.send(removed);
            }
            Command::Pause { job, reply } => {
                let _ = reply.send(self.pause(&job));
            }
            Command::Resume { job, reply } => {
                let _ = reply.send(self.resume(&job));
            }
            Command::Trigger { key, reply } => {
                let _ = reply.send(self.triggers.get(&key).cloned());
            }
            Command::Triggers { group, reply } => {
                let mut list: Vec<Trigger> = self
                    .triggers
                    .values()
                    .filter(|t| group.as_ref().map_or(true, |g| &t.key.group == g))
                    .cloned()
                    .collect();
                list.sort_by(|a, b| a.key.cmp(&b.key));
                let _ = reply.send(list);
            }
            Command::Status { reply } => {
                let _ = reply.send(EngineStatus {
                    started: self.started,
                    triggers: self.triggers.len(),
                    executing: self.in_flight.len(),
                });
            }
        }
        Flow::Continue
    }

    fn add_or_replace(&mut self, schedule: Schedule) -> Result<Option<DateTime<Utc>>> {
        let key = schedule.key();

        if !schedule.enabled {
            if self.triggers.remove(&key).is_some() {
                info!(trigger = %key, "schedule disabled; trigger removed");
            } else {
                debug!(trigger = %key, "schedule disabled; not installed");
            }
            return Ok(None);
        }

        let first = schedule.next_fire_after(self.clock.now()).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!(
                "cron expression '{}' for {key} has no future fire time",
                schedule.cron_expression()
            ))
        })?;

        self.next_generation += 1;
        let trigger = Trigger::new(schedule, first, self.next_generation);
        // insert swaps in one step; the old installation is gone before the
        // loop looks at the map again
        let replaced = self.triggers.insert(key.clone(), trigger).is_some();
        info!(trigger = %key, next_fire = %first, replaced, "trigger scheduled");
        Ok(Some(first))
    }

    fn pause(&mut self, job: &JobId) -> bool {
        let mut paused = false;
        for t in self.triggers.values_mut().filter(|t| &t.key.job == job) {
            if matches!(t.state, TriggerState::Waiting | TriggerState::Acquired | TriggerState::Firing) {
                t.state = TriggerState::Paused;
                paused = true;
                info!(trigger = %t.key, "trigger paused");
            }
        }
        paused
    }

    fn resume(&mut self, job: &JobId) -> bool {
        let mut resumed = false;
        for t in self.triggers.values_mut().filter(|t| &t.key.job == job) {
            if t.state == TriggerState::Paused {
                t.state = if t.next_fire_time.is_none() {
                    TriggerState::Complete
                } else if t.executing > 0 {
                    TriggerState::Firing
                } else {
                    TriggerState::Waiting
                };
                resumed = true;
                info!(trigger = %t.key, state = %t.state, "trigger resumed");
            }
        }
        resumed
    }

    /// Fire every due trigger, earliest first.
    fn fire_due(&mut self) {
        let now = self.clock.now();
        let mut due: Vec<(DateTime<Utc>, TriggerKey)> = self
            .triggers
            .values()
            .filter(|t| t.is_due(now))
            .filter_map(|t| t.next_fire_time.map(|at| (at, t.key.clone())))
            .collect();
        due.sort();

        for (_, key) in due {
            self.fire_trigger(&key, now);
        }
    }

    fn fire_trigger(&mut self, key: &TriggerKey, now: DateTime<Utc>) {
        let Some(trigger) = self.triggers.get_mut(key) else {
            return;
        };
        let Some(scheduled) = trigger.next_fire_time else {
            return;
        };

        let (slot, next) = if now - scheduled > self.config.misfire_threshold {
            let policy = trigger.misfire_instruction;
            warn!(trigger = %key, missed = %scheduled, %policy, "trigger misfired");
            self.listeners.emit(&SchedulerEvent::TriggerMisfired {
                job: key.job.clone(),
                trigger: key.clone(),
                instruction: policy,
                missed_fire_time: scheduled,
            });
            // never walk the missed slots one by one
            let next = trigger.schedule.next_fire_after(now);
            match policy {
                MisfirePolicy::FireNowAndProceed => (Some(now), next),
                MisfirePolicy::FireOnceNow => (Some(scheduled), next),
                MisfirePolicy::DoNothing => (None, next),
            }
        } else {
            (Some(scheduled), trigger.schedule.next_fire_after(scheduled))
        };

        trigger.next_fire_time = next;
        let Some(slot) = slot else {
            if next.is_none() && trigger.executing == 0 {
                trigger.state = TriggerState::Complete;
            }
            return;
        };

        let previous = trigger.previous_fire_time.replace(slot);
        trigger.state = TriggerState::Acquired;
        let acquisition = Acquisition {
            key: key.clone(),
            generation: trigger.generation,
            ctx: JobContext {
                job: key.job.clone(),
                trigger: key.clone(),
                schedule_id: trigger.schedule.id.clone(),
                fire_id: Uuid::new_v4(),
                scheduled_fire_time: slot,
                fire_time: now,
                previous_fire_time: previous,
                next_fire_time: next,
                refire_count: 0,
                comment: trigger.schedule.comment.clone(),
            },
        };

        debug!(trigger = %key, scheduled = %slot, next = ?next, "trigger fired");
        self.listeners.emit(&SchedulerEvent::TriggerFired {
            job: key.job.clone(),
            trigger: key.clone(),
            fire_id: acquisition.ctx.fire_id,
            scheduled_fire_time: slot,
            fire_time: now,
        });
        self.dispatch(acquisition);
    }

    fn dispatch(&mut self, acquisition: Acquisition) {
        match self.dispatcher.fire(acquisition.ctx.clone()) {
            Ok(execution) => {
                if let Some(t) = self.current_trigger_mut(&acquisition) {
                    if acquisition.ctx.refire_count == 0 {
                        t.executing += 1;
                    }
                    if t.state == TriggerState::Acquired {
                        t.state = TriggerState::Firing;
                    }
                }
                let handle = self.in_flight.spawn(execution);
                self.executions.insert(handle.id(), acquisition);
            }
            Err(SchedulerError::DispatchSkipped { job }) => {
                info!(%job, trigger = %acquisition.key, "fire skipped: job already running");
                self.listeners.emit(&SchedulerEvent::FireSkipped {
                    job,
                    trigger: acquisition.key.clone(),
                    fire_id: acquisition.ctx.fire_id,
                });
                let instruction = self.settle(&acquisition, acquisition.ctx.refire_count > 0);
                self.emit_complete(&acquisition, instruction);
            }
            Err(e) => {
                error!(trigger = %acquisition.key, "cannot run job: {e}");
                self.listeners.emit(&SchedulerEvent::SchedulerError {
                    message: format!("cannot run job {} for trigger {}", acquisition.ctx.job, acquisition.key),
                    cause: e.to_string(),
                    fatal: false,
                });
                if acquisition.ctx.refire_count > 0 {
                    self.settle(&acquisition, true);
                }
                if let Some(t) = self.current_trigger_mut(&acquisition) {
                    t.state = TriggerState::Error;
                }
                self.emit_complete(&acquisition, CompletionInstruction::SetTriggerError);
            }
        }
    }

    fn on_execution_finished(&mut self, joined: std::result::Result<(tokio::task::Id, JobOutcome), JoinError>) {
        let (id, outcome) = match joined {
            Ok(pair) => pair,
            Err(err) => return self.on_execution_lost(err),
        };
        let Some(acquisition) = self.executions.remove(&id) else {
            warn!("completion for an unknown execution ignored");
            return;
        };

        let result = outcome.result;
        let error = match (&result.error, result.success) {
            (Some(e), _) => Some(e.clone()),
            (None, false) => Some("job reported failure".to_string()),
            (None, true) => None,
        };
        self.listeners.emit(&SchedulerEvent::JobExecuted {
            job: acquisition.ctx.job.clone(),
            trigger: acquisition.key.clone(),
            fire_id: acquisition.ctx.fire_id,
            duration_ms: outcome.duration.as_millis() as u64,
            error,
            refire_immediately: result.refire_immediately,
            unschedule_firing_trigger: result.unschedule_firing_trigger,
            unschedule_all_triggers_of_job: result.unschedule_all_triggers_of_job,
        });

        if result.refire_immediately && !self.shutting_down && self.current_trigger_mut(&acquisition).is_some() {
            let mut again = acquisition;
            again.ctx.refire_count += 1;
            again.ctx.fire_time = self.clock.now();
            debug!(trigger = %again.key, refire = again.ctx.refire_count, "refiring job immediately");
            self.dispatch(again);
            return;
        }

        let instruction = if result.unschedule_all_triggers_of_job {
            let job = &acquisition.ctx.job;
            let before = self.triggers.len();
            self.triggers.retain(|k, _| &k.job != job);
            info!(%job, removed = before - self.triggers.len(), "all triggers of job unscheduled");
            CompletionInstruction::DeleteAllJobTriggers
        } else if result.unschedule_firing_trigger {
            if self.current_trigger_mut(&acquisition).is_some() {
                self.triggers.remove(&acquisition.key);
                info!(trigger = %acquisition.key, "trigger unscheduled by job");
            }
            CompletionInstruction::DeleteTrigger
        } else {
            self.settle(&acquisition, true)
        };
        self.emit_complete(&acquisition, instruction);
    }

    /// The execution task died without producing a result.
    fn on_execution_lost(&mut self, err: JoinError) {
        let acquisition = self.executions.remove(&err.id());
        error!("job execution lost: {err}");
        self.listeners.emit(&SchedulerEvent::SchedulerError {
            message: match &acquisition {
                Some(a) => format!("execution of job {} for trigger {} was lost", a.ctx.job, a.key),
                None => "execution of an unknown job was lost".to_string(),
            },
            cause: err.to_string(),
            fatal: false,
        });
        if let Some(acquisition) = acquisition {
            self.settle(&acquisition, true);
            if let Some(t) = self.current_trigger_mut(&acquisition) {
                t.state = TriggerState::Error;
            }
            self.emit_complete(&acquisition, CompletionInstruction::SetTriggerError);
        }
    }

    /// Bring the trigger back to rest after an acquisition ends.
    /// `finished_execution` is true when one of its executions completed.
    fn settle(&mut self, acquisition: &Acquisition, finished_execution: bool) -> CompletionInstruction {
        let Some(t) = self.current_trigger_mut(acquisition) else {
            // replaced or removed meanwhile; the new installation is untouched
            return CompletionInstruction::NoInstruction;
        };
        if finished_execution {
            t.executing = t.executing.saturating_sub(1);
        }
        if matches!(t.state, TriggerState::Acquired | TriggerState::Firing) && t.executing == 0 {
            if t.next_fire_time.is_none() {
                t.state = TriggerState::Complete;
                return CompletionInstruction::SetTriggerComplete;
            }
            t.state = TriggerState::Waiting;
        } else if t.state == TriggerState::Acquired {
            t.state = TriggerState::Firing;
        }
        CompletionInstruction::NoInstruction
    }

    fn emit_complete(&self, acquisition: &Acquisition, instruction: CompletionInstruction) {
        self.listeners.emit(&SchedulerEvent::TriggerComplete {
            job: acquisition.ctx.job.clone(),
            trigger: acquisition.key.clone(),
            fire_id: acquisition.ctx.fire_id,
            instruction,
        });
    }

    /// The trigger this acquisition belongs to, unless it has since been
    /// replaced or removed.
    fn current_trigger_mut(&mut self, acquisition: &Acquisition) -> Option<&mut Trigger> {
        self.triggers
            .get_mut(&acquisition.key)
            .filter(|t| t.generation == acquisition.generation)
    }
}
