//! `taskproc-scheduler`: cron-driven job scheduling with live reconciliation.
//!
//! # Overview
//!
//! A single engine task owns every [`Trigger`]. Callers talk to it through a
//! cloneable [`SchedulerHandle`]; each call is a command on a bounded channel
//! answered over a oneshot. Due triggers are handed to the [`Dispatcher`],
//! which runs jobs on a bounded worker pool and reports a [`JobResult`] back
//! to the engine. Every step is published to the listeners registered in a
//! [`taskproc_hooks::ListenerSet`].
//!
//! The [`Reconciler`] is a job like any other, scheduled in the `System`
//! group. On each run it loads desired definitions from a [`ScheduleSource`]
//! and adds, replaces or removes triggers so the engine matches them.
//!
//! # Cron format
//!
//! Six fields, seconds first: `sec min hour day-of-month month day-of-week`.
//! `?` is accepted in the two day fields. Evaluation happens in the
//! schedule's own timezone (IANA name or fixed offset).

pub mod clock;
pub mod cron;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod job;
pub mod reconciler;
pub mod source;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::{next_fire_time, CronExpression, ScheduleZone};
pub use db::SqliteScheduleSource;
pub use dispatcher::Dispatcher;
pub use engine::{EngineConfig, EngineStatus, SchedulerEngine, SchedulerHandle, WeakSchedulerHandle};
pub use error::{Result, SchedulerError};
pub use job::{Job, JobContext, JobPolicy, JobRegistry, JobResult};
pub use reconciler::{ReconcileSummary, Reconciler, RECONCILER_JOB, SYSTEM_GROUP};
pub use source::{ScheduleSource, StaticScheduleSource};
pub use types::{Schedule, Trigger, TriggerState};
