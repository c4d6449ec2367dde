use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskproc_core::types::{CompletionInstruction, JobId, MisfirePolicy, TriggerKey};
use uuid::Uuid;

/// Every lifecycle point a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TriggerFired,
    TriggerMisfired,
    TriggerComplete,
    JobExecuted,
    /// A fire collided with a running disallow-concurrent job.
    FireSkipped,
    SchedulerError,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::TriggerFired,
        EventKind::TriggerMisfired,
        EventKind::TriggerComplete,
        EventKind::JobExecuted,
        EventKind::FireSkipped,
        EventKind::SchedulerError,
    ];
}

/// A lifecycle event. For one acquisition (`fire_id`) the order is always
/// fired, then executed or skipped, then complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SchedulerEvent {
    TriggerFired {
        job: JobId,
        trigger: TriggerKey,
        fire_id: Uuid,
        /// The slot this fire stands for.
        scheduled_fire_time: DateTime<Utc>,
        fire_time: DateTime<Utc>,
    },
    TriggerMisfired {
        job: JobId,
        trigger: TriggerKey,
        instruction: MisfirePolicy,
        missed_fire_time: DateTime<Utc>,
    },
    TriggerComplete {
        job: JobId,
        trigger: TriggerKey,
        fire_id: Uuid,
        instruction: CompletionInstruction,
    },
    JobExecuted {
        job: JobId,
        trigger: TriggerKey,
        fire_id: Uuid,
        duration_ms: u64,
        /// `None` on success.
        error: Option<String>,
        refire_immediately: bool,
        unschedule_firing_trigger: bool,
        unschedule_all_triggers_of_job: bool,
    },
    FireSkipped {
        job: JobId,
        trigger: TriggerKey,
        fire_id: Uuid,
    },
    SchedulerError {
        message: String,
        cause: String,
        /// True only when the timing loop itself died.
        fatal: bool,
    },
}

impl SchedulerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::TriggerFired { .. } => EventKind::TriggerFired,
            SchedulerEvent::TriggerMisfired { .. } => EventKind::TriggerMisfired,
            SchedulerEvent::TriggerComplete { .. } => EventKind::TriggerComplete,
            SchedulerEvent::JobExecuted { .. } => EventKind::JobExecuted,
            SchedulerEvent::FireSkipped { .. } => EventKind::FireSkipped,
            SchedulerEvent::SchedulerError { .. } => EventKind::SchedulerError,
        }
    }

    /// The job the event concerns, if any.
    pub fn job(&self) -> Option<&JobId> {
        match self {
            SchedulerEvent::TriggerFired { job, .. }
            | SchedulerEvent::TriggerMisfired { job, .. }
            | SchedulerEvent::TriggerComplete { job, .. }
            | SchedulerEvent::JobExecuted { job, .. }
            | SchedulerEvent::FireSkipped { job, .. } => Some(job),
            SchedulerEvent::SchedulerError { .. } => None,
        }
    }

    pub fn trigger(&self) -> Option<&TriggerKey> {
        match self {
            SchedulerEvent::TriggerFired { trigger, .. }
            | SchedulerEvent::TriggerMisfired { trigger, .. }
            | SchedulerEvent::TriggerComplete { trigger, .. }
            | SchedulerEvent::JobExecuted { trigger, .. }
            | SchedulerEvent::FireSkipped { trigger, .. } => Some(trigger),
            SchedulerEvent::SchedulerError { .. } => None,
        }
    }
}
