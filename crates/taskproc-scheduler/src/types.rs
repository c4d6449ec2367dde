use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskproc_core::config::JobDefinition;
use taskproc_core::types::{GroupName, JobId, MisfirePolicy, TriggerKey};

use crate::cron::{CronExpression, ScheduleZone};
use crate::error::{Result, SchedulerError};

/// A validated schedule for one job in one group. Immutable: an update is a
/// new `Schedule` handed to `add_or_replace`.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: String,
    pub job: JobId,
    pub group: GroupName,
    pub enabled: bool,
    pub misfire_policy: MisfirePolicy,
    pub comment: String,
    /// No fire happens before this instant.
    pub start_at: Option<DateTime<Utc>>,
    cron: CronExpression,
    zone: ScheduleZone,
}

impl Schedule {
    /// Build a schedule from a definition record.
    ///
    /// Fails when the cron expression or timezone is malformed, or when the
    /// expression can never fire again.
    pub fn from_definition(def: &JobDefinition, default_group: &GroupName) -> Result<Self> {
        Self::from_definition_at(def, default_group, Utc::now())
    }

    /// [`Schedule::from_definition`], judging "can fire again" from `now`.
    pub fn from_definition_at(def: &JobDefinition, default_group: &GroupName, now: DateTime<Utc>) -> Result<Self> {
        let cron = CronExpression::parse(&def.cron)?;
        let zone = ScheduleZone::parse(&def.timezone)?;
        if cron.next_after(&zone, now).is_none() {
            return Err(SchedulerError::InvalidSchedule(format!(
                "cron expression '{}' for job {} has no future fire time",
                def.cron, def.job
            )));
        }

        Ok(Self {
            id: def.id.clone(),
            job: def.job.clone(),
            group: def.group.clone().unwrap_or_else(|| default_group.clone()),
            enabled: def.enabled,
            misfire_policy: def.misfire_policy,
            comment: def.comment.clone(),
            start_at: None,
            cron,
            zone,
        })
    }

    /// Shorthand for an enabled schedule in the default group.
    pub fn cron(job: impl Into<JobId>, expression: &str, timezone: &str) -> Result<Self> {
        let def = JobDefinition::new(job, expression).with_timezone(timezone);
        Self::from_definition(&def, &GroupName::default())
    }

    pub fn in_group(mut self, group: impl Into<GroupName>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    pub fn key(&self) -> TriggerKey {
        TriggerKey { group: self.group.clone(), job: self.job.clone() }
    }

    pub fn cron_expression(&self) -> &str {
        self.cron.as_str()
    }

    pub fn zone(&self) -> ScheduleZone {
        self.zone
    }

    /// Next fire time strictly after `after`, honouring `start_at`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = match self.start_at {
            // the instant itself is allowed to fire
            Some(start) if start > after => start - chrono::Duration::seconds(1),
            _ => after,
        };
        self.cron.next_after(&self.zone, from)
    }

    /// Same definition, ignoring `start_at`: replacing one with the other
    /// would change nothing.
    pub fn same_definition(&self, other: &Schedule) -> bool {
        self.id == other.id
            && self.job == other.job
            && self.group == other.group
            && self.enabled == other.enabled
            && self.misfire_policy == other.misfire_policy
            && self.comment == other.comment
            && self.cron == other.cron
            && self.zone == other.zone
    }
}

/// Lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Waiting for its next fire time.
    Waiting,
    /// Selected as due by the timing loop, not yet handed off.
    Acquired,
    /// At least one job execution is in flight. The trigger keeps its
    /// schedule: reaching the next fire time while firing fires again.
    Firing,
    Paused,
    /// The schedule has no further fire time.
    Complete,
    /// The job could not be run (unregistered identity or lost execution).
    Error,
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Firing => "firing",
            TriggerState::Paused => "paused",
            TriggerState::Complete => "complete",
            TriggerState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Runtime binding of a schedule to its job. Owned by the engine task;
/// callers only ever see clones.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub key: TriggerKey,
    pub schedule: Schedule,
    pub state: TriggerState,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub misfire_instruction: MisfirePolicy,
    /// Bumped on every replace so completions of an older installation can
    /// be told apart.
    pub(crate) generation: u64,
    /// Executions of this installation still in flight.
    pub(crate) executing: u32,
}

impl Trigger {
    pub(crate) fn new(schedule: Schedule, first_fire: DateTime<Utc>, generation: u64) -> Self {
        Self {
            key: schedule.key(),
            misfire_instruction: schedule.misfire_policy,
            schedule,
            state: TriggerState::Waiting,
            next_fire_time: Some(first_fire),
            previous_fire_time: None,
            generation,
            executing: 0,
        }
    }

    /// Whether the timing loop considers this trigger at all.
    pub fn is_scheduled(&self) -> bool {
        matches!(self.state, TriggerState::Waiting | TriggerState::Firing)
    }

    /// Scheduled with a fire time at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_scheduled() && self.next_fire_time.is_some_and(|t| t <= now)
    }

    /// Number of executions of this trigger currently in flight.
    pub fn executing(&self) -> u32 {
        self.executing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn schedule_from_definition_uses_default_group() {
        let def = JobDefinition::new("report", "0 0 12 * * ?").with_comment("daily report");
        let schedule = Schedule::from_definition(&def, &GroupName::new("DynamicJobs")).unwrap();
        assert_eq!(schedule.key(), TriggerKey::new("DynamicJobs", "report"));
        assert_eq!(schedule.comment, "daily report");
        assert_eq!(schedule.cron_expression(), "0 0 12 * * ?");
    }

    #[test]
    fn explicit_group_wins() {
        let def = JobDefinition::new("report", "0 0 12 * * ?").with_group("Reports");
        let schedule = Schedule::from_definition(&def, &GroupName::default()).unwrap();
        assert_eq!(schedule.group.as_str(), "Reports");
    }

    #[test]
    fn schedule_without_future_fire_is_rejected() {
        let def = JobDefinition::new("never", "0 0 0 31 4 ?"); // April has 30 days
        assert!(matches!(
            Schedule::from_definition(&def, &GroupName::default()),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(matches!(
            Schedule::cron("a", "not a cron", "UTC"),
            Err(SchedulerError::InvalidCronExpression { .. })
        ));
        assert!(matches!(
            Schedule::cron("a", "0 0 12 * * ?", "Nowhere/Special"),
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn start_at_holds_back_the_first_fire() {
        let schedule = Schedule::cron("a", "0 0 * * * ?", "UTC")
            .unwrap()
            .starting_at(utc("2024-01-01T05:00:00Z"));
        // start instant itself matches and is allowed
        assert_eq!(
            schedule.next_fire_after(utc("2024-01-01T00:00:00Z")),
            Some(utc("2024-01-01T05:00:00Z"))
        );
        // after start_at the cron runs normally
        assert_eq!(
            schedule.next_fire_after(utc("2024-01-01T06:30:00Z")),
            Some(utc("2024-01-01T07:00:00Z"))
        );
    }

    #[test]
    fn same_definition_ignores_start_at() {
        let a = Schedule::cron("a", "0 0 * * * ?", "UTC").unwrap();
        let b = a.clone().starting_at(Utc::now());
        assert!(a.same_definition(&b));
        let c = a.clone().with_comment("changed");
        assert!(!a.same_definition(&c));
    }

    #[test]
    fn trigger_due_only_when_waiting() {
        let schedule = Schedule::cron("a", "0 0 * * * ?", "UTC").unwrap();
        let mut trigger = Trigger::new(schedule, utc("2024-01-01T01:00:00Z"), 1);
        assert!(trigger.is_due(utc("2024-01-01T01:00:00Z")));
        assert!(!trigger.is_due(utc("2024-01-01T00:59:59Z")));
        trigger.state = TriggerState::Firing;
        assert!(trigger.is_due(utc("2024-01-01T01:00:00Z")));
        trigger.state = TriggerState::Paused;
        assert!(!trigger.is_due(utc("2024-01-01T02:00:00Z")));
        trigger.state = TriggerState::Complete;
        assert!(!trigger.is_due(utc("2024-01-01T02:00:00Z")));
    }
}
