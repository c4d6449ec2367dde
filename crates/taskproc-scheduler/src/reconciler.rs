//! Periodic reconciliation of installed triggers against a schedule source.
//!
//! The reconciler is itself a job: it holds a handle to the engine and, on
//! every run, makes the triggers of its managed group match what the source
//! says they should be. It is the only job with access to the control
//! surface.
//!
//! The handle is weak. The reconciler lives in the engine's own job
//! registry, so a strong handle would keep the engine running after the
//! application dropped its last one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskproc_core::config::{JobDefinition, ReconcilerConfig};
use taskproc_core::types::{GroupName, JobId, MisfirePolicy, TriggerKey};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::engine::{SchedulerHandle, WeakSchedulerHandle};
use crate::error::{Result, SchedulerError};
use crate::job::{Job, JobContext, JobPolicy, JobRegistry, JobResult};
use crate::source::ScheduleSource;
use crate::types::{Schedule, Trigger, TriggerState};

/// Job identity the reconciler registers under.
pub const RECONCILER_JOB: &str = "reconciler";
/// Group holding the reconciler's own trigger, kept apart from the groups it
/// manages.
pub const SYSTEM_GROUP: &str = "System";

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: usize,
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added={} replaced={} unchanged={} removed={} failed={}",
            self.added, self.replaced, self.unchanged, self.removed, self.failed
        )
    }
}

pub struct Reconciler {
    scheduler: WeakSchedulerHandle,
    source: Arc<dyn ScheduleSource>,
    group: GroupName,
    managed: Vec<JobId>,
    settle_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        scheduler: &SchedulerHandle,
        source: Arc<dyn ScheduleSource>,
        group: impl Into<GroupName>,
        managed: Vec<JobId>,
    ) -> Self {
        Self {
            scheduler: scheduler.downgrade(),
            source,
            group: group.into(),
            managed,
            settle_delay: Duration::ZERO,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_config(cfg: &ReconcilerConfig, scheduler: &SchedulerHandle, source: Arc<dyn ScheduleSource>) -> Self {
        Self::new(scheduler, source, cfg.group.clone(), cfg.jobs.clone())
            .with_settle_delay(Duration::from_millis(cfg.settle_delay_ms))
    }

    /// Hold back the first fire of every schedule this reconciler installs.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Time source for validation and settle delays. Share the engine's.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn group(&self) -> &GroupName {
        &self.group
    }

    fn scheduler(&self) -> Result<SchedulerHandle> {
        self.scheduler.upgrade().ok_or(SchedulerError::EngineStopped)
    }

    fn key_for(&self, def: &JobDefinition) -> TriggerKey {
        TriggerKey {
            group: def.group.clone().unwrap_or_else(|| self.group.clone()),
            job: def.job.clone(),
        }
    }

    /// Register as the exclusive `reconciler` job.
    pub fn register(self: Arc<Self>, registry: &JobRegistry) {
        registry.register(RECONCILER_JOB, self, JobPolicy::exclusive());
    }

    /// The reconciler's own schedule, in [`SYSTEM_GROUP`].
    pub fn schedule(cron: &str, timezone: &str) -> Result<Schedule> {
        Ok(Schedule::cron(RECONCILER_JOB, cron, timezone)?
            .in_group(SYSTEM_GROUP)
            .with_misfire_policy(MisfirePolicy::FireNowAndProceed)
            .with_comment("reconcile dynamic job schedules"))
    }

    /// Run one pass.
    ///
    /// Fails only when the source itself fails or the engine is gone; a bad
    /// record or a rejected schedule is logged and counted in `failed`
    /// without affecting the other identities.
    ///
    /// Several records for one `(group, job)` resolve to the one with the
    /// lowest `id`; the others count as failed.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let desired = self.source.load(&self.managed).await.map_err(|e| match e {
            SchedulerError::ReconciliationSource(_) => e,
            other => SchedulerError::ReconciliationSource(other.to_string()),
        })?;
        let scheduler = self.scheduler()?;

        let installed: HashMap<TriggerKey, Trigger> = scheduler
            .triggers(None)
            .await?
            .into_iter()
            .filter(|t| self.managed.contains(&t.key.job))
            .map(|t| (t.key.clone(), t))
            .collect();

        let mut summary = ReconcileSummary::default();
        let mut by_key: BTreeMap<TriggerKey, Vec<JobDefinition>> = BTreeMap::new();
        for def in desired {
            by_key.entry(self.key_for(&def)).or_default().push(def);
        }

        let mut keep: HashSet<TriggerKey> = HashSet::new();
        for (key, mut defs) in by_key {
            defs.sort_by(|a, b| a.id.cmp(&b.id));
            let mut defs = defs.into_iter();
            let Some(def) = defs.next() else {
                continue;
            };
            for duplicate in defs {
                warn!(trigger = %key, schedule_id = %duplicate.id, kept = %def.id, "duplicate job schedule ignored");
                summary.failed += 1;
            }
            // a bad record never costs the identity its current trigger
            keep.insert(key.clone());

            let now = self.clock.now();
            let schedule = match Schedule::from_definition_at(&def, &self.group, now) {
                Ok(s) => s,
                Err(e) => {
                    warn!(trigger = %key, schedule_id = %def.id, "skipping job schedule: {e}");
                    summary.failed += 1;
                    continue;
                }
            };

            if !schedule.enabled {
                keep.remove(&key);
                if installed.contains_key(&key) {
                    self.remove(&scheduler, &key, &mut summary).await?;
                }
                continue;
            }

            let existing = installed.get(&key);
            if existing.is_some_and(|t| t.schedule.same_definition(&schedule) && t.state != TriggerState::Error) {
                summary.unchanged += 1;
                continue;
            }

            let schedule = if self.settle_delay.is_zero() {
                schedule
            } else {
                let delay = chrono::Duration::from_std(self.settle_delay).unwrap_or(chrono::Duration::zero());
                schedule.starting_at(now + delay)
            };

            match scheduler.add_or_replace(schedule).await {
                Ok(next) => {
                    if existing.is_some() {
                        summary.replaced += 1;
                    } else {
                        summary.added += 1;
                    }
                    info!(trigger = %key, next_fire = ?next, replaced = existing.is_some(), "job schedule applied");
                }
                Err(SchedulerError::EngineStopped) => return Err(SchedulerError::EngineStopped),
                Err(e) => {
                    warn!(trigger = %key, "job schedule rejected: {e}");
                    summary.failed += 1;
                }
            }
        }

        for key in installed.keys().filter(|k| k.group == self.group && !keep.contains(*k)) {
            self.remove(&scheduler, key, &mut summary).await?;
        }

        self.log_active_triggers(&scheduler).await?;
        Ok(summary)
    }

    async fn remove(&self, scheduler: &SchedulerHandle, key: &TriggerKey, summary: &mut ReconcileSummary) -> Result<()> {
        if scheduler.remove(&key.group, &key.job).await? {
            info!(trigger = %key, "job schedule removed");
            summary.removed += 1;
        }
        Ok(())
    }

    async fn log_active_triggers(&self, scheduler: &SchedulerHandle) -> Result<()> {
        let triggers = scheduler.triggers(Some(&self.group)).await?;
        debug!(group = %self.group, count = triggers.len(), "active triggers");
        for t in &triggers {
            debug!(
                trigger = %t.key,
                state = %t.state,
                next_fire = ?t.next_fire_time,
                previous_fire = ?t.previous_fire_time,
                "active trigger"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Job for Reconciler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        match self.reconcile().await {
            Ok(summary) => {
                info!(fire_id = %ctx.fire_id, group = %self.group, %summary, "reconciliation finished");
                JobResult::ok()
            }
            Err(e) => {
                error!(fire_id = %ctx.fire_id, group = %self.group, "reconciliation failed: {e}");
                JobResult::failed(e.to_string())
            }
        }
    }
}
