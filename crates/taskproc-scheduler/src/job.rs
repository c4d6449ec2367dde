use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use taskproc_core::types::{JobId, TriggerKey};
use tracing::debug;
use uuid::Uuid;

/// A unit of work the engine can run. The engine never looks inside; it only
/// invokes `execute` and inspects the returned [`JobResult`].
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

/// Everything a job learns about the fire it is running for.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobId,
    pub trigger: TriggerKey,
    /// Id of the schedule record the trigger was built from.
    pub schedule_id: String,
    /// Unique per acquisition; shared by refires of the same acquisition.
    pub fire_id: Uuid,
    /// The slot this fire stands for (the missed slot for `FireOnceNow`).
    pub scheduled_fire_time: DateTime<Utc>,
    pub fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// How many times this acquisition has been re-run on request.
    pub refire_count: u32,
    pub comment: String,
}

/// Outcome of one job execution, returned rather than thrown so the engine's
/// decisions operate on data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub error: Option<String>,
    /// Run the job again right away within the same acquisition.
    pub refire_immediately: bool,
    /// Remove the trigger that fired this execution.
    pub unschedule_firing_trigger: bool,
    /// Remove every trigger of this job, in all groups.
    pub unschedule_all_triggers_of_job: bool,
}

impl JobResult {
    pub fn ok() -> Self {
        Self { success: true, ..Default::default() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Default::default() }
    }

    pub fn refire(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    pub fn unschedule_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    pub fn unschedule_all(mut self) -> Self {
        self.unschedule_all_triggers_of_job = true;
        self
    }
}

/// Concurrency policy attached to a registry entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// At most one execution of this job at a time; colliding fires are skipped.
    pub disallow_concurrent_execution: bool,
}

impl JobPolicy {
    pub fn concurrent() -> Self {
        Self { disallow_concurrent_execution: false }
    }

    pub fn exclusive() -> Self {
        Self { disallow_concurrent_execution: true }
    }
}

/// A registered job unit together with its policy.
#[derive(Clone)]
pub struct JobEntry {
    pub job: Arc<dyn Job>,
    pub policy: JobPolicy,
}

/// Maps job identities to executable units. Populated before the engine
/// starts and shared as `Arc<JobRegistry>`.
#[derive(Default)]
pub struct JobRegistry {
    entries: DashMap<JobId, JobEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the unit for `id`.
    pub fn register(&self, id: impl Into<JobId>, job: Arc<dyn Job>, policy: JobPolicy) {
        let id = id.into();
        debug!(job = %id, exclusive = policy.disallow_concurrent_execution, "job registered");
        self.entries.insert(id, JobEntry { job, policy });
    }

    pub fn get(&self, id: &JobId) -> Option<JobEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.entries.contains_key(id)
    }

    /// Registered identities, sorted for stable output.
    pub fn ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn execute(&self, _ctx: JobContext) -> JobResult {
            JobResult::ok()
        }
    }

    #[test]
    fn result_builders() {
        let r = JobResult::failed("disk full").refire();
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("disk full"));
        assert!(r.refire_immediately);
        assert!(!r.unschedule_firing_trigger);

        let r = JobResult::failed("gone").unschedule_all();
        assert!(r.unschedule_all_triggers_of_job);
        assert!(JobResult::ok().success);
    }

    #[test]
    fn registry_lookup() {
        let registry = JobRegistry::new();
        registry.register("b", Arc::new(Noop), JobPolicy::exclusive());
        registry.register("a", Arc::new(Noop), JobPolicy::concurrent());

        assert!(registry.contains(&JobId::from("a")));
        assert!(registry.get(&JobId::from("missing")).is_none());
        assert!(registry.get(&JobId::from("b")).unwrap().policy.disallow_concurrent_execution);
        assert_eq!(registry.ids(), vec![JobId::from("a"), JobId::from("b")]);
    }
}
