//! Runs fired jobs on a bounded worker pool.
//!
//! `fire` decides synchronously whether an execution may start at all (job
//! registered, not already running when exclusive) and hands back a future.
//! Waiting for a worker permit happens inside that future, so the caller can
//! spawn it and move on without ever blocking on a saturated pool.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use taskproc_core::types::JobId;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};
use crate::job::{JobContext, JobRegistry, JobResult};

/// What a finished execution reports back to the engine.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub result: JobResult,
    pub duration: Duration,
}

/// Pending job execution returned by [`Dispatcher::fire`].
pub type Execution = BoxFuture<'static, JobOutcome>;

/// Marks an exclusive job as running; cleared on drop, i.e. when the
/// execution future finishes or is dropped.
struct RunningGuard {
    running: Arc<DashSet<JobId>>,
    job: JobId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.job);
    }
}

pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    workers: Arc<Semaphore>,
    /// Exclusive jobs currently executing or waiting for a worker.
    running: Arc<DashSet<JobId>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<JobRegistry>, worker_count: usize) -> Self {
        Self {
            registry,
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
            running: Arc::new(DashSet::new()),
        }
    }

    /// Prepare an execution for `ctx.job`.
    ///
    /// Returns `DispatchSkipped` immediately if the job disallows concurrent
    /// execution and is already running, `JobNotRegistered` if the identity
    /// is unknown.
    pub fn fire(&self, ctx: JobContext) -> Result<Execution> {
        let entry = self
            .registry
            .get(&ctx.job)
            .ok_or_else(|| SchedulerError::JobNotRegistered { job: ctx.job.clone() })?;

        let guard = if entry.policy.disallow_concurrent_execution {
            // insert is the atomic check-and-set
            if !self.running.insert(ctx.job.clone()) {
                return Err(SchedulerError::DispatchSkipped { job: ctx.job.clone() });
            }
            Some(RunningGuard { running: Arc::clone(&self.running), job: ctx.job.clone() })
        } else {
            None
        };

        let workers = Arc::clone(&self.workers);
        Ok(async move {
            let _guard = guard;
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return JobOutcome {
                        result: JobResult::failed(SchedulerError::JobExecution("worker pool closed".into()).to_string()),
                        duration: Duration::ZERO,
                    }
                }
            };

            let job_id = ctx.job.clone();
            let started = Instant::now();
            let result = AssertUnwindSafe(entry.job.execute(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let msg = panic_message(panic.as_ref());
                    warn!(job = %job_id, "job panicked: {msg}");
                    JobResult::failed(SchedulerError::JobExecution(format!("job panicked: {msg}")).to_string())
                });
            let duration = started.elapsed();

            debug!(job = %job_id, success = result.success, duration_ms = duration.as_millis() as u64, "job finished");
            JobOutcome { result, duration }
        }
        .boxed())
    }

    /// Whether an exclusive job currently holds its running flag.
    pub fn is_running(&self, job: &JobId) -> bool {
        self.running.contains(job)
    }

    /// Workers not currently executing a job.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobPolicy};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskproc_core::types::TriggerKey;
    use tokio::sync::Notify;
    use uuid::Uuid;

    fn ctx(job: &str) -> JobContext {
        let now = Utc::now();
        JobContext {
            job: JobId::from(job),
            trigger: TriggerKey::new("DEFAULT", job),
            schedule_id: "s1".into(),
            fire_id: Uuid::new_v4(),
            scheduled_fire_time: now,
            fire_time: now,
            previous_fire_time: None,
            next_fire_time: None,
            refire_count: 0,
            comment: String::new(),
        }
    }

    /// Blocks until released.
    struct Gate(Arc<Notify>);

    #[async_trait]
    impl Job for Gate {
        async fn execute(&self, _ctx: JobContext) -> JobResult {
            self.0.notified().await;
            JobResult::ok()
        }
    }

    struct Panics;

    #[async_trait]
    impl Job for Panics {
        async fn execute(&self, _ctx: JobContext) -> JobResult {
            panic!("kaboom");
        }
    }

    /// Tracks the highest number of simultaneous executions.
    struct Counting {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    #[async_trait]
    impl Job for Counting {
        async fn execute(&self, _ctx: JobContext) -> JobResult {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            JobResult::ok()
        }
    }

    #[tokio::test]
    async fn exclusive_job_collision_is_skipped_once() {
        let registry = Arc::new(JobRegistry::new());
        let gate = Arc::new(Notify::new());
        registry.register("sync", Arc::new(Gate(Arc::clone(&gate))), JobPolicy::exclusive());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), 4);

        let first = tokio::spawn(dispatcher.fire(ctx("sync")).unwrap());
        assert!(dispatcher.is_running(&JobId::from("sync")));

        let second = dispatcher.fire(ctx("sync"));
        assert!(matches!(second, Err(SchedulerError::DispatchSkipped { .. })));

        gate.notify_one();
        let outcome = first.await.unwrap();
        assert!(outcome.result.success);
        assert!(!dispatcher.is_running(&JobId::from("sync")));

        // free again once the first execution is done
        let third = tokio::spawn(dispatcher.fire(ctx("sync")).unwrap());
        gate.notify_one();
        assert!(third.await.unwrap().result.success);
    }

    #[tokio::test]
    async fn concurrent_job_may_overlap() {
        let registry = Arc::new(JobRegistry::new());
        let gate = Arc::new(Notify::new());
        registry.register("fanout", Arc::new(Gate(Arc::clone(&gate))), JobPolicy::concurrent());
        let dispatcher = Dispatcher::new(registry, 4);

        let a = tokio::spawn(dispatcher.fire(ctx("fanout")).unwrap());
        let b = tokio::spawn(dispatcher.fire(ctx("fanout")).unwrap());
        // give both a chance to park on the gate
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_waiters();
        assert!(a.await.unwrap().result.success);
        assert!(b.await.unwrap().result.success);
    }

    #[tokio::test]
    async fn unknown_job_is_rejected() {
        let dispatcher = Dispatcher::new(Arc::new(JobRegistry::new()), 1);
        assert!(matches!(dispatcher.fire(ctx("ghost")), Err(SchedulerError::JobNotRegistered { .. })));
    }

    #[tokio::test]
    async fn panic_becomes_failed_result() {
        let registry = Arc::new(JobRegistry::new());
        registry.register("bad", Arc::new(Panics), JobPolicy::exclusive());
        let dispatcher = Dispatcher::new(registry, 1);

        let outcome = dispatcher.fire(ctx("bad")).unwrap().await;
        assert!(!outcome.result.success);
        assert!(outcome.result.error.unwrap().contains("kaboom"));
        // the running flag is released even though the job panicked
        assert!(!dispatcher.is_running(&JobId::from("bad")));
    }

    #[tokio::test]
    async fn worker_pool_bounds_parallelism() {
        let registry = Arc::new(JobRegistry::new());
        let job = Arc::new(Counting { current: AtomicUsize::new(0), max: AtomicUsize::new(0) });
        registry.register("count", job.clone(), JobPolicy::concurrent());
        let dispatcher = Dispatcher::new(registry, 2);

        let handles: Vec<_> = (0..6).map(|_| tokio::spawn(dispatcher.fire(ctx("count")).unwrap())).collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(job.max.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.idle_workers(), 2);
    }
}
