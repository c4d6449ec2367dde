//! Jobs shipped with the service binary.

use std::sync::Arc;

use async_trait::async_trait;
use taskproc_scheduler::{Job, JobContext, JobPolicy, JobRegistry, JobResult};
use tracing::info;

/// Identity of [`LogJob`].
pub const LOG_JOB: &str = "log";

/// Writes its schedule comment to the log. Useful as a heartbeat and for
/// checking a cron expression against the wall clock.
pub struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        info!(
            trigger = %ctx.trigger,
            scheduled = %ctx.scheduled_fire_time,
            next = ?ctx.next_fire_time,
            "{}",
            if ctx.comment.is_empty() { "log job fired" } else { ctx.comment.as_str() }
        );
        JobResult::ok()
    }
}

/// Register every built-in job.
pub fn register_builtin(registry: &JobRegistry) {
    registry.register(LOG_JOB, Arc::new(LogJob), JobPolicy::exclusive());
}
