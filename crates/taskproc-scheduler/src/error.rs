use taskproc_core::types::JobId;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression does not parse.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// The timezone is not a known IANA identifier.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The schedule cannot produce a future fire time; it is never installed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A disallow-concurrent job was fired while already running. Expected
    /// flow, reported as a skip rather than a failure.
    #[error("Fire skipped: job {job} is already running")]
    DispatchSkipped { job: JobId },

    /// No job with the given identity is registered.
    #[error("Job not registered: {job}")]
    JobNotRegistered { job: JobId },

    /// A job unit failed while running.
    #[error("Job execution failed: {0}")]
    JobExecution(String),

    /// The job definition source could not produce data for one pass.
    #[error("Reconciliation source error: {0}")]
    ReconciliationSource(String),

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The timing loop itself failed; scheduling has halted.
    #[error("Scheduler fatal error: {0}")]
    Fatal(String),

    /// The engine task is gone (shut down or crashed).
    #[error("Scheduler engine is not running")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
