use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{GroupName, JobId, MisfirePolicy};

pub const DEFAULT_WORKER_COUNT: usize = 10;
pub const DEFAULT_MISFIRE_THRESHOLD_SECS: u64 = 60;
pub const DEFAULT_IDLE_WAIT_SECS: u64 = 30;
pub const DEFAULT_RECONCILER_CRON: &str = "0 0 * * * ?"; // top of every hour
pub const DEFAULT_RECONCILER_GROUP: &str = "DynamicJobs";
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Top-level config (taskproc.toml + TASKPROC_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskprocConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    /// Statically configured jobs, installed once at startup.
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

/// Engine and worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Size of the job worker pool. Independent of the number of triggers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// A fire time later than this is handled by the trigger's misfire policy.
    #[serde(default = "default_misfire_threshold_secs")]
    pub misfire_threshold_secs: u64,
    /// Upper bound on how long the timing loop sleeps without re-checking.
    #[serde(default = "default_idle_wait_secs")]
    pub idle_wait_secs: u64,
    /// Block shutdown until running jobs complete.
    #[serde(default = "bool_true")]
    pub wait_for_jobs_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            misfire_threshold_secs: DEFAULT_MISFIRE_THRESHOLD_SECS,
            idle_wait_secs: DEFAULT_IDLE_WAIT_SECS,
            wait_for_jobs_on_shutdown: true,
        }
    }
}

/// Dynamic scheduling: the reconciler job polls a definition store and
/// keeps the triggers of its group in sync with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default)]
    pub enabled: bool,
    /// When the reconciler itself runs.
    #[serde(default = "default_reconciler_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Trigger group owned by the reconciler.
    #[serde(default = "default_reconciler_group")]
    pub group: GroupName,
    /// Job identities whose schedules come from the definition store.
    #[serde(default)]
    pub jobs: Vec<JobId>,
    /// SQLite file holding the `job_schedules` table.
    #[serde(default = "default_db_path")]
    pub database_path: String,
    /// Delay before newly installed triggers may fire. Zero disables it.
    #[serde(default)]
    pub settle_delay_ms: u64,
    /// Run one reconciliation pass before the engine starts.
    #[serde(default = "bool_true")]
    pub run_on_start: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: default_reconciler_cron(),
            timezone: default_timezone(),
            group: default_reconciler_group(),
            jobs: Vec::new(),
            database_path: default_db_path(),
            settle_delay_ms: 0,
            run_on_start: true,
        }
    }
}

/// One job definition record, as supplied by the config file or a
/// definition store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Stable id of the definition record.
    #[serde(default = "new_definition_id")]
    pub id: String,
    /// Registry identity of the job to run.
    pub job: JobId,
    /// Trigger group; the installer decides when absent.
    #[serde(default)]
    pub group: Option<GroupName>,
    /// Six-field cron: sec min hour day-of-month month day-of-week.
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default)]
    pub comment: String,
}

impl JobDefinition {
    pub fn new(job: impl Into<JobId>, cron: impl Into<String>) -> Self {
        Self {
            id: new_definition_id(),
            job: job.into(),
            group: None,
            cron: cron.into(),
            timezone: default_timezone(),
            enabled: true,
            misfire_policy: MisfirePolicy::default(),
            comment: String::new(),
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<GroupName>) -> Self {
        self.group = Some(group.into());
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

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn bool_true() -> bool {
    true
}
fn default_worker_count() -> usize {
    DEFAULT_WORKER_COUNT
}
fn default_misfire_threshold_secs() -> u64 {
    DEFAULT_MISFIRE_THRESHOLD_SECS
}
fn default_idle_wait_secs() -> u64 {
    DEFAULT_IDLE_WAIT_SECS
}
fn default_reconciler_cron() -> String {
    DEFAULT_RECONCILER_CRON.to_string()
}
fn default_reconciler_group() -> GroupName {
    GroupName::new(DEFAULT_RECONCILER_GROUP)
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn new_definition_id() -> String {
    Uuid::now_v7().to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskproc/taskproc.db", home)
}

impl TaskprocConfig {
    /// Load config from a TOML file with TASKPROC_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TASKPROC_SCHEDULER__WORKER_COUNT=4`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        tracing::debug!(%path, "loading config");

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TASKPROC_").split("__"))
            .extract()
            .map_err(|e| crate::error::TaskprocError::Config(e.to_string()))
    }

    /// Parse config from an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> crate::error::Result<Self> {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| crate::error::TaskprocError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskproc/taskproc.toml", home)
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &str) -> crate::error::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = TaskprocConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.scheduler.misfire_threshold_secs, 60);
        assert!(config.scheduler.wait_for_jobs_on_shutdown);
        assert!(!config.reconciler.enabled);
        assert_eq!(config.reconciler.group.as_str(), "DynamicJobs");
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn jobs_table_parses_with_defaults() {
        let config = TaskprocConfig::from_toml_str(
            r#"
            [scheduler]
            worker_count = 2

            [[jobs]]
            job = "log"
            cron = "0 */5 * * * ?"
            comment = "heartbeat"

            [[jobs]]
            id = "nightly"
            job = "report"
            cron = "0 0 2 * * ?"
            timezone = "Europe/Budapest"
            enabled = false
            misfire_policy = "do_nothing"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.worker_count, 2);
        assert_eq!(config.jobs.len(), 2);

        let first = &config.jobs[0];
        assert_eq!(first.job.as_str(), "log");
        assert_eq!(first.timezone, "UTC");
        assert!(first.enabled);
        assert_eq!(first.misfire_policy, MisfirePolicy::FireNowAndProceed);
        assert!(!first.id.is_empty());

        let second = &config.jobs[1];
        assert_eq!(second.id, "nightly");
        assert!(!second.enabled);
        assert_eq!(second.misfire_policy, MisfirePolicy::DoNothing);
    }

    #[test]
    fn job_without_cron_is_a_config_error() {
        let err = TaskprocConfig::from_toml_str("[[jobs]]\njob = \"log\"\n").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn example_config_parses() {
        let config = TaskprocConfig::from_toml_str(include_str!("../../../taskproc.example.toml")).unwrap();
        assert_eq!(config.reconciler.jobs, vec![JobId::from("log")]);
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.jobs[1].group, Some(GroupName::new("Nightly")));
    }
}
