use std::sync::Arc;

use taskproc_core::config::{ensure_parent_dir, JobDefinition, ReconcilerConfig, TaskprocConfig};
use taskproc_core::types::GroupName;
use taskproc_hooks::{ListenerSet, LoggingListener};
use taskproc_scheduler::{
    EngineConfig, JobRegistry, Reconciler, Schedule, SchedulerEngine, SchedulerHandle, SqliteScheduleSource,
};
use tracing::{debug, info, warn};

use crate::jobs;

/// Everything the service wires together at startup.
pub struct App {
    pub scheduler: SchedulerHandle,
    pub registry: Arc<JobRegistry>,
    pub listeners: Arc<ListenerSet>,
    pub reconciler: Option<Arc<Reconciler>>,
}

impl App {
    /// Build the engine (in standby), register built-in jobs and listeners,
    /// install static schedules and, if enabled, the reconciler.
    pub async fn build(config: &TaskprocConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(JobRegistry::new());
        jobs::register_builtin(&registry);

        let listeners = Arc::new(ListenerSet::new());
        listeners.register_all("logging", Arc::new(LoggingListener));

        let scheduler =
            SchedulerEngine::new(EngineConfig::from(&config.scheduler), Arc::clone(&registry), Arc::clone(&listeners))
                .spawn();

        let installed = install_static_jobs(&scheduler, &registry, &config.jobs).await?;
        info!(installed, defined = config.jobs.len(), "static jobs installed");

        let reconciler = if config.reconciler.enabled {
            Some(setup_reconciler(&config.reconciler, &scheduler, &registry).await?)
        } else {
            debug!("reconciler disabled");
            None
        };

        Ok(Self { scheduler, registry, listeners, reconciler })
    }
}

/// Install the static `[[jobs]]` definitions. Disabled, unregistered and
/// invalid ones are logged and skipped. Returns how many were installed.
pub async fn install_static_jobs(
    scheduler: &SchedulerHandle,
    registry: &JobRegistry,
    definitions: &[JobDefinition],
) -> anyhow::Result<usize> {
    let mut installed = 0;
    for def in definitions {
        if !def.enabled {
            debug!(job = %def.job, "static job disabled; skipping");
            continue;
        }
        if !registry.contains(&def.job) {
            warn!(job = %def.job, "static job refers to an unknown job; skipping");
            continue;
        }
        let schedule = match Schedule::from_definition(def, &GroupName::default()) {
            Ok(s) => s,
            Err(e) => {
                warn!(job = %def.job, "static job skipped: {e}");
                continue;
            }
        };
        let next = scheduler.add_or_replace(schedule).await?;
        info!(job = %def.job, cron = %def.cron, timezone = %def.timezone, next_fire = ?next, "static job scheduled");
        installed += 1;
    }
    Ok(installed)
}

/// Open the schedule database, register the reconciler job and schedule it.
/// With `run_on_start` one pass runs before this returns.
pub async fn setup_reconciler(
    cfg: &ReconcilerConfig,
    scheduler: &SchedulerHandle,
    registry: &JobRegistry,
) -> anyhow::Result<Arc<Reconciler>> {
    ensure_parent_dir(&cfg.database_path)?;
    info!(path = %cfg.database_path, "opening schedule database");
    let conn = rusqlite::Connection::open(&cfg.database_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    let source = SqliteScheduleSource::new(conn)?;

    let reconciler = Arc::new(Reconciler::from_config(cfg, scheduler, Arc::new(source)));
    Arc::clone(&reconciler).register(registry);

    if cfg.run_on_start {
        match reconciler.reconcile().await {
            Ok(summary) => info!(group = %cfg.group, %summary, "initial reconciliation finished"),
            // retried on the next scheduled run
            Err(e) => warn!(group = %cfg.group, "initial reconciliation failed: {e}"),
        }
    }

    let next = scheduler.add_or_replace(Reconciler::schedule(&cfg.cron, &cfg.timezone)?).await?;
    info!(cron = %cfg.cron, managed = cfg.jobs.len(), next_fire = ?next, "reconciler scheduled");
    Ok(reconciler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskproc_core::types::{JobId, TriggerKey};
    use taskproc_scheduler::{RECONCILER_JOB, SYSTEM_GROUP};

    #[tokio::test]
    async fn static_jobs_skip_disabled_unknown_and_invalid() {
        let config = TaskprocConfig {
            jobs: vec![
                JobDefinition::new("log", "0 0 12 * * ?").with_comment("noon"),
                JobDefinition::new("log", "0 0 13 * * ?").with_group("Afternoon").disabled(),
                JobDefinition::new("missing", "0 0 12 * * ?"),
                JobDefinition::new("log", "bogus").with_group("Broken"),
            ],
            ..Default::default()
        };
        let app = App::build(&config).await.unwrap();

        let triggers = app.scheduler.triggers(None).await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].key, TriggerKey::new("DEFAULT", "log"));
        assert!(app.reconciler.is_none());
        assert!(!app.scheduler.status().await.unwrap().started);
        app.scheduler.shutdown(false).await.unwrap();
    }

    #[tokio::test]
    async fn reconciler_is_wired_from_config() {
        let dir = std::env::temp_dir().join(format!("taskproc-app-{}", std::process::id()));
        let path = dir.join("schedules.db");
        let mut config = TaskprocConfig::default();
        config.reconciler.enabled = true;
        config.reconciler.database_path = path.to_string_lossy().into_owned();
        config.reconciler.jobs = vec![JobId::from("log")];

        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        {
            let source = SqliteScheduleSource::new(rusqlite::Connection::open(&path).unwrap()).unwrap();
            source.upsert(&JobDefinition::new("log", "0 */10 * * * ?").with_comment("dynamic")).unwrap();
        }

        let app = App::build(&config).await.unwrap();
        assert!(app.reconciler.is_some());
        assert!(app.registry.contains(&JobId::from(RECONCILER_JOB)));

        let system = app.scheduler.triggers(Some(&GroupName::new(SYSTEM_GROUP))).await.unwrap();
        assert_eq!(system.len(), 1);
        let dynamic = app.scheduler.triggers(Some(&config.reconciler.group)).await.unwrap();
        assert_eq!(dynamic.len(), 1);
        assert_eq!(dynamic[0].schedule.comment, "dynamic");

        app.scheduler.shutdown(false).await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
