use std::sync::RwLock;

use async_trait::async_trait;
use taskproc_core::config::JobDefinition;
use taskproc_core::types::JobId;

use crate::error::Result;

/// Where the reconciler reads desired schedules from.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Definitions for the given job identities. Identities without a record
    /// are simply absent from the result.
    async fn load(&self, jobs: &[JobId]) -> Result<Vec<JobDefinition>>;
}

/// In-memory source, replaceable at runtime.
#[derive(Default)]
pub struct StaticScheduleSource {
    definitions: RwLock<Vec<JobDefinition>>,
}

impl StaticScheduleSource {
    pub fn new(definitions: Vec<JobDefinition>) -> Self {
        Self { definitions: RwLock::new(definitions) }
    }

    /// Swap the whole desired set.
    pub fn set(&self, definitions: Vec<JobDefinition>) {
        *self.definitions.write().expect("schedule source lock poisoned") = definitions;
    }
}

#[async_trait]
impl ScheduleSource for StaticScheduleSource {
    async fn load(&self, jobs: &[JobId]) -> Result<Vec<JobDefinition>> {
        let definitions = self.definitions.read().expect("schedule source lock poisoned");
        Ok(definitions.iter().filter(|d| jobs.contains(&d.job)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filters_to_requested_identities() {
        let source = StaticScheduleSource::new(vec![
            JobDefinition::new("a", "0 0 * * * ?"),
            JobDefinition::new("b", "0 30 * * * ?"),
        ]);
        let loaded = source.load(&[JobId::from("b"), JobId::from("zzz")]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].job, JobId::from("b"));

        source.set(vec![]);
        assert!(source.load(&[JobId::from("b")]).await.unwrap().is_empty());
    }
}
