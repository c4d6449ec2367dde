use serde::{Deserialize, Serialize};
use std::fmt;

/// Group used when a schedule does not name one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Identity of an entry in the job registry (e.g. `"log"`, `"reconciler"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Logical trigger group. The reconciler owns exactly one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupName(pub String);

impl GroupName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GroupName {
    fn default() -> Self {
        Self(DEFAULT_GROUP.to_string())
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key of a live trigger. At most one trigger exists per key.
///
/// Format: `{group}.{job}`, matching how triggers are named in log output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub group: GroupName,
    pub job: JobId,
}

impl TriggerKey {
    pub fn new(group: impl Into<GroupName>, job: impl Into<JobId>) -> Self {
        Self { group: group.into(), job: job.into() }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.job)
    }
}

/// What the engine does with a fire time that elapsed more than the misfire
/// threshold ago.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Fire once now, then continue with the first regular time after now.
    #[default]
    FireNowAndProceed,
    /// Skip the missed fire and continue with the first regular time after now.
    DoNothing,
    /// Fire once now as a stand-in for the missed slot, then continue after now.
    FireOnceNow,
}

impl fmt::Display for MisfirePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MisfirePolicy::FireNowAndProceed => "fire_now_and_proceed",
            MisfirePolicy::DoNothing => "do_nothing",
            MisfirePolicy::FireOnceNow => "fire_once_now",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fire_now_and_proceed" => Ok(MisfirePolicy::FireNowAndProceed),
            "do_nothing" => Ok(MisfirePolicy::DoNothing),
            "fire_once_now" => Ok(MisfirePolicy::FireOnceNow),
            other => Err(format!("unknown misfire policy: {other}")),
        }
    }
}

/// What the engine did with a trigger once an acquisition completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionInstruction {
    /// Trigger went back to waiting (or stays paused).
    NoInstruction,
    /// The schedule has no further fire time.
    SetTriggerComplete,
    /// The job result asked to unschedule the firing trigger.
    DeleteTrigger,
    /// The job result asked to unschedule every trigger of the job.
    DeleteAllJobTriggers,
    /// The execution was lost or the job is not registered.
    SetTriggerError,
}

impl fmt::Display for CompletionInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletionInstruction::NoInstruction => "no_instruction",
            CompletionInstruction::SetTriggerComplete => "set_trigger_complete",
            CompletionInstruction::DeleteTrigger => "delete_trigger",
            CompletionInstruction::DeleteAllJobTriggers => "delete_all_job_triggers",
            CompletionInstruction::SetTriggerError => "set_trigger_error",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_key_display() {
        let key = TriggerKey::new("DynamicJobs", "report");
        assert_eq!(key.to_string(), "DynamicJobs.report");
    }

    #[test]
    fn misfire_policy_round_trips_through_str() {
        for p in [
            MisfirePolicy::FireNowAndProceed,
            MisfirePolicy::DoNothing,
            MisfirePolicy::FireOnceNow,
        ] {
            assert_eq!(p.to_string().parse::<MisfirePolicy>().unwrap(), p);
        }
        assert!("later".parse::<MisfirePolicy>().is_err());
    }

    #[test]
    fn default_group_name() {
        assert_eq!(GroupName::default().as_str(), DEFAULT_GROUP);
    }
}
