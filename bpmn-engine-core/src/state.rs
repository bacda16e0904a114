//! Serialisable snapshots of the running tree.
//!
//! Every field of the top-level [`DefinitionState`] is optional so partial
//! states (counters only, environment only) can be recovered.

use crate::broker::BrokerState;
use crate::environment::EnvironmentState;
use crate::messages::{Content, Parent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_false(v: &bool) -> bool {
    !v
}

// ── Status & counters ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Entered,
    Started,
    Executing,
    Executed,
    Discard,
    Error,
}

/// Lifecycle status of a definition or process run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Entered,
    Started,
    Executing,
    End,
    Discard,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounters {
    pub taken: u32,
    pub discarded: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub completed: u32,
    pub discarded: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCounters {
    pub take: u32,
    pub discard: u32,
}

// ── Activity ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubExecutionStatus {
    Running,
    Completed,
    Discarded,
}

/// One loop iteration or event definition execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubExecutionState {
    pub execution_id: String,
    pub index: usize,
    pub status: SubExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityExecutionState {
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub completed: bool,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executions: Vec<SubExecutionState>,
    /// Nested scopes of a running sub-process, one per live execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<ProcessExecutionState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinArrival {
    pub flow_id: String,
    pub taken: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ActivityStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stopped: bool,
    #[serde(default)]
    pub counters: ActivityCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ActivityExecutionState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub join: Vec<JoinArrival>,
}

// ── Process ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub id: String,
    pub counters: FlowCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExecutionState {
    pub id: String,
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default)]
    pub children: Vec<ActivityState>,
    #[serde(default)]
    pub flows: Vec<FlowState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessState {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stopped: bool,
    #[serde(default)]
    pub counters: RunCounters,
    /// Set for processes started by a call activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Parent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ProcessExecutionState>,
}

// ── Definition ──

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionExecutionState {
    #[serde(default, skip_serializing_if = "is_false")]
    pub stopped: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub completed: bool,
    #[serde(default)]
    pub processes: Vec<ProcessState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<RunCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<DefinitionExecutionState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_definition_state_parses() {
        let state: DefinitionState =
            serde_json::from_str(r#"{"counters": {"completed": 1, "discarded": 0}}"#).unwrap();
        assert_eq!(
            state.counters,
            Some(RunCounters {
                completed: 1,
                discarded: 0
            })
        );
        assert!(state.execution.is_none());
    }

    #[test]
    fn status_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Executing).unwrap(),
            "\"executing\""
        );
        assert_eq!(
            serde_json::to_string(&ActivityStatus::Executed).unwrap(),
            "\"executed\""
        );
    }
}
