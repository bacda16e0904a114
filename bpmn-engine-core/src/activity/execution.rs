//! Execution progress of one activity run: the root execution plus its loop
//! iterations or event definition executions.

use super::{Activity, WeakActivity};
use crate::authoring::dto::MultiInstanceDto;
use crate::messages::{unshift_parent, Content, ParentRef};
use crate::state::{ActivityExecutionState, ProcessExecutionState, SubExecutionState, SubExecutionStatus};
use serde_json::Value;

/// How the root execution fans out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fanout {
    /// The behaviour runs once on the root execution.
    Single,
    /// One sub-execution per iteration.
    Loop(MultiInstanceDto),
    /// One sub-execution per event definition.
    Definitions { count: usize, throwing: bool },
}

#[derive(Debug, Clone)]
pub(crate) struct ExecutionProgress {
    pub root: Content,
    pub completed: bool,
    pub subs: Vec<SubExecutionState>,
}

impl ExecutionProgress {
    pub fn new(root: Content) -> Self {
        Self {
            root,
            completed: false,
            subs: Vec::new(),
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root.execution_id
    }

    /// Content of sub-execution `index`: its parent head is the activity
    /// execution.
    pub fn sub_content(&self, index: usize) -> Content {
        let mut content = self.root.clone();
        content.execution_id = format!("{}_{}", self.root.execution_id, index);
        content.index = Some(index);
        content.is_root_scope = false;
        content.parent = Some(unshift_parent(
            self.root.parent.as_ref(),
            &ParentRef::new(&self.root.id, &self.root.kind, &self.root.execution_id),
        ));
        content
    }

    pub fn start_sub(&mut self, index: usize) -> Content {
        let content = self.sub_content(index);
        self.subs.push(SubExecutionState {
            execution_id: content.execution_id.clone(),
            index,
            status: SubExecutionStatus::Running,
            output: None,
        });
        content
    }

    pub fn sub_mut(&mut self, execution_id: &str) -> Option<&mut SubExecutionState> {
        self.subs.iter_mut().find(|s| s.execution_id == execution_id)
    }

    pub fn running(&self) -> Vec<&SubExecutionState> {
        self.subs
            .iter()
            .filter(|s| s.status == SubExecutionStatus::Running)
            .collect()
    }

    /// What the root should do now that a sub-execution settled, if anything.
    pub fn settle(&self, fanout: Fanout) -> Settled {
        let running = self.running().len();
        match fanout {
            Fanout::Single => Settled::Pending,
            Fanout::Loop(mi) => {
                if self.subs.len() < mi.cardinality {
                    if mi.sequential && running == 0 {
                        return Settled::StartNext(self.subs.len());
                    }
                    return Settled::Pending;
                }
                if running > 0 {
                    return Settled::Pending;
                }
                let mut ordered: Vec<&SubExecutionState> = self.subs.iter().collect();
                ordered.sort_by_key(|s| s.index);
                let output = ordered
                    .iter()
                    .map(|s| s.output.clone().unwrap_or(Value::Null))
                    .collect();
                Settled::Completed(Some(Value::Array(output)))
            }
            Fanout::Definitions { throwing, .. } => {
                let completed: Vec<&SubExecutionState> = self
                    .subs
                    .iter()
                    .filter(|s| s.status == SubExecutionStatus::Completed)
                    .collect();
                if !throwing {
                    if let Some(first) = completed.first() {
                        return Settled::Completed(first.output.clone());
                    }
                }
                if running > 0 {
                    return Settled::Pending;
                }
                if completed.is_empty() {
                    Settled::Discarded
                } else {
                    Settled::Completed(completed.last().and_then(|s| s.output.clone()))
                }
            }
        }
    }

    pub fn to_state(&self, scopes: Vec<ProcessExecutionState>) -> ActivityExecutionState {
        ActivityExecutionState {
            execution_id: self.root.execution_id.clone(),
            completed: self.completed,
            content: self.root.clone(),
            executions: self.subs.clone(),
            scopes,
        }
    }

    pub fn from_state(state: &ActivityExecutionState) -> Self {
        Self {
            root: state.content.clone(),
            completed: state.completed,
            subs: state.executions.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Settled {
    Pending,
    StartNext(usize),
    Completed(Option<Value>),
    Discarded,
}

// ── Execution api ──

/// Handle to one running iteration or event definition execution.
#[derive(Clone)]
pub struct ExecutionApi {
    activity: WeakActivity,
    content: Content,
}

impl std::fmt::Debug for ExecutionApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionApi")
            .field("id", &self.content.id)
            .field("execution_id", &self.content.execution_id)
            .finish()
    }
}

impl ExecutionApi {
    pub(crate) fn new(activity: &Activity, content: Content) -> Self {
        Self {
            activity: activity.downgrade(),
            content,
        }
    }

    pub fn id(&self) -> &str {
        &self.content.id
    }

    pub fn execution_id(&self) -> &str {
        &self.content.execution_id
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Cancel the execution. Cancelling twice is a no-op.
    pub fn cancel(&self) {
        if let Some(activity) = self.activity.upgrade() {
            activity.cancel_execution(&self.content.execution_id);
        }
    }

    pub fn signal(&self, message: Option<Value>) {
        if let Some(activity) = self.activity.upgrade() {
            activity.get_api(Some(&self.content)).signal(message);
        }
    }

    pub fn discard(&self) {
        if let Some(activity) = self.activity.upgrade() {
            activity.get_api(Some(&self.content)).discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Parent;

    fn root() -> Content {
        Content::new("task", "bpmn:UserTask")
            .with_execution_id("task_1")
            .with_parent(Some(Parent::from(ParentRef::new("process1", "bpmn:Process", "process1_1"))))
    }

    #[test]
    fn sub_content_adopts_activity_as_parent() {
        let progress = ExecutionProgress::new(root());
        let sub = progress.sub_content(2);
        assert_eq!(sub.execution_id, "task_1_2");
        assert_eq!(sub.index, Some(2));
        let parent = sub.parent.unwrap();
        assert_eq!(parent.id, "task");
        assert_eq!(parent.execution_id, "task_1");
        assert_eq!(parent.path[0].id, "process1");
    }

    #[test]
    fn sequential_loop_starts_next_when_previous_settles() {
        let mi = MultiInstanceDto {
            cardinality: 2,
            sequential: true,
        };
        let mut progress = ExecutionProgress::new(root());
        progress.start_sub(0);
        assert_eq!(progress.settle(Fanout::Loop(mi)), Settled::Pending);

        let sub = progress.sub_mut("task_1_0").unwrap();
        sub.status = SubExecutionStatus::Completed;
        sub.output = Some(Value::from(1));
        assert_eq!(progress.settle(Fanout::Loop(mi)), Settled::StartNext(1));

        progress.start_sub(1);
        progress.sub_mut("task_1_1").unwrap().status = SubExecutionStatus::Discarded;
        assert_eq!(
            progress.settle(Fanout::Loop(mi)),
            Settled::Completed(Some(serde_json::json!([1, null])))
        );
    }

    #[test]
    fn catching_definitions_complete_on_first() {
        let fanout = Fanout::Definitions {
            count: 2,
            throwing: false,
        };
        let mut progress = ExecutionProgress::new(root());
        progress.start_sub(0);
        progress.start_sub(1);
        progress.sub_mut("task_1_1").unwrap().status = SubExecutionStatus::Completed;
        assert_eq!(progress.settle(fanout), Settled::Completed(None));
    }

    #[test]
    fn throwing_definitions_wait_for_all() {
        let fanout = Fanout::Definitions {
            count: 2,
            throwing: true,
        };
        let mut progress = ExecutionProgress::new(root());
        progress.start_sub(0);
        progress.start_sub(1);
        progress.sub_mut("task_1_0").unwrap().status = SubExecutionStatus::Completed;
        assert_eq!(progress.settle(fanout), Settled::Pending);
        progress.sub_mut("task_1_1").unwrap().status = SubExecutionStatus::Completed;
        assert_eq!(progress.settle(fanout), Settled::Completed(None));
    }
}
