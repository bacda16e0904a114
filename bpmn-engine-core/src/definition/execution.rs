//! Process bookkeeping for one definition run.
//!
//! Keeps the set of running processes (executable ones plus those started
//! by call activities), relays call activity outcomes, broadcasts delegated
//! events between processes and settles the run once every process left.

use crate::api::Api;
use crate::broker::{Broker, ConsumeOptions, Dispatcher};
use crate::context::DefinitionContext;
use crate::error::{ActivityError, EngineError};
use crate::messages::{shift_parent, unshift_parent, Content, Message, Parent, ParentRef};
use crate::process::execution::ScopeOutcome;
use crate::process::Process;
use crate::state::DefinitionExecutionState;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

const PROCESS_TAG: &str = "_definition-process";

type OnComplete = Box<dyn Fn(ScopeOutcome)>;

#[derive(Default)]
struct State {
    content: Option<Content>,
    stopped: bool,
    completed: bool,
}

struct ExecutionInner {
    broker: Broker,
    context: DefinitionContext,
    dispatcher: Dispatcher,
    processes: Vec<Process>,
    running: RefCell<Vec<Process>>,
    state: RefCell<State>,
    on_complete: OnComplete,
}

#[derive(Clone)]
pub(crate) struct DefinitionExecution {
    inner: Rc<ExecutionInner>,
}

#[derive(Clone)]
struct WeakExecution {
    inner: Weak<ExecutionInner>,
}

impl WeakExecution {
    fn upgrade(&self) -> Option<DefinitionExecution> {
        self.inner.upgrade().map(|inner| DefinitionExecution { inner })
    }
}

/// Outcome of a called process, relayed to its call activity.
enum CallOutcome {
    Completed(Option<Value>),
    Discarded,
    Error(ActivityError),
}

/// A process whose events are forwarded to the definition broker.
fn new_process(dto_id: &str, context: &DefinitionContext, dispatcher: &Dispatcher, broker: &Broker) -> Option<Process> {
    let dto = context.get_process_by_id(dto_id)?;
    let process = Process::new(dto, context, dispatcher);
    process.broker().create_shovel("event", "#", broker, "event");
    Some(process)
}

impl DefinitionExecution {
    pub fn new(
        broker: &Broker,
        context: &DefinitionContext,
        dispatcher: &Dispatcher,
        on_complete: impl Fn(ScopeOutcome) + 'static,
    ) -> Self {
        let processes = context
            .get_processes()
            .iter()
            .filter_map(|dto| new_process(&dto.id, context, dispatcher, broker))
            .collect();
        Self {
            inner: Rc::new(ExecutionInner {
                broker: broker.clone(),
                context: context.clone(),
                dispatcher: dispatcher.clone(),
                processes,
                running: RefCell::default(),
                state: RefCell::default(),
                on_complete: Box::new(on_complete),
            }),
        }
    }

    fn downgrade(&self) -> WeakExecution {
        WeakExecution {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Every process of the definition, in declaration order.
    pub fn processes(&self) -> &[Process] {
        &self.inner.processes
    }

    /// Processes of the current run, including called ones.
    pub fn running(&self) -> Vec<Process> {
        self.inner.running.borrow().clone()
    }

    pub fn execution_id(&self) -> Option<String> {
        self.inner
            .state
            .borrow()
            .content
            .as_ref()
            .map(|c| c.execution_id.clone())
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.borrow().completed
    }

    fn definition_parent(&self) -> Option<Parent> {
        self.inner
            .state
            .borrow()
            .content
            .as_ref()
            .map(|c| Parent::from(c.as_parent_ref()))
    }

    // ── Run ──

    pub fn execute(&self, content: &Content) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.content = Some(content.clone());
            state.stopped = false;
            state.completed = false;
        }
        let executable: Vec<Process> = self
            .inner
            .processes
            .iter()
            .filter(|p| p.is_executable())
            .cloned()
            .collect();
        *self.inner.running.borrow_mut() = executable.clone();

        let parent = Parent::from(content.as_parent_ref());
        for process in &executable {
            process.set_parent(parent.clone());
            self.subscribe(process);
        }
        for process in executable {
            process.run();
        }
    }

    fn subscribe(&self, process: &Process) {
        let weak = self.downgrade();
        let source = process.downgrade();
        process.broker().subscribe_tmp(
            "event",
            "#",
            move |msg| {
                if let (Some(execution), Some(process)) = (weak.upgrade(), source.upgrade()) {
                    execution.on_process_event(&process, msg);
                }
            },
            ConsumeOptions::default().tag(PROCESS_TAG),
        );
    }

    fn is_own_event(process: &Process, content: &Content) -> bool {
        content.id == process.id() && process.execution_id().as_deref() == Some(content.execution_id.as_str())
    }

    fn is_called(process: &Process) -> bool {
        process
            .parent()
            .is_some_and(|p| p.kind != crate::definition::DEFINITION_TYPE)
    }

    fn on_process_event(&self, process: &Process, message: &Message) {
        {
            let state = self.inner.state.borrow();
            if state.completed || state.stopped {
                return;
            }
        }
        if message.properties.delegate {
            self.broadcast(message, Some(process));
        }

        let content = &message.content;
        let own = Self::is_own_event(process, content);
        match message.routing_key() {
            "activity.call" => self.start_called(message),
            "activity.call.cancel" => self.cancel_called(content),
            "process.end" if own => {
                let output = content.output.clone();
                if Self::is_called(process) {
                    self.notify_caller(process, CallOutcome::Completed(output));
                } else if let Some(Value::Object(output)) = output {
                    self.inner.context.environment().assign_output(output);
                }
            }
            "process.discard" if own && Self::is_called(process) => {
                self.notify_caller(process, CallOutcome::Discarded);
            }
            "process.error" if own => {
                let error = content
                    .error
                    .clone()
                    .unwrap_or_else(|| ActivityError::new("process failed").with_source(process.id()));
                if Self::is_called(process) {
                    self.notify_caller(process, CallOutcome::Error(error));
                } else {
                    self.fail(process, error);
                }
            }
            "process.leave" if own => {
                if Self::is_called(process) {
                    self.release_called(process);
                }
                self.check_complete();
            }
            _ => {}
        }
    }

    fn start_called(&self, message: &Message) {
        let content = &message.content;
        let Some(called) = content.extra.get("calledElement").and_then(Value::as_str) else {
            warn!(activity_id = %content.id, "call without called element");
            return;
        };
        let parent = unshift_parent(content.parent.as_ref(), &content.as_parent_ref());
        let Some(process) = new_process(called, &self.inner.context, &self.inner.dispatcher, &self.inner.broker) else {
            let error = ActivityError::new(format!("Process {called} not found")).with_source(&content.id);
            if let Some(api) = self.get_api(&caller_content(&parent)) {
                api.fail(error);
            }
            return;
        };
        info!(
            activity_id = %content.id,
            execution_id = %content.execution_id,
            process_id = called,
            "start called process"
        );
        process.set_parent(parent);
        self.inner.running.borrow_mut().push(process.clone());
        self.subscribe(&process);
        process.run();
    }

    /// Forget a called process once it has left.
    fn release_called(&self, process: &Process) {
        process.broker().cancel(PROCESS_TAG);
        let execution_id = process.execution_id();
        self.inner
            .running
            .borrow_mut()
            .retain(|p| !(p.id() == process.id() && p.execution_id() == execution_id));
        debug!(process_id = %process.id(), "called process released");
    }

    fn cancel_called(&self, content: &Content) {
        let called = self.inner.running.borrow().iter().find(|p| {
            p.is_running()
                && p
                    .parent()
                    .is_some_and(|parent| parent.id == content.id && parent.execution_id == content.execution_id)
        }).cloned();
        if let Some(process) = called {
            debug!(process_id = %process.id(), activity_id = %content.id, "cancel called process");
            process.discard();
        }
    }

    fn notify_caller(&self, process: &Process, outcome: CallOutcome) {
        let Some(parent) = process.parent() else { return };
        let Some(api) = self.get_api(&caller_content(&parent)) else {
            debug!(process_id = %process.id(), "caller is gone");
            return;
        };
        match outcome {
            CallOutcome::Completed(output) => api.send_api_message("completed", output, false),
            CallOutcome::Discarded => api.send_api_message("discard", None, false),
            CallOutcome::Error(error) => api.fail(error),
        }
    }

    /// Hand a delegated event to every running process except `source`.
    fn broadcast(&self, message: &Message, source: Option<&Process>) {
        let targets: Vec<Process> = self
            .inner
            .running
            .borrow()
            .iter()
            .filter(|p| p.is_running())
            .filter(|p| source.map_or(true, |s| s.id() != p.id() || s.execution_id() != p.execution_id()))
            .cloned()
            .collect();
        for process in targets {
            process.delegate(message);
        }
    }

    pub fn delegate(&self, message: &Message) {
        if self.is_completed() {
            return;
        }
        self.broadcast(message, None);
    }

    fn check_complete(&self) {
        {
            let state = self.inner.state.borrow();
            if state.completed || state.stopped {
                return;
            }
        }
        if self.inner.running.borrow().iter().any(Process::is_running) {
            return;
        }
        self.settle();
        (self.inner.on_complete)(ScopeOutcome::Completed(None));
    }

    fn settle(&self) {
        self.inner.state.borrow_mut().completed = true;
        for process in self.running() {
            process.broker().cancel(PROCESS_TAG);
        }
    }

    fn fail(&self, source: &Process, error: ActivityError) {
        self.settle();
        for process in self.running() {
            if process.is_running() && process.execution_id() != source.execution_id() {
                process.discard();
            }
        }
        (self.inner.on_complete)(ScopeOutcome::Error(error));
    }

    pub fn stop(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.completed {
                return;
            }
            state.stopped = true;
        }
        for process in self.running() {
            process.broker().cancel(PROCESS_TAG);
            process.stop();
        }
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.completed || state.content.is_none() {
                return;
            }
            state.stopped = false;
        }
        let running = self.running();
        for process in &running {
            self.subscribe(process);
        }
        for process in running {
            process.resume();
        }
        self.check_complete();
    }

    // ── Api ──

    /// Api of the process or activity execution `content` addresses.
    pub fn get_api(&self, content: &Content) -> Option<Api> {
        let running = self.running();
        let matches = |p: &Process, r: &ParentRef| p.id() == r.id && p.execution_id().as_deref() == Some(r.execution_id.as_str());

        if let Some(process) = running
            .iter()
            .find(|p| matches(p, &ParentRef::new(&content.id, &content.kind, &content.execution_id)))
        {
            return Some(process.get_api(Some(content)));
        }
        let chain = content.parent.as_ref()?.chain();
        chain.iter().enumerate().find_map(|(position, ancestor)| {
            let process = running.iter().find(|p| matches(p, ancestor))?;
            let path: Vec<ParentRef> = chain[..position].iter().rev().cloned().collect();
            process.resolve_api(&path, content)
        })
    }

    // ── State ──

    pub fn get_state(&self) -> DefinitionExecutionState {
        let state = self.inner.state.borrow();
        DefinitionExecutionState {
            stopped: state.stopped,
            completed: state.completed,
            processes: self.inner.running.borrow().iter().map(Process::get_state).collect(),
        }
    }

    pub fn recover(&self, state: &DefinitionExecutionState, content: Content) -> Result<(), EngineError> {
        {
            let mut own = self.inner.state.borrow_mut();
            own.content = Some(content);
            own.stopped = state.stopped;
            own.completed = state.completed;
        }
        let parent = self.definition_parent();
        let mut running = Vec::with_capacity(state.processes.len());
        for process_state in &state.processes {
            let called = process_state
                .parent
                .as_ref()
                .is_some_and(|p| p.kind != crate::definition::DEFINITION_TYPE);
            let existing = (!called)
                .then(|| self.inner.processes.iter().find(|p| p.id() == process_state.id).cloned())
                .flatten();
            let process = match existing {
                Some(process) => process,
                None => match new_process(&process_state.id, &self.inner.context, &self.inner.dispatcher, &self.inner.broker) {
                    Some(process) => process,
                    None => {
                        warn!(process_id = %process_state.id, "recovered process is not in the definition");
                        continue;
                    }
                },
            };
            if let (false, Some(parent)) = (called, &parent) {
                process.set_parent(parent.clone());
            }
            process.recover(process_state)?;
            running.push(process);
        }
        *self.inner.running.borrow_mut() = running;
        Ok(())
    }
}

/// Content addressing the call activity execution named by `parent`.
fn caller_content(parent: &Parent) -> Content {
    Content::new(&parent.id, &parent.kind)
        .with_execution_id(&parent.execution_id)
        .with_parent(shift_parent(Some(parent)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_content_drops_the_call_activity_from_the_chain() {
        let parent = Parent {
            id: "call".to_string(),
            kind: "bpmn:CallActivity".to_string(),
            execution_id: "call_1".to_string(),
            path: vec![
                ParentRef::new("process1", "bpmn:Process", "process1_1"),
                ParentRef::new("def1", "bpmn:Definitions", "def1_1"),
            ],
        };
        let content = caller_content(&parent);
        assert_eq!(content.id, "call");
        assert_eq!(content.execution_id, "call_1");
        let up = content.parent.unwrap();
        assert_eq!(up.id, "process1");
        assert_eq!(up.path.len(), 1);
    }
}
