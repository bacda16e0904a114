//! Definition: the entry point that runs the executable processes of a
//! parsed BPMN definition.
//!
//! The definition has its own broker with the same lifecycle as processes
//! and activities. Every process broker shovels its events to the
//! definition `event` exchange, so listeners registered with
//! [`Definition::on`] see the whole tree.

mod execution;

use crate::activity::Activity;
use crate::api::{Api, ApiTarget};
use crate::broker::{Broker, ConsumeOptions, Dispatcher, QueueOptions};
use crate::context::DefinitionContext;
use crate::environment::Environment;
use crate::error::{ActivityError, EngineError};
use crate::messages::{unique_id, Content, Message, Properties};
use crate::process::execution::ScopeOutcome;
use crate::process::Process;
use crate::state::{DefinitionState, RunCounters, RunStatus};
use execution::DefinitionExecution;
use serde_json::Value;
use std::cell::RefCell;
use std::future::Future;
use std::rc::{Rc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const DEFINITION_TYPE: &str = "bpmn:Definitions";

const RUN_Q: &str = "run-q";
const RUN_TAG: &str = "_definition-run";
const API_TAG: &str = "_definition-api";
const CALLBACK_TAG: &str = "_definition-callback";

#[derive(Default)]
struct RunState {
    status: Option<RunStatus>,
    execution_id: Option<String>,
    stopped: bool,
    counters: RunCounters,
    execute_message: Option<Message>,
    /// Error of the last run nobody listened for.
    unhandled: Option<ActivityError>,
}

struct DefinitionInner {
    context: DefinitionContext,
    broker: Broker,
    dispatcher: Dispatcher,
    execution: RefCell<Option<DefinitionExecution>>,
    run: RefCell<RunState>,
}

#[derive(Clone)]
pub struct Definition {
    inner: Rc<DefinitionInner>,
}

#[derive(Clone)]
struct WeakDefinition {
    inner: Weak<DefinitionInner>,
}

impl WeakDefinition {
    fn upgrade(&self) -> Option<Definition> {
        self.inner.upgrade().map(|inner| Definition { inner })
    }
}

impl std::fmt::Debug for Definition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Definition")
            .field("id", &self.id())
            .field("execution_id", &self.execution_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Event name to routing pattern: `leave` means `definition.leave`, `wait`
/// means `activity.wait`, anything with a dot is taken as is.
fn event_pattern(event: &str) -> String {
    match event {
        e if e.contains('.') => e.to_string(),
        "wait" => "activity.wait".to_string(),
        e => format!("definition.{e}"),
    }
}

impl Definition {
    pub fn new(context: DefinitionContext) -> Self {
        let dispatcher = Dispatcher::new();
        let broker = Broker::with_dispatcher(context.id(), dispatcher.clone());
        for exchange in ["run", "api", "event", "execution"] {
            broker.assert_exchange(exchange);
        }
        broker.assert_queue(RUN_Q, QueueOptions::default());
        broker.bind_queue(RUN_Q, "run", "run.#", 0);
        Self {
            inner: Rc::new(DefinitionInner {
                context,
                broker,
                dispatcher,
                execution: RefCell::default(),
                run: RefCell::default(),
            }),
        }
    }

    /// Run `context` in `environment` instead of the context's own.
    pub fn with_environment(context: &DefinitionContext, environment: Environment) -> Self {
        Self::new(context.clone_with(environment))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        Ok(Self::new(DefinitionContext::from_yaml(yaml)?))
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(Self::new(DefinitionContext::from_json(json)?))
    }

    fn downgrade(&self) -> WeakDefinition {
        WeakDefinition {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ── Accessors ──

    pub fn id(&self) -> &str {
        self.inner.context.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.context.name()
    }

    pub fn kind(&self) -> &'static str {
        DEFINITION_TYPE
    }

    pub fn context(&self) -> &DefinitionContext {
        &self.inner.context
    }

    pub fn environment(&self) -> &Environment {
        self.inner.context.environment()
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.inner.run.borrow().status
    }

    pub fn is_running(&self) -> bool {
        self.status().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.run.borrow().stopped
    }

    pub fn execution_id(&self) -> Option<String> {
        self.inner.run.borrow().execution_id.clone()
    }

    pub fn counters(&self) -> RunCounters {
        self.inner.run.borrow().counters
    }

    fn content(&self) -> Content {
        Content::new(self.id(), DEFINITION_TYPE).with_execution_id(self.execution_id().unwrap_or_default())
    }

    fn execution(&self) -> DefinitionExecution {
        let existing = self.inner.execution.borrow().clone();
        if let Some(execution) = existing {
            return execution;
        }
        let weak = self.downgrade();
        let execution = DefinitionExecution::new(
            &self.inner.broker,
            &self.inner.context,
            &self.inner.dispatcher,
            move |outcome| {
                if let Some(definition) = weak.upgrade() {
                    definition.on_execution_complete(outcome);
                }
            },
        );
        *self.inner.execution.borrow_mut() = Some(execution.clone());
        execution
    }

    /// Every process, created once and reused by later runs.
    pub fn get_processes(&self) -> Vec<Process> {
        self.execution().processes().to_vec()
    }

    pub fn get_executable_processes(&self) -> Vec<Process> {
        self.get_processes()
            .into_iter()
            .filter(Process::is_executable)
            .collect()
    }

    pub fn get_process_by_id(&self, id: &str) -> Option<Process> {
        self.get_processes().into_iter().find(|p| p.id() == id)
    }

    /// Processes of the current run, called processes included.
    pub fn get_running_processes(&self) -> Vec<Process> {
        self.execution()
            .running()
            .into_iter()
            .filter(Process::is_running)
            .collect()
    }

    /// Activities that are running in any running process.
    pub fn get_postponed(&self) -> Vec<Activity> {
        self.get_running_processes()
            .iter()
            .flat_map(Process::get_postponed)
            .collect()
    }

    pub fn get_activity_by_id(&self, id: &str) -> Option<Activity> {
        self.get_running_processes()
            .iter()
            .chain(self.get_processes().iter())
            .find_map(|p| p.get_activity_by_id(id))
    }

    // ── Listeners ──

    /// Subscribe to `event` on the definition broker. Returns the consumer
    /// tag; cancel it through [`Definition::broker`].
    pub fn on(&self, event: &str, handler: impl Fn(&Message) + 'static) -> String {
        self.inner
            .broker
            .subscribe_tmp("event", &event_pattern(event), handler, ConsumeOptions::default())
    }

    pub fn once(&self, event: &str, handler: impl Fn(&Message) + 'static) -> String {
        self.inner
            .broker
            .subscribe_once("event", &event_pattern(event), handler, ConsumeOptions::default())
    }

    /// Resolves with the next `event`, or fails with the run's error if the
    /// definition errors first. The subscriptions are made right away, so
    /// events published before the future is polled are not missed.
    pub fn wait_for(&self, event: &str) -> impl Future<Output = Result<Message, EngineError>> {
        let (tx, rx) = oneshot::channel();
        let tx = RefCell::new(Some(tx));
        let tags: Rc<RefCell<Vec<String>>> = Rc::default();
        let settle: Rc<dyn Fn(Result<Message, EngineError>)> = {
            let broker = self.inner.broker.downgrade();
            let tags = tags.clone();
            Rc::new(move |result: Result<Message, EngineError>| {
                if let Some(broker) = broker.upgrade() {
                    for tag in tags.borrow().iter() {
                        broker.cancel(tag);
                    }
                }
                if let Some(tx) = tx.borrow_mut().take() {
                    let _ = tx.send(result);
                }
            })
        };

        let on_event = settle.clone();
        let tag = self.once(event, move |msg| on_event(Ok(msg.clone())));
        tags.borrow_mut().push(tag);
        if event_pattern(event) != "definition.error" {
            let tag = self.once("error", move |msg| {
                let error = msg
                    .content
                    .error
                    .clone()
                    .unwrap_or_else(|| ActivityError::new("definition failed"));
                settle(Err(error.into()));
            });
            tags.borrow_mut().push(tag);
        }

        let event = event.to_string();
        async move { rx.await.unwrap_or(Err(EngineError::WaitAbandoned(event))) }
    }

    // ── Run ──

    /// Run every executable process. Returns the error of a failed run when
    /// nothing listens for `error`.
    pub fn run(&self) -> Result<(), EngineError> {
        let content = {
            let mut run = self.inner.run.borrow_mut();
            if run.stopped && run.status.is_some() {
                return Err(EngineError::Stopped);
            }
            if run.status.is_some() {
                return Err(EngineError::AlreadyRunning);
            }
            if self.inner.context.get_executable_processes().is_empty() {
                return Err(EngineError::NoExecutableProcess);
            }
            run.status = Some(RunStatus::Entered);
            run.execution_id = Some(unique_id(self.id()));
            run.stopped = false;
            run.unhandled = None;
            drop(run);
            self.content()
        };
        info!(definition_id = %self.id(), execution_id = %content.execution_id, "run definition");
        self.consume_run();
        self.subscribe_api(&content.execution_id);
        self.publish_run("run.enter", content);
        self.take_unhandled()
    }

    /// Run and call `callback` once the run leaves, stops or fails.
    pub fn run_with(&self, callback: impl FnOnce(Result<(), EngineError>) + 'static) -> Result<(), EngineError> {
        let slot: Rc<RefCell<Option<Box<dyn FnOnce(Result<(), EngineError>)>>>> =
            Rc::new(RefCell::new(Some(Box::new(callback))));
        let pending = slot.clone();
        let broker = self.inner.broker.downgrade();
        self.inner.broker.subscribe_tmp(
            "event",
            "definition.#",
            move |msg| {
                let result = match msg.routing_key() {
                    "definition.leave" | "definition.stop" => Ok(()),
                    "definition.error" => Err(EngineError::from(
                        msg.content
                            .error
                            .clone()
                            .unwrap_or_else(|| ActivityError::new("definition failed")),
                    )),
                    _ => return,
                };
                let callback = pending.borrow_mut().take();
                if let Some(broker) = broker.upgrade() {
                    broker.cancel(CALLBACK_TAG);
                }
                if let Some(callback) = callback {
                    callback(result);
                }
            },
            ConsumeOptions::default().tag(CALLBACK_TAG),
        );
        if let Err(err) = self.run() {
            self.inner.broker.cancel(CALLBACK_TAG);
            let callback = slot.borrow_mut().take();
            if let Some(callback) = callback {
                callback(Err(err.clone()));
            }
            return Err(err);
        }
        Ok(())
    }

    fn take_unhandled(&self) -> Result<(), EngineError> {
        match self.inner.run.borrow_mut().unhandled.take() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn consume_run(&self) {
        let weak = self.downgrade();
        self.inner.broker.consume(
            RUN_Q,
            move |msg| {
                if let Some(definition) = weak.upgrade() {
                    definition.on_run_message(msg);
                }
            },
            ConsumeOptions::default().tag(RUN_TAG).prefetch(1),
        );
    }

    fn subscribe_api(&self, execution_id: &str) {
        let weak = self.downgrade();
        self.inner.broker.subscribe_tmp(
            "api",
            &format!("definition.*.{execution_id}"),
            move |msg| {
                if let Some(definition) = weak.upgrade() {
                    definition.on_api(msg);
                }
            },
            ConsumeOptions::default().tag(API_TAG),
        );
    }

    fn publish_run(&self, routing_key: &str, content: Content) {
        self.inner
            .broker
            .publish("run", routing_key, content, Properties::default());
    }

    fn publish_event(&self, routing_key: &str, content: &Content) {
        let kind = routing_key.rsplit('.').next().unwrap_or(routing_key);
        self.inner
            .broker
            .publish("event", routing_key, content.clone(), Properties::typed(kind));
    }

    fn set_status(&self, status: Option<RunStatus>) {
        self.inner.run.borrow_mut().status = status;
    }

    fn on_run_message(&self, message: &Message) {
        let broker = &self.inner.broker;
        let content = message.content.clone();
        debug!(definition_id = %self.id(), routing_key = %message.routing_key(), "run");
        match message.routing_key() {
            "run.enter" => {
                self.set_status(Some(RunStatus::Entered));
                self.publish_event("definition.enter", &content);
                self.publish_run("run.start", content);
                broker.ack(message);
            }
            "run.start" => {
                self.set_status(Some(RunStatus::Started));
                self.publish_event("definition.start", &content);
                self.publish_run("run.execute", content);
                broker.ack(message);
            }
            "run.execute" => {
                self.set_status(Some(RunStatus::Executing));
                self.inner.run.borrow_mut().execute_message = Some(message.clone());
                let execution = self.execution();
                let resumable = message.fields.redelivered
                    && !execution.is_completed()
                    && execution.execution_id().as_deref() == Some(content.execution_id.as_str());
                if resumable {
                    execution.resume();
                } else {
                    execution.execute(&content);
                }
            }
            "run.end" => {
                let mut content = content;
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = Some(RunStatus::End);
                    run.counters.completed += 1;
                }
                content.output = Some(Value::Object(self.environment().output()));
                self.publish_event("definition.end", &content);
                self.publish_run("run.leave", content);
                broker.ack(message);
            }
            "run.discard" => {
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = Some(RunStatus::Discard);
                    run.counters.discarded += 1;
                }
                self.publish_event("definition.discard", &content);
                self.publish_run("run.leave", content);
                broker.ack(message);
            }
            "run.error" => {
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = Some(RunStatus::Error);
                    run.counters.discarded += 1;
                }
                let delivered = broker.try_publish(
                    "event",
                    "definition.error",
                    content.clone(),
                    Properties::typed("error").mandatory(),
                );
                if delivered.is_err() {
                    let error = content
                        .error
                        .clone()
                        .unwrap_or_else(|| ActivityError::new("definition failed"));
                    warn!(definition_id = %self.id(), error = %error.message, "unhandled definition error");
                    self.inner.run.borrow_mut().unhandled = Some(error);
                }
                self.publish_run("run.leave", content);
                broker.ack(message);
            }
            "run.leave" => {
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = None;
                    run.execute_message = None;
                }
                broker.ack(message);
                broker.cancel(RUN_TAG);
                broker.cancel(API_TAG);
                info!(definition_id = %self.id(), execution_id = %content.execution_id, "definition left");
                self.publish_event("definition.leave", &content);
            }
            other => {
                warn!(definition_id = %self.id(), routing_key = other, "unknown run message");
                broker.ack(message);
            }
        }
    }

    fn on_execution_complete(&self, outcome: ScopeOutcome) {
        let mut content = self.content();
        let routing_key = match outcome {
            ScopeOutcome::Completed(_) => "run.end",
            ScopeOutcome::Discarded => "run.discard",
            ScopeOutcome::Error(error) => {
                content.error = Some(error);
                "run.error"
            }
        };
        self.publish_run(routing_key, content);
        let execute_message = self.inner.run.borrow_mut().execute_message.take();
        if let Some(message) = execute_message {
            self.inner.broker.ack(&message);
        }
    }

    // ── Api ──

    fn on_api(&self, message: &Message) {
        match message.kind() {
            Some("stop") => self.stop(),
            Some(_) if message.properties.delegate => self.execution().delegate(message),
            _ => {}
        }
    }

    /// Api of the definition, or of the process or activity execution that
    /// published `message`.
    pub fn get_api(&self, message: Option<&Message>) -> Option<Api> {
        match message {
            None => Some(Api::new(
                ApiTarget::Definition,
                self.inner.broker.clone(),
                self.content(),
            )),
            Some(message) => self.execution().get_api(&message.content),
        }
    }

    fn require_running(&self) -> Result<(), EngineError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(EngineError::NotRunning)
        }
    }

    /// Broadcast a signal to every running process, at any depth. Returns
    /// the error of a run it made fail when nothing listens for `error`.
    pub fn signal(&self, message: Value) -> Result<(), EngineError> {
        self.require_running()?;
        self.send_delegated("signal", message);
        self.take_unhandled()
    }

    /// Deliver a message to every running process, at any depth. An id
    /// naming a signal or escalation reference is delivered as that kind.
    pub fn send_message(&self, message: Value) -> Result<(), EngineError> {
        self.require_running()?;
        let kind = message
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| self.inner.context.get_reference_by_id(id))
            .map_or("message", |reference| reference.message_type());
        self.send_delegated(kind, message);
        self.take_unhandled()
    }

    /// Error of a run that failed with nobody listening for `error`, when
    /// the failure was driven through an [`Api`] handle rather than a
    /// definition method.
    pub fn take_unhandled_error(&self) -> Option<ActivityError> {
        self.inner.run.borrow_mut().unhandled.take()
    }

    fn send_delegated(&self, kind: &str, message: Value) {
        if let Some(api) = self.get_api(None) {
            api.delegate(kind, Some(message));
        }
    }

    // ── Stop, resume, state ──

    /// Stop every running process. Ignored when not running.
    pub fn stop(&self) {
        let content = {
            let mut run = self.inner.run.borrow_mut();
            if run.status.is_none() || run.stopped {
                return;
            }
            run.stopped = true;
            drop(run);
            self.content()
        };
        let broker = &self.inner.broker;
        broker.cancel(RUN_TAG);
        broker.cancel(API_TAG);
        let execution = self.inner.execution.borrow().clone();
        if let Some(execution) = execution {
            execution.stop();
        }
        info!(definition_id = %self.id(), execution_id = %content.execution_id, "definition stopped");
        self.publish_event("definition.stop", &content);
    }

    /// Continue a stopped or recovered run.
    pub fn resume(&self) -> Result<(), EngineError> {
        let execution_id = {
            let mut run = self.inner.run.borrow_mut();
            if run.status.is_some() && !run.stopped {
                return Err(EngineError::CannotResumeRunning);
            }
            if run.status.is_none() {
                return Ok(());
            }
            run.stopped = false;
            run.unhandled = None;
            run.execution_id.clone().unwrap_or_default()
        };
        info!(definition_id = %self.id(), %execution_id, "resume definition");
        self.publish_event("definition.resume", &self.content());
        self.subscribe_api(&execution_id);
        self.consume_run();
        self.take_unhandled()
    }

    pub fn get_state(&self) -> DefinitionState {
        let execution = self.inner.execution.borrow().clone();
        let run = self.inner.run.borrow();
        DefinitionState {
            id: Some(self.id().to_string()),
            kind: Some(DEFINITION_TYPE.to_string()),
            execution_id: run.execution_id.clone(),
            status: run.status,
            stopped: Some(run.stopped),
            counters: Some(run.counters),
            environment: Some(self.environment().get_state()),
            broker: Some(self.inner.broker.get_state()),
            execution: execution.map(|e| e.get_state()),
        }
    }

    /// Rehydrate from a state. Settings of the environment this definition
    /// was built with are kept. Call [`Definition::resume`] to continue.
    pub fn recover(&self, state: &DefinitionState) -> Result<(), EngineError> {
        if self.is_running() && !self.is_stopped() {
            return Err(EngineError::CannotRecoverRunning);
        }
        {
            let mut run = self.inner.run.borrow_mut();
            if state.execution_id.is_some() {
                run.execution_id = state.execution_id.clone();
            }
            if state.status.is_some() {
                run.status = state.status;
            }
            if let Some(stopped) = state.stopped {
                run.stopped = stopped;
            }
            if let Some(counters) = state.counters {
                run.counters = counters;
            }
            run.execute_message = None;
        }
        if let Some(environment) = &state.environment {
            self.environment().recover(environment);
        }
        if let Some(broker) = &state.broker {
            self.inner.broker.recover(broker);
        }
        if let Some(execution) = &state.execution {
            self.execution().recover(execution, self.content())?;
        }
        debug!(definition_id = %self.id(), status = ?self.status(), "recovered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ActivityStatus;
    use serde_json::json;

    const USER_TASK: &str = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: StartEvent, id: start }
      - { kind: UserTask, id: task }
      - { kind: EndEvent, id: end }
    flows:
      - { id: flow1, from: start, to: task }
      - { id: flow2, from: task, to: end }
"#;

    const POSTPONED: &str = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: StartEvent, id: start }
      - { kind: ParallelGateway, id: fork }
      - { kind: UserTask, id: task1 }
      - { kind: UserTask, id: task2 }
      - kind: SubProcess
        id: subProcess
        elements:
          - { kind: UserTask, id: subtask }
    flows:
      - { id: f1, from: start, to: fork }
      - { id: f2, from: fork, to: task1 }
      - { id: f3, from: fork, to: task2 }
      - { id: f4, from: fork, to: subProcess }
"#;

    fn ids(activities: &[Activity]) -> Vec<String> {
        activities.iter().map(|a| a.id().to_string()).collect()
    }

    fn routing_keys(definition: &Definition, pattern: &str) -> Rc<RefCell<Vec<String>>> {
        let seen: Rc<RefCell<Vec<String>>> = Rc::default();
        let sink = seen.clone();
        definition.on(pattern, move |msg| sink.borrow_mut().push(msg.fields.routing_key.clone()));
        seen
    }

    #[test]
    fn runs_lifecycle_and_completes_on_signal() {
        let definition = Definition::from_yaml(USER_TASK).unwrap();
        let events = routing_keys(&definition, "definition.#");
        definition.run().unwrap();
        assert_eq!(definition.status(), Some(RunStatus::Executing));
        assert_eq!(*events.borrow(), vec!["definition.enter", "definition.start"]);

        definition.signal(json!({"id": "task"})).unwrap();
        assert!(!definition.is_running());
        assert_eq!(definition.counters().completed, 1);
        assert_eq!(
            *events.borrow(),
            vec!["definition.enter", "definition.start", "definition.end", "definition.leave"]
        );
        assert_eq!(definition.environment().output()["task"]["id"], "task");
    }

    #[test]
    fn run_while_running_is_rejected() {
        let definition = Definition::from_yaml(USER_TASK).unwrap();
        definition.run().unwrap();
        assert_eq!(definition.run().unwrap_err(), EngineError::AlreadyRunning);
    }

    #[test]
    fn no_executable_process_is_rejected() {
        let definition = Definition::from_yaml(
            r#"
id: def1
processes:
  - id: process1
    executable: false
"#,
        )
        .unwrap();
        assert_eq!(definition.run().unwrap_err(), EngineError::NoExecutableProcess);
    }

    #[test]
    fn signal_requires_running_definition() {
        let definition = Definition::from_yaml(USER_TASK).unwrap();
        let err = definition.signal(json!({"id": "task"})).unwrap_err();
        assert_eq!(err.to_string(), "Definition is not running");
    }

    #[test]
    fn unmatched_signal_leaves_task_waiting() {
        let definition = Definition::from_yaml(USER_TASK).unwrap();
        definition.run().unwrap();
        definition.signal(json!({"id": "hittepa"})).unwrap();
        assert_eq!(ids(&definition.get_postponed()), vec!["task"]);
        let task = definition.get_activity_by_id("task").unwrap();
        assert_eq!(task.counters().taken, 0);
    }

    #[test]
    fn postponed_lists_running_activities() {
        let definition = Definition::from_yaml(POSTPONED).unwrap();
        definition.run().unwrap();
        assert_eq!(ids(&definition.get_postponed()), vec!["task1", "task2", "subProcess"]);
    }

    #[test]
    fn wait_events_carry_parent_path_and_resolve_api() {
        let definition = Definition::from_yaml(POSTPONED).unwrap();
        let waits: Rc<RefCell<Vec<Message>>> = Rc::default();
        let sink = waits.clone();
        definition.on("wait", move |msg| sink.borrow_mut().push(msg.clone()));
        definition.run().unwrap();

        let subtask = waits
            .borrow()
            .iter()
            .find(|m| m.content.id == "subtask")
            .cloned()
            .unwrap();
        let parent = subtask.content.parent.clone().unwrap();
        assert_eq!(parent.id, "subProcess");
        let path: Vec<&str> = parent.path.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(path, vec!["process1", "def1"]);

        let api = definition.get_api(Some(&subtask)).unwrap();
        assert_eq!(api.id(), "subtask");
        api.signal(None);
        assert_eq!(ids(&definition.get_postponed()), vec!["task1", "task2"]);
    }

    #[test]
    fn signal_reaches_nested_user_task() {
        let definition = Definition::from_yaml(POSTPONED).unwrap();
        definition.run().unwrap();
        definition.signal(json!({"id": "subtask"})).unwrap();
        assert_eq!(ids(&definition.get_postponed()), vec!["task1", "task2"]);
    }

    #[test]
    fn call_activity_loop_runs_called_processes() {
        let definition = Definition::from_yaml(
            r#"
id: def1
processes:
  - id: process1
    elements:
      - kind: CallActivity
        id: call
        called_element: process2
        multi_instance: { cardinality: 3 }
  - id: process2
    executable: false
    elements:
      - { kind: UserTask, id: task }
"#,
        )
        .unwrap();
        definition.run().unwrap();
        let running = definition.get_running_processes();
        assert_eq!(running.len(), 4);
        let called = &running[1];
        let parent = called.parent().unwrap();
        assert_eq!(parent.id, "call");
        assert_eq!(parent.path[0].id, "process1");

        definition.signal(json!({"id": "task"})).unwrap();
        assert!(!definition.is_running());
        assert_eq!(definition.counters().completed, 1);
        let call = definition.get_process_by_id("process1").unwrap().get_activity_by_id("call").unwrap();
        assert_eq!(call.counters().taken, 1);
    }

    #[test]
    fn discarded_call_activity_discards_called_process() {
        let definition = Definition::from_yaml(
            r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: CallActivity, id: call, called_element: process2 }
      - { kind: BoundaryEvent, id: bound, attached_to: call, event_definitions: [{ kind: Signal }] }
  - id: process2
    executable: false
    elements:
      - { kind: UserTask, id: task }
"#,
        )
        .unwrap();
        definition.run().unwrap();
        let called = definition.get_running_processes()[1].clone();
        assert!(called.is_running());

        let bound = definition.get_activity_by_id("bound").unwrap();
        bound.signal(None);
        assert!(!called.is_running());
        assert_eq!(called.counters().discarded, 1);
        assert!(!definition.is_running());
    }

    #[test]
    fn error_without_listener_is_returned_from_run() {
        let definition = Definition::from_yaml(
            r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: ServiceTask, id: task, service: missing }
"#,
        )
        .unwrap();
        let err = definition.run().unwrap_err();
        let error = err.as_activity_error().unwrap();
        assert_eq!(error.source_id.as_deref(), Some("task"));
        assert!(error.message.contains("missing"));
        assert_eq!(definition.counters().discarded, 1);
        assert!(!definition.is_running());
        assert_eq!(definition.broker().consumer_count(), 0);
    }

    #[test]
    fn error_listener_swallows_error() {
        let definition = Definition::from_yaml(
            r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: ServiceTask, id: task, service: missing }
"#,
        )
        .unwrap();
        let errors = routing_keys(&definition, "error");
        definition.run().unwrap();
        assert_eq!(*errors.borrow(), vec!["definition.error"]);
    }

    #[test]
    fn run_with_reports_outcome() {
        let definition = Definition::from_yaml(USER_TASK).unwrap();
        let outcome: Rc<RefCell<Option<Result<(), EngineError>>>> = Rc::default();
        let sink = outcome.clone();
        definition
            .run_with(move |result| *sink.borrow_mut() = Some(result))
            .unwrap();
        assert!(outcome.borrow().is_none());
        definition.signal(json!({"id": "task"})).unwrap();
        assert_eq!(*outcome.borrow(), Some(Ok(())));
    }

    #[test]
    fn sequential_runs_count_completions() {
        let definition = Definition::from_yaml(USER_TASK).unwrap();
        for _ in 0..2 {
            definition.run().unwrap();
            definition.signal(json!({"id": "task"})).unwrap();
        }
        assert_eq!(definition.counters().completed, 2);
        let task = definition.get_activity_by_id("task").unwrap();
        assert_eq!(task.counters().taken, 2);
    }

    #[test]
    fn stop_cancels_every_consumer() {
        let definition = Definition::from_yaml(POSTPONED).unwrap();
        definition.run().unwrap();
        definition.stop();
        assert!(definition.is_stopped());
        assert_eq!(definition.broker().consumer_count(), 0);
        for process in definition.get_running_processes() {
            assert_eq!(process.broker().consumer_count(), 0);
            assert!(process
                .get_activities()
                .iter()
                .all(|a| a.broker().consumer_count() == 0));
        }
        assert!(definition.recover(&definition.get_state()).is_ok());
    }

    #[test]
    fn recovered_definition_resumes_where_it_stopped() {
        let definition = Definition::from_yaml(POSTPONED).unwrap();
        definition.run().unwrap();
        definition.stop();
        let json = serde_json::to_string(&definition.get_state()).unwrap();

        let recovered = Definition::from_yaml(POSTPONED).unwrap();
        recovered.recover(&serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(recovered.status(), Some(RunStatus::Executing));
        assert_eq!(ids(&recovered.get_postponed()), vec!["task1", "task2", "subProcess"]);
        let subtask = recovered.get_activity_by_id("subtask").unwrap();
        assert_eq!(subtask.status(), Some(ActivityStatus::Executing));

        recovered.resume().unwrap();
        for id in ["task1", "task2", "subtask"] {
            recovered.signal(json!({ "id": id })).unwrap();
        }
        assert!(!recovered.is_running());
        assert_eq!(recovered.counters().completed, 1);
    }

    #[test]
    fn resume_running_definition_is_rejected() {
        let definition = Definition::from_yaml(USER_TASK).unwrap();
        definition.run().unwrap();
        assert_eq!(definition.resume().unwrap_err(), EngineError::CannotResumeRunning);
        assert_eq!(definition.recover(&DefinitionState::default()).unwrap_err(), EngineError::CannotRecoverRunning);
    }

    #[tokio::test]
    async fn wait_for_resolves_with_event() {
        let definition = Definition::from_yaml(
            r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: StartEvent, id: start }
      - { kind: EndEvent, id: end }
    flows:
      - { id: flow1, from: start, to: end }
"#,
        )
        .unwrap();
        let leave = definition.wait_for("leave");
        definition.run().unwrap();
        let message = leave.await.unwrap();
        assert_eq!(message.fields.routing_key, "definition.leave");
        assert_eq!(message.content.id, "def1");
    }

    #[test]
    fn escalation_is_broadcast_between_processes() {
        let definition = Definition::from_yaml(
            r#"
id: def1
references:
  - { kind: Escalation, id: Escalation_0 }
processes:
  - id: thrower
    elements:
      - { kind: UserTask, id: task }
      - { kind: EndEvent, id: throw, event_definitions: [{ kind: Escalation, reference: Escalation_0 }] }
    flows:
      - { id: f1, from: task, to: throw }
  - id: catcher
    elements:
      - { kind: IntermediateCatchEvent, id: catch, event_definitions: [{ kind: Escalation, reference: Escalation_0 }] }
"#,
        )
        .unwrap();
        definition.run().unwrap();
        assert_eq!(ids(&definition.get_postponed()), vec!["task", "catch"]);
        definition.signal(json!({"id": "task"})).unwrap();
        assert!(!definition.is_running());
        let catch = definition.get_activity_by_id("catch").unwrap();
        assert_eq!(catch.counters().taken, 1);
    }

    const REFERENCES: &str = r#"
id: def1
references:
  - { kind: Signal, id: Signal_0, name: Go }
  - { kind: Message, id: Message_0 }
processes:
  - id: process1
    elements:
      - { kind: IntermediateCatchEvent, id: signalCatch, event_definitions: [{ kind: Signal, reference: Signal_0 }] }
  - id: process2
    elements:
      - { kind: IntermediateCatchEvent, id: messageCatch, event_definitions: [{ kind: Message, reference: Message_0 }] }
"#;

    const FAILS_AFTER_TASK: &str = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: UserTask, id: task }
      - { kind: ServiceTask, id: service, service: missing }
    flows:
      - { id: flow1, from: task, to: service }
"#;

    #[test]
    fn send_message_with_signal_reference_reaches_signal_catch() {
        let definition = Definition::from_yaml(REFERENCES).unwrap();
        definition.run().unwrap();
        definition.send_message(json!({"id": "Signal_0"})).unwrap();

        let catch = definition.get_activity_by_id("signalCatch").unwrap();
        assert_eq!(catch.counters().taken, 1);
        assert_eq!(ids(&definition.get_postponed()), vec!["messageCatch"]);
    }

    #[test]
    fn send_message_reaches_message_catch() {
        let definition = Definition::from_yaml(REFERENCES).unwrap();
        definition.run().unwrap();
        definition.send_message(json!({"id": "Message_0"})).unwrap();
        assert_eq!(ids(&definition.get_postponed()), vec!["signalCatch"]);

        definition.send_message(json!({"id": "Unknown"})).unwrap();
        assert_eq!(ids(&definition.get_postponed()), vec!["signalCatch"]);

        definition.signal(json!({"id": "Signal_0"})).unwrap();
        assert!(!definition.is_running());
        assert_eq!(definition.counters().completed, 1);
    }

    #[test]
    fn signal_returns_error_of_run_it_failed() {
        let definition = Definition::from_yaml(FAILS_AFTER_TASK).unwrap();
        definition.run().unwrap();

        let err = definition.signal(json!({"id": "task"})).unwrap_err();
        let error = err.as_activity_error().unwrap();
        assert_eq!(error.source_id.as_deref(), Some("service"));
        assert!(!definition.is_running());
        assert_eq!(definition.counters().discarded, 1);
        assert_eq!(definition.signal(json!({"id": "task"})).unwrap_err(), EngineError::NotRunning);
    }

    #[test]
    fn error_driven_through_api_is_kept_for_the_caller() {
        let definition = Definition::from_yaml(FAILS_AFTER_TASK).unwrap();
        let waits: Rc<RefCell<Vec<Message>>> = Rc::default();
        let sink = waits.clone();
        definition.on("wait", move |msg| sink.borrow_mut().push(msg.clone()));
        definition.run().unwrap();

        let wait = waits.borrow()[0].clone();
        definition.get_api(Some(&wait)).unwrap().signal(None);
        assert!(!definition.is_running());
        let error = definition.take_unhandled_error().unwrap();
        assert_eq!(error.source_id.as_deref(), Some("service"));
        assert!(definition.take_unhandled_error().is_none());
    }

    #[tokio::test]
    async fn wait_for_fails_when_definition_errors() {
        let definition = Definition::from_yaml(
            r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: ServiceTask, id: task, service: missing }
"#,
        )
        .unwrap();
        let leave = definition.wait_for("leave");
        definition.run().unwrap();

        let err = leave.await.unwrap_err();
        assert_eq!(err.as_activity_error().unwrap().source_id.as_deref(), Some("task"));
        assert!(!definition.is_running());
        assert_eq!(definition.broker().consumer_count(), 0);
    }

    #[test]
    fn called_processes_are_released_after_leaving() {
        let definition = Definition::from_yaml(
            r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: StartEvent, id: start }
      - { kind: CallActivity, id: call, called_element: process2 }
      - { kind: UserTask, id: task }
      - { kind: EndEvent, id: end }
    flows:
      - { id: f1, from: start, to: call }
      - { id: f2, from: call, to: task }
      - { id: back, from: task, to: call, condition: { variable: output.again, op: "==", value: true } }
      - { id: done, from: task, to: end, default: true }
  - id: process2
    executable: false
    elements:
      - { kind: Task, id: inner }
"#,
        )
        .unwrap();
        let tracked = |definition: &Definition| definition.get_state().execution.map_or(0, |e| e.processes.len());
        let call = || definition.get_activity_by_id("call").unwrap();

        definition.run().unwrap();
        assert_eq!(call().counters().taken, 1);
        assert_eq!(tracked(&definition), 1);

        definition.signal(json!({"id": "task", "again": true})).unwrap();
        assert_eq!(call().counters().taken, 2);
        assert_eq!(tracked(&definition), 1);
        assert_eq!(ids(&definition.get_postponed()), vec!["task"]);

        definition.signal(json!({"id": "task"})).unwrap();
        assert!(!definition.is_running());
        assert_eq!(definition.counters().completed, 1);
    }

    #[test]
    fn run_on_stopped_definition_asks_for_resume() {
        let definition = Definition::from_yaml(USER_TASK).unwrap();
        definition.run().unwrap();
        definition.stop();
        assert_eq!(definition.run().unwrap_err(), EngineError::Stopped);

        definition.resume().unwrap();
        definition.signal(json!({"id": "task"})).unwrap();
        assert_eq!(definition.counters().completed, 1);
    }
}
