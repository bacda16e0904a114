//! Process run lifecycle.
//!
//! A process drives one [`ProcessExecution`] through `run.enter` →
//! `run.start` → `run.execute` → `run.end` | `run.discard` | `run.error` →
//! `run.leave` on its own broker, mirroring the activity lifecycle. Every
//! process gets a fork of the definition environment: variables and output
//! are its own, services are shared.

pub mod execution;

use crate::activity::Activity;
use crate::api::{Api, ApiTarget};
use crate::authoring::dto::{ProcessDto, ScopeDto};
use crate::broker::{Broker, ConsumeOptions, Dispatcher, QueueOptions};
use crate::context::{DefinitionContext, ScopeContext};
use crate::environment::Environment;
use crate::error::EngineError;
use crate::messages::{unique_id, Content, Message, Parent, ParentRef, Properties};
use crate::state::{ProcessState, RunCounters, RunStatus};
use execution::{ProcessExecution, ScopeOutcome};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

pub const PROCESS_TYPE: &str = "bpmn:Process";

const RUN_Q: &str = "run-q";
const RUN_TAG: &str = "_process-run";
const API_TAG: &str = "_process-api";

#[derive(Default)]
struct RunState {
    status: Option<RunStatus>,
    execution_id: Option<String>,
    stopped: bool,
    counters: RunCounters,
    parent: Option<Parent>,
    execute_message: Option<Message>,
}

struct ProcessInner {
    id: String,
    name: Option<String>,
    executable: bool,
    scope: ScopeDto,
    broker: Broker,
    environment: Environment,
    context: ScopeContext,
    execution: RefCell<Option<ProcessExecution>>,
    run: RefCell<RunState>,
}

#[derive(Clone)]
pub struct Process {
    inner: Rc<ProcessInner>,
}

#[derive(Clone)]
pub struct WeakProcess {
    inner: Weak<ProcessInner>,
}

impl WeakProcess {
    pub fn upgrade(&self) -> Option<Process> {
        self.inner.upgrade().map(|inner| Process { inner })
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.inner.id)
            .field("execution_id", &self.execution_id())
            .field("status", &self.status())
            .finish()
    }
}

impl Process {
    pub fn new(dto: &ProcessDto, definition: &DefinitionContext, dispatcher: &Dispatcher) -> Self {
        let broker = Broker::with_dispatcher(&dto.id, dispatcher.clone());
        for exchange in ["run", "api", "event", "execution"] {
            broker.assert_exchange(exchange);
        }
        broker.assert_queue(RUN_Q, QueueOptions::default());
        broker.bind_queue(RUN_Q, "run", "run.#", 0);

        let environment = definition.environment().fork();
        let context = ScopeContext {
            definition: definition.clone_with(environment.clone()),
            environment: environment.clone(),
            dispatcher: dispatcher.clone(),
        };
        Self {
            inner: Rc::new(ProcessInner {
                id: dto.id.clone(),
                name: dto.name.clone(),
                executable: dto.executable,
                scope: dto.scope(),
                broker,
                environment,
                context,
                execution: RefCell::default(),
                run: RefCell::default(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakProcess {
        WeakProcess {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ── Accessors ──

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn kind(&self) -> &'static str {
        PROCESS_TYPE
    }

    pub fn is_executable(&self) -> bool {
        self.inner.executable
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.environment
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

    pub fn parent(&self) -> Option<Parent> {
        self.inner.run.borrow().parent.clone()
    }

    /// Place the process in a parent chain: the definition, or the call
    /// activity execution that started it.
    pub fn set_parent(&self, parent: Parent) {
        self.inner.run.borrow_mut().parent = Some(parent);
    }

    pub fn as_parent_ref(&self) -> ParentRef {
        ParentRef::new(self.id(), PROCESS_TYPE, self.execution_id().unwrap_or_default())
    }

    fn content(&self) -> Content {
        let run = self.inner.run.borrow();
        Content::new(self.id(), PROCESS_TYPE)
            .with_execution_id(run.execution_id.clone().unwrap_or_default())
            .with_parent(run.parent.clone())
    }

    /// The scope execution, created on first use.
    pub fn execution(&self) -> ProcessExecution {
        let existing = self.inner.execution.borrow().clone();
        if let Some(execution) = existing {
            return execution;
        }
        let weak = self.downgrade();
        let execution = ProcessExecution::new(
            self.id(),
            PROCESS_TYPE,
            &self.inner.broker,
            &self.inner.scope,
            &self.inner.context,
            move |outcome, _content| {
                if let Some(process) = weak.upgrade() {
                    process.on_execution_complete(outcome);
                }
            },
        );
        *self.inner.execution.borrow_mut() = Some(execution.clone());
        execution
    }

    pub fn get_activities(&self) -> Vec<Activity> {
        self.execution().get_activities().to_vec()
    }

    pub fn get_activity_by_id(&self, id: &str) -> Option<Activity> {
        self.execution().get_activity_by_id(id)
    }

    pub fn get_postponed(&self) -> Vec<Activity> {
        if !self.is_running() {
            return Vec::new();
        }
        self.execution().get_postponed()
    }

    // ── Run ──

    pub fn run(&self) {
        let content = {
            let mut run = self.inner.run.borrow_mut();
            if run.status.is_some() {
                drop(run);
                warn!(process_id = %self.id(), "process is already running");
                return;
            }
            run.status = Some(RunStatus::Entered);
            run.execution_id = Some(unique_id(&self.inner.id));
            run.stopped = false;
            drop(run);
            self.content()
        };
        info!(process_id = %self.id(), execution_id = %content.execution_id, "run process");
        self.consume_run();
        self.subscribe_api(&content.execution_id);
        self.publish_run("run.enter", content);
    }

    fn consume_run(&self) {
        let weak = self.downgrade();
        self.inner.broker.consume(
            RUN_Q,
            move |msg| {
                if let Some(process) = weak.upgrade() {
                    process.on_run_message(msg);
                }
            },
            ConsumeOptions::default().tag(RUN_TAG).prefetch(1),
        );
    }

    fn subscribe_api(&self, execution_id: &str) {
        let weak = self.downgrade();
        self.inner.broker.subscribe_tmp(
            "api",
            &format!("process.*.{execution_id}"),
            move |msg| {
                if let Some(process) = weak.upgrade() {
                    process.on_api(msg);
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
        debug!(process_id = %self.id(), routing_key = %message.routing_key(), "run");
        match message.routing_key() {
            "run.enter" => {
                self.set_status(Some(RunStatus::Entered));
                self.publish_event("process.enter", &content);
                self.publish_run("run.start", content);
                broker.ack(message);
            }
            "run.start" => {
                self.set_status(Some(RunStatus::Started));
                self.publish_event("process.start", &content);
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
                    debug!(process_id = %self.id(), "resume execution");
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
                content.output = Some(Value::Object(self.inner.environment.output()));
                self.publish_event("process.end", &content);
                self.publish_run("run.leave", content);
                broker.ack(message);
            }
            "run.discard" => {
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = Some(RunStatus::Discard);
                    run.counters.discarded += 1;
                }
                self.publish_event("process.discard", &content);
                self.publish_run("run.leave", content);
                broker.ack(message);
            }
            "run.error" => {
                {
                    let mut run = self.inner.run.borrow_mut();
                    run.status = Some(RunStatus::Error);
                    run.counters.discarded += 1;
                }
                if let Some(error) = &content.error {
                    warn!(process_id = %self.id(), error = %error.message, "process error");
                }
                self.publish_event("process.error", &content);
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
                self.publish_event("process.leave", &content);
            }
            other => {
                warn!(process_id = %self.id(), routing_key = other, "unknown run message");
                broker.ack(message);
            }
        }
    }

    fn on_execution_complete(&self, outcome: ScopeOutcome) {
        let mut content = self.content();
        let routing_key = match outcome {
            ScopeOutcome::Completed(output) => {
                content.output = output;
                "run.end"
            }
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
        if message.properties.delegate {
            self.delegate(message);
            return;
        }
        match message.kind() {
            Some("stop") => self.stop(),
            Some("discard") => self.discard_run(),
            Some("signal") | Some("message") => self.delegate(message),
            _ => {}
        }
    }

    fn discard_run(&self) {
        match self.status() {
            Some(RunStatus::Executing) => self.execution().discard(),
            Some(RunStatus::Entered) | Some(RunStatus::Started) => {
                if let Some(queue) = self.inner.broker.get_queue(RUN_Q) {
                    queue.purge();
                }
                self.set_status(Some(RunStatus::Discard));
                self.publish_run("run.discard", self.content());
            }
            _ => {}
        }
    }

    pub fn get_api(&self, content: Option<&Content>) -> Api {
        let content = content.cloned().unwrap_or_else(|| self.content());
        Api::new(ApiTarget::Process, self.inner.broker.clone(), content)
    }

    /// Api of an activity execution somewhere below this process. `path`
    /// lists the ancestors between the process and `content`, outermost
    /// first.
    pub fn resolve_api(&self, path: &[ParentRef], content: &Content) -> Option<Api> {
        self.execution().resolve_api(path, content)
    }

    pub fn signal(&self, message: Option<Value>) {
        self.get_api(None).delegate("signal", message);
    }

    /// Hand a delegated event to the running children.
    pub fn delegate(&self, message: &Message) {
        if self.status() != Some(RunStatus::Executing) || self.is_stopped() {
            return;
        }
        self.execution().delegate(message);
    }

    pub fn discard(&self) {
        if self.is_running() {
            self.get_api(None).discard();
        }
    }

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
        info!(process_id = %self.id(), execution_id = %content.execution_id, "process stopped");
        self.publish_event("process.stop", &content);
    }

    pub fn resume(&self) {
        let execution_id = {
            let mut run = self.inner.run.borrow_mut();
            if run.status.is_none() || !run.stopped {
                return;
            }
            run.stopped = false;
            run.execution_id.clone().unwrap_or_default()
        };
        debug!(process_id = %self.id(), %execution_id, "resume process");
        self.subscribe_api(&execution_id);
        self.consume_run();
    }

    // ── State ──

    pub fn get_state(&self) -> ProcessState {
        let execution = self.inner.execution.borrow().clone();
        let run = self.inner.run.borrow();
        ProcessState {
            id: self.id().to_string(),
            kind: PROCESS_TYPE.to_string(),
            execution_id: run.execution_id.clone(),
            status: run.status,
            stopped: run.stopped,
            counters: run.counters,
            parent: run.parent.clone(),
            environment: Some(self.inner.environment.get_state()),
            broker: Some(self.inner.broker.get_state()),
            execution: execution.map(|e| e.get_state()),
        }
    }

    /// Rehydrate a stopped or idle process. Consumers come back with
    /// [`Process::resume`].
    pub fn recover(&self, state: &ProcessState) -> Result<(), EngineError> {
        if self.is_running() && !self.is_stopped() {
            return Err(EngineError::CannotRecoverRunningProcess(self.id().to_string()));
        }
        {
            let mut run = self.inner.run.borrow_mut();
            run.status = state.status;
            run.execution_id = state.execution_id.clone();
            run.stopped = state.stopped;
            run.counters = state.counters;
            if state.parent.is_some() {
                run.parent = state.parent.clone();
            }
            run.execute_message = None;
        }
        if let Some(environment) = &state.environment {
            self.inner.environment.recover(environment);
        }
        if let Some(broker) = &state.broker {
            self.inner.broker.recover(broker);
        }
        if let Some(execution) = &state.execution {
            self.execution().recover(execution);
        }
        Ok(())
    }
}
