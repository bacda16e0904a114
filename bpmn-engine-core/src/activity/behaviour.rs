//! What an activity does between `run.execute` and `execute.completed`.

use super::Activity;
use crate::authoring::dto::{ElementDto, ScopeDto};
use crate::broker::{Broker, ConsumeOptions};
use crate::context::ScopeContext;
use crate::environment::{Service, ServiceCall};
use crate::error::ActivityError;
use crate::event_definitions::EventDefinition;
use crate::messages::{Content, Fields, Message, Properties};
use crate::process::execution::{ProcessExecution, ScopeOutcome};
use crate::state::ProcessExecutionState;
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

pub(crate) enum Behaviour {
    /// Tasks, gateways and events without definitions.
    Immediate,
    /// User tasks and catch events without definitions.
    Wait,
    Service(ServiceBehaviour),
    SubProcess(SubProcessBehaviour),
    CallActivity { called_element: String },
    Events(Vec<EventDefinition>),
}

pub(crate) struct ServiceBehaviour {
    service: String,
    /// Live call token per execution id. A completion whose token is gone
    /// belongs to a stopped or finished execution.
    calls: RefCell<BTreeMap<String, u64>>,
    sequence: Cell<u64>,
}

pub(crate) struct SubProcessBehaviour {
    scope: ScopeDto,
    context: ScopeContext,
    executions: RefCell<BTreeMap<String, ProcessExecution>>,
}

fn api_tag(execution_id: &str) -> String {
    format!("_api-{execution_id}")
}

impl Behaviour {
    pub fn new(element: &ElementDto, broker: &Broker, context: &ScopeContext) -> Self {
        let definitions = element.event_definitions();
        if !definitions.is_empty() {
            let throwing = element.is_throwing();
            return Behaviour::Events(
                definitions
                    .iter()
                    .map(|dto| EventDefinition::new(element.id(), broker, dto, throwing, &context.definition))
                    .collect(),
            );
        }
        match element {
            ElementDto::UserTask { .. }
            | ElementDto::IntermediateCatchEvent { .. }
            | ElementDto::BoundaryEvent { .. } => Behaviour::Wait,
            ElementDto::ServiceTask { service, .. } => Behaviour::Service(ServiceBehaviour {
                service: service.clone(),
                calls: RefCell::default(),
                sequence: Cell::new(0),
            }),
            ElementDto::SubProcess { .. } => Behaviour::SubProcess(SubProcessBehaviour {
                scope: element.scope().unwrap_or_default(),
                context: context.clone(),
                executions: RefCell::default(),
            }),
            ElementDto::CallActivity { called_element, .. } => Behaviour::CallActivity {
                called_element: called_element.clone(),
            },
            _ => Behaviour::Immediate,
        }
    }

    pub fn event_definitions(&self) -> &[EventDefinition] {
        match self {
            Behaviour::Events(definitions) => definitions,
            _ => &[],
        }
    }

    /// Start (or on redelivery, resume) the execution addressed by `content`.
    pub fn execute(&self, activity: &Activity, content: &Content, redelivered: bool) {
        let broker = activity.broker();
        match self {
            Behaviour::Immediate => {
                broker.publish("execution", "execute.completed", content.clone(), Properties::default());
            }
            Behaviour::Wait => execute_wait(activity, content),
            Behaviour::Service(service) => service.execute(activity, content, redelivered),
            Behaviour::SubProcess(sub) => sub.execute(activity, content, redelivered),
            Behaviour::CallActivity { called_element } => {
                execute_call(activity, content, called_element, redelivered)
            }
            Behaviour::Events(definitions) => {
                if let Some(definition) = content.index.and_then(|i| definitions.get(i)) {
                    definition.execute(content);
                }
            }
        }
    }

    /// Release whatever the execution holds once it has settled. `completed`
    /// is false when it was discarded, errored or cancelled.
    pub fn cleanup(&self, activity: &Activity, content: &Content, completed: bool) {
        let broker = activity.broker();
        let execution_id = content.execution_id.as_str();
        broker.cancel(&api_tag(execution_id));
        match self {
            Behaviour::Service(service) => {
                service.calls.borrow_mut().remove(execution_id);
            }
            Behaviour::SubProcess(sub) => {
                let execution = sub.executions.borrow_mut().remove(execution_id);
                if let Some(execution) = execution {
                    if !execution.is_completed() {
                        execution.discard();
                    }
                }
            }
            Behaviour::CallActivity { called_element } if !completed => {
                let mut cancel = content.clone();
                cancel.extra.insert("calledElement".into(), json!(called_element));
                broker.publish(
                    "event",
                    "activity.call.cancel",
                    cancel,
                    Properties::typed("cancel"),
                );
            }
            Behaviour::Events(definitions) => {
                if let Some(definition) = content.index.and_then(|i| definitions.get(i)) {
                    definition.stop();
                }
            }
            _ => {}
        }
    }

    /// Suspend every live execution; `execution_ids` are those still running.
    pub fn stop(&self, activity: &Activity, execution_ids: &[String]) {
        let broker = activity.broker();
        for execution_id in execution_ids {
            broker.cancel(&api_tag(execution_id));
        }
        match self {
            Behaviour::Service(service) => service.calls.borrow_mut().clear(),
            Behaviour::SubProcess(sub) => {
                let executions: Vec<ProcessExecution> = sub.executions.borrow().values().cloned().collect();
                for execution in executions {
                    execution.stop();
                }
            }
            Behaviour::Events(definitions) => {
                for definition in definitions {
                    definition.stop();
                }
            }
            _ => {}
        }
    }

    pub fn scope_states(&self) -> Vec<ProcessExecutionState> {
        match self {
            Behaviour::SubProcess(sub) => sub
                .executions
                .borrow()
                .values()
                .map(ProcessExecution::get_state)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn recover_scopes(&self, activity: &Activity, scopes: &[ProcessExecutionState]) {
        let Behaviour::SubProcess(sub) = self else { return };
        sub.executions.borrow_mut().clear();
        for state in scopes {
            let Some(content) = &state.content else { continue };
            let execution = sub.create_execution(activity, content);
            execution.recover(state);
            sub.executions
                .borrow_mut()
                .insert(content.execution_id.clone(), execution);
        }
    }

    /// Live nested scopes of a sub-process.
    pub fn scopes(&self) -> Vec<ProcessExecution> {
        match self {
            Behaviour::SubProcess(sub) => sub.executions.borrow().values().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

// ── Wait ──

fn execute_wait(activity: &Activity, content: &Content) {
    let broker = activity.broker();
    let execution_id = content.execution_id.clone();
    let weak = activity.downgrade();
    let waiting = content.clone();
    broker.subscribe_tmp(
        "api",
        &format!("activity.#.{execution_id}"),
        move |msg| {
            if let Some(activity) = weak.upgrade() {
                on_wait_api(&activity, &waiting, msg);
            }
        },
        ConsumeOptions::default().tag(api_tag(&execution_id)),
    );
    debug!(activity_id = %activity.id(), execution_id = %execution_id, "wait");
    broker.publish(
        "event",
        "activity.wait",
        content.clone(),
        Properties::typed("wait"),
    );
}

fn on_wait_api(activity: &Activity, content: &Content, message: &Message) {
    let broker = activity.broker();
    match message.kind() {
        Some("signal") => {
            if message.properties.delegate && message.content.message_id() != Some(activity.id()) {
                return;
            }
            broker.cancel(&api_tag(&content.execution_id));
            let mut completed = content.clone();
            completed.output = message.content.message.clone();
            completed.state = Some("signal".to_string());
            broker.publish("execution", "execute.completed", completed, Properties::default());
        }
        Some("discard") => {
            broker.cancel(&api_tag(&content.execution_id));
            broker.publish("execution", "execute.discard", content.clone(), Properties::default());
        }
        Some("error") => {
            broker.cancel(&api_tag(&content.execution_id));
            let mut failed = content.clone();
            failed.error = Some(
                message
                    .content
                    .error
                    .clone()
                    .unwrap_or_else(|| ActivityError::new("failed"))
                    .with_source(activity.id()),
            );
            broker.publish("execution", "execute.error", failed, Properties::default());
        }
        Some("stop") => {
            broker.cancel(&api_tag(&content.execution_id));
        }
        _ => {}
    }
}

// ── Service ──

impl ServiceBehaviour {
    fn resolve(&self, activity: &Activity) -> Option<Service> {
        let environment = activity.environment();
        environment.get_service_by_name(&self.service).or_else(|| {
            environment.settings().enable_dummy_service.then(|| {
                let dummy: Service = Rc::new(|call: ServiceCall| call.complete(None));
                dummy
            })
        })
    }

    fn execute(&self, activity: &Activity, content: &Content, redelivered: bool) {
        let broker = activity.broker();
        let Some(service) = self.resolve(activity) else {
            let error = ActivityError::new(format!("Service {} did not resolve to a function", self.service))
                .with_source(activity.id());
            warn!(activity_id = %activity.id(), error = %error.message, "service");
            let mut failed = content.clone();
            failed.error = Some(error);
            broker.publish("execution", "execute.error", failed, Properties::default());
            return;
        };

        let token = self.sequence.get() + 1;
        self.sequence.set(token);
        self.calls
            .borrow_mut()
            .insert(content.execution_id.clone(), token);

        let message = Message {
            fields: Fields {
                routing_key: "execute.start".to_string(),
                exchange: "execution".to_string(),
                redelivered,
                ..Fields::default()
            },
            content: content.clone(),
            properties: Properties::default(),
        };
        let weak = activity.downgrade();
        let calling = content.clone();
        let call = ServiceCall::new(message, move |result| {
            let Some(activity) = weak.upgrade() else { return };
            let Behaviour::Service(service) = activity.behaviour() else { return };
            let current = service.calls.borrow().get(&calling.execution_id).copied();
            if current != Some(token) {
                debug!(activity_id = %activity.id(), execution_id = %calling.execution_id, "stale service completion");
                return;
            }
            service.calls.borrow_mut().remove(&calling.execution_id);
            let broker = activity.broker();
            let mut settled = calling.clone();
            match result {
                Ok(output) => {
                    settled.output = output;
                    broker.publish("execution", "execute.completed", settled, Properties::default());
                }
                Err(error) => {
                    settled.error = Some(error.with_source(activity.id()));
                    broker.publish("execution", "execute.error", settled, Properties::default());
                }
            }
        });
        debug!(activity_id = %activity.id(), service = %self.service, redelivered, "call service");
        service(call);
    }
}

// ── Sub-process ──

impl SubProcessBehaviour {
    fn create_execution(&self, activity: &Activity, content: &Content) -> ProcessExecution {
        let weak = activity.broker().downgrade();
        ProcessExecution::new(
            activity.id(),
            activity.kind(),
            activity.broker(),
            &self.scope,
            &self.context,
            move |outcome, content| {
                let Some(broker) = weak.upgrade() else { return };
                let mut settled = content.clone();
                let routing_key = match outcome {
                    ScopeOutcome::Completed(output) => {
                        settled.output = output;
                        "execute.completed"
                    }
                    ScopeOutcome::Discarded => "execute.discard",
                    ScopeOutcome::Error(error) => {
                        settled.error = Some(error);
                        "execute.error"
                    }
                };
                broker.publish("execution", routing_key, settled, Properties::default());
            },
        )
        .with_content(content)
    }

    fn subscribe_api(&self, activity: &Activity, execution: &ProcessExecution, execution_id: &str) {
        let weak = execution.downgrade();
        activity.broker().subscribe_tmp(
            "api",
            &format!("activity.#.{execution_id}"),
            move |msg| {
                let Some(execution) = weak.upgrade() else { return };
                if msg.properties.delegate {
                    execution.delegate(msg);
                } else if msg.kind() == Some("discard") {
                    execution.discard();
                }
            },
            ConsumeOptions::default().tag(api_tag(execution_id)),
        );
    }

    fn execute(&self, activity: &Activity, content: &Content, redelivered: bool) {
        let execution_id = content.execution_id.clone();
        if redelivered {
            let existing = self.executions.borrow().get(&execution_id).cloned();
            if let Some(execution) = existing {
                self.subscribe_api(activity, &execution, &execution_id);
                execution.resume();
                return;
            }
        }
        let execution = self.create_execution(activity, content);
        self.executions
            .borrow_mut()
            .insert(execution_id.clone(), execution.clone());
        self.subscribe_api(activity, &execution, &execution_id);
        execution.execute(content);
    }
}

// ── Call activity ──

fn execute_call(activity: &Activity, content: &Content, called_element: &str, redelivered: bool) {
    let broker = activity.broker();
    let execution_id = content.execution_id.clone();
    let weak = activity.downgrade();
    let calling = content.clone();
    broker.subscribe_tmp(
        "api",
        &format!("activity.#.{execution_id}"),
        move |msg| {
            let Some(activity) = weak.upgrade() else { return };
            let broker = activity.broker();
            let routing_key = match msg.kind() {
                Some("completed") => "execute.completed",
                Some("discard") => "execute.discard",
                Some("error") => "execute.error",
                _ => return,
            };
            broker.cancel(&api_tag(&calling.execution_id));
            let mut settled = calling.clone();
            settled.output = msg.content.message.clone();
            if routing_key == "execute.error" {
                settled.error = msg.content.error.clone();
            }
            broker.publish("execution", routing_key, settled, Properties::default());
        },
        ConsumeOptions::default().tag(api_tag(&execution_id)),
    );
    if redelivered {
        return;
    }
    let mut call = content.clone();
    call.extra.insert("calledElement".into(), json!(called_element));
    debug!(activity_id = %activity.id(), called_element, "call");
    broker.publish("event", "activity.call", call, Properties::typed("call"));
}
