//! Reference-based event definitions: escalation, signal and message.
//!
//! A throwing definition publishes a delegated `activity.<type>` event and
//! completes at once. A catching definition consumes a durable queue bound to
//! the activity's `api` exchange and completes on the first correlated
//! message, or immediately if one is already buffered.

mod reference;

pub use reference::{Reference, ReferenceInfo, ReferenceKindExt};

use crate::authoring::dto::{EventDefinitionDto, ReferenceKind};
use crate::broker::{Broker, ConsumeOptions};
use crate::context::DefinitionContext;
use crate::messages::{shift_parent, Content, Message, Properties};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::debug;

#[derive(Default)]
struct CatchState {
    completed: bool,
    content: Option<Content>,
    info: Option<ReferenceInfo>,
}

struct EventDefinitionInner {
    activity_id: String,
    is_throwing: bool,
    reference: Reference,
    broker: Broker,
    state: RefCell<CatchState>,
}

#[derive(Clone)]
pub struct EventDefinition {
    inner: Rc<EventDefinitionInner>,
}

impl std::fmt::Debug for EventDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDefinition")
            .field("activity_id", &self.inner.activity_id)
            .field("type", &self.kind().definition_type())
            .field("is_throwing", &self.inner.is_throwing)
            .finish()
    }
}

impl EventDefinition {
    /// Bind the definition to its activity broker. Catching definitions
    /// assert their durable queue here so events are buffered from the start.
    pub fn new(
        activity_id: &str,
        broker: &Broker,
        dto: &EventDefinitionDto,
        is_throwing: bool,
        context: &DefinitionContext,
    ) -> Self {
        let element = dto
            .reference
            .as_deref()
            .and_then(|id| context.get_reference_by_id(id))
            .filter(|element| element.kind == dto.kind);
        let reference = Reference {
            kind: dto.kind,
            id: dto.reference.clone(),
            element,
        };
        if !is_throwing {
            let queue = reference.queue_name(activity_id);
            broker.assert_queue(&queue, Default::default());
            broker.bind_queue(
                &queue,
                "api",
                &format!("*.{}.#", dto.kind.reference_type()),
                400,
            );
        }
        Self {
            inner: Rc::new(EventDefinitionInner {
                activity_id: activity_id.to_string(),
                is_throwing,
                reference,
                broker: broker.clone(),
                state: RefCell::new(CatchState::default()),
            }),
        }
    }

    fn from_weak(weak: &Weak<EventDefinitionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn kind(&self) -> ReferenceKind {
        self.inner.reference.kind
    }

    pub fn is_throwing(&self) -> bool {
        self.inner.is_throwing
    }

    pub fn reference(&self) -> &Reference {
        &self.inner.reference
    }

    pub fn description(&self) -> String {
        self.inner.reference.info().description
    }

    pub fn queue_name(&self) -> Option<String> {
        (!self.inner.is_throwing).then(|| self.inner.reference.queue_name(&self.inner.activity_id))
    }

    fn catch_tag(&self, execution_id: &str) -> String {
        format!("_on{}-{}", self.kind().reference_type(), execution_id)
    }

    /// `content` is the sub-execution content: its parent head is the owning
    /// activity.
    pub fn execute(&self, content: &Content) {
        if self.inner.is_throwing {
            self.execute_throw(content);
        } else {
            self.execute_catch(content);
        }
    }

    fn execute_throw(&self, content: &Content) {
        let kind = self.kind();
        let info = self.inner.reference.info();
        debug!(
            activity_id = %self.inner.activity_id,
            execution_id = %content.execution_id,
            "throw {}",
            info.description
        );

        let mut throw = as_activity_content(content);
        throw.message = Some(info.message.clone());
        throw.state = Some("throw".to_string());
        throw.extra.insert(kind.content_key().to_string(), info.message);
        self.inner.broker.publish(
            "event",
            &format!("activity.{}", kind.reference_type()),
            throw,
            Properties::typed(kind.reference_type()).delegated(),
        );
        self.inner
            .broker
            .publish("execution", "execute.completed", content.clone(), Properties::default());
    }

    fn execute_catch(&self, content: &Content) {
        let kind = self.kind();
        let info = self.inner.reference.info();
        let execution_id = content.execution_id.clone();
        {
            let mut state = self.inner.state.borrow_mut();
            state.completed = false;
            state.content = Some(content.clone());
            state.info = Some(info.clone());
        }

        let queue = self.inner.reference.queue_name(&self.inner.activity_id);
        let buffered = self
            .inner
            .broker
            .get_queue(&queue)
            .and_then(|q| q.take(|msg| self.accepts(msg, &info)));
        if let Some(message) = buffered {
            debug!(activity_id = %self.inner.activity_id, "caught buffered {}", info.description);
            self.complete(&message);
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        self.inner.broker.consume(
            &queue,
            move |msg| {
                if let Some(definition) = Self::from_weak(&weak) {
                    definition.on_catch(msg);
                }
            },
            ConsumeOptions::no_ack().tag(self.catch_tag(&execution_id)),
        );

        let weak = Rc::downgrade(&self.inner);
        self.inner.broker.subscribe_tmp(
            "api",
            &format!("activity.#.{execution_id}"),
            move |msg| {
                if let Some(definition) = Self::from_weak(&weak) {
                    definition.on_api(msg);
                }
            },
            ConsumeOptions::default().tag(format!("_api-{execution_id}")),
        );

        debug!(
            activity_id = %self.inner.activity_id,
            execution_id = %execution_id,
            "expect {}",
            info.description
        );
        let mut wait = as_activity_content(content);
        wait.state = Some("wait".to_string());
        wait.extra
            .insert(kind.content_key().to_string(), info.message.clone());
        self.inner
            .broker
            .publish("event", "activity.wait", wait, Properties::typed("wait"));
    }

    /// Correlation: ids must match (both absent for anonymous references).
    /// Direct signals and messages are accepted regardless.
    fn accepts(&self, message: &Message, info: &ReferenceInfo) -> bool {
        let direct = !message.properties.delegate && self.kind() != ReferenceKind::Escalation;
        direct || message.content.message_id() == info.message_id()
    }

    fn on_catch(&self, message: &Message) {
        let info = {
            let state = self.inner.state.borrow();
            if state.completed {
                return;
            }
            state.info.clone()
        };
        let Some(info) = info else { return };
        if !self.accepts(message, &info) {
            return;
        }
        self.complete(message);
    }

    fn on_api(&self, message: &Message) {
        match message.kind() {
            Some("discard") => {
                let content = {
                    let mut state = self.inner.state.borrow_mut();
                    state.completed = true;
                    state.content.clone()
                };
                let Some(content) = content else { return };
                self.stop();
                self.inner
                    .broker
                    .publish("execution", "execute.discard", content, Properties::default());
            }
            Some("stop") => self.stop(),
            _ => {}
        }
    }

    fn complete(&self, message: &Message) {
        let kind = self.kind();
        let (content, info) = {
            let mut state = self.inner.state.borrow_mut();
            state.completed = true;
            (state.content.clone(), state.info.clone())
        };
        let (Some(content), Some(info)) = (content, info) else { return };
        self.stop();
        debug!(
            activity_id = %self.inner.activity_id,
            execution_id = %content.execution_id,
            "caught {}",
            info.description
        );

        let output = message.content.message.clone();
        let mut caught = as_activity_content(&content);
        caught.message = output.clone();
        caught.state = Some("catch".to_string());
        caught
            .extra
            .insert(kind.content_key().to_string(), info.message.clone());
        self.inner
            .broker
            .publish("event", "activity.catch", caught, Properties::typed("catch"));

        let mut completed = content;
        completed.output = output;
        completed.state = Some("catch".to_string());
        completed
            .extra
            .insert(kind.content_key().to_string(), info.message);
        self.inner
            .broker
            .publish("execution", "execute.completed", completed, Properties::default());
    }

    /// Cancel the consumers of the current execution. The durable queue
    /// keeps its binding.
    pub fn stop(&self) {
        let execution_id = {
            let state = self.inner.state.borrow();
            state.content.as_ref().map(|c| c.execution_id.clone())
        };
        let Some(execution_id) = execution_id else { return };
        self.inner.broker.cancel(&self.catch_tag(&execution_id));
        self.inner.broker.cancel(&format!("_api-{execution_id}"));
    }
}

/// Sub-execution content re-addressed to the owning activity execution.
fn as_activity_content(content: &Content) -> Content {
    let mut activity = content.clone();
    if let Some(parent) = &content.parent {
        activity.execution_id = parent.execution_id.clone();
        activity.parent = shift_parent(Some(parent));
    }
    activity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueOptions;
    use crate::messages::{Parent, ParentRef};
    use serde_json::json;

    const YAML: &str = r#"
id: def1
references:
  - { kind: Escalation, id: Escalation_0, name: Too large }
  - { kind: Signal, id: Signal_0, name: Go }
processes:
  - id: process1
    elements:
      - { kind: Task, id: task }
"#;

    fn context() -> DefinitionContext {
        DefinitionContext::from_yaml(YAML).unwrap()
    }

    fn activity_broker() -> (Broker, Rc<RefCell<Vec<Message>>>) {
        let broker = Broker::new("event");
        for exchange in ["api", "event", "execution"] {
            broker.assert_exchange(exchange);
        }
        broker.assert_queue("execution-q", QueueOptions::default());
        broker.bind_queue("execution-q", "execution", "execute.#", 0);
        let messages: Rc<RefCell<Vec<Message>>> = Rc::default();
        let sink = messages.clone();
        broker.subscribe_tmp(
            "event",
            "activity.*",
            move |msg| sink.borrow_mut().push(msg.clone()),
            ConsumeOptions::default(),
        );
        (broker, messages)
    }

    fn execute_content() -> Content {
        Content::new("event", "bpmn:IntermediateCatchEvent")
            .with_execution_id("event_1_0")
            .with_parent(Some(Parent {
                id: "event".into(),
                kind: "bpmn:IntermediateCatchEvent".into(),
                execution_id: "event_1".into(),
                path: vec![ParentRef::new("process1", "bpmn:Process", "process1_1")],
            }))
    }

    fn definition(broker: &Broker, kind: ReferenceKind, reference: Option<&str>, throwing: bool) -> EventDefinition {
        EventDefinition::new(
            "event",
            broker,
            &EventDefinitionDto {
                kind,
                reference: reference.map(str::to_string),
            },
            throwing,
            &context(),
        )
    }

    fn execution_messages(broker: &Broker) -> Vec<Message> {
        broker.get_queue("execution-q").unwrap().messages()
    }

    fn escalate(broker: &Broker, id: Option<&str>, delegate: bool) {
        let message = id.map(|id| json!({"id": id}));
        let mut properties = Properties::typed("escalate");
        properties.delegate = delegate;
        broker.publish(
            "api",
            "activity.escalate.event_1_0",
            Content::default().with_message(message),
            properties,
        );
    }

    #[test]
    fn throw_publishes_delegated_escalation_then_completes() {
        let (broker, events) = activity_broker();
        let throw = definition(&broker, ReferenceKind::Escalation, Some("Escalation_0"), true);
        throw.execute(&execute_content());

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        let escalate = &events[0];
        assert_eq!(escalate.fields.routing_key, "activity.escalate");
        assert!(escalate.properties.delegate);
        assert_eq!(escalate.kind(), Some("escalate"));
        assert_eq!(escalate.content.state.as_deref(), Some("throw"));
        assert_eq!(escalate.content.execution_id, "event_1");
        assert_eq!(escalate.content.parent.as_ref().unwrap().id, "process1");
        assert_eq!(escalate.content.message_id(), Some("Escalation_0"));
        assert_eq!(escalate.content.message.as_ref().unwrap()["name"], "Too large");

        let executions = execution_messages(&broker);
        assert_eq!(executions[0].fields.routing_key, "execute.completed");
        assert_eq!(executions[0].content.execution_id, "event_1_0");
    }

    #[test]
    fn anonymous_catch_describes_itself_and_completes_on_anonymous_escalation() {
        let (broker, events) = activity_broker();
        let catch = definition(&broker, ReferenceKind::Escalation, None, false);
        assert_eq!(catch.description(), "anonymous escalation");
        assert_eq!(catch.queue_name().as_deref(), Some("escalate-event-anonymous-q"));

        catch.execute(&execute_content());
        assert_eq!(events.borrow()[0].fields.routing_key, "activity.wait");
        assert!(execution_messages(&broker).is_empty());

        escalate(&broker, Some("Escalation_0"), true);
        assert!(execution_messages(&broker).is_empty());

        escalate(&broker, None, true);
        let executions = execution_messages(&broker);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].content.state.as_deref(), Some("catch"));
        assert_eq!(events.borrow().last().unwrap().fields.routing_key, "activity.catch");
        assert_eq!(broker.consumer_count(), 1);
    }

    #[test]
    fn catch_waits_with_reference_and_ignores_other_ids() {
        let (broker, events) = activity_broker();
        let catch = definition(&broker, ReferenceKind::Escalation, Some("Escalation_0"), false);
        assert_eq!(catch.description(), "Too large <Escalation_0>");
        catch.execute(&execute_content());

        let wait = events.borrow()[0].clone();
        assert_eq!(wait.content.execution_id, "event_1");
        assert_eq!(wait.content.extra["escalation"]["id"], "Escalation_0");

        escalate(&broker, Some("Escalation_1"), false);
        assert!(execution_messages(&broker).is_empty());
        escalate(&broker, Some("Escalation_0"), false);
        let executions = execution_messages(&broker);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].content.output.as_ref().unwrap()["id"], "Escalation_0");
    }

    #[test]
    fn buffered_escalation_completes_immediately() {
        let (broker, events) = activity_broker();
        let catch = definition(&broker, ReferenceKind::Escalation, Some("Escalation_0"), false);
        escalate(&broker, Some("Escalation_0"), true);
        catch.execute(&execute_content());

        assert_eq!(execution_messages(&broker).len(), 1);
        assert!(events.borrow().iter().all(|m| m.fields.routing_key != "activity.wait"));
    }

    #[test]
    fn stopped_catch_buffers_and_completes_after_resume() {
        let (broker, _events) = activity_broker();
        let catch = definition(&broker, ReferenceKind::Escalation, Some("Escalation_0"), false);
        catch.execute(&execute_content());
        catch.stop();
        assert_eq!(broker.consumer_count(), 1);

        escalate(&broker, Some("Escalation_0"), true);
        assert!(execution_messages(&broker).is_empty());
        let queue = catch.queue_name().unwrap();
        assert_eq!(broker.get_queue(&queue).unwrap().message_count(), 1);

        catch.execute(&execute_content());
        assert_eq!(execution_messages(&broker).len(), 1);
        assert_eq!(broker.get_queue(&queue).unwrap().message_count(), 0);
    }

    #[test]
    fn api_discard_forces_execute_discard() {
        let (broker, _events) = activity_broker();
        let catch = definition(&broker, ReferenceKind::Escalation, None, false);
        catch.execute(&execute_content());
        broker.publish(
            "api",
            "activity.discard.event_1_0",
            Content::default(),
            Properties::typed("discard"),
        );
        let executions = execution_messages(&broker);
        assert_eq!(executions[0].fields.routing_key, "execute.discard");
        assert_eq!(broker.consumer_count(), 1);

        escalate(&broker, None, true);
        assert_eq!(execution_messages(&broker).len(), 1);
    }

    #[test]
    fn direct_signal_is_accepted_regardless_of_id() {
        let (broker, _events) = activity_broker();
        let catch = definition(&broker, ReferenceKind::Signal, Some("Signal_0"), false);
        catch.execute(&execute_content());
        broker.publish(
            "api",
            "activity.signal.event_1",
            Content::default().with_message(Some(json!({"id": "other"}))),
            Properties::typed("signal").delegated(),
        );
        assert!(execution_messages(&broker).is_empty());
        broker.publish(
            "api",
            "activity.signal.event_1",
            Content::default().with_message(Some(json!({"id": "other"}))),
            Properties::typed("signal"),
        );
        assert_eq!(execution_messages(&broker).len(), 1);
    }
}
