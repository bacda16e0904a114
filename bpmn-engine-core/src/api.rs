//! Handle for sending API messages to a running definition, process or
//! activity execution.

use crate::broker::Broker;
use crate::error::ActivityError;
use crate::messages::{Content, Properties};
use serde_json::Value;
use tracing::debug;

/// Routing prefix of the element an [`Api`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiTarget {
    Definition,
    Process,
    Activity,
}

impl ApiTarget {
    fn prefix(self) -> &'static str {
        match self {
            ApiTarget::Definition => "definition",
            ApiTarget::Process => "process",
            ApiTarget::Activity => "activity",
        }
    }
}

/// Publishes `<prefix>.<action>.<executionId>` on the owner's `api` exchange.
#[derive(Clone, Debug)]
pub struct Api {
    target: ApiTarget,
    broker: Broker,
    content: Content,
}

impl Api {
    pub fn new(target: ApiTarget, broker: Broker, content: Content) -> Self {
        Self {
            target,
            broker,
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

    pub fn signal(&self, message: Option<Value>) {
        self.send_api_message("signal", message, false);
    }

    /// Signal with the delegate flag, as a definition broadcast would.
    pub fn delegate(&self, kind: &str, message: Option<Value>) {
        self.send_api_message(kind, message, true);
    }

    pub fn discard(&self) {
        self.send_api_message("discard", None, false);
    }

    pub fn stop(&self) {
        self.send_api_message("stop", None, false);
    }

    pub fn fail(&self, error: ActivityError) {
        let mut content = self.content.clone();
        content.error = Some(error);
        self.publish("error", content, false);
    }

    pub fn send_api_message(&self, action: &str, message: Option<Value>, delegate: bool) {
        let mut content = self.content.clone();
        content.message = message;
        self.publish(action, content, delegate);
    }

    fn publish(&self, action: &str, content: Content, delegate: bool) {
        let routing_key = format!(
            "{}.{}.{}",
            self.target.prefix(),
            action,
            self.content.execution_id
        );
        debug!(id = %self.content.id, routing_key = %routing_key, "api message");
        let mut properties = Properties::typed(action);
        properties.delegate = delegate;
        self.broker.publish("api", &routing_key, content, properties);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConsumeOptions;
    use crate::messages::Message;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn api_messages_are_typed_and_keyed_by_execution() {
        let broker = Broker::new("task");
        let seen: Rc<RefCell<Vec<Message>>> = Rc::default();
        let sink = seen.clone();
        broker.subscribe_tmp(
            "api",
            "activity.#.task_1",
            move |msg| sink.borrow_mut().push(msg.clone()),
            ConsumeOptions::default(),
        );
        let api = Api::new(
            ApiTarget::Activity,
            broker,
            Content::new("task", "bpmn:UserTask").with_execution_id("task_1"),
        );
        api.signal(Some(json!({"id": "Signal_0"})));
        api.delegate("signal", None);
        api.fail(ActivityError::new("boom"));

        let seen = seen.borrow();
        assert_eq!(seen[0].fields.routing_key, "activity.signal.task_1");
        assert_eq!(seen[0].kind(), Some("signal"));
        assert_eq!(seen[0].content.message_id(), Some("Signal_0"));
        assert!(!seen[0].properties.delegate);
        assert!(seen[1].properties.delegate);
        assert_eq!(seen[2].kind(), Some("error"));
        assert_eq!(seen[2].content.error.as_ref().unwrap().message, "boom");
    }
}
