use crate::authoring::dto::ReferenceKind;
use crate::context::ReferenceElement;
use crate::messages::broker_safe_id;
use serde_json::{json, Value};

/// Routing vocabulary per event definition kind.
pub trait ReferenceKindExt {
    /// Segment used in api routing keys and catch queue names.
    fn reference_type(self) -> &'static str;
    /// Content key carrying the resolved reference.
    fn content_key(self) -> &'static str;
    fn noun(self) -> &'static str;
    fn definition_type(self) -> &'static str;
}

impl ReferenceKindExt for ReferenceKind {
    fn reference_type(self) -> &'static str {
        match self {
            ReferenceKind::Escalation => "escalate",
            ReferenceKind::Signal => "signal",
            ReferenceKind::Message => "message",
        }
    }

    fn content_key(self) -> &'static str {
        match self {
            ReferenceKind::Escalation => "escalation",
            ReferenceKind::Signal => "signal",
            ReferenceKind::Message => "message",
        }
    }

    fn noun(self) -> &'static str {
        self.content_key()
    }

    fn definition_type(self) -> &'static str {
        match self {
            ReferenceKind::Escalation => "bpmn:EscalationEventDefinition",
            ReferenceKind::Signal => "bpmn:SignalEventDefinition",
            ReferenceKind::Message => "bpmn:MessageEventDefinition",
        }
    }
}

/// Reference as declared on the event definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub id: Option<String>,
    pub element: Option<ReferenceElement>,
}

/// Resolved reference carried by wait, catch and throw messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceInfo {
    pub message: Value,
    pub description: String,
}

impl ReferenceInfo {
    pub fn message_id(&self) -> Option<&str> {
        self.message.get("id").and_then(Value::as_str)
    }
}

impl Reference {
    pub fn is_anonymous(&self) -> bool {
        self.element.is_none()
    }

    /// Durable catch queue for `activity_id`.
    pub fn queue_name(&self, activity_id: &str) -> String {
        let target = match &self.element {
            Some(element) => broker_safe_id(&element.id),
            None => "anonymous".to_string(),
        };
        format!(
            "{}-{}-{}-q",
            self.kind.reference_type(),
            broker_safe_id(activity_id),
            target
        )
    }

    pub fn info(&self) -> ReferenceInfo {
        match &self.element {
            Some(element) => {
                let mut message = element.resolve();
                message["referenceType"] = json!(self.kind.reference_type());
                let name = element.name.as_deref().unwrap_or(&element.id);
                ReferenceInfo {
                    message,
                    description: format!("{} <{}>", name, element.id),
                }
            }
            None => {
                let mut message = json!({
                    "name": "anonymous",
                    "referenceType": self.kind.reference_type(),
                });
                if let Some(id) = &self.id {
                    message["id"] = json!(id);
                }
                ReferenceInfo {
                    message,
                    description: format!("anonymous {}", self.kind.noun()),
                }
            }
        }
    }
}
