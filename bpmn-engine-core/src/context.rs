//! Read-only view of a parsed definition plus the environment it runs in.

use crate::authoring::dto::{DefinitionDto, ElementDto, ProcessDto, ReferenceKind};
use crate::authoring::validate::validate_definition;
use crate::authoring::yaml::{parse_definition_json, parse_definition_yaml};
use crate::broker::Dispatcher;
use crate::environment::Environment;
use crate::error::EngineError;
use serde_json::{json, Value};
use std::rc::Rc;

/// Signal, message or escalation element referenced by event definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceElement {
    pub id: String,
    pub name: Option<String>,
    pub kind: ReferenceKind,
}

impl ReferenceElement {
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ReferenceKind::Signal => "bpmn:Signal",
            ReferenceKind::Message => "bpmn:Message",
            ReferenceKind::Escalation => "bpmn:Escalation",
        }
    }

    /// Message type used when the reference is sent through a definition.
    pub fn message_type(&self) -> &'static str {
        match self.kind {
            ReferenceKind::Signal => "signal",
            ReferenceKind::Message => "message",
            ReferenceKind::Escalation => "escalate",
        }
    }

    /// `{id, type, name, messageType}` as carried in `content.message`.
    pub fn resolve(&self) -> Value {
        let mut resolved = json!({
            "id": self.id,
            "type": self.type_name(),
            "messageType": self.message_type(),
        });
        if let Some(name) = &self.name {
            resolved["name"] = json!(name);
        }
        resolved
    }
}

struct ContextInner {
    dto: DefinitionDto,
    environment: Environment,
}

#[derive(Clone)]
pub struct DefinitionContext {
    inner: Rc<ContextInner>,
}

impl std::fmt::Debug for DefinitionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionContext")
            .field("id", &self.inner.dto.id)
            .finish()
    }
}

impl DefinitionContext {
    pub fn new(dto: DefinitionDto, environment: Environment) -> Self {
        Self {
            inner: Rc::new(ContextInner { dto, environment }),
        }
    }

    /// Validate `dto` and build a context with a default environment.
    pub fn from_dto(dto: DefinitionDto) -> Result<Self, EngineError> {
        let errors = validate_definition(&dto);
        if !errors.is_empty() {
            return Err(EngineError::Invalid(errors));
        }
        Ok(Self::new(dto, Environment::default()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let dto = parse_definition_yaml(yaml).map_err(|e| EngineError::Parse(e.to_string()))?;
        Self::from_dto(dto)
    }

    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let dto = parse_definition_json(json).map_err(|e| EngineError::Parse(e.to_string()))?;
        Self::from_dto(dto)
    }

    /// Same definition with another environment.
    pub fn clone_with(&self, environment: Environment) -> Self {
        Self::new(self.inner.dto.clone(), environment)
    }

    pub fn id(&self) -> &str {
        &self.inner.dto.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.dto.name.as_deref()
    }

    pub fn dto(&self) -> &DefinitionDto {
        &self.inner.dto
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    pub fn get_processes(&self) -> &[ProcessDto] {
        &self.inner.dto.processes
    }

    pub fn get_executable_processes(&self) -> Vec<&ProcessDto> {
        self.inner.dto.processes.iter().filter(|p| p.executable).collect()
    }

    pub fn get_process_by_id(&self, id: &str) -> Option<&ProcessDto> {
        self.inner.dto.process(id)
    }

    /// First element with `id` in any process, searching nested scopes.
    pub fn get_activity_by_id(&self, id: &str) -> Option<&ElementDto> {
        self.inner
            .dto
            .processes
            .iter()
            .find_map(|p| find_element(&p.elements, id))
    }

    pub fn get_reference_by_id(&self, id: &str) -> Option<ReferenceElement> {
        self.inner.dto.reference(id).map(|r| ReferenceElement {
            id: r.id.clone(),
            name: r.name.clone(),
            kind: r.kind,
        })
    }
}

fn find_element<'a>(elements: &'a [ElementDto], id: &str) -> Option<&'a ElementDto> {
    elements.iter().find_map(|element| {
        if element.id() == id {
            return Some(element);
        }
        match element {
            ElementDto::SubProcess { elements, .. } => find_element(elements, id),
            _ => None,
        }
    })
}

/// Everything an activity needs from its surroundings.
#[derive(Clone, Debug)]
pub struct ScopeContext {
    pub definition: DefinitionContext,
    pub environment: Environment,
    pub dispatcher: Dispatcher,
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
id: def1
references:
  - { kind: Signal, id: Signal_0, name: Go }
  - { kind: Escalation, id: Escalation_0 }
processes:
  - id: process1
    elements:
      - { kind: StartEvent, id: start }
      - kind: SubProcess
        id: subp
        elements:
          - { kind: UserTask, id: subtask }
  - id: process2
    executable: false
    elements:
      - { kind: UserTask, id: task }
"#;

    #[test]
    fn lookups_reach_nested_elements() {
        let context = DefinitionContext::from_yaml(YAML).unwrap();
        assert_eq!(context.id(), "def1");
        assert_eq!(context.get_processes().len(), 2);
        assert_eq!(context.get_executable_processes().len(), 1);
        assert_eq!(
            context.get_activity_by_id("subtask").map(|e| e.type_name()),
            Some("bpmn:UserTask")
        );
        assert!(context.get_activity_by_id("ghost").is_none());
    }

    #[test]
    fn references_resolve_with_message_type() {
        let context = DefinitionContext::from_yaml(YAML).unwrap();
        let signal = context.get_reference_by_id("Signal_0").unwrap();
        let resolved = signal.resolve();
        assert_eq!(resolved["id"], "Signal_0");
        assert_eq!(resolved["name"], "Go");
        assert_eq!(resolved["messageType"], "signal");
        let escalation = context.get_reference_by_id("Escalation_0").unwrap();
        assert_eq!(escalation.message_type(), "escalate");
        assert!(escalation.resolve().get("name").is_none());
    }

    #[test]
    fn invalid_yaml_is_rejected() {
        let err = DefinitionContext::from_yaml("id: def1\nprocesses: []\n").unwrap_err();
        assert!(matches!(err, EngineError::Invalid(_)));
        let err = DefinitionContext::from_yaml("id: [").unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
