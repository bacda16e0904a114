use serde::{Deserialize, Serialize};

// ── Helper defaults for serde ──

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !v
}

// ── Top-level DTO ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferenceDto>,
    pub processes: Vec<ProcessDto>,
}

impl DefinitionDto {
    pub fn process(&self, id: &str) -> Option<&ProcessDto> {
        self.processes.iter().find(|p| p.id == id)
    }

    pub fn reference(&self, id: &str) -> Option<&ReferenceDto> {
        self.references.iter().find(|r| r.id == id)
    }
}

// ── Reference elements ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    Signal,
    Message,
    Escalation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceDto {
    pub kind: ReferenceKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ── Process ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub executable: bool,
    #[serde(default)]
    pub elements: Vec<ElementDto>,
    #[serde(default)]
    pub flows: Vec<FlowDto>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associations: Vec<AssociationDto>,
}

impl ProcessDto {
    pub fn scope(&self) -> ScopeDto {
        ScopeDto {
            elements: self.elements.clone(),
            flows: self.flows.clone(),
            associations: self.associations.clone(),
        }
    }
}

/// Elements and connections of one scope: a process or a sub-process.
#[derive(Debug, Clone, Default)]
pub struct ScopeDto {
    pub elements: Vec<ElementDto>,
    pub flows: Vec<FlowDto>,
    pub associations: Vec<AssociationDto>,
}

// ── Flows ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDto {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<FlowCondition>,
    #[serde(default, alias = "default", skip_serializing_if = "is_false")]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCondition {
    pub variable: String,
    pub op: ConditionOp,
    pub value: ConditionValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    I64(i64),
    Str(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationDto {
    pub id: String,
    pub from: String,
    pub to: String,
}

// ── Event definitions ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDefinitionDto {
    pub kind: ReferenceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiInstanceDto {
    pub cardinality: usize,
    #[serde(default)]
    pub sequential: bool,
}

// ── Element (tagged enum) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ElementDto {
    StartEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        event_definitions: Vec<EventDefinitionDto>,
    },
    EndEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        event_definitions: Vec<EventDefinitionDto>,
    },
    IntermediateCatchEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        event_definitions: Vec<EventDefinitionDto>,
    },
    IntermediateThrowEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        event_definitions: Vec<EventDefinitionDto>,
    },
    BoundaryEvent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        attached_to: String,
        #[serde(default = "default_true")]
        cancel_activity: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        event_definitions: Vec<EventDefinitionDto>,
    },
    Task {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_instance: Option<MultiInstanceDto>,
        #[serde(default, skip_serializing_if = "is_false")]
        for_compensation: bool,
    },
    UserTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_instance: Option<MultiInstanceDto>,
        #[serde(default, skip_serializing_if = "is_false")]
        for_compensation: bool,
    },
    ServiceTask {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_instance: Option<MultiInstanceDto>,
        #[serde(default, skip_serializing_if = "is_false")]
        for_compensation: bool,
    },
    SubProcess {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_instance: Option<MultiInstanceDto>,
        #[serde(default)]
        elements: Vec<ElementDto>,
        #[serde(default)]
        flows: Vec<FlowDto>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        associations: Vec<AssociationDto>,
    },
    CallActivity {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        called_element: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_instance: Option<MultiInstanceDto>,
    },
    ExclusiveGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    InclusiveGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    ParallelGateway {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ElementDto {
    pub fn id(&self) -> &str {
        match self {
            ElementDto::StartEvent { id, .. }
            | ElementDto::EndEvent { id, .. }
            | ElementDto::IntermediateCatchEvent { id, .. }
            | ElementDto::IntermediateThrowEvent { id, .. }
            | ElementDto::BoundaryEvent { id, .. }
            | ElementDto::Task { id, .. }
            | ElementDto::UserTask { id, .. }
            | ElementDto::ServiceTask { id, .. }
            | ElementDto::SubProcess { id, .. }
            | ElementDto::CallActivity { id, .. }
            | ElementDto::ExclusiveGateway { id, .. }
            | ElementDto::InclusiveGateway { id, .. }
            | ElementDto::ParallelGateway { id, .. } => id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ElementDto::StartEvent { name, .. }
            | ElementDto::EndEvent { name, .. }
            | ElementDto::IntermediateCatchEvent { name, .. }
            | ElementDto::IntermediateThrowEvent { name, .. }
            | ElementDto::BoundaryEvent { name, .. }
            | ElementDto::Task { name, .. }
            | ElementDto::UserTask { name, .. }
            | ElementDto::ServiceTask { name, .. }
            | ElementDto::SubProcess { name, .. }
            | ElementDto::CallActivity { name, .. }
            | ElementDto::ExclusiveGateway { name, .. }
            | ElementDto::InclusiveGateway { name, .. }
            | ElementDto::ParallelGateway { name, .. } => name.as_deref(),
        }
    }

    /// BPMN type name, e.g. `bpmn:UserTask`.
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementDto::StartEvent { .. } => "bpmn:StartEvent",
            ElementDto::EndEvent { .. } => "bpmn:EndEvent",
            ElementDto::IntermediateCatchEvent { .. } => "bpmn:IntermediateCatchEvent",
            ElementDto::IntermediateThrowEvent { .. } => "bpmn:IntermediateThrowEvent",
            ElementDto::BoundaryEvent { .. } => "bpmn:BoundaryEvent",
            ElementDto::Task { .. } => "bpmn:Task",
            ElementDto::UserTask { .. } => "bpmn:UserTask",
            ElementDto::ServiceTask { .. } => "bpmn:ServiceTask",
            ElementDto::SubProcess { .. } => "bpmn:SubProcess",
            ElementDto::CallActivity { .. } => "bpmn:CallActivity",
            ElementDto::ExclusiveGateway { .. } => "bpmn:ExclusiveGateway",
            ElementDto::InclusiveGateway { .. } => "bpmn:InclusiveGateway",
            ElementDto::ParallelGateway { .. } => "bpmn:ParallelGateway",
        }
    }

    pub fn event_definitions(&self) -> &[EventDefinitionDto] {
        match self {
            ElementDto::StartEvent { event_definitions, .. }
            | ElementDto::EndEvent { event_definitions, .. }
            | ElementDto::IntermediateCatchEvent { event_definitions, .. }
            | ElementDto::IntermediateThrowEvent { event_definitions, .. }
            | ElementDto::BoundaryEvent { event_definitions, .. } => event_definitions,
            _ => &[],
        }
    }

    pub fn multi_instance(&self) -> Option<MultiInstanceDto> {
        match self {
            ElementDto::Task { multi_instance, .. }
            | ElementDto::UserTask { multi_instance, .. }
            | ElementDto::ServiceTask { multi_instance, .. }
            | ElementDto::SubProcess { multi_instance, .. }
            | ElementDto::CallActivity { multi_instance, .. } => *multi_instance,
            _ => None,
        }
    }

    pub fn is_for_compensation(&self) -> bool {
        match self {
            ElementDto::Task { for_compensation, .. }
            | ElementDto::UserTask { for_compensation, .. }
            | ElementDto::ServiceTask { for_compensation, .. } => *for_compensation,
            _ => false,
        }
    }

    pub fn attached_to(&self) -> Option<&str> {
        match self {
            ElementDto::BoundaryEvent { attached_to, .. } => Some(attached_to.as_str()),
            _ => None,
        }
    }

    /// Throw events publish their event definitions; everything else with
    /// event definitions catches.
    pub fn is_throwing(&self) -> bool {
        matches!(
            self,
            ElementDto::EndEvent { .. } | ElementDto::IntermediateThrowEvent { .. }
        )
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            ElementDto::ExclusiveGateway { .. }
                | ElementDto::InclusiveGateway { .. }
                | ElementDto::ParallelGateway { .. }
        )
    }

    /// Nested scope of a sub-process.
    pub fn scope(&self) -> Option<ScopeDto> {
        match self {
            ElementDto::SubProcess {
                elements,
                flows,
                associations,
                ..
            } => Some(ScopeDto {
                elements: elements.clone(),
                flows: flows.clone(),
                associations: associations.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_accessors_cover_every_kind() {
        let yaml = r#"
- { kind: StartEvent, id: start }
- { kind: BoundaryEvent, id: bound, attached_to: task, event_definitions: [{ kind: Escalation }] }
- { kind: UserTask, id: task, multi_instance: { cardinality: 3 } }
- { kind: ServiceTask, id: svc, service: save, for_compensation: true }
- { kind: IntermediateThrowEvent, id: throw, event_definitions: [{ kind: Signal, reference: Signal_0 }] }
- { kind: SubProcess, id: subp, elements: [{ kind: Task, id: inner }] }
"#;
        let elements: Vec<ElementDto> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(elements[0].type_name(), "bpmn:StartEvent");
        assert_eq!(elements[1].attached_to(), Some("task"));
        assert_eq!(elements[1].event_definitions()[0].kind, ReferenceKind::Escalation);
        assert_eq!(
            elements[2].multi_instance(),
            Some(MultiInstanceDto {
                cardinality: 3,
                sequential: false
            })
        );
        assert!(elements[3].is_for_compensation());
        assert!(elements[4].is_throwing());
        assert_eq!(elements[5].scope().unwrap().elements[0].id(), "inner");
    }

    #[test]
    fn boundary_events_cancel_by_default() {
        let element: ElementDto =
            serde_yaml::from_str("{ kind: BoundaryEvent, id: b, attached_to: t }").unwrap();
        assert!(matches!(
            element,
            ElementDto::BoundaryEvent {
                cancel_activity: true,
                ..
            }
        ));
    }

    #[test]
    fn flow_accepts_default_alias() {
        let flow: FlowDto = serde_yaml::from_str("{ id: f, from: a, to: b, default: true }").unwrap();
        assert!(flow.is_default);
    }
}
