use super::dto::*;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn error(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

/// Validate a DefinitionDto before building a context. Returns all errors found.
pub fn validate_definition(dto: &DefinitionDto) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // V5: At least one process
    if dto.processes.is_empty() {
        errors.push(error("V5", "No process found".to_string()));
    }

    let process_ids: HashSet<&str> = dto.processes.iter().map(|p| p.id.as_str()).collect();
    let reference_ids: HashSet<&str> = dto.references.iter().map(|r| r.id.as_str()).collect();

    for process in &dto.processes {
        if process.id.contains(['.', '*', '#']) {
            errors.push(error(
                "V2",
                format!("Process id contains a routing character: {}", process.id),
            ));
        }
        validate_scope(
            &process.id,
            &process.elements,
            &process.flows,
            &process.associations,
            &process_ids,
            &reference_ids,
            &mut errors,
        );
    }

    errors
}

fn validate_scope(
    scope_id: &str,
    elements: &[ElementDto],
    flows: &[FlowDto],
    associations: &[AssociationDto],
    process_ids: &HashSet<&str>,
    reference_ids: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    // Build lookup map
    let mut element_map: HashMap<&str, &ElementDto> = HashMap::new();

    // V1: Element ids must be unique within the scope
    for element in elements {
        let id = element.id();
        if element_map.contains_key(id) {
            errors.push(error("V1", format!("Duplicate element id in {}: {}", scope_id, id)));
        } else {
            element_map.insert(id, element);
        }
    }

    // V2: Element ids must not contain routing characters
    for element in elements {
        if element.id().contains(['.', '*', '#']) {
            errors.push(error(
                "V2",
                format!("Element id contains a routing character: {}", element.id()),
            ));
        }
    }

    // V3: Flow and association endpoints exist in the scope
    for flow in flows {
        for (end, target) in [("from", &flow.from), ("to", &flow.to)] {
            if !element_map.contains_key(target.as_str()) {
                errors.push(error(
                    "V3",
                    format!("Flow {} {} '{}' not found in {}", flow.id, end, target, scope_id),
                ));
            }
        }
    }
    for association in associations {
        for (end, target) in [("from", &association.from), ("to", &association.to)] {
            if !element_map.contains_key(target.as_str()) {
                errors.push(error(
                    "V3",
                    format!(
                        "Association {} {} '{}' not found in {}",
                        association.id, end, target, scope_id
                    ),
                ));
            }
        }
    }

    for element in elements {
        // V4: Boundary host exists
        if let Some(host) = element.attached_to() {
            let valid = element_map
                .get(host)
                .is_some_and(|h| !matches!(h, ElementDto::BoundaryEvent { .. }) && !h.is_gateway());
            if !valid {
                errors.push(error(
                    "V4",
                    format!("BoundaryEvent {}: host '{}' not found", element.id(), host),
                ));
            }
        }

        // V6: Call activity target exists
        if let ElementDto::CallActivity {
            id, called_element, ..
        } = element
        {
            if !process_ids.contains(called_element.as_str()) {
                errors.push(error(
                    "V6",
                    format!("CallActivity {}: process '{}' not found", id, called_element),
                ));
            }
        }

        // V7: ExclusiveGateway has at most one default outgoing flow
        if let ElementDto::ExclusiveGateway { id, .. } = element {
            let defaults = flows
                .iter()
                .filter(|f| f.from == *id && f.is_default)
                .count();
            if defaults > 1 {
                errors.push(error(
                    "V7",
                    format!(
                        "ExclusiveGateway {}: at most one default outgoing flow, found {}",
                        id, defaults
                    ),
                ));
            }
        }

        // V8: Event definition references exist
        for definition in element.event_definitions() {
            if let Some(reference) = &definition.reference {
                if !reference_ids.contains(reference.as_str()) {
                    errors.push(error(
                        "V8",
                        format!("{}: reference '{}' not found", element.id(), reference),
                    ));
                }
            }
        }

        if let ElementDto::SubProcess {
            id,
            elements,
            flows,
            associations,
            ..
        } = element
        {
            validate_scope(
                id,
                elements,
                flows,
                associations,
                process_ids,
                reference_ids,
                errors,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authoring::yaml::parse_definition_yaml;

    fn rules(yaml: &str) -> Vec<String> {
        let dto = parse_definition_yaml(yaml).unwrap();
        validate_definition(&dto).into_iter().map(|e| e.rule).collect()
    }

    #[test]
    fn valid_definition_has_no_errors() {
        let yaml = r#"
id: def1
references:
  - { kind: Escalation, id: Escalation_0 }
processes:
  - id: process1
    elements:
      - { kind: StartEvent, id: start }
      - { kind: UserTask, id: task }
      - { kind: BoundaryEvent, id: bound, attached_to: task, event_definitions: [{ kind: Escalation, reference: Escalation_0 }] }
      - { kind: EndEvent, id: end }
    flows:
      - { id: flow1, from: start, to: task }
      - { id: flow2, from: task, to: end }
"#;
        assert!(rules(yaml).is_empty());
    }

    #[test]
    fn duplicate_and_dotted_ids() {
        let yaml = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: Task, id: a }
      - { kind: Task, id: a }
      - { kind: Task, id: b.c }
"#;
        assert_eq!(rules(yaml), vec!["V1", "V2"]);
    }

    #[test]
    fn same_id_in_nested_scope_is_allowed() {
        let yaml = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: Task, id: a }
      - kind: SubProcess
        id: subp
        elements:
          - { kind: Task, id: a }
"#;
        assert!(rules(yaml).is_empty());
    }

    #[test]
    fn dangling_flow_boundary_call_and_reference() {
        let yaml = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: StartEvent, id: start }
      - { kind: BoundaryEvent, id: bound, attached_to: ghost }
      - { kind: CallActivity, id: call, called_element: missing }
      - { kind: IntermediateThrowEvent, id: throw, event_definitions: [{ kind: Signal, reference: nope }] }
    flows:
      - { id: flow1, from: start, to: nowhere }
"#;
        assert_eq!(rules(yaml), vec!["V3", "V4", "V6", "V8"]);
    }

    #[test]
    fn exclusive_gateway_with_two_defaults() {
        let yaml = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: ExclusiveGateway, id: gw }
      - { kind: Task, id: a }
      - { kind: Task, id: b }
    flows:
      - { id: f1, from: gw, to: a, default: true }
      - { id: f2, from: gw, to: b, default: true }
"#;
        assert_eq!(rules(yaml), vec!["V7"]);
    }

    #[test]
    fn no_process() {
        assert_eq!(rules("id: def1\nprocesses: []\n"), vec!["V5"]);
    }
}
