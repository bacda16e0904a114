use super::dto::DefinitionDto;
use anyhow::Result;

/// Parse a YAML string into a DefinitionDto.
///
/// Validation is NOT performed here; call `validate_definition()` or use
/// `Definition::from_yaml()` which validates before building the context.
pub fn parse_definition_yaml(yaml_str: &str) -> Result<DefinitionDto> {
    let dto: DefinitionDto = serde_yaml::from_str(yaml_str)?;
    Ok(dto)
}

/// Parse a JSON string into a DefinitionDto.
pub fn parse_definition_json(json_str: &str) -> Result<DefinitionDto> {
    let dto: DefinitionDto = serde_json::from_str(json_str)?;
    Ok(dto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authoring::dto::*;

    #[test]
    fn test_basic_yaml_parse() {
        let yaml = r#"
id: def1
processes:
  - id: process1
    elements:
      - kind: StartEvent
        id: start
      - kind: ServiceTask
        id: task
        service: save
      - kind: EndEvent
        id: end
    flows:
      - { id: flow1, from: start, to: task }
      - { id: flow2, from: task, to: end }
"#;
        let dto = parse_definition_yaml(yaml).unwrap();
        assert_eq!(dto.id, "def1");
        assert_eq!(dto.processes.len(), 1);
        assert!(dto.processes[0].executable);
        assert_eq!(dto.processes[0].elements.len(), 3);
        assert_eq!(dto.processes[0].flows.len(), 2);
    }

    #[test]
    fn test_yaml_with_conditions() {
        let yaml = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: ExclusiveGateway, id: gw }
      - { kind: Task, id: a }
      - { kind: Task, id: b }
    flows:
      - id: f1
        from: gw
        to: a
        condition:
          variable: approved
          op: "=="
          value: true
      - id: f2
        from: gw
        to: b
        condition:
          variable: tier
          op: "!="
          value: gold
      - { id: f3, from: gw, to: b, default: true }
"#;
        let dto = parse_definition_yaml(yaml).unwrap();
        let flows = &dto.processes[0].flows;
        let cond = flows[0].condition.as_ref().unwrap();
        assert_eq!(cond.variable, "approved");
        assert_eq!(cond.op, ConditionOp::Eq);
        assert_eq!(cond.value, ConditionValue::Bool(true));
        assert_eq!(
            flows[1].condition.as_ref().unwrap().value,
            ConditionValue::Str("gold".to_string())
        );
        assert!(flows[2].is_default);
    }

    #[test]
    fn test_json_parse() {
        let json = r#"{
  "id": "def1",
  "references": [{ "kind": "Signal", "id": "Signal_0", "name": "Go" }],
  "processes": [{ "id": "process1", "executable": false, "elements": [{ "kind": "UserTask", "id": "task" }] }]
}"#;
        let dto = parse_definition_json(json).unwrap();
        assert_eq!(dto.reference("Signal_0").unwrap().kind, ReferenceKind::Signal);
        assert!(!dto.process("process1").unwrap().executable);
    }

    #[test]
    fn test_unknown_kind_fails() {
        let yaml = r#"
id: def1
processes:
  - id: process1
    elements:
      - { kind: TimerWait, id: t }
"#;
        assert!(parse_definition_yaml(yaml).is_err());
    }
}
