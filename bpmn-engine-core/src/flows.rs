//! Sequence flows and associations between activities of one scope.

use crate::activity::{Activity, WeakActivity};
use crate::authoring::dto::{AssociationDto, ConditionOp, ConditionValue, FlowCondition, FlowDto};
use crate::error::ActivityError;
use crate::messages::Content;
use crate::state::{FlowCounters, FlowState};
use serde_json::{json, Map, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

/// What arrives on an activity's inbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    FlowTake,
    FlowDiscard,
    AssociationTake,
    AssociationDiscard,
}

impl InboundKind {
    pub fn routing_key(self) -> &'static str {
        match self {
            InboundKind::FlowTake => "flow.take",
            InboundKind::FlowDiscard => "flow.discard",
            InboundKind::AssociationTake => "association.take",
            InboundKind::AssociationDiscard => "association.discard",
        }
    }

    pub fn from_routing_key(key: &str) -> Option<Self> {
        match key {
            "flow.take" => Some(InboundKind::FlowTake),
            "flow.discard" => Some(InboundKind::FlowDiscard),
            "association.take" => Some(InboundKind::AssociationTake),
            "association.discard" => Some(InboundKind::AssociationDiscard),
            _ => None,
        }
    }
}

struct Connection {
    id: String,
    kind: &'static str,
    source_id: String,
    target_id: String,
    target: RefCell<Option<WeakActivity>>,
    counters: Cell<FlowCounters>,
}

impl Connection {
    fn new(id: &str, kind: &'static str, source_id: &str, target_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            target: RefCell::new(None),
            counters: Cell::new(FlowCounters::default()),
        }
    }

    fn inbound_content(&self, source: Option<&Content>, discard_sequence: &[String]) -> Content {
        let mut content = Content::new(&self.id, self.kind);
        if let Some(source) = source {
            content.execution_id = source.execution_id.clone();
            content.parent = source.parent.clone();
            content.output = source.output.clone();
        }
        content.extra.insert("sourceId".into(), json!(self.source_id));
        content.extra.insert("targetId".into(), json!(self.target_id));
        if !discard_sequence.is_empty() {
            content
                .extra
                .insert("discardSequence".into(), json!(discard_sequence));
        }
        content
    }

    fn deliver(&self, kind: InboundKind, content: Content) {
        let target = self.target.borrow().as_ref().and_then(WeakActivity::upgrade);
        debug!(flow_id = %self.id, target_id = %self.target_id, routing_key = kind.routing_key(), "flow");
        if let Some(target) = target {
            target.inbound(kind, content);
        }
    }

    fn count(&self, f: impl FnOnce(&mut FlowCounters)) {
        let mut counters = self.counters.get();
        f(&mut counters);
        self.counters.set(counters);
    }
}

// ── Sequence flow ──

#[derive(Clone)]
pub struct SequenceFlow {
    inner: Rc<SequenceFlowInner>,
}

struct SequenceFlowInner {
    connection: Connection,
    condition: Option<FlowCondition>,
    is_default: bool,
}

impl std::fmt::Debug for SequenceFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceFlow")
            .field("id", &self.inner.connection.id)
            .finish()
    }
}

impl SequenceFlow {
    pub fn new(dto: &FlowDto) -> Self {
        Self {
            inner: Rc::new(SequenceFlowInner {
                connection: Connection::new(&dto.id, "bpmn:SequenceFlow", &dto.from, &dto.to),
                condition: dto.condition.clone(),
                is_default: dto.is_default,
            }),
        }
    }

    pub(crate) fn connect(&self, target: &Activity) {
        *self.inner.connection.target.borrow_mut() = Some(target.downgrade());
    }

    pub fn id(&self) -> &str {
        &self.inner.connection.id
    }

    pub fn source_id(&self) -> &str {
        &self.inner.connection.source_id
    }

    pub fn target_id(&self) -> &str {
        &self.inner.connection.target_id
    }

    pub fn is_default(&self) -> bool {
        self.inner.is_default
    }

    pub fn is_conditional(&self) -> bool {
        self.inner.condition.is_some()
    }

    pub fn counters(&self) -> FlowCounters {
        self.inner.connection.counters.get()
    }

    pub fn take(&self, source: &Content) {
        self.inner.connection.count(|c| c.take += 1);
        let content = self.inner.connection.inbound_content(Some(source), &[]);
        self.inner.connection.deliver(InboundKind::FlowTake, content);
    }

    /// Discard the flow. `discard_sequence` lists the activities the discard
    /// already passed through.
    pub fn discard(&self, source: &Content, discard_sequence: &[String]) {
        self.inner.connection.count(|c| c.discard += 1);
        let content = self
            .inner
            .connection
            .inbound_content(Some(source), discard_sequence);
        self.inner.connection.deliver(InboundKind::FlowDiscard, content);
    }

    /// Evaluate the flow condition; unconditional flows always pass.
    pub fn evaluate(&self, scope: &Map<String, Value>, strict: bool) -> Result<bool, ActivityError> {
        match &self.inner.condition {
            None => Ok(true),
            Some(condition) => evaluate_condition(condition, scope, strict)
                .map_err(|e| e.with_source(self.id())),
        }
    }

    pub fn get_state(&self) -> FlowState {
        FlowState {
            id: self.id().to_string(),
            counters: self.counters(),
        }
    }

    pub fn recover(&self, state: &FlowState) {
        self.inner.connection.counters.set(state.counters);
    }
}

// ── Association ──

#[derive(Clone)]
pub struct Association {
    inner: Rc<Connection>,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association").field("id", &self.inner.id).finish()
    }
}

impl Association {
    pub fn new(dto: &AssociationDto) -> Self {
        Self {
            inner: Rc::new(Connection::new(&dto.id, "bpmn:Association", &dto.from, &dto.to)),
        }
    }

    pub(crate) fn connect(&self, target: &Activity) {
        *self.inner.target.borrow_mut() = Some(target.downgrade());
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    pub fn target_id(&self) -> &str {
        &self.inner.target_id
    }

    pub fn counters(&self) -> FlowCounters {
        self.inner.counters.get()
    }

    pub fn take(&self, source: Option<&Content>) {
        self.inner.count(|c| c.take += 1);
        let content = self.inner.inbound_content(source, &[]);
        self.inner.deliver(InboundKind::AssociationTake, content);
    }

    pub fn discard(&self, source: Option<&Content>) {
        self.inner.count(|c| c.discard += 1);
        let content = self.inner.inbound_content(source, &[]);
        self.inner.deliver(InboundKind::AssociationDiscard, content);
    }
}

// ── Conditions ──

/// Evaluate `condition` against `scope`. A missing variable is false unless
/// `strict` is set.
pub fn evaluate_condition(
    condition: &FlowCondition,
    scope: &Map<String, Value>,
    strict: bool,
) -> Result<bool, ActivityError> {
    let Some(actual) = lookup(scope, &condition.variable) else {
        if strict {
            return Err(ActivityError::new(format!(
                "Condition variable {} is not defined",
                condition.variable
            )));
        }
        return Ok(false);
    };

    let result = match (&condition.value, actual) {
        (ConditionValue::Bool(expected), Value::Bool(actual)) => match condition.op {
            ConditionOp::Eq => actual == expected,
            ConditionOp::Neq => actual != expected,
            ConditionOp::Lt | ConditionOp::Gt => {
                return Err(ActivityError::new(format!(
                    "Condition on {} cannot order booleans",
                    condition.variable
                )))
            }
        },
        (ConditionValue::I64(expected), Value::Number(actual)) => {
            let actual = actual.as_i64().ok_or_else(|| {
                ActivityError::new(format!("Condition variable {} is not an integer", condition.variable))
            })?;
            match condition.op {
                ConditionOp::Eq => actual == *expected,
                ConditionOp::Neq => actual != *expected,
                ConditionOp::Lt => actual < *expected,
                ConditionOp::Gt => actual > *expected,
            }
        }
        (ConditionValue::Str(expected), Value::String(actual)) => match condition.op {
            ConditionOp::Eq => actual == expected,
            ConditionOp::Neq => actual != expected,
            ConditionOp::Lt => actual < expected,
            ConditionOp::Gt => actual > expected,
        },
        _ => matches!(condition.op, ConditionOp::Neq),
    };
    Ok(result)
}

/// Dotted lookup, e.g. `output.approved`.
fn lookup<'a>(scope: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = scope.get(segments.next()?)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(variable: &str, op: ConditionOp, value: ConditionValue) -> FlowCondition {
        FlowCondition {
            variable: variable.to_string(),
            op,
            value,
        }
    }

    fn scope() -> Map<String, Value> {
        let value = json!({"approved": true, "amount": 120, "tier": "gold", "output": {"score": 7}});
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn compares_booleans_integers_and_strings() {
        let scope = scope();
        let eval = |c: FlowCondition| evaluate_condition(&c, &scope, false).unwrap();
        assert!(eval(condition("approved", ConditionOp::Eq, ConditionValue::Bool(true))));
        assert!(eval(condition("amount", ConditionOp::Gt, ConditionValue::I64(100))));
        assert!(!eval(condition("amount", ConditionOp::Lt, ConditionValue::I64(100))));
        assert!(eval(condition("tier", ConditionOp::Neq, ConditionValue::Str("silver".into()))));
        assert!(eval(condition("output.score", ConditionOp::Eq, ConditionValue::I64(7))));
    }

    #[test]
    fn missing_variable_is_false_unless_strict() {
        let scope = scope();
        let c = condition("ghost", ConditionOp::Eq, ConditionValue::Bool(true));
        assert!(!evaluate_condition(&c, &scope, false).unwrap());
        let err = evaluate_condition(&c, &scope, true).unwrap_err();
        assert_eq!(err.message, "Condition variable ghost is not defined");
    }

    #[test]
    fn type_mismatch_only_satisfies_not_equal() {
        let scope = scope();
        let eq = condition("tier", ConditionOp::Eq, ConditionValue::I64(1));
        let neq = condition("tier", ConditionOp::Neq, ConditionValue::I64(1));
        assert!(!evaluate_condition(&eq, &scope, false).unwrap());
        assert!(evaluate_condition(&neq, &scope, false).unwrap());
    }

    #[test]
    fn unconditional_flow_passes_and_counts_takes() {
        let flow = SequenceFlow::new(&FlowDto {
            id: "flow1".into(),
            from: "a".into(),
            to: "b".into(),
            condition: None,
            is_default: false,
        });
        assert!(flow.evaluate(&Map::new(), true).unwrap());
        flow.take(&Content::new("a", "bpmn:Task"));
        flow.discard(&Content::new("a", "bpmn:Task"), &["a".to_string()]);
        assert_eq!(flow.counters(), FlowCounters { take: 1, discard: 1 });
    }
}
