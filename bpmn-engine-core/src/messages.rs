//! Message envelope carried by every broker in the engine, plus the pure
//! helpers used to derive message content and parent chains.

use crate::error::ActivityError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

fn is_false(v: &bool) -> bool {
    !v
}

// ── Parent chain ──

/// One ancestor in a parent chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execution_id: String,
}

impl ParentRef {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            execution_id: execution_id.into(),
        }
    }
}

/// Nearest ancestor plus the remaining ancestors, nearest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parent {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<ParentRef>,
}

impl Parent {
    pub fn head(&self) -> ParentRef {
        ParentRef::new(&self.id, &self.kind, &self.execution_id)
    }

    /// Every ancestor, nearest first.
    pub fn chain(&self) -> Vec<ParentRef> {
        let mut chain = Vec::with_capacity(self.path.len() + 1);
        chain.push(self.head());
        chain.extend(self.path.iter().cloned());
        chain
    }
}

impl From<ParentRef> for Parent {
    fn from(r: ParentRef) -> Self {
        Self {
            id: r.id,
            kind: r.kind,
            execution_id: r.execution_id,
            path: Vec::new(),
        }
    }
}

// ── Envelope ──

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fields {
    pub routing_key: String,
    pub exchange: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub redelivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delegate: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub persistent: bool,
}

impl Properties {
    pub fn typed(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn delegated(mut self) -> Self {
        self.delegate = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }
}

/// Message body. Known keys are typed, anything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Parent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActivityError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_root_scope: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Content {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn with_parent(mut self, parent: Option<Parent>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_message(mut self, message: Option<Value>) -> Self {
        self.message = message;
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// `message.id` of the carried message, used for correlation.
    pub fn message_id(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
    }

    /// This content as a parent reference.
    pub fn as_parent_ref(&self) -> ParentRef {
        ParentRef::new(&self.id, &self.kind, &self.execution_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub fields: Fields,
    pub content: Content,
    pub properties: Properties,
}

impl Message {
    pub fn routing_key(&self) -> &str {
        &self.fields.routing_key
    }

    pub fn kind(&self) -> Option<&str> {
        self.properties.kind()
    }
}

// ── Helpers ──

/// Copy `content` and overlay every key of `extend` (an object) on top.
pub fn clone_content(content: &Content, extend: Value) -> Content {
    let Value::Object(extend) = extend else {
        return content.clone();
    };
    let mut merged = match serde_json::to_value(content) {
        Ok(Value::Object(map)) => map,
        _ => return content.clone(),
    };
    for (key, value) in extend {
        merged.insert(key, value);
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or_else(|_| content.clone())
}

/// Drop the nearest ancestor; the next one in `path` becomes the head.
pub fn shift_parent(parent: Option<&Parent>) -> Option<Parent> {
    let parent = parent?;
    let (head, rest) = parent.path.split_first()?;
    let mut shifted = Parent::from(head.clone());
    shifted.path = rest.to_vec();
    Some(shifted)
}

/// Make `adopting` the nearest ancestor, pushing the current head into the
/// path. Adopting the current head again only refreshes its execution id.
pub fn unshift_parent(parent: Option<&Parent>, adopting: &ParentRef) -> Parent {
    let Some(parent) = parent else {
        return Parent::from(adopting.clone());
    };
    if parent.id == adopting.id {
        let mut same = parent.clone();
        if !adopting.execution_id.is_empty() {
            same.execution_id = adopting.execution_id.clone();
        }
        if !adopting.kind.is_empty() {
            same.kind = adopting.kind.clone();
        }
        return same;
    }
    let mut path = Vec::with_capacity(parent.path.len() + 1);
    path.push(parent.head());
    path.extend(parent.path.iter().cloned());
    let mut unshifted = Parent::from(adopting.clone());
    unshifted.path = path;
    unshifted
}

/// Append `ancestor` as the outermost ancestor unless already present.
pub fn push_parent(parent: Option<&Parent>, ancestor: &ParentRef) -> Parent {
    let Some(parent) = parent else {
        return Parent::from(ancestor.clone());
    };
    let mut pushed = parent.clone();
    if pushed.id == ancestor.id {
        if !ancestor.execution_id.is_empty() {
            pushed.execution_id = ancestor.execution_id.clone();
        }
        return pushed;
    }
    if let Some(existing) = pushed.path.iter_mut().find(|p| p.id == ancestor.id) {
        if !ancestor.execution_id.is_empty() {
            existing.execution_id = ancestor.execution_id.clone();
        }
        return pushed;
    }
    pushed.path.push(ancestor.clone());
    pushed
}

/// Routing-safe version of an element id: `.`, `*` and `#` become `_`.
pub fn broker_safe_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '.' | '*' | '#' => '_',
            c => c,
        })
        .collect()
}

/// Short unique id, `<prefix>_<12 hex>`. The tail is the random part of a
/// v7 uuid.
pub fn unique_id(prefix: &str) -> String {
    let simple = Uuid::now_v7().simple().to_string();
    let tail = &simple[simple.len() - 12..];
    format!("{prefix}_{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parent(id: &str, exec: &str, path: &[(&str, &str)]) -> Parent {
        Parent {
            id: id.to_string(),
            kind: String::new(),
            execution_id: exec.to_string(),
            path: path
                .iter()
                .map(|(id, exec)| ParentRef::new(*id, "", *exec))
                .collect(),
        }
    }

    #[test]
    fn shift_parent_promotes_next_ancestor() {
        let p = parent("task", "task_1", &[("process1", "p_1"), ("def1", "d_1")]);
        let shifted = shift_parent(Some(&p)).unwrap();
        assert_eq!(shifted.id, "process1");
        assert_eq!(shifted.execution_id, "p_1");
        assert_eq!(shifted.path, vec![ParentRef::new("def1", "", "d_1")]);
    }

    #[test]
    fn shift_parent_without_path_is_none() {
        assert!(shift_parent(Some(&parent("def1", "d_1", &[]))).is_none());
        assert!(shift_parent(None).is_none());
    }

    #[test]
    fn unshift_parent_pushes_head_into_path() {
        let p = parent("process1", "p_1", &[("def1", "d_1")]);
        let unshifted = unshift_parent(Some(&p), &ParentRef::new("subp", "", "s_1"));
        assert_eq!(unshifted.id, "subp");
        assert_eq!(
            unshifted.path,
            vec![ParentRef::new("process1", "", "p_1"), ParentRef::new("def1", "", "d_1")]
        );
    }

    #[test]
    fn unshift_same_id_refreshes_execution_id() {
        let p = parent("subp", "s_1", &[("process1", "p_1")]);
        let unshifted = unshift_parent(Some(&p), &ParentRef::new("subp", "", "s_1_0"));
        assert_eq!(unshifted.execution_id, "s_1_0");
        assert_eq!(unshifted.path.len(), 1);
    }

    #[test]
    fn push_parent_appends_outermost_once() {
        let p = parent("task", "t_1", &[]);
        let pushed = push_parent(Some(&p), &ParentRef::new("def1", "", "d_1"));
        let again = push_parent(Some(&pushed), &ParentRef::new("def1", "", "d_2"));
        assert_eq!(again.path, vec![ParentRef::new("def1", "", "d_2")]);
    }

    #[test]
    fn broker_safe_id_replaces_routing_characters() {
        assert_eq!(broker_safe_id("a.b*c#d"), "a_b_c_d");
        assert_eq!(broker_safe_id("Escalation_0"), "Escalation_0");
    }

    #[test]
    fn clone_content_overlays_keys() {
        let content = Content::new("task", "bpmn:Task").with_execution_id("task_1");
        let cloned = clone_content(
            &content,
            json!({"executionId": "task_2", "state": "throw", "escalation": {"id": "E"}}),
        );
        assert_eq!(cloned.id, "task");
        assert_eq!(cloned.execution_id, "task_2");
        assert_eq!(cloned.state.as_deref(), Some("throw"));
        assert_eq!(cloned.extra.get("escalation"), Some(&json!({"id": "E"})));
        assert_eq!(content.execution_id, "task_1");
    }

    #[test]
    fn unique_ids_carry_prefix() {
        let a = unique_id("task");
        let b = unique_id("task");
        assert!(a.starts_with("task_"));
        assert_eq!(a.len(), "task_".len() + 12);
        assert_ne!(a, b);
    }

    #[test]
    fn content_message_id_reads_nested_id() {
        let content = Content::default().with_message(Some(json!({"id": "Signal_0"})));
        assert_eq!(content.message_id(), Some("Signal_0"));
        assert_eq!(Content::default().message_id(), None);
    }
}
