//! Token passing inside one scope: a process or a sub-process execution.
//!
//! Children publish their events on their own brokers; a shovel forwards
//! them to the owner's `event` exchange where the scope keeps its books:
//! boundary events are armed and discarded, delegated events are broadcast
//! to the other running children, and completion is detected once every
//! child is idle.

use crate::activity::Activity;
use crate::api::Api;
use crate::authoring::dto::ScopeDto;
use crate::broker::{Broker, ConsumeOptions};
use crate::context::ScopeContext;
use crate::error::ActivityError;
use crate::flows::{Association, SequenceFlow};
use crate::messages::{unshift_parent, Content, Message, Parent, ParentRef};
use crate::state::ProcessExecutionState;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::debug;

/// How a scope execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeOutcome {
    Completed(Option<Value>),
    Discarded,
    Error(ActivityError),
}

type OnComplete = Box<dyn Fn(ScopeOutcome, &Content)>;

#[derive(Default)]
struct ScopeState {
    content: Option<Content>,
    stopped: bool,
    completed: bool,
}

struct ExecutionInner {
    id: String,
    kind: String,
    broker: Broker,
    children: Vec<Activity>,
    flows: Vec<SequenceFlow>,
    associations: Vec<Association>,
    state: RefCell<ScopeState>,
    on_complete: OnComplete,
}

#[derive(Clone)]
pub struct ProcessExecution {
    inner: Rc<ExecutionInner>,
}

#[derive(Clone)]
pub struct WeakProcessExecution {
    inner: Weak<ExecutionInner>,
}

impl WeakProcessExecution {
    pub fn upgrade(&self) -> Option<ProcessExecution> {
        self.inner.upgrade().map(|inner| ProcessExecution { inner })
    }
}

impl std::fmt::Debug for ProcessExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessExecution")
            .field("id", &self.inner.id)
            .field("execution_id", &self.execution_id())
            .finish()
    }
}

impl ProcessExecution {
    /// Build the children of `scope` and wire their flows. `broker` is the
    /// owner's broker; child events are forwarded to its `event` exchange.
    pub fn new(
        owner_id: &str,
        owner_kind: &str,
        broker: &Broker,
        scope: &ScopeDto,
        context: &ScopeContext,
        on_complete: impl Fn(ScopeOutcome, &Content) + 'static,
    ) -> Self {
        let children: Vec<Activity> = scope
            .elements
            .iter()
            .map(|element| Activity::new(element, context))
            .collect();
        for child in &children {
            child.broker().create_shovel("event", "#", broker, "event");
        }
        let find = |id: &str| children.iter().find(|c| c.id() == id);

        let flows = scope
            .flows
            .iter()
            .map(|dto| {
                let flow = SequenceFlow::new(dto);
                if let Some(target) = find(&dto.to) {
                    flow.connect(target);
                    target.add_inbound_flow(&dto.id);
                }
                if let Some(source) = find(&dto.from) {
                    source.add_outbound_flow(flow.clone());
                }
                flow
            })
            .collect();
        let associations = scope
            .associations
            .iter()
            .map(|dto| {
                let association = Association::new(dto);
                if let Some(target) = find(&dto.to) {
                    association.connect(target);
                }
                association
            })
            .collect();

        Self {
            inner: Rc::new(ExecutionInner {
                id: owner_id.to_string(),
                kind: owner_kind.to_string(),
                broker: broker.clone(),
                children,
                flows,
                associations,
                state: RefCell::default(),
                on_complete: Box::new(on_complete),
            }),
        }
    }

    /// Address the execution before it runs, e.g. ahead of a recover.
    pub fn with_content(self, content: &Content) -> Self {
        self.inner.state.borrow_mut().content = Some(content.clone());
        self.adopt_children(content);
        self
    }

    pub fn downgrade(&self) -> WeakProcessExecution {
        WeakProcessExecution {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn execution_id(&self) -> Option<String> {
        self.inner
            .state
            .borrow()
            .content
            .as_ref()
            .map(|c| c.execution_id.clone())
    }

    pub fn content(&self) -> Option<Content> {
        self.inner.state.borrow().content.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inner.state.borrow().completed
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.borrow().stopped
    }

    pub fn get_activities(&self) -> &[Activity] {
        &self.inner.children
    }

    pub fn get_sequence_flows(&self) -> &[SequenceFlow] {
        &self.inner.flows
    }

    pub fn get_associations(&self) -> &[Association] {
        &self.inner.associations
    }

    pub fn get_association_by_id(&self, id: &str) -> Option<&Association> {
        self.inner.associations.iter().find(|a| a.id() == id)
    }

    fn get_child(&self, id: &str) -> Option<&Activity> {
        self.inner.children.iter().find(|c| c.id() == id)
    }

    /// Child activity by id, searching running sub-process scopes too.
    pub fn get_activity_by_id(&self, id: &str) -> Option<Activity> {
        if let Some(child) = self.get_child(id) {
            return Some(child.clone());
        }
        self.inner
            .children
            .iter()
            .flat_map(Activity::get_scopes)
            .find_map(|scope| scope.get_activity_by_id(id))
    }

    /// Running children, in declaration order.
    pub fn get_postponed(&self) -> Vec<Activity> {
        self.inner
            .children
            .iter()
            .filter(|c| c.is_running())
            .cloned()
            .collect()
    }

    fn adopt_children(&self, content: &Content) {
        let parent: Parent = unshift_parent(content.parent.as_ref(), &content.as_parent_ref());
        for child in &self.inner.children {
            child.set_parent(parent.clone());
        }
    }

    fn event_tag(&self) -> String {
        format!("_scope-{}", self.execution_id().unwrap_or_default())
    }

    // ── Run ──

    pub fn execute(&self, content: &Content) {
        {
            let mut state = self.inner.state.borrow_mut();
            state.content = Some(content.clone());
            state.stopped = false;
            state.completed = false;
        }
        debug!(
            process_id = %self.inner.id,
            execution_id = %content.execution_id,
            "execute scope"
        );
        self.adopt_children(content);
        self.subscribe();
        for child in &self.inner.children {
            child.reset();
            child.activate();
        }

        let starters: Vec<Activity> = self
            .inner
            .children
            .iter()
            .filter(|c| c.is_start())
            .cloned()
            .collect();
        if starters.is_empty() {
            self.complete(ScopeOutcome::Completed(None));
            return;
        }
        for starter in starters {
            starter.run(None);
        }
    }

    fn subscribe(&self) {
        let weak = self.downgrade();
        self.inner.broker.subscribe_tmp(
            "event",
            "activity.#",
            move |msg| {
                if let Some(execution) = weak.upgrade() {
                    execution.on_child_event(msg);
                }
            },
            ConsumeOptions::default().tag(self.event_tag()),
        );
    }

    /// The child an event comes from, and whether it is the child's own
    /// event rather than one bubbled up from a nested scope.
    fn source_child(&self, content: &Content, execution_id: &str) -> Option<(usize, bool)> {
        let chain: Vec<ParentRef> = content.parent.as_ref()?.chain();
        let position = chain.iter().position(|p| p.execution_id == execution_id)?;
        let child_id = match position {
            0 => content.id.as_str(),
            n => chain[n - 1].id.as_str(),
        };
        let index = self.inner.children.iter().position(|c| c.id() == child_id)?;
        Some((index, position == 0))
    }

    fn on_child_event(&self, message: &Message) {
        let execution_id = {
            let state = self.inner.state.borrow();
            if state.completed || state.stopped {
                return;
            }
            match &state.content {
                Some(content) => content.execution_id.clone(),
                None => return,
            }
        };
        let Some((index, direct)) = self.source_child(&message.content, &execution_id) else {
            return;
        };
        if message.properties.delegate {
            self.broadcast(message, Some(index));
        }
        if !direct {
            return;
        }

        let child = self.inner.children[index].clone();
        match message.routing_key() {
            "activity.enter" => self.arm_boundaries(&child, &message.content),
            "activity.end" if child.attached_to().is_some() && child.cancel_activity() => {
                let host = child.attached_to().and_then(|id| self.get_child(id)).cloned();
                if let Some(host) = host.filter(Activity::is_running) {
                    debug!(activity_id = %child.id(), host_id = %host.id(), "interrupt host");
                    host.discard();
                }
            }
            "activity.leave" => {
                self.discard_boundaries(&child);
                self.check_complete();
            }
            "activity.error" => {
                let error = message
                    .content
                    .error
                    .clone()
                    .unwrap_or_else(|| ActivityError::new("activity failed").with_source(child.id()));
                self.fail(error);
            }
            _ => {}
        }
    }

    fn boundaries_of(&self, host: &Activity) -> Vec<Activity> {
        self.inner
            .children
            .iter()
            .filter(|c| c.attached_to() == Some(host.id()))
            .cloned()
            .collect()
    }

    fn arm_boundaries(&self, host: &Activity, content: &Content) {
        for boundary in self.boundaries_of(host) {
            if !boundary.is_running() {
                boundary.run(Some(content.clone()));
            }
        }
    }

    fn discard_boundaries(&self, host: &Activity) {
        for boundary in self.boundaries_of(host) {
            if boundary.is_running() {
                boundary.discard();
            }
        }
    }

    /// Send a delegated event to every running child except `exclude`.
    fn broadcast(&self, message: &Message, exclude: Option<usize>) {
        let kind = message.kind().unwrap_or("signal");
        for (index, child) in self.inner.children.iter().enumerate() {
            if Some(index) == exclude || !child.is_running() {
                continue;
            }
            child
                .get_api(None)
                .send_api_message(kind, message.content.message.clone(), true);
        }
    }

    /// Delegate an api message (signal, message, escalation) to the running
    /// children.
    pub fn delegate(&self, message: &Message) {
        if self.is_completed() {
            return;
        }
        self.broadcast(message, None);
    }

    fn check_complete(&self) {
        {
            let state = self.inner.state.borrow();
            if state.completed || state.stopped {
                return;
            }
        }
        if self.inner.children.iter().all(Activity::is_idle) {
            self.complete(ScopeOutcome::Completed(None));
        }
    }

    fn settle(&self) -> Option<Content> {
        let content = {
            let mut state = self.inner.state.borrow_mut();
            if state.completed {
                return None;
            }
            state.completed = true;
            state.content.clone()
        };
        self.inner.broker.cancel(&self.event_tag());
        content
    }

    fn complete(&self, outcome: ScopeOutcome) {
        let Some(content) = self.settle() else { return };
        for child in &self.inner.children {
            child.deactivate();
        }
        debug!(process_id = %self.inner.id, execution_id = %content.execution_id, ?outcome, "scope settled");
        (self.inner.on_complete)(outcome, &content);
    }

    fn fail(&self, error: ActivityError) {
        let Some(content) = self.settle() else { return };
        for child in self.get_postponed() {
            child.discard();
        }
        for child in &self.inner.children {
            child.deactivate();
        }
        debug!(process_id = %self.inner.id, error = %error.message, "scope failed");
        (self.inner.on_complete)(ScopeOutcome::Error(error), &content);
    }

    /// Discard every running child and settle as discarded.
    pub fn discard(&self) {
        let Some(content) = self.settle() else { return };
        for child in self.get_postponed() {
            child.discard();
        }
        for child in &self.inner.children {
            child.deactivate();
        }
        (self.inner.on_complete)(ScopeOutcome::Discarded, &content);
    }

    pub fn stop(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.completed {
                return;
            }
            state.stopped = true;
        }
        self.inner.broker.cancel(&self.event_tag());
        for child in &self.inner.children {
            child.stop();
        }
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.completed || state.content.is_none() {
                return;
            }
            state.stopped = false;
        }
        self.subscribe();
        for child in &self.inner.children {
            child.activate();
            child.resume();
        }
        self.check_complete();
    }

    // ── Api ──

    /// Resolve `content` against the live tree. `path` lists the ancestors
    /// below this scope, outermost first.
    pub fn resolve_api(&self, path: &[ParentRef], content: &Content) -> Option<Api> {
        let Some((head, rest)) = path.split_first() else {
            return self.get_child(&content.id).map(|c| c.get_api(Some(content)));
        };
        let child = self.get_child(&head.id)?;
        if rest.is_empty() && head.id == content.id {
            return Some(child.get_api(Some(content)));
        }
        child
            .get_scopes()
            .into_iter()
            .find(|scope| scope.execution_id().as_deref() == Some(head.execution_id.as_str()))?
            .resolve_api(rest, content)
    }

    // ── State ──

    pub fn get_state(&self) -> ProcessExecutionState {
        let state = self.inner.state.borrow();
        ProcessExecutionState {
            id: self.inner.id.clone(),
            execution_id: state
                .content
                .as_ref()
                .map(|c| c.execution_id.clone())
                .unwrap_or_default(),
            stopped: state.stopped,
            completed: state.completed,
            content: state.content.clone(),
            children: self.inner.children.iter().map(Activity::get_state).collect(),
            flows: self.inner.flows.iter().map(SequenceFlow::get_state).collect(),
        }
    }

    pub fn recover(&self, state: &ProcessExecutionState) {
        {
            let mut scope = self.inner.state.borrow_mut();
            scope.stopped = state.stopped;
            scope.completed = state.completed;
            if state.content.is_some() {
                scope.content = state.content.clone();
            }
        }
        if let Some(content) = &state.content {
            self.adopt_children(content);
        }
        for child_state in &state.children {
            if let Some(child) = self.get_child(&child_state.id) {
                child.recover(child_state);
            }
        }
        for flow_state in &state.flows {
            if let Some(flow) = self.inner.flows.iter().find(|f| f.id() == flow_state.id) {
                flow.recover(flow_state);
            }
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }
}
