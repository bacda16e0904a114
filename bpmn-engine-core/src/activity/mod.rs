//! Activity execution state machine.
//!
//! Every activity owns a broker. Lifecycle steps travel through `run-q`
//! (`run.enter` → `run.start` → `run.execute` → `run.end` | `run.discard` |
//! `run.error` → `run.leave`), consumed one at a time with acknowledgement.
//! `run.execute` stays unacknowledged until the execution settles, so a
//! stopped activity keeps it and gets it redelivered on resume.
//!
//! Each step publishes the next message before acknowledging its own, which
//! keeps `run-q` non-empty for as long as the activity is running.

mod behaviour;
mod execution;

pub use execution::ExecutionApi;

pub(crate) use behaviour::Behaviour;
use execution::{ExecutionProgress, Fanout, Settled};

use crate::api::{Api, ApiTarget};
use crate::authoring::dto::ElementDto;
use crate::broker::{Broker, ConsumeOptions, QueueOptions};
use crate::context::ScopeContext;
use crate::environment::Environment;
use crate::error::ActivityError;
use crate::flows::{InboundKind, SequenceFlow};
use crate::messages::{unique_id, Content, Message, Parent, Properties};
use crate::process::execution::ProcessExecution;
use crate::state::{ActivityCounters, ActivityState, ActivityStatus, JoinArrival, SubExecutionStatus};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

const RUN_Q: &str = "run-q";
const EXECUTION_Q: &str = "execution-q";
const INBOUND_Q: &str = "inbound-q";

const RUN_TAG: &str = "_activity-run";
const EXECUTION_TAG: &str = "_activity-execution";
const API_TAG: &str = "_activity-api";
const INBOUND_TAG: &str = "_run-on-inbound";

#[derive(Default)]
struct RunState {
    status: Option<ActivityStatus>,
    execution_id: Option<String>,
    stopped: bool,
    activated: bool,
    counters: ActivityCounters,
    content: Option<Content>,
    parent: Option<Parent>,
    execute_message: Option<Message>,
    join: Vec<JoinArrival>,
    discard_sequence: Vec<String>,
}

struct ActivityInner {
    element: ElementDto,
    broker: Broker,
    context: ScopeContext,
    behaviour: Behaviour,
    fanout: Fanout,
    inbound: RefCell<Vec<String>>,
    outbound: RefCell<Vec<SequenceFlow>>,
    run: RefCell<RunState>,
    execution: RefCell<Option<ExecutionProgress>>,
}

/// Shared handle to one activity.
#[derive(Clone)]
pub struct Activity {
    inner: Rc<ActivityInner>,
}

#[derive(Clone, Default)]
pub struct WeakActivity {
    inner: Weak<ActivityInner>,
}

impl WeakActivity {
    pub fn upgrade(&self) -> Option<Activity> {
        self.inner.upgrade().map(|inner| Activity { inner })
    }
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id())
            .field("type", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

impl Activity {
    pub fn new(element: &ElementDto, context: &ScopeContext) -> Self {
        let broker = Broker::with_dispatcher(element.id(), context.dispatcher.clone());
        for exchange in ["run", "execution", "api", "event", "inbound"] {
            broker.assert_exchange(exchange);
        }
        broker.assert_queue(RUN_Q, QueueOptions::default());
        broker.bind_queue(RUN_Q, "run", "run.#", 0);
        broker.assert_queue(EXECUTION_Q, QueueOptions::default());
        broker.bind_queue(EXECUTION_Q, "execution", "execute.#", 0);
        broker.assert_queue(INBOUND_Q, QueueOptions::default());
        broker.bind_queue(INBOUND_Q, "inbound", "#", 0);

        let behaviour = Behaviour::new(element, &broker, context);
        let fanout = match (element.multi_instance(), behaviour.event_definitions()) {
            (Some(mi), _) => Fanout::Loop(mi),
            (None, []) => Fanout::Single,
            (None, definitions) => Fanout::Definitions {
                count: definitions.len(),
                throwing: element.is_throwing(),
            },
        };

        Self {
            inner: Rc::new(ActivityInner {
                element: element.clone(),
                broker,
                context: context.clone(),
                behaviour,
                fanout,
                inbound: RefCell::default(),
                outbound: RefCell::default(),
                run: RefCell::default(),
                execution: RefCell::default(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakActivity {
        WeakActivity {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ── Accessors ──

    pub fn id(&self) -> &str {
        self.inner.element.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.element.name()
    }

    pub fn kind(&self) -> &'static str {
        self.inner.element.type_name()
    }

    pub fn element(&self) -> &ElementDto {
        &self.inner.element
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.context.environment
    }

    pub(crate) fn behaviour(&self) -> &Behaviour {
        &self.inner.behaviour
    }

    pub fn attached_to(&self) -> Option<&str> {
        self.inner.element.attached_to()
    }

    pub fn cancel_activity(&self) -> bool {
        match &self.inner.element {
            ElementDto::BoundaryEvent { cancel_activity, .. } => *cancel_activity,
            _ => false,
        }
    }

    pub fn is_for_compensation(&self) -> bool {
        self.inner.element.is_for_compensation()
    }

    /// Runs when the scope starts: nothing flows into it and it is neither
    /// attached nor a compensation handler.
    pub fn is_start(&self) -> bool {
        self.inner.inbound.borrow().is_empty() && self.attached_to().is_none() && !self.is_for_compensation()
    }

    /// Parallel and inclusive gateways with several inbound flows wait for
    /// all of them.
    pub fn is_join(&self) -> bool {
        matches!(
            self.inner.element,
            ElementDto::ParallelGateway { .. } | ElementDto::InclusiveGateway { .. }
        ) && self.inner.inbound.borrow().len() > 1
    }

    pub fn status(&self) -> Option<ActivityStatus> {
        self.inner.run.borrow().status
    }

    pub fn is_running(&self) -> bool {
        self.status().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.run.borrow().stopped
    }

    pub fn execution_id(&self) -> Option<String> {
        self.inner.run.borrow().execution_id.clone()
    }

    pub fn counters(&self) -> ActivityCounters {
        self.inner.run.borrow().counters
    }

    /// Content of the current run.
    pub fn content(&self) -> Option<Content> {
        self.inner.run.borrow().content.clone()
    }

    pub fn get_outbound_flows(&self) -> Vec<SequenceFlow> {
        self.inner.outbound.borrow().clone()
    }

    /// Nested scopes of a running sub-process.
    pub fn get_scopes(&self) -> Vec<ProcessExecution> {
        self.inner.behaviour.scopes()
    }

    pub(crate) fn set_parent(&self, parent: Parent) {
        self.inner.run.borrow_mut().parent = Some(parent);
    }

    pub(crate) fn add_inbound_flow(&self, flow_id: &str) {
        self.inner.inbound.borrow_mut().push(flow_id.to_string());
    }

    pub(crate) fn add_outbound_flow(&self, flow: SequenceFlow) {
        self.inner.outbound.borrow_mut().push(flow);
    }

    /// Nothing running, nothing queued and no join waiting.
    pub(crate) fn is_idle(&self) -> bool {
        let waiting = {
            let run = self.inner.run.borrow();
            run.status.is_some() || !run.join.is_empty()
        };
        !waiting && self.queue_len(RUN_Q) == 0 && self.queue_len(INBOUND_Q) == 0
    }

    /// Drop inbound leftovers of a previous scope run.
    pub(crate) fn reset(&self) {
        if self.is_running() {
            return;
        }
        self.inner.run.borrow_mut().join.clear();
        if let Some(queue) = self.inner.broker.get_queue(INBOUND_Q) {
            queue.purge();
        }
    }

    fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .broker
            .get_queue(queue)
            .map(|q| q.message_count())
            .unwrap_or(0)
    }

    // ── Activation & inbound ──

    /// Start listening for inbound flows.
    pub fn activate(&self) {
        self.inner.run.borrow_mut().activated = true;
        self.consume_inbound();
    }

    pub fn deactivate(&self) {
        self.inner.run.borrow_mut().activated = false;
        self.inner.broker.cancel(INBOUND_TAG);
    }

    /// Called by connected flows and associations.
    pub(crate) fn inbound(&self, kind: InboundKind, content: Content) {
        self.inner
            .broker
            .publish("inbound", kind.routing_key(), content, Properties::typed(kind.routing_key()));
    }

    fn consume_inbound(&self) {
        {
            let run = self.inner.run.borrow();
            if run.status.is_some() || run.stopped || !run.activated {
                return;
            }
        }
        let weak = self.downgrade();
        self.inner.broker.consume(
            INBOUND_Q,
            move |msg| {
                if let Some(activity) = weak.upgrade() {
                    activity.on_inbound(msg);
                }
            },
            ConsumeOptions::default().tag(INBOUND_TAG),
        );
    }

    fn on_inbound(&self, message: &Message) {
        let broker = &self.inner.broker;
        let Some(kind) = InboundKind::from_routing_key(message.routing_key()) else {
            broker.ack(message);
            return;
        };
        let content = message.content.clone();
        match kind {
            InboundKind::AssociationDiscard => broker.ack(message),
            InboundKind::AssociationTake => {
                broker.ack(message);
                broker.cancel(INBOUND_TAG);
                self.run(Some(content));
            }
            InboundKind::FlowTake | InboundKind::FlowDiscard if self.is_join() => {
                self.on_join_arrival(message, kind == InboundKind::FlowTake);
            }
            InboundKind::FlowTake => {
                broker.ack(message);
                broker.cancel(INBOUND_TAG);
                self.run(Some(content));
            }
            InboundKind::FlowDiscard => {
                broker.ack(message);
                let sequence = discard_sequence(&content);
                if sequence.iter().any(|id| id == self.id()) {
                    debug!(activity_id = %self.id(), "discard loop ignored");
                    return;
                }
                broker.cancel(INBOUND_TAG);
                self.start_run(Some(content), Some(sequence));
            }
        }
    }

    fn on_join_arrival(&self, message: &Message, taken: bool) {
        let ready = {
            let inbound = self.inner.inbound.borrow();
            let mut run = self.inner.run.borrow_mut();
            run.join.push(JoinArrival {
                flow_id: message.content.id.clone(),
                taken,
            });
            let complete = inbound
                .iter()
                .all(|flow_id| run.join.iter().any(|a| &a.flow_id == flow_id));
            if complete {
                let mut any_taken = false;
                for flow_id in inbound.iter() {
                    if let Some(idx) = run.join.iter().position(|a| &a.flow_id == flow_id) {
                        any_taken |= run.join.remove(idx).taken;
                    }
                }
                Some(any_taken)
            } else {
                None
            }
        };
        let broker = &self.inner.broker;
        broker.ack(message);
        match ready {
            Some(true) => {
                broker.cancel(INBOUND_TAG);
                self.run(Some(message.content.clone()));
            }
            Some(false) => {
                broker.cancel(INBOUND_TAG);
                self.start_run(Some(message.content.clone()), Some(discard_sequence(&message.content)));
            }
            None => debug!(activity_id = %self.id(), flow_id = %message.content.id, "join pending"),
        }
    }

    // ── Run ──

    pub fn run(&self, content: Option<Content>) {
        self.start_run(content, None);
    }

    fn start_run(&self, inbound: Option<Content>, discard: Option<Vec<String>>) {
        let execution_id = unique_id(self.id());
        let content = {
            let mut run = self.inner.run.borrow_mut();
            if run.status.is_some() {
                drop(run);
                warn!(activity_id = %self.id(), "activity is already running");
                return;
            }
            let mut content = Content::new(self.id(), self.kind())
                .with_execution_id(&execution_id)
                .with_parent(run.parent.clone());
            if let Some(host) = self.attached_to() {
                content.extra.insert("attachedTo".into(), json!(host));
                content
                    .extra
                    .insert("cancelActivity".into(), json!(self.cancel_activity()));
            }
            if let Some(inbound) = &inbound {
                content
                    .extra
                    .insert("inbound".into(), json!([{"id": inbound.id, "type": inbound.kind}]));
            }
            run.status = Some(if discard.is_some() {
                ActivityStatus::Discard
            } else {
                ActivityStatus::Entered
            });
            run.execution_id = Some(execution_id.clone());
            run.stopped = false;
            run.content = Some(content.clone());
            run.discard_sequence = discard.clone().unwrap_or_default();
            content
        };
        *self.inner.execution.borrow_mut() = None;

        self.consume_run();
        self.subscribe_api(&execution_id);
        let routing_key = if discard.is_some() { "run.discard" } else { "run.enter" };
        self.publish_run(routing_key, content);
    }

    fn consume_run(&self) {
        let weak = self.downgrade();
        self.inner.broker.consume(
            RUN_Q,
            move |msg| {
                if let Some(activity) = weak.upgrade() {
                    activity.on_run_message(msg);
                }
            },
            ConsumeOptions::default().tag(RUN_TAG).prefetch(1),
        );
    }

    fn subscribe_api(&self, execution_id: &str) {
        let weak = self.downgrade();
        self.inner.broker.subscribe_tmp(
            "api",
            &format!("activity.*.{execution_id}"),
            move |msg| {
                if let Some(activity) = weak.upgrade() {
                    activity.on_api(msg);
                }
            },
            ConsumeOptions::default().tag(API_TAG),
        );
    }

    fn publish_run(&self, routing_key: &str, content: Content) {
        self.inner
            .broker
            .publish("run", routing_key, content, Properties::default());
    }

    fn publish_event(&self, routing_key: &str, content: &Content) {
        let kind = routing_key.rsplit('.').next().unwrap_or(routing_key);
        self.inner
            .broker
            .publish("event", routing_key, content.clone(), Properties::typed(kind));
    }

    fn set_status(&self, status: Option<ActivityStatus>) {
        self.inner.run.borrow_mut().status = status;
    }

    fn on_run_message(&self, message: &Message) {
        let broker = &self.inner.broker;
        let content = message.content.clone();
        debug!(
            activity_id = %self.id(),
            execution_id = %content.execution_id,
            routing_key = %message.routing_key(),
            "run"
        );
        match message.routing_key() {
            "run.enter" => {
                self.set_status(Some(ActivityStatus::Entered));
                self.publish_event("activity.enter", &content);
                self.publish_run("run.start", content);
                broker.ack(message);
            }
            "run.start" => {
                self.set_status(Some(ActivityStatus::Started));
                self.publish_event("activity.start", &content);
                self.publish_run("run.execute", content);
                broker.ack(message);
            }
            "run.execute" => self.on_execute(message),
            "run.end" => {
                self.set_status(Some(ActivityStatus::Executed));
                if let Some(output) = &content.output {
                    self.environment().set_output(self.id(), output.clone());
                }
                self.publish_event("activity.end", &content);
                match self.take_outbound(&content) {
                    Ok(()) => self.publish_run("run.leave", content),
                    Err(error) => {
                        let mut failed = content;
                        failed.error = Some(error);
                        self.publish_run("run.error", failed);
                    }
                }
                broker.ack(message);
            }
            "run.discard" => {
                self.set_status(Some(ActivityStatus::Discard));
                self.publish_event("activity.discard", &content);
                let sequence = {
                    let run = self.inner.run.borrow();
                    let mut sequence = run.discard_sequence.clone();
                    sequence.push(self.id().to_string());
                    sequence
                };
                for flow in self.get_outbound_flows() {
                    flow.discard(&content, &sequence);
                }
                self.publish_run("run.leave", content);
                broker.ack(message);
            }
            "run.error" => {
                self.set_status(Some(ActivityStatus::Error));
                if let Some(error) = &content.error {
                    warn!(activity_id = %self.id(), error = %error.message, "activity error");
                }
                self.publish_event("activity.error", &content);
                self.publish_run("run.leave", content);
                broker.ack(message);
            }
            "run.leave" => {
                {
                    let mut run = self.inner.run.borrow_mut();
                    match run.status.take() {
                        Some(ActivityStatus::Discard) | Some(ActivityStatus::Error) => run.counters.discarded += 1,
                        _ => run.counters.taken += 1,
                    }
                    run.execute_message = None;
                    run.discard_sequence.clear();
                }
                *self.inner.execution.borrow_mut() = None;
                broker.ack(message);
                broker.cancel(RUN_TAG);
                broker.cancel(API_TAG);
                self.publish_event("activity.leave", &content);
                self.consume_inbound();
            }
            other => {
                warn!(activity_id = %self.id(), routing_key = other, "unknown run message");
                broker.ack(message);
            }
        }
    }

    /// Take or discard every outbound flow after a completed execution.
    fn take_outbound(&self, content: &Content) -> Result<(), ActivityError> {
        let flows = self.get_outbound_flows();
        if flows.is_empty() {
            return Ok(());
        }
        let environment = self.environment();
        let strict = environment.is_strict();
        let mut scope = environment.variables();
        if let Some(output) = &content.output {
            scope.insert("output".into(), output.clone());
        }

        let element = &self.inner.element;
        let parallel = matches!(element, ElementDto::ParallelGateway { .. });
        let mut taken = vec![false; flows.len()];
        if parallel {
            taken.fill(true);
        } else {
            let exclusive = matches!(element, ElementDto::ExclusiveGateway { .. });
            for (idx, flow) in flows.iter().enumerate() {
                if flow.is_default() {
                    continue;
                }
                taken[idx] = flow.evaluate(&scope, strict)?;
                if exclusive && taken[idx] {
                    break;
                }
            }
            if let Some(default_idx) = flows.iter().position(SequenceFlow::is_default) {
                let take_default = if element.is_gateway() {
                    !taken.iter().any(|t| *t)
                } else {
                    !flows
                        .iter()
                        .zip(&taken)
                        .any(|(flow, taken)| *taken && flow.is_conditional())
                };
                taken[default_idx] = take_default;
            }
            if element.is_gateway() && !taken.iter().any(|t| *t) {
                return Err(ActivityError::new(format!("{} no conditional flow taken", self.id()))
                    .with_source(self.id()));
            }
        }

        let discard_sequence = [self.id().to_string()];
        for (flow, take) in flows.iter().zip(taken) {
            if take {
                flow.take(content);
            } else {
                flow.discard(content, &discard_sequence);
            }
        }
        Ok(())
    }

    // ── Execution ──

    fn consume_execution(&self) {
        let weak = self.downgrade();
        self.inner.broker.consume(
            EXECUTION_Q,
            move |msg| {
                if let Some(activity) = weak.upgrade() {
                    activity.on_execution_message(msg);
                }
            },
            ConsumeOptions::no_ack().tag(EXECUTION_TAG),
        );
    }

    fn on_execute(&self, message: &Message) {
        self.set_status(Some(ActivityStatus::Executing));
        let mut root = message.content.clone();
        root.is_root_scope = true;
        self.inner.run.borrow_mut().execute_message = Some(message.clone());

        let previous = {
            let progress = self.inner.execution.borrow();
            progress
                .as_ref()
                .filter(|p| p.root_id() == root.execution_id)
                .map(|p| p.completed)
        };
        if message.fields.redelivered {
            match previous {
                Some(true) => {
                    self.inner.broker.ack(message);
                    return;
                }
                Some(false) => {
                    debug!(activity_id = %self.id(), execution_id = %root.execution_id, "resume execution");
                    self.consume_execution();
                    self.resume_execution();
                    return;
                }
                None => {}
            }
        }

        *self.inner.execution.borrow_mut() = Some(ExecutionProgress::new(root.clone()));
        self.consume_execution();
        self.start_execution(&root);
    }

    fn start_execution(&self, root: &Content) {
        let count = match self.inner.fanout {
            Fanout::Single => {
                self.inner.behaviour.execute(self, root, false);
                return;
            }
            Fanout::Loop(mi) if mi.cardinality == 0 => {
                let mut completed = root.clone();
                completed.output = Some(Value::Array(Vec::new()));
                self.finish("execute.completed", completed);
                return;
            }
            Fanout::Loop(mi) if mi.sequential => 1,
            Fanout::Loop(mi) => mi.cardinality,
            Fanout::Definitions { count, .. } => count,
        };
        for index in 0..count {
            self.start_sub(index);
        }
    }

    fn start_sub(&self, index: usize) {
        let content = {
            let mut progress = self.inner.execution.borrow_mut();
            let Some(progress) = progress.as_mut() else { return };
            progress.start_sub(index)
        };
        self.inner.behaviour.execute(self, &content, false);
    }

    fn resume_execution(&self) {
        let (root, running) = {
            let progress = self.inner.execution.borrow();
            let Some(progress) = progress.as_ref() else { return };
            let running: Vec<Content> = progress
                .running()
                .iter()
                .map(|s| progress.sub_content(s.index))
                .collect();
            (progress.root.clone(), running)
        };
        if self.inner.fanout == Fanout::Single {
            self.inner.behaviour.execute(self, &root, true);
            return;
        }
        if running.is_empty() {
            self.on_sub_settled();
            return;
        }
        for content in running {
            self.inner.behaviour.execute(self, &content, true);
        }
    }

    fn on_execution_message(&self, message: &Message) {
        let routing_key = message.routing_key();
        let execution_id = message.content.execution_id.as_str();
        let (root, sub) = {
            let progress = self.inner.execution.borrow();
            let Some(progress) = progress.as_ref().filter(|p| !p.completed) else { return };
            let sub = progress
                .subs
                .iter()
                .find(|s| s.execution_id == execution_id && s.status == SubExecutionStatus::Running)
                .map(|s| progress.sub_content(s.index));
            (progress.root.clone(), sub)
        };

        if execution_id == root.execution_id {
            match routing_key {
                "execute.completed" | "execute.error" => self.finish(routing_key, message.content.clone()),
                "execute.discard" | "execute.cancel" => self.finish("execute.discard", message.content.clone()),
                _ => {}
            }
            return;
        }

        let Some(sub) = sub else { return };
        let status = match routing_key {
            "execute.completed" => SubExecutionStatus::Completed,
            "execute.discard" | "execute.cancel" => SubExecutionStatus::Discarded,
            "execute.error" => {
                let mut failed = root;
                failed.error = message.content.error.clone();
                self.finish("execute.error", failed);
                return;
            }
            _ => return,
        };
        {
            let mut progress = self.inner.execution.borrow_mut();
            if let Some(state) = progress.as_mut().and_then(|p| p.sub_mut(execution_id)) {
                state.status = status;
                state.output = message.content.output.clone();
            }
        }
        self.inner
            .behaviour
            .cleanup(self, &sub, status == SubExecutionStatus::Completed);
        self.on_sub_settled();
    }

    fn on_sub_settled(&self) {
        let (settled, root) = {
            let progress = self.inner.execution.borrow();
            let Some(progress) = progress.as_ref().filter(|p| !p.completed) else { return };
            (progress.settle(self.inner.fanout), progress.root.clone())
        };
        match settled {
            Settled::Pending => {}
            Settled::StartNext(index) => self.start_sub(index),
            Settled::Completed(output) => {
                let mut completed = root;
                completed.output = output;
                self.finish("execute.completed", completed);
            }
            Settled::Discarded => self.finish("execute.discard", root),
        }
    }

    /// Settle the root execution and move the run on.
    fn finish(&self, routing_key: &str, content: Content) {
        let (root, running) = {
            let mut progress = self.inner.execution.borrow_mut();
            let Some(progress) = progress.as_mut() else { return };
            if progress.completed {
                return;
            }
            progress.completed = true;
            let running: Vec<usize> = progress.running().iter().map(|s| s.index).collect();
            let contents: Vec<Content> = running.iter().map(|i| progress.sub_content(*i)).collect();
            for sub in progress.subs.iter_mut() {
                if sub.status == SubExecutionStatus::Running {
                    sub.status = SubExecutionStatus::Discarded;
                }
            }
            (progress.root.clone(), contents)
        };
        let broker = &self.inner.broker;
        broker.cancel(EXECUTION_TAG);
        for sub in &running {
            self.inner.behaviour.cleanup(self, sub, false);
        }
        let completed = routing_key == "execute.completed";
        self.inner.behaviour.cleanup(self, &root, completed);

        let next = match routing_key {
            "execute.completed" => "run.end",
            "execute.discard" => "run.discard",
            _ => "run.error",
        };
        let mut run_content = content;
        run_content.execution_id = root.execution_id.clone();
        run_content.index = None;
        run_content.is_root_scope = false;
        run_content.parent = root.parent.clone();
        self.publish_run(next, run_content);

        let execute_message = self.inner.run.borrow_mut().execute_message.take();
        if let Some(message) = execute_message {
            broker.ack(&message);
        }
    }

    // ── Api ──

    fn on_api(&self, message: &Message) {
        match message.kind() {
            Some("stop") => self.stop(),
            Some("discard") => self.discard_run(),
            Some("error") => {
                let error = message
                    .content
                    .error
                    .clone()
                    .unwrap_or_else(|| ActivityError::new("failed"))
                    .with_source(self.id());
                self.fail_run(error);
            }
            _ => {}
        }
    }

    fn discard_run(&self) {
        match self.status() {
            Some(ActivityStatus::Executing) => {
                let root = self.inner.execution.borrow().as_ref().map(|p| p.root.clone());
                if let Some(root) = root {
                    self.inner
                        .broker
                        .publish("execution", "execute.discard", root, Properties::default());
                }
            }
            Some(ActivityStatus::Entered) | Some(ActivityStatus::Started) => {
                if let Some(queue) = self.inner.broker.get_queue(RUN_Q) {
                    queue.purge();
                }
                if let Some(content) = self.content() {
                    self.set_status(Some(ActivityStatus::Discard));
                    self.publish_run("run.discard", content);
                }
            }
            _ => {}
        }
    }

    fn fail_run(&self, error: ActivityError) {
        if self.status() != Some(ActivityStatus::Executing) {
            return;
        }
        let root = self.inner.execution.borrow().as_ref().map(|p| p.root.clone());
        if let Some(mut root) = root {
            root.error = Some(error);
            self.inner
                .broker
                .publish("execution", "execute.error", root, Properties::default());
        }
    }

    /// Api bound to `content`, or to the current run.
    pub fn get_api(&self, content: Option<&Content>) -> Api {
        let content = content
            .cloned()
            .or_else(|| self.content())
            .unwrap_or_else(|| Content::new(self.id(), self.kind()));
        Api::new(ApiTarget::Activity, self.inner.broker.clone(), content)
    }

    pub fn signal(&self, message: Option<Value>) {
        self.get_api(None).signal(message);
    }

    /// Discard the running activity; an idle activity runs its discard path.
    pub fn discard(&self) {
        if self.is_running() {
            self.get_api(None).discard();
        } else {
            self.start_run(None, Some(Vec::new()));
        }
    }

    /// Running loop iterations or event definition executions; the root
    /// execution for everything else.
    pub fn get_executing(&self) -> Vec<ExecutionApi> {
        let contents: Vec<Content> = {
            let progress = self.inner.execution.borrow();
            let Some(progress) = progress.as_ref().filter(|p| !p.completed) else {
                return Vec::new();
            };
            match self.inner.fanout {
                Fanout::Single => vec![progress.root.clone()],
                _ => progress
                    .running()
                    .iter()
                    .map(|s| progress.sub_content(s.index))
                    .collect(),
            }
        };
        contents
            .into_iter()
            .map(|content| ExecutionApi::new(self, content))
            .collect()
    }

    pub(crate) fn cancel_execution(&self, execution_id: &str) {
        let content = {
            let progress = self.inner.execution.borrow();
            let Some(progress) = progress.as_ref().filter(|p| !p.completed) else { return };
            if progress.root_id() == execution_id {
                Some(progress.root.clone())
            } else {
                progress
                    .running()
                    .iter()
                    .find(|s| s.execution_id == execution_id)
                    .map(|s| progress.sub_content(s.index))
            }
        };
        let Some(content) = content else { return };
        debug!(activity_id = %self.id(), execution_id, "cancel execution");
        self.inner
            .broker
            .publish("execution", "execute.cancel", content, Properties::default());
    }

    // ── Stop, resume, state ──

    /// Cancel every consumer. The in-flight run message and queued inbound
    /// messages stay.
    pub fn stop(&self) {
        let (running, content) = {
            let mut run = self.inner.run.borrow_mut();
            run.stopped = true;
            (run.status.is_some(), run.content.clone())
        };
        let live: Vec<String> = {
            let progress = self.inner.execution.borrow();
            match progress.as_ref().filter(|p| !p.completed) {
                Some(progress) => std::iter::once(progress.root_id().to_string())
                    .chain(progress.running().iter().map(|s| s.execution_id.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        let broker = &self.inner.broker;
        broker.cancel(RUN_TAG);
        broker.cancel(API_TAG);
        broker.cancel(EXECUTION_TAG);
        broker.cancel(INBOUND_TAG);
        self.inner.behaviour.stop(self, &live);
        if running {
            if let Some(content) = content {
                debug!(activity_id = %self.id(), execution_id = %content.execution_id, "stop");
                self.publish_event("activity.stop", &content);
            }
        }
    }

    pub fn resume(&self) {
        let (status, execution_id) = {
            let mut run = self.inner.run.borrow_mut();
            run.stopped = false;
            (run.status, run.execution_id.clone())
        };
        if status.is_some() {
            if let Some(execution_id) = execution_id {
                self.subscribe_api(&execution_id);
            }
            self.consume_run();
        } else {
            self.consume_inbound();
        }
    }

    pub fn get_state(&self) -> ActivityState {
        let progress = self.inner.execution.borrow().clone();
        let execution = progress.map(|p| p.to_state(self.inner.behaviour.scope_states()));
        let run = self.inner.run.borrow();
        ActivityState {
            id: self.id().to_string(),
            kind: self.kind().to_string(),
            status: run.status,
            execution_id: run.execution_id.clone(),
            stopped: run.stopped,
            counters: run.counters,
            broker: Some(self.inner.broker.get_state()),
            execution,
            join: run.join.clone(),
        }
    }

    /// Rehydrate a stopped or idle activity. Consumers are re-established by
    /// [`Activity::resume`].
    pub fn recover(&self, state: &ActivityState) {
        if self.is_running() && !self.is_stopped() {
            warn!(activity_id = %self.id(), "cannot recover running activity");
            return;
        }
        if let Some(broker) = &state.broker {
            self.inner.broker.recover(broker);
        }
        let run_content = state
            .execution
            .as_ref()
            .map(|e| {
                let mut content = e.content.clone();
                content.is_root_scope = false;
                content
            })
            .or_else(|| {
                self.inner
                    .broker
                    .get_queue(RUN_Q)
                    .and_then(|q| q.peek())
                    .map(|m| m.content)
            });
        {
            let mut run = self.inner.run.borrow_mut();
            run.status = state.status;
            run.execution_id = state.execution_id.clone();
            run.stopped = state.stopped;
            run.counters = state.counters;
            run.join = state.join.clone();
            run.content = run_content;
        }
        *self.inner.execution.borrow_mut() = state.execution.as_ref().map(ExecutionProgress::from_state);
        if let Some(execution) = &state.execution {
            self.inner.behaviour.recover_scopes(self, &execution.scopes);
        }
    }
}

fn discard_sequence(content: &Content) -> Vec<String> {
    content
        .extra
        .get("discardSequence")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}
