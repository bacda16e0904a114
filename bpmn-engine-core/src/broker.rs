//! In-process topic broker.
//!
//! Every definition, process and activity owns a [`Broker`]. Brokers in one
//! tree share a [`Dispatcher`] so that deliveries are serialised: a handler
//! never runs inside another handler, and anything published from a handler
//! is delivered after it returns.

use crate::error::BrokerError;
use crate::messages::{Content, Fields, Message, Properties};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

pub type Handler = Rc<dyn Fn(&Message)>;

fn default_true() -> bool {
    true
}

// ── Options ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

impl QueueOptions {
    pub fn temporary() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub consumer_tag: Option<String>,
    /// Unacknowledged messages allowed in flight; `0` means one.
    pub prefetch: usize,
    once: bool,
}

impl ConsumeOptions {
    pub fn no_ack() -> Self {
        Self {
            no_ack: true,
            ..Self::default()
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }
}

// ── Dispatcher ──

struct Delivery {
    broker: Weak<RefCell<BrokerInner>>,
    queue: String,
}

#[derive(Default)]
struct DispatcherInner {
    pending: RefCell<VecDeque<Delivery>>,
    draining: Cell<bool>,
}

/// Delivery scheduler shared by every broker of one definition tree.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Rc<DispatcherInner>,
}

struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("draining", &self.is_draining())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.get()
    }

    fn schedule(&self, broker: &Rc<RefCell<BrokerInner>>, queue: &str) {
        self.inner.pending.borrow_mut().push_back(Delivery {
            broker: Rc::downgrade(broker),
            queue: queue.to_string(),
        });
    }

    /// Run deliveries until nothing is left. A nested call is a no-op; the
    /// outer loop picks up whatever was scheduled.
    pub fn drain(&self) {
        if self.inner.draining.replace(true) {
            return;
        }
        let _guard = DrainGuard(&self.inner.draining);
        loop {
            let next = self.inner.pending.borrow_mut().pop_front();
            let Some(delivery) = next else { break };
            if let Some(inner) = delivery.broker.upgrade() {
                let broker = Broker {
                    inner,
                    dispatcher: self.clone(),
                };
                broker.deliver_next(&delivery.queue);
            }
        }
    }
}

// ── Internals ──

struct Binding {
    queue: String,
    pattern: String,
    priority: i32,
}

struct Exchange {
    name: String,
    bindings: Vec<Binding>,
}

struct QueuedMessage {
    message: Message,
    pending: Option<String>,
}

struct Queue {
    name: String,
    options: QueueOptions,
    messages: VecDeque<QueuedMessage>,
}

struct Consumer {
    tag: String,
    queue: String,
    handler: Handler,
    no_ack: bool,
    prefetch: usize,
    once: bool,
}

struct Shovel {
    source_exchange: String,
    pattern: String,
    destination: WeakBroker,
    destination_exchange: String,
}

struct BrokerInner {
    owner: String,
    exchanges: Vec<Exchange>,
    queues: Vec<Queue>,
    consumers: Vec<Consumer>,
    shovels: Vec<Shovel>,
    sequence: u64,
}

enum Settle {
    Ack,
    Requeue,
    Drop,
}

impl BrokerInner {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn assert_queue(&mut self, name: &str, options: QueueOptions) {
        if !self.queues.iter().any(|q| q.name == name) {
            self.queues.push(Queue {
                name: name.to_string(),
                options,
                messages: VecDeque::new(),
            });
        }
    }

    fn exchange_mut(&mut self, name: &str) -> &mut Exchange {
        let idx = match self.exchanges.iter().position(|e| e.name == name) {
            Some(idx) => idx,
            None => {
                self.exchanges.push(Exchange {
                    name: name.to_string(),
                    bindings: Vec::new(),
                });
                self.exchanges.len() - 1
            }
        };
        &mut self.exchanges[idx]
    }

    fn pending_count(&self, tag: &str) -> usize {
        self.queues
            .iter()
            .flat_map(|q| q.messages.iter())
            .filter(|m| m.pending.as_deref() == Some(tag))
            .count()
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.retain(|q| q.name != name);
        self.consumers.retain(|c| c.queue != name);
        for exchange in &mut self.exchanges {
            exchange.bindings.retain(|b| b.queue != name);
        }
    }

    /// Unregister a consumer, returning its pending messages to the queue.
    fn remove_consumer(&mut self, tag: &str) -> Option<String> {
        let idx = self.consumers.iter().position(|c| c.tag == tag)?;
        let consumer = self.consumers.remove(idx);
        if let Some(queue) = self.queues.iter_mut().find(|q| q.name == consumer.queue) {
            for entry in queue
                .messages
                .iter_mut()
                .filter(|m| m.pending.as_deref() == Some(tag))
            {
                entry.pending = None;
                entry.message.fields.redelivered = true;
            }
        }
        let auto_delete = self
            .queues
            .iter()
            .any(|q| q.name == consumer.queue && q.options.auto_delete);
        if auto_delete && !self.consumers.iter().any(|c| c.queue == consumer.queue) {
            self.delete_queue(&consumer.queue);
        }
        Some(consumer.queue)
    }

    /// Pick the next deliverable message for `queue_name` and the consumer
    /// that should get it.
    fn take_next(&mut self, queue_name: &str) -> Option<(Handler, Message)> {
        let queue_idx = self.queues.iter().position(|q| q.name == queue_name)?;
        let message_idx = self.queues[queue_idx]
            .messages
            .iter()
            .position(|m| m.pending.is_none())?;
        let consumer_idx = self.consumers.iter().position(|c| {
            c.queue == queue_name && (c.no_ack || self.pending_count(&c.tag) < c.prefetch)
        })?;

        let consumer = &self.consumers[consumer_idx];
        let tag = consumer.tag.clone();
        let handler = consumer.handler.clone();
        let no_ack = consumer.no_ack;
        let once = consumer.once;

        let queue = &mut self.queues[queue_idx];
        let mut message = if no_ack {
            queue.messages.remove(message_idx)?.message
        } else {
            let entry = &mut queue.messages[message_idx];
            entry.pending = Some(tag.clone());
            entry.message.clone()
        };
        message.fields.consumer_tag = Some(tag.clone());
        if once {
            self.remove_consumer(&tag);
        }
        Some((handler, message))
    }

    fn settle(&mut self, queue_name: &str, message_id: &str, settle: Settle) -> bool {
        let Some(queue) = self.queues.iter_mut().find(|q| q.name == queue_name) else {
            return false;
        };
        let Some(idx) = queue
            .messages
            .iter()
            .position(|m| m.pending.is_some() && m.message.properties.message_id == message_id)
        else {
            return false;
        };
        match settle {
            Settle::Ack | Settle::Drop => {
                queue.messages.remove(idx);
            }
            Settle::Requeue => {
                let entry = &mut queue.messages[idx];
                entry.pending = None;
                entry.message.fields.redelivered = true;
            }
        }
        true
    }
}

// ── Public handles ──

/// Shared handle to one broker.
#[derive(Clone)]
pub struct Broker {
    inner: Rc<RefCell<BrokerInner>>,
    dispatcher: Dispatcher,
}

/// Non-owning broker handle, used by shovels and by handlers that must not
/// keep their own broker alive.
#[derive(Clone)]
pub struct WeakBroker {
    inner: Weak<RefCell<BrokerInner>>,
    dispatcher: Dispatcher,
}

impl WeakBroker {
    pub fn upgrade(&self) -> Option<Broker> {
        self.inner.upgrade().map(|inner| Broker {
            inner,
            dispatcher: self.dispatcher.clone(),
        })
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("owner", &self.owner()).finish()
    }
}

impl Broker {
    pub fn new(owner: impl Into<String>) -> Self {
        Self::with_dispatcher(owner, Dispatcher::new())
    }

    pub fn with_dispatcher(owner: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BrokerInner {
                owner: owner.into(),
                exchanges: Vec::new(),
                queues: Vec::new(),
                consumers: Vec::new(),
                shovels: Vec::new(),
                sequence: 0,
            })),
            dispatcher,
        }
    }

    pub fn owner(&self) -> String {
        self.inner.borrow().owner.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn downgrade(&self) -> WeakBroker {
        WeakBroker {
            inner: Rc::downgrade(&self.inner),
            dispatcher: self.dispatcher.clone(),
        }
    }

    pub fn assert_exchange(&self, name: &str) {
        self.inner.borrow_mut().exchange_mut(name);
    }

    pub fn assert_queue(&self, name: &str, options: QueueOptions) -> QueueHandle {
        self.inner.borrow_mut().assert_queue(name, options);
        QueueHandle {
            broker: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn get_queue(&self, name: &str) -> Option<QueueHandle> {
        let exists = self.inner.borrow().queues.iter().any(|q| q.name == name);
        exists.then(|| QueueHandle {
            broker: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn delete_queue(&self, name: &str) {
        self.inner.borrow_mut().delete_queue(name);
    }

    /// Bind `queue` to `exchange`; higher `priority` bindings receive first.
    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str, priority: i32) {
        let mut inner = self.inner.borrow_mut();
        inner.assert_queue(queue, QueueOptions::default());
        let exchange = inner.exchange_mut(exchange);
        if exchange
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern)
        {
            return;
        }
        exchange.bindings.push(Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
            priority,
        });
        exchange.bindings.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn unbind_queue(&self, queue: &str, exchange: &str, pattern: &str) {
        let mut inner = self.inner.borrow_mut();
        if let Some(exchange) = inner.exchanges.iter_mut().find(|e| e.name == exchange) {
            exchange
                .bindings
                .retain(|b| !(b.queue == queue && b.pattern == pattern));
        }
    }

    /// Forward every message published on `source_exchange` matching
    /// `pattern` to `destination`'s `destination_exchange`.
    pub fn create_shovel(
        &self,
        source_exchange: &str,
        pattern: &str,
        destination: &Broker,
        destination_exchange: &str,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.exchange_mut(source_exchange);
        inner.shovels.push(Shovel {
            source_exchange: source_exchange.to_string(),
            pattern: pattern.to_string(),
            destination: destination.downgrade(),
            destination_exchange: destination_exchange.to_string(),
        });
    }

    /// Publish and log undelivered mandatory errors.
    pub fn publish(&self, exchange: &str, routing_key: &str, content: Content, properties: Properties) {
        if let Err(err) = self.try_publish(exchange, routing_key, content, properties) {
            warn!(owner = %self.owner(), routing_key, error = %err, "undelivered message");
        }
    }

    pub fn try_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Content,
        properties: Properties,
    ) -> Result<(), BrokerError> {
        let result = self.route(exchange, routing_key, content, properties);
        self.dispatcher.drain();
        result
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Content,
        mut properties: Properties,
    ) -> Result<(), BrokerError> {
        let (targets, shovels, message) = {
            let mut inner = self.inner.borrow_mut();
            if properties.message_id.is_empty() {
                let seq = inner.next_sequence();
                properties.message_id = format!("{}.{}", inner.owner, seq);
            }
            let mut targets: Vec<String> = Vec::new();
            if let Some(ex) = inner.exchanges.iter().find(|e| e.name == exchange) {
                for binding in &ex.bindings {
                    if topic_matches(&binding.pattern, routing_key) && !targets.contains(&binding.queue) {
                        targets.push(binding.queue.clone());
                    }
                }
            }
            let message = Message {
                fields: Fields {
                    routing_key: routing_key.to_string(),
                    exchange: exchange.to_string(),
                    ..Fields::default()
                },
                content,
                properties,
            };
            targets.retain(|name| inner.queues.iter().any(|q| &q.name == name));
            for name in &targets {
                if let Some(queue) = inner.queues.iter_mut().find(|q| &q.name == name) {
                    let mut queued = message.clone();
                    queued.fields.queue = Some(name.clone());
                    queue.messages.push_back(QueuedMessage {
                        message: queued,
                        pending: None,
                    });
                }
            }
            let shovels: Vec<(WeakBroker, String)> = inner
                .shovels
                .iter()
                .filter(|s| s.source_exchange == exchange && topic_matches(&s.pattern, routing_key))
                .map(|s| (s.destination.clone(), s.destination_exchange.clone()))
                .collect();
            (targets, shovels, message)
        };

        for name in &targets {
            self.dispatcher.schedule(&self.inner, name);
        }

        let mut forwarded = false;
        for (destination, destination_exchange) in shovels {
            let Some(broker) = destination.upgrade() else { continue };
            forwarded = true;
            let mut properties = message.properties.clone();
            properties.message_id.clear();
            properties.mandatory = false;
            broker.route(
                &destination_exchange,
                routing_key,
                message.content.clone(),
                properties,
            )?;
        }

        if targets.is_empty()
            && !forwarded
            && message.properties.mandatory
            && message.properties.kind() == Some("error")
        {
            return Err(BrokerError::Undelivered {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    fn deliver_next(&self, queue: &str) {
        let next = self.inner.borrow_mut().take_next(queue);
        let Some((handler, message)) = next else { return };
        debug!(
            owner = %self.owner(),
            routing_key = %message.fields.routing_key,
            consumer_tag = ?message.fields.consumer_tag,
            "deliver"
        );
        handler(&message);
        self.dispatcher.schedule(&self.inner, queue);
    }

    /// Register a consumer on `queue` and return its tag. Re-consuming with
    /// a tag that already consumes the same queue is a no-op.
    pub fn consume(
        &self,
        queue: &str,
        handler: impl Fn(&Message) + 'static,
        options: ConsumeOptions,
    ) -> String {
        let tag = {
            let mut inner = self.inner.borrow_mut();
            inner.assert_queue(queue, QueueOptions::default());
            let tag = match options.consumer_tag {
                Some(tag) => tag,
                None => format!("smq.ctag-{}", inner.next_sequence()),
            };
            match inner.consumers.iter().find(|c| c.tag == tag).map(|c| c.queue == queue) {
                Some(true) => return tag,
                Some(false) => {
                    inner.remove_consumer(&tag);
                    inner.assert_queue(queue, QueueOptions::default());
                }
                None => {}
            }
            inner.consumers.push(Consumer {
                tag: tag.clone(),
                queue: queue.to_string(),
                handler: Rc::new(handler),
                no_ack: options.no_ack,
                prefetch: options.prefetch.max(1),
                once: options.once,
            });
            tag
        };
        self.dispatcher.schedule(&self.inner, queue);
        self.dispatcher.drain();
        tag
    }

    /// Consume a fresh auto-delete queue bound to `exchange` with `pattern`.
    pub fn subscribe_tmp(
        &self,
        exchange: &str,
        pattern: &str,
        handler: impl Fn(&Message) + 'static,
        options: ConsumeOptions,
    ) -> String {
        let (queue, tag) = {
            let mut inner = self.inner.borrow_mut();
            let seq = inner.next_sequence();
            let tag = options
                .consumer_tag
                .clone()
                .unwrap_or_else(|| format!("smq.ctag-{seq}"));
            (format!("{}.tmp-{seq}", inner.owner), tag)
        };
        self.assert_queue(&queue, QueueOptions::temporary());
        self.bind_queue(&queue, exchange, pattern, 0);
        let options = ConsumeOptions {
            no_ack: true,
            consumer_tag: Some(tag),
            ..options
        };
        self.consume(&queue, handler, options)
    }

    /// Like [`Broker::subscribe_tmp`] but cancelled after the first delivery.
    pub fn subscribe_once(
        &self,
        exchange: &str,
        pattern: &str,
        handler: impl Fn(&Message) + 'static,
        options: ConsumeOptions,
    ) -> String {
        let options = ConsumeOptions {
            once: true,
            ..options
        };
        self.subscribe_tmp(exchange, pattern, handler, options)
    }

    /// Unregister `tag`; its unacknowledged messages go back to the queue.
    pub fn cancel(&self, tag: &str) -> bool {
        let queue = self.inner.borrow_mut().remove_consumer(tag);
        match queue {
            Some(queue) => {
                self.dispatcher.schedule(&self.inner, &queue);
                self.dispatcher.drain();
                true
            }
            None => false,
        }
    }

    pub fn has_consumer(&self, tag: &str) -> bool {
        self.inner.borrow().consumers.iter().any(|c| c.tag == tag)
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.borrow().consumers.len()
    }

    pub fn ack(&self, message: &Message) {
        self.settle(message, Settle::Ack);
    }

    pub fn nack(&self, message: &Message, requeue: bool) {
        self.settle(message, if requeue { Settle::Requeue } else { Settle::Drop });
    }

    fn settle(&self, message: &Message, settle: Settle) {
        let Some(queue) = message.fields.queue.as_deref() else { return };
        let settled = self
            .inner
            .borrow_mut()
            .settle(queue, &message.properties.message_id, settle);
        if settled {
            self.dispatcher.schedule(&self.inner, queue);
            self.dispatcher.drain();
        }
    }

    // ── State ──

    /// Durable queues and their messages. Pending messages are stored as
    /// redelivered.
    pub fn get_state(&self) -> BrokerState {
        let inner = self.inner.borrow();
        let queues = inner
            .queues
            .iter()
            .filter(|q| q.options.durable)
            .map(|q| QueueState {
                name: q.name.clone(),
                options: q.options,
                messages: q
                    .messages
                    .iter()
                    .map(|m| {
                        let mut message = m.message.clone();
                        if m.pending.is_some() {
                            message.fields.redelivered = true;
                        }
                        message.fields.consumer_tag = None;
                        message
                    })
                    .collect(),
            })
            .collect();
        BrokerState { queues }
    }

    /// Replace queue contents with `state`. Bindings are left untouched.
    pub fn recover(&self, state: &BrokerState) {
        {
            let mut inner = self.inner.borrow_mut();
            for queue_state in &state.queues {
                inner.assert_queue(&queue_state.name, queue_state.options);
                if let Some(queue) = inner.queues.iter_mut().find(|q| q.name == queue_state.name) {
                    queue.messages = queue_state
                        .messages
                        .iter()
                        .map(|m| {
                            let mut message = m.clone();
                            message.fields.queue = Some(queue_state.name.clone());
                            QueuedMessage {
                                message,
                                pending: None,
                            }
                        })
                        .collect();
                }
            }
        }
        for queue_state in &state.queues {
            self.dispatcher.schedule(&self.inner, &queue_state.name);
        }
        self.dispatcher.drain();
    }
}

/// Handle to a named queue of a broker.
#[derive(Clone)]
pub struct QueueHandle {
    broker: Broker,
    name: String,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn with_queue<T>(&self, f: impl FnOnce(&Queue) -> T) -> Option<T> {
        let inner = self.broker.inner.borrow();
        inner.queues.iter().find(|q| q.name == self.name).map(f)
    }

    pub fn message_count(&self) -> usize {
        self.with_queue(|q| q.messages.len()).unwrap_or(0)
    }

    pub fn consumer_count(&self) -> usize {
        let inner = self.broker.inner.borrow();
        inner.consumers.iter().filter(|c| c.queue == self.name).count()
    }

    pub fn peek(&self) -> Option<Message> {
        self.with_queue(|q| q.messages.front().map(|m| m.message.clone()))
            .flatten()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.with_queue(|q| q.messages.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove and return the first queued, unacknowledged message accepted
    /// by `predicate`.
    pub fn take(&self, predicate: impl Fn(&Message) -> bool) -> Option<Message> {
        let mut inner = self.broker.inner.borrow_mut();
        let queue = inner.queues.iter_mut().find(|q| q.name == self.name)?;
        let idx = queue
            .messages
            .iter()
            .position(|m| m.pending.is_none() && predicate(&m.message))?;
        queue.messages.remove(idx).map(|m| m.message)
    }

    pub fn purge(&self) {
        let mut inner = self.broker.inner.borrow_mut();
        if let Some(queue) = inner.queues.iter_mut().find(|q| q.name == self.name) {
            queue.messages.clear();
        }
    }

    pub fn consume(&self, handler: impl Fn(&Message) + 'static, options: ConsumeOptions) -> String {
        self.broker.consume(&self.name, handler, options)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerState {
    pub queues: Vec<QueueState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub name: String,
    #[serde(default)]
    pub options: QueueOptions,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Topic matching: `*` is exactly one segment, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_segments(&pattern, &key)
}

fn matches_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_segments(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && matches_segments(rest, &key[1..]),
        Some((segment, rest)) => key.first() == Some(segment) && matches_segments(rest, &key[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Rc<RefCell<Vec<String>>>, impl Fn(&Message) + 'static) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |msg: &Message| {
            sink.borrow_mut().push(msg.fields.routing_key.clone())
        })
    }

    fn broker_with_run_queue() -> Broker {
        let broker = Broker::new("test");
        broker.assert_exchange("run");
        broker.assert_queue("run-q", QueueOptions::default());
        broker.bind_queue("run-q", "run", "run.#", 0);
        broker
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("run.#", "run.enter"));
        assert!(topic_matches("#", "activity.wait"));
        assert!(topic_matches("*.signal.#", "activity.signal.task_1"));
        assert!(topic_matches("activity.#.task_1", "activity.signal.task_1"));
        assert!(topic_matches("execute.#", "execute"));
        assert!(!topic_matches("*.signal.#", "activity.escalate.task_1"));
        assert!(!topic_matches("run.*", "run.enter.x"));
    }

    #[test]
    fn publish_from_outside_delivers_immediately() {
        let broker = broker_with_run_queue();
        let (seen, handler) = collector();
        broker.consume("run-q", handler, ConsumeOptions::no_ack());
        broker.publish("run", "run.enter", Content::default(), Properties::default());
        assert_eq!(*seen.borrow(), vec!["run.enter"]);
        assert_eq!(broker.get_queue("run-q").unwrap().message_count(), 0);
    }

    #[test]
    fn publish_from_handler_is_deferred() {
        let broker = broker_with_run_queue();
        let order = Rc::new(RefCell::new(Vec::new()));
        let (b, o) = (broker.downgrade(), order.clone());
        broker.consume(
            "run-q",
            move |msg| {
                let key = msg.fields.routing_key.clone();
                if key == "run.enter" {
                    if let Some(b) = b.upgrade() {
                        b.publish("run", "run.start", Content::default(), Properties::default());
                    }
                }
                o.borrow_mut().push(format!("{key}:done"));
            },
            ConsumeOptions::no_ack(),
        );
        broker.publish("run", "run.enter", Content::default(), Properties::default());
        assert_eq!(*order.borrow(), vec!["run.enter:done", "run.start:done"]);
    }

    #[test]
    fn ack_consumer_holds_message_until_acked() {
        let broker = broker_with_run_queue();
        let last = Rc::new(RefCell::new(None::<Message>));
        let sink = last.clone();
        broker.consume(
            "run-q",
            move |msg| *sink.borrow_mut() = Some(msg.clone()),
            ConsumeOptions::default().tag("_run"),
        );
        broker.publish("run", "run.enter", Content::default(), Properties::default());
        broker.publish("run", "run.start", Content::default(), Properties::default());

        let queue = broker.get_queue("run-q").unwrap();
        assert_eq!(queue.message_count(), 2);
        let first = last.borrow().clone().unwrap();
        assert_eq!(first.fields.routing_key, "run.enter");

        broker.ack(&first);
        assert_eq!(queue.message_count(), 1);
        assert_eq!(last.borrow().as_ref().unwrap().fields.routing_key, "run.start");
    }

    #[test]
    fn cancel_returns_pending_message_as_redelivered() {
        let broker = broker_with_run_queue();
        broker.consume("run-q", |_| {}, ConsumeOptions::default().tag("_run"));
        broker.publish("run", "run.execute", Content::default(), Properties::default());
        assert!(broker.cancel("_run"));
        assert!(!broker.cancel("_run"));

        let queue = broker.get_queue("run-q").unwrap();
        assert_eq!(queue.message_count(), 1);
        assert!(queue.peek().unwrap().fields.redelivered);

        let (seen, handler) = collector();
        broker.consume("run-q", handler, ConsumeOptions::no_ack());
        assert_eq!(*seen.borrow(), vec!["run.execute"]);
    }

    #[test]
    fn consume_with_same_tag_is_idempotent() {
        let broker = broker_with_run_queue();
        broker.consume("run-q", |_| {}, ConsumeOptions::no_ack().tag("_run"));
        broker.consume("run-q", |_| {}, ConsumeOptions::no_ack().tag("_run"));
        assert_eq!(broker.consumer_count(), 1);
    }

    #[test]
    fn subscribe_tmp_queue_is_deleted_on_cancel() {
        let broker = Broker::new("test");
        broker.assert_exchange("event");
        let (seen, handler) = collector();
        let tag = broker.subscribe_tmp("event", "activity.*", handler, ConsumeOptions::default());
        broker.publish("event", "activity.start", Content::default(), Properties::default());
        broker.publish("event", "process.start", Content::default(), Properties::default());
        assert_eq!(*seen.borrow(), vec!["activity.start"]);

        broker.cancel(&tag);
        assert_eq!(broker.consumer_count(), 0);
        assert!(broker.get_state().queues.is_empty());
    }

    #[test]
    fn subscribe_once_fires_once() {
        let broker = Broker::new("test");
        let (seen, handler) = collector();
        broker.subscribe_once("event", "#", handler, ConsumeOptions::default());
        broker.publish("event", "a", Content::default(), Properties::default());
        broker.publish("event", "b", Content::default(), Properties::default());
        assert_eq!(*seen.borrow(), vec!["a"]);
        assert_eq!(broker.consumer_count(), 0);
    }

    #[test]
    fn mandatory_error_without_queue_is_undelivered() {
        let broker = Broker::new("test");
        broker.assert_exchange("event");
        let result = broker.try_publish(
            "event",
            "definition.error",
            Content::default(),
            Properties::typed("error").mandatory(),
        );
        assert!(matches!(result, Err(BrokerError::Undelivered { .. })));

        let ignored = broker.try_publish(
            "event",
            "definition.error",
            Content::default(),
            Properties::typed("ignore").mandatory(),
        );
        assert!(ignored.is_ok());
    }

    #[test]
    fn higher_priority_bindings_receive_first() {
        let broker = Broker::new("test");
        let order = Rc::new(RefCell::new(Vec::new()));
        for (queue, priority) in [("low-q", 0), ("high-q", 400)] {
            broker.bind_queue(queue, "api", "#", priority);
            let o = order.clone();
            broker.consume(queue, move |_| o.borrow_mut().push(queue), ConsumeOptions::no_ack());
        }
        broker.publish("api", "activity.signal.x", Content::default(), Properties::default());
        assert_eq!(*order.borrow(), vec!["high-q", "low-q"]);
    }

    #[test]
    fn shovel_forwards_to_parent_exchange() {
        let dispatcher = Dispatcher::new();
        let child = Broker::with_dispatcher("child", dispatcher.clone());
        let parent = Broker::with_dispatcher("parent", dispatcher);
        child.create_shovel("event", "#", &parent, "event");
        let (seen, handler) = collector();
        parent.subscribe_tmp("event", "activity.#", handler, ConsumeOptions::default());
        child.publish("event", "activity.wait", Content::default(), Properties::default().delegated());
        assert_eq!(*seen.borrow(), vec!["activity.wait"]);
    }

    #[test]
    fn state_recovers_durable_queues_only() {
        let broker = broker_with_run_queue();
        broker.subscribe_tmp("event", "#", |_| {}, ConsumeOptions::default());
        broker.consume("run-q", |_| {}, ConsumeOptions::default().tag("_run"));
        broker.publish("run", "run.execute", Content::default(), Properties::default());

        let state = broker.get_state();
        assert_eq!(state.queues.len(), 1);
        assert!(state.queues[0].messages[0].fields.redelivered);

        let recovered = broker_with_run_queue();
        recovered.recover(&state);
        assert_eq!(recovered.get_queue("run-q").unwrap().message_count(), 1);
    }
}
