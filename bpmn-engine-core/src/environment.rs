//! Execution environment: settings, variables, output and services.
//!
//! An [`Environment`] is a cheap shared handle. [`Environment::fork`] gives a
//! process its own variables and output while keeping the service registry
//! shared, so a service added later is visible everywhere.

use crate::config::EngineSettings;
use crate::error::ActivityError;
use crate::messages::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

type Completion = Box<dyn FnOnce(Result<Option<Value>, ActivityError>)>;

/// One invocation of a service by a service task.
///
/// The call may be completed synchronously or kept and completed later.
/// Dropping it without completing leaves the task waiting.
pub struct ServiceCall {
    message: Message,
    completion: Option<Completion>,
}

impl ServiceCall {
    pub(crate) fn new(
        message: Message,
        completion: impl FnOnce(Result<Option<Value>, ActivityError>) + 'static,
    ) -> Self {
        Self {
            message,
            completion: Some(Box::new(completion)),
        }
    }

    /// The execute message that triggered the call.
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn complete(mut self, output: Option<Value>) {
        if let Some(done) = self.completion.take() {
            done(Ok(output));
        }
    }

    pub fn fail(mut self, message: impl Into<String>) {
        if let Some(done) = self.completion.take() {
            done(Err(ActivityError::new(message)));
        }
    }
}

pub type Service = Rc<dyn Fn(ServiceCall)>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    #[serde(default)]
    pub settings: Option<EngineSettings>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub output: Map<String, Value>,
}

struct EnvironmentInner {
    settings: RefCell<EngineSettings>,
    variables: RefCell<Map<String, Value>>,
    output: RefCell<Map<String, Value>>,
    services: Rc<RefCell<BTreeMap<String, Service>>>,
}

#[derive(Clone)]
pub struct Environment {
    inner: Rc<EnvironmentInner>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("settings", &self.inner.settings.borrow())
            .field("variables", &self.inner.variables.borrow())
            .finish()
    }
}

impl Environment {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            inner: Rc::new(EnvironmentInner {
                settings: RefCell::new(settings),
                variables: RefCell::new(Map::new()),
                output: RefCell::new(Map::new()),
                services: Rc::new(RefCell::new(BTreeMap::new())),
            }),
        }
    }

    pub fn with_variables(self, variables: Map<String, Value>) -> Self {
        *self.inner.variables.borrow_mut() = variables;
        self
    }

    /// New scope: deep-copied settings and variables, empty output, shared
    /// services.
    pub fn fork(&self) -> Self {
        Self {
            inner: Rc::new(EnvironmentInner {
                settings: RefCell::new(self.settings()),
                variables: RefCell::new(self.variables()),
                output: RefCell::new(Map::new()),
                services: self.inner.services.clone(),
            }),
        }
    }

    /// Like [`Environment::fork`] with settings replaced.
    pub fn fork_with_settings(&self, settings: EngineSettings) -> Self {
        let forked = self.fork();
        *forked.inner.settings.borrow_mut() = settings;
        forked
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner.settings.borrow().clone()
    }

    pub fn is_strict(&self) -> bool {
        self.inner.settings.borrow().strict
    }

    pub fn variables(&self) -> Map<String, Value> {
        self.inner.variables.borrow().clone()
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.inner.variables.borrow().get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.inner.variables.borrow_mut().insert(name.into(), value);
    }

    pub fn output(&self) -> Map<String, Value> {
        self.inner.output.borrow().clone()
    }

    pub fn set_output(&self, key: impl Into<String>, value: Value) {
        self.inner.output.borrow_mut().insert(key.into(), value);
    }

    pub fn assign_output(&self, output: Map<String, Value>) {
        self.inner.output.borrow_mut().extend(output);
    }

    pub fn add_service(&self, name: impl Into<String>, service: impl Fn(ServiceCall) + 'static) {
        self.inner
            .services
            .borrow_mut()
            .insert(name.into(), Rc::new(service));
    }

    pub fn get_service_by_name(&self, name: &str) -> Option<Service> {
        self.inner.services.borrow().get(name).cloned()
    }

    pub fn get_state(&self) -> EnvironmentState {
        EnvironmentState {
            settings: Some(self.settings()),
            variables: self.variables(),
            output: self.output(),
        }
    }

    /// Restore variables and output. Settings stay as constructed.
    pub fn recover(&self, state: &EnvironmentState) {
        *self.inner.variables.borrow_mut() = state.variables.clone();
        *self.inner.output.borrow_mut() = state.output.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    #[test]
    fn fork_copies_variables_and_shares_services() {
        let env = Environment::default();
        env.set_variable("count", json!(1));
        let forked = env.fork();
        forked.set_variable("count", json!(2));
        assert_eq!(env.variable("count"), Some(json!(1)));

        let called = Rc::new(Cell::new(0));
        let c = called.clone();
        env.add_service("later", move |call| {
            c.set(c.get() + 1);
            call.complete(None);
        });
        let service = forked.get_service_by_name("later").expect("shared service");
        service(ServiceCall::new(Message::default(), |_| {}));
        assert_eq!(called.get(), 1);
    }

    #[test]
    fn service_call_completes_once() {
        let results = Rc::new(RefCell::new(Vec::new()));
        let sink = results.clone();
        let call = ServiceCall::new(Message::default(), move |r| sink.borrow_mut().push(r));
        call.fail("boom");
        assert_eq!(results.borrow().len(), 1);
        assert_eq!(
            results.borrow()[0].as_ref().unwrap_err().message,
            "boom".to_string()
        );
    }

    #[test]
    fn recover_keeps_constructed_settings() {
        let mut settings = EngineSettings::default();
        settings.strict = false;
        let env = Environment::new(settings);

        let mut saved = EngineSettings::default();
        saved.strict = true;
        env.recover(&EnvironmentState {
            settings: Some(saved),
            variables: Map::from_iter([("a".to_string(), json!(1))]),
            output: Map::new(),
        });
        assert!(!env.is_strict());
        assert_eq!(env.variable("a"), Some(json!(1)));
    }
}
