//! Message-driven BPMN 2.0 execution engine.
//!
//! Definitions, processes and activities each own an in-process broker;
//! every lifecycle step is a message on a queue, which is what makes runs
//! stoppable, serialisable and resumable at any point.

pub mod activity;
pub mod api;
pub mod authoring;
pub mod broker;
pub mod config;
pub mod context;
pub mod definition;
pub mod environment;
pub mod error;
pub mod event_definitions;
pub mod flows;
pub mod messages;
pub mod process;
pub mod state;
pub mod store;

pub use activity::{Activity, ExecutionApi};
pub use api::{Api, ApiTarget};
pub use broker::{Broker, ConsumeOptions, Dispatcher, QueueOptions};
pub use config::EngineSettings;
pub use context::DefinitionContext;
pub use definition::Definition;
pub use environment::{Environment, ServiceCall};
pub use error::{ActivityError, BrokerError, EngineError};
pub use messages::{Content, Message, Parent, ParentRef};
pub use process::Process;
pub use state::{DefinitionState, RunStatus};
pub use store::{MemoryStateStore, StateStore};
