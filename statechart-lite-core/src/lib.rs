//! Statechart-Lite — a hierarchical statechart interpreter.
//!
//! A declarative chart description (JSON or YAML object form) is loaded,
//! verified and compiled into an immutable [`types::Program`] in one of
//! three layouts, then executed per instance inside a mailbox actor with
//! deterministic ordering, guards, entry/exit/transition actions, invoked
//! services, delayed and eventless transitions, and parallel regions.
//! The [`orchestrator::Orchestrator`] routes events between instances and
//! fans notifications out to subscribers.

pub mod compiler;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod interp;
pub mod mailbox;
pub mod orchestrator;
pub mod types;

pub use context::{MachineContext, Service, ServiceFn};
pub use engine::StatechartEngine;
pub use error::{ChartError, CompileError, EngineError, LoadError};
pub use events::Notification;
pub use mailbox::MailboxHandle;
pub use orchestrator::{NotificationBatcher, Orchestrator};
pub use types::{EventObject, InterpOptions, Layout, Snapshot, Status};
