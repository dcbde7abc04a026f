//! # terrace_core
//!
//! Dependency resolution and apply orchestration for terrace.
//!
//! This crate takes a composed environment and runs validate, plan, apply or
//! destroy across its module instances in dependency order, threading each
//! instance's outputs into the inputs of the instances that depend on it.
//!
//! # Architecture
//!
//! - **Resolver**: Builds the instance graph and substitutes dependency
//!   outputs, falling back to mock outputs where a command allows them
//! - **Run log**: Per-instance state machine, run outcome and persistence
//! - **Orchestrator**: Bounded parallel scheduling, state locking, partial
//!   state on failure, orphan detection and resume
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use terrace_core::{ApplyOrchestrator, RunOptions};
//! use terrace_iac::{MemoryStateStore, MockBackend, StateLocator};
//! use terrace_spec::CommandKind;
//!
//! let orchestrator = ApplyOrchestrator::new(
//!     Arc::new(MockBackend::new()),
//!     Arc::new(MemoryStateStore::new()),
//!     catalog,
//!     StateLocator::new("acme"),
//! )
//! .with_runs_dir(project.runs_dir());
//!
//! let options = RunOptions::new(CommandKind::Apply).with_parallelism(4);
//! let log = orchestrator.run(&composed, options).await?;
//! println!("{:?}", log.outcome);
//! ```

pub mod error;
pub mod executor;
pub mod log;
pub mod resolver;

pub use error::{CoreError, CoreResult};
pub use executor::{ApplyOrchestrator, CancelSignal, FailurePolicy, RunOptions, ORPHAN_TARGET};
pub use log::{ErrorKind, InstanceRecord, InstanceStatus, RunLog, RunOutcome};
pub use resolver::{resolve_inputs, DependencyGraph, InputResolution, InstanceOutputs};
