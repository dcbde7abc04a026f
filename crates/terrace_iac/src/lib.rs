//! # terrace_iac
//!
//! Module rendering, state backends and resource provisioning for terrace.
//!
//! This crate turns a module definition plus fully resolved inputs into an
//! ordered set of resource nodes, stores per-instance state behind locks and
//! compare-and-swap writes, and applies nodes through a pluggable
//! provisioning backend.
//!
//! ## Features
//!
//! - **Rendering**: `for_each` expansion, `enabled` gates, tag merging and
//!   intra-module ordering with cycle detection
//! - **State**: Deterministic, injective state keys; in-memory and local
//!   file stores with per-key locks
//! - **Provisioning**: Mock backend for tests and simulations, command backend
//!   speaking JSON over stdin/stdout
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use terrace_iac::{EnvContext, MockBackend, ModuleApplier, ModuleRenderer};
//! use terrace_spec::{Attributes, InstanceId, ModuleDefinition, TagSet};
//!
//! # async fn run(module: ModuleDefinition, inputs: Attributes) {
//! let env = EnvContext::new("qa", "us-east-1");
//! let rendered = ModuleRenderer::new(&module, &env)
//!     .render(&inputs, &BTreeSet::new(), &TagSet::new())
//!     .unwrap();
//!
//! let backend = MockBackend::new();
//! let id = InstanceId::new("qa", "us-east-1", "network");
//! let outcome = ModuleApplier::new(&backend, &id).apply(&rendered, None).await;
//! # }
//! ```

pub mod applier;
pub mod command;
pub mod error;
pub mod interpolate;
pub mod locator;
pub mod mock;
pub mod provider;
pub mod renderer;
pub mod state;

pub use applier::{ApplyOutcome, ModuleApplier, PartialApply};
pub use command::CommandBackend;
pub use error::{IacError, IacResult};
pub use interpolate::ResourceRef;
pub use locator::{StateKey, StateLocator, STATE_FILE};
pub use mock::{CapturedCall, MockBackend};
pub use provider::{ChangeAction, PlanSummary, ProvisioningBackend, ResourceChange, ResourceRequest};
pub use renderer::{EnvContext, ModuleRenderer, RenderedModule, RenderedOutput, ResourceNode};
pub use state::{
    display_outputs, FileStateStore, LockInfo, MemoryStateStore, ResourceState, StateRecord,
    StateStore,
};
