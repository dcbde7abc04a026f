//! # terrace_spec
//!
//! Configuration model, variable schema validation and environment
//! composition for terrace.
//!
//! A terrace project keeps one shared root configuration, a catalog of
//! versioned modules and any number of environments instantiating those
//! modules. This crate loads all three, checks instance inputs against the
//! module schemas and merges the layers into one fully resolved view per
//! environment.
//!
//! ## Features
//!
//! - **Schema validation**: Nested typed inputs with defaults, coercion and
//!   path-qualified errors
//! - **Composition**: Root, environment and instance layers merged with fixed
//!   precedence, secrets sourced at compose time and never serialized
//! - **References**: `${dependency.<name>.outputs.<output>}` discovery and
//!   substitution
//! - **Ordering**: A declaration-ordered DAG shared by resource and instance
//!   planning
//!
//! ## Project Layout
//!
//! - `terrace.toml` - Backend, provider defaults, common tags and inputs
//! - `modules/<path>/module.yaml` - Module definitions
//! - `environments/<name>/env.yaml` - Environment definitions
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use terrace_spec::{ConfigValidator, EnvironmentComposer, Project};
//!
//! let project = Project::open("./infra").unwrap();
//! let env = project.environment("qa").unwrap();
//!
//! let catalog = Arc::new(project.catalog.clone());
//! let composer = EnvironmentComposer::new(Arc::new(project.root.clone()), catalog.clone());
//! let composed = composer.compose(&env).unwrap();
//!
//! let report = ConfigValidator::validate_environment(&composed, &catalog);
//! for error in &report.errors {
//!     eprintln!("Error: {}", error);
//! }
//! ```

pub mod composer;
pub mod error;
pub mod graph;
pub mod models;
pub mod reader;
pub mod reference;
pub mod schema;
pub mod validator;

pub use composer::{
    ComposedEnvironment, EnvSecretSource, EnvironmentComposer, ResolvedInstance, SecretSource,
    StaticSecretSource,
};
pub use error::{SpecError, SpecResult};
pub use graph::{Cycle, Dag};
pub use models::*;
pub use reader::{ConfigReader, ModuleCatalog, Project};
pub use reference::DependencyRef;
pub use schema::{SchemaError, SchemaErrorKind, SchemaValidator};
pub use validator::{check_inputs, ConfigValidator, ValidationReport};
