//! Error types for the core module.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while resolving or orchestrating a run.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Dependency cycle between instances: {}", .members.join(" -> "))]
    Cycle { members: Vec<String> },

    #[error(
        "{instance} would use mock output '{output}' of dependency '{dependency}' during apply; \
         apply '{dependency}' first"
    )]
    MockUsedInApply {
        instance: String,
        dependency: String,
        output: String,
    },

    #[error("Instance not found: {0}")]
    UnknownInstance(String),

    #[error("{instance} depends on unknown instance '{target}'")]
    UnknownDependency { instance: String, target: String },

    #[error("{instance} references undeclared dependency in {reference}")]
    UndeclaredDependency { instance: String, reference: String },

    #[error("{instance} needs {reference}, which has no applied value and no usable mock")]
    UnresolvedOutput { instance: String, reference: String },

    #[error("Configuration is invalid: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Invalid run state: {0}")]
    InvalidState(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Configuration error: {0}")]
    Spec(#[from] terrace_spec::SpecError),

    #[error(transparent)]
    Iac(#[from] terrace_iac::IacError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
