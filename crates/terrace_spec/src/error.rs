//! Error types for configuration loading and composition.

use std::path::PathBuf;
use thiserror::Error;

use crate::schema::SchemaError;

/// Result type alias for configuration operations.
pub type SpecResult<T> = Result<T, SpecError>;

/// Errors that can occur while loading, validating or composing configuration.
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Configuration not found at path: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration in file {path}: {message}")]
    InvalidFormat { path: PathBuf, message: String },

    #[error("Schema validation failed for {target}: {}", join_errors(.errors))]
    Schema {
        target: String,
        errors: Vec<SchemaError>,
    },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Duplicate instance '{instance}' in environment {environment}")]
    DuplicateInstance { environment: String, instance: String },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Secret for input '{input}' of {instance} is not set (expected variable {variable})")]
    MissingSecret {
        instance: String,
        input: String,
        variable: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[SchemaError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
