//! Error types for rendering, state and provisioning.

use thiserror::Error;

use terrace_spec::SpecError;

/// Result type alias for IaC operations.
pub type IacResult<T> = Result<T, IacError>;

/// Errors that can occur while rendering modules or touching state and resources.
#[derive(Error, Debug)]
pub enum IacError {
    #[error("Render of module {module} failed: {message}")]
    Render { module: String, message: String },

    #[error("Unresolved reference {reference} in {context}")]
    UnresolvedReference { context: String, reference: String },

    #[error("Apply of {address} failed: {message}")]
    Apply { address: String, message: String },

    #[error("Destroy of {address} failed: {message}")]
    Destroy { address: String, message: String },

    #[error("State {key} is locked by {holder}")]
    LockContention { key: String, holder: String },

    #[error("State {key} is held by {holder}, not lock {requested}")]
    LockIdMismatch {
        key: String,
        requested: String,
        holder: String,
    },

    #[error("Lock on {key} is not held by this run")]
    LockNotHeld { key: String },

    #[error("State {key} changed concurrently: expected serial {expected}, found {found}")]
    SerialMismatch {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Instances {first} and {second} map to the same state key {key}")]
    StateKeyCollision {
        key: String,
        first: String,
        second: String,
    },

    #[error("Invalid state key: {0}")]
    InvalidStateKey(String),

    #[error("Provisioner error: {0}")]
    Provisioner(String),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IacError {
    pub fn render(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Render {
            module: module.into(),
            message: message.into(),
        }
    }
}
