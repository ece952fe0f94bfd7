//! Error types for the vanadium runtime core.

use thiserror::Error;

use crate::units::UnitState;

/// Boxed error type accepted from unit code at the contract boundary.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the runtime core.
///
/// User-code failures (unit hooks, task closures, config listeners) are
/// contained at the boundary that invoked them and surface here already
/// classified; core-internal failures propagate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Parse or I/O failure on a configuration file.
    #[error("configuration error for '{id}': {detail}")]
    Configuration { id: String, detail: String },

    /// A typed configuration rejected its on-disk content.
    #[error("validation failed for '{id}': {}", errors.join("; "))]
    Validation { id: String, errors: Vec<String> },

    /// A config id was used before `register`.
    #[error("config '{id}' is not registered")]
    NotRegistered { id: String },

    /// The registered config for this id has a different type.
    #[error("config type mismatch for '{id}'")]
    TypeMismatch { id: String },

    /// A unit id that is not present in the manager.
    #[error("unknown unit '{unit}'")]
    UnknownUnit { unit: String },

    /// Unsatisfied hard dependency or dependency cycle.
    #[error("dependency error for unit '{unit}': {detail}")]
    Dependency { unit: String, detail: String },

    /// Failure during discovery, manifest parse, symbol resolution,
    /// instantiation, or `on_load`.
    #[error("failed to load unit '{unit}': {detail}")]
    Load { unit: String, detail: String },

    /// `on_enable` returned an error or panicked.
    #[error("failed to enable unit '{unit}': {detail}")]
    Enable { unit: String, detail: String },

    /// `on_reload` failed, or the unit does not support reloading.
    #[error("failed to reload unit '{unit}': {detail}")]
    Reload { unit: String, detail: String },

    /// An operation was requested from a state that does not permit it.
    #[error("unit '{unit}' cannot {operation} from state {state:?}")]
    InvalidState {
        unit: String,
        operation: &'static str,
        state: UnitState,
    },

    /// The runtime is shutting down and rejected the operation.
    #[error("runtime is shutting down")]
    ShuttingDown,

    /// Invariant violation inside the core.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Render a payload captured from `std::panic::catch_unwind` as a message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
