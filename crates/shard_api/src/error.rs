//! Errors surfaced to shard code.

use crate::lang::LangError;
use crate::lifecycle::LifecycleState;
use crate::services::ServiceError;
use crate::symbol::SymbolError;
use std::any::Any;
use thiserror::Error;

/// Errors returned by shard hooks and by [`ShardContext`](crate::ShardContext)
/// capabilities.
///
/// # Error Categories
///
/// - **ContextNotBound**: a capability was used before the host bound the context.
///   Always a programming error in the shard, never retried.
/// - **WrongPhase**: a capability was used outside the lifecycle phase that permits it
/// - **Hook**: a lifecycle hook reported failure
/// - **Panicked**: a lifecycle hook panicked and the host caught it
/// - **Service** / **Symbol** / **Dependency**: failures of host-provided services
/// - **Lang**: a message bundle is missing or lacks a key
#[derive(Debug, Clone, Error)]
pub enum ShardError {
    /// A capability was invoked before context assignment
    #[error("{call} was called before the shard context was bound")]
    ContextNotBound { call: &'static str },
    /// A capability was invoked in a lifecycle phase that does not allow it
    #[error("{call} is not allowed while the shard is {state}")]
    WrongPhase {
        call: &'static str,
        state: LifecycleState,
    },
    /// A lifecycle hook returned an error
    #[error("{0}")]
    Hook(String),
    /// A lifecycle hook panicked
    #[error("shard panicked: {0}")]
    Panicked(String),
    /// A host service failed
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
    /// A symbol lookup failed
    #[error("symbol error: {0}")]
    Symbol(#[from] SymbolError),
    /// A dependency declaration was rejected
    #[error("invalid dependency declaration: {0}")]
    Dependency(String),
    /// A language bundle could not be loaded or a key is missing
    #[error("language error: {0}")]
    Lang(#[from] LangError),
}

impl ShardError {
    /// Convenience constructor for hook failures.
    pub fn hook(message: impl Into<String>) -> Self {
        ShardError::Hook(message.into())
    }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }

    #[test]
    fn test_context_not_bound_names_the_call() {
        let error = ShardError::ContextNotBound { call: "storage" };
        assert_eq!(
            error.to_string(),
            "storage was called before the shard context was bound"
        );
    }
}
