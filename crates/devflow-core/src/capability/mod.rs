//! Capabilities the engine calls out to.
//!
//! Every non-generation step goes through [`ExternalAction`]; generation
//! steps go through [`Generator`]. Both use native async fn in traits and
//! are type-erased through `BoxExternalAction` / `BoxGenerator` so a
//! [`CapabilityTable`] can hold heterogeneous implementations.

pub mod action;
pub mod generator;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

pub use action::{ActionOutcome, BoxExternalAction, ExternalAction};
pub use generator::{BoxGenerator, GenerationOutcome, GenerationRequest, Generator};
pub use table::CapabilityTable;

/// Failure reported by a capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CapabilityError {
    pub message: String,
    /// Whether retrying the same call could succeed.
    pub retryable: bool,
}

impl CapabilityError {
    /// A transient failure (service unavailable, throttled, network).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will not go away on retry (bad request, not found).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
