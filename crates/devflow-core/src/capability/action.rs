//! The external action interface and its type-erased wrapper.
//!
//! `BoxExternalAction` follows the blanket-impl pattern:
//! 1. An object-safe `ExternalActionDyn` trait with boxed futures
//! 2. A blanket impl of `ExternalActionDyn` for every `T: ExternalAction`
//! 3. `BoxExternalAction` wraps `Box<dyn ExternalActionDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use super::CapabilityError;

/// Result of a successful action call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    /// Output record; `outputs` bindings extract paths from it.
    pub outputs: Value,
    /// Actual cost, when the service reports one. The target's configured
    /// per-call cost applies otherwise.
    pub cost: Option<f64>,
}

impl ActionOutcome {
    pub fn new(outputs: Value) -> Self {
        Self {
            outputs,
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// A named service (issue tracker, source control, chat, wiki...) that
/// performs operations by action name.
pub trait ExternalAction: Send + Sync {
    fn invoke(
        &self,
        action: &str,
        inputs: &Map<String, Value>,
    ) -> impl Future<Output = Result<ActionOutcome, CapabilityError>> + Send;
}

/// Object-safe version of [`ExternalAction`] with boxed futures.
pub trait ExternalActionDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        inputs: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, CapabilityError>> + Send + 'a>>;
}

impl<T: ExternalAction> ExternalActionDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        action: &'a str,
        inputs: &'a Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<ActionOutcome, CapabilityError>> + Send + 'a>> {
        Box::pin(self.invoke(action, inputs))
    }
}

/// Type-erased external action.
pub struct BoxExternalAction {
    inner: Box<dyn ExternalActionDyn + Send + Sync>,
}

impl BoxExternalAction {
    pub fn new<T: ExternalAction + 'static>(action: T) -> Self {
        Self {
            inner: Box::new(action),
        }
    }

    pub async fn invoke(
        &self,
        action: &str,
        inputs: &Map<String, Value>,
    ) -> Result<ActionOutcome, CapabilityError> {
        self.inner.invoke_boxed(action, inputs).await
    }
}

impl std::fmt::Debug for BoxExternalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxExternalAction").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl ExternalAction for Echo {
        async fn invoke(
            &self,
            action: &str,
            inputs: &Map<String, Value>,
        ) -> Result<ActionOutcome, CapabilityError> {
            if action == "explode" {
                return Err(CapabilityError::permanent("boom"));
            }
            Ok(ActionOutcome::new(json!({ "action": action, "inputs": inputs })).with_cost(0.5))
        }
    }

    #[tokio::test]
    async fn test_boxed_action_delegates() {
        let boxed = BoxExternalAction::new(Echo);
        let mut inputs = Map::new();
        inputs.insert("id".to_string(), json!(7));

        let outcome = boxed.invoke("get_issue", &inputs).await.unwrap();
        assert_eq!(outcome.outputs["action"], "get_issue");
        assert_eq!(outcome.outputs["inputs"]["id"], 7);
        assert_eq!(outcome.cost, Some(0.5));

        let err = boxed.invoke("explode", &inputs).await.unwrap_err();
        assert!(!err.retryable);
    }
}
