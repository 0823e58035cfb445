//! External actions served by the gateway.

use devflow_core::capability::{ActionOutcome, CapabilityError, ExternalAction};
use serde_json::{Map, Value};

use super::types::{ActionRequestBody, ActionResponseBody};
use super::HttpGateway;

/// One action target routed through an [`HttpGateway`].
#[derive(Debug, Clone)]
pub struct GatewayAction {
    gateway: HttpGateway,
    target: String,
}

impl GatewayAction {
    pub fn new(gateway: HttpGateway, target: impl Into<String>) -> Self {
        Self {
            gateway,
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl ExternalAction for GatewayAction {
    async fn invoke(
        &self,
        action: &str,
        inputs: &Map<String, Value>,
    ) -> Result<ActionOutcome, CapabilityError> {
        let path = format!(
            "/actions/{}/{}",
            urlencoding::encode(&self.target),
            urlencoding::encode(action)
        );
        tracing::debug!(target_name = %self.target, action, "invoking gateway action");

        let reply: ActionResponseBody = self
            .gateway
            .post(&path, &ActionRequestBody { inputs })
            .await?;

        Ok(ActionOutcome {
            outputs: reply.outputs,
            cost: reply.cost.filter(|c| c.is_finite() && *c >= 0.0),
        })
    }
}
