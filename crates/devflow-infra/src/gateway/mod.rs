//! HTTP capability gateway.
//!
//! One service fronts every external system a workflow talks to. Actions are
//! posted to `{base}/actions/{target}/{action}` and generation requests to
//! `{base}/generate/{target}`. The optional bearer token is held in a
//! [`SecretString`] and only exposed while building request headers.

pub mod action;
pub mod generator;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use devflow_core::capability::{CapabilityError, CapabilityTable};
use devflow_types::workflow::{StepKind, StepSpec};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub use action::GatewayAction;
pub use generator::GatewayGenerator;

/// Client-side ceiling per request; step timeouts normally fire first.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Shared HTTP client for one gateway.
///
/// Cheap to clone; every [`GatewayAction`] and [`GatewayGenerator`] holds one.
#[derive(Clone)]
pub struct HttpGateway {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                token,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn action(&self, target: impl Into<String>) -> GatewayAction {
        GatewayAction::new(self.clone(), target)
    }

    pub fn generator(&self, target: impl Into<String>) -> GatewayGenerator {
        GatewayGenerator::new(self.clone(), target)
    }

    /// A table serving every target `steps` reference (nested and undo
    /// steps included) through this gateway.
    pub fn capability_table(&self, steps: &[StepSpec]) -> CapabilityTable {
        let mut table = CapabilityTable::new();
        self.register(steps, &mut table);
        table
    }

    fn register<'a>(&self, steps: impl IntoIterator<Item = &'a StepSpec>, table: &mut CapabilityTable) {
        for step in steps {
            match &step.kind {
                StepKind::ExternalAction { target, .. } if table.action(target).is_none() => {
                    table.register_action(target.clone(), self.action(target.clone()));
                }
                StepKind::GenerationAction { target, .. } if table.generator(target).is_none() => {
                    table.register_generator(target.clone(), self.generator(target.clone()));
                }
                _ => {}
            }
            self.register(step.children(), table);
            if let Some(undo) = &step.undo {
                self.register(std::iter::once(undo.as_ref()), table);
            }
        }
    }

    /// POST `body` as JSON to `path` and decode the JSON reply.
    pub(crate) async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, CapabilityError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.inner.base_url, path);
        let mut request = self.inner.client.post(&url).json(body);
        if let Some(token) = &self.inner.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            tracing::debug!(url = %url, error = %e, "gateway request failed");
            CapabilityError::transient(format!("request to {url} failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(url = %url, status = status.as_u16(), "gateway returned error status");
            return Err(classify_status(status, &body));
        }

        response.json::<T>().await.map_err(|e| {
            CapabilityError::permanent(format!("invalid response from {url}: {e}"))
        })
    }
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.inner.base_url)
            .field("authenticated", &self.inner.token.is_some())
            .finish()
    }
}

/// Map a non-success status to a capability error.
///
/// Throttling, timeouts and server errors are transient; every other client
/// error is permanent.
pub fn classify_status(status: StatusCode, body: &str) -> CapabilityError {
    let detail = body.trim();
    let message = if detail.is_empty() {
        format!("gateway returned {status}")
    } else {
        format!("gateway returned {status}: {}", truncate(detail, 512))
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        CapabilityError::transient(message)
    } else {
        CapabilityError::permanent(message)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
