//! The generation interface and its type-erased wrapper.

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use super::CapabilityError;

/// What the generator is asked to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Resolved prompt context. Opaque to the engine.
    pub prompt: Value,
    /// Resolved step inputs, passed alongside the prompt.
    pub inputs: Map<String, Value>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    /// Most this attempt may cost.
    pub budget: f64,
    /// Language hint from the step's quality settings.
    pub language: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Quality findings from the previous attempt, when regenerating.
    pub feedback: Vec<String>,
}

/// A generated artifact and its usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutcome {
    pub content: String,
    /// Language the generator reports, if it differs from the request.
    pub language: Option<String>,
    pub model: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Actual cost; computed from the pricing table when absent.
    pub cost: Option<f64>,
}

/// A code/config/prose generator.
pub trait Generator: Send + Sync {
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<GenerationOutcome, CapabilityError>> + Send;
}

/// Object-safe version of [`Generator`] with boxed futures.
pub trait GeneratorDyn: Send + Sync {
    fn generate_boxed<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GenerationOutcome, CapabilityError>> + Send + 'a>>;
}

impl<T: Generator> GeneratorDyn for T {
    fn generate_boxed<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<GenerationOutcome, CapabilityError>> + Send + 'a>> {
        Box::pin(self.generate(request))
    }
}

/// Type-erased generator.
pub struct BoxGenerator {
    inner: Box<dyn GeneratorDyn + Send + Sync>,
}

impl BoxGenerator {
    pub fn new<T: Generator + 'static>(generator: T) -> Self {
        Self {
            inner: Box::new(generator),
        }
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, CapabilityError> {
        self.inner.generate_boxed(request).await
    }
}

impl std::fmt::Debug for BoxGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxGenerator").finish_non_exhaustive()
    }
}
