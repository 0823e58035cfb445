//! Generation served by the gateway.

use devflow_core::capability::{
    CapabilityError, GenerationOutcome, GenerationRequest, Generator,
};

use super::types::{GenerateRequestBody, GenerateResponseBody};
use super::HttpGateway;

/// One generation target routed through an [`HttpGateway`].
#[derive(Debug, Clone)]
pub struct GatewayGenerator {
    gateway: HttpGateway,
    target: String,
}

impl GatewayGenerator {
    pub fn new(gateway: HttpGateway, target: impl Into<String>) -> Self {
        Self {
            gateway,
            target: target.into(),
        }
    }
}

impl Generator for GatewayGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, CapabilityError> {
        let path = format!("/generate/{}", urlencoding::encode(&self.target));
        tracing::debug!(
            target_name = %self.target,
            attempt = request.attempt,
            budget = request.budget,
            "requesting generation"
        );

        let body = GenerateRequestBody {
            prompt: &request.prompt,
            inputs: &request.inputs,
            model: request.model.as_deref(),
            max_tokens: request.max_tokens,
            budget: request.budget,
            language: request.language.as_deref(),
            attempt: request.attempt,
            feedback: &request.feedback,
        };
        let reply: GenerateResponseBody = self.gateway.post(&path, &body).await?;

        Ok(GenerationOutcome {
            content: reply.content,
            language: reply.language,
            model: reply.model.or_else(|| request.model.clone()),
            tokens_in: reply.tokens_in,
            tokens_out: reply.tokens_out,
            cost: reply.cost.filter(|c| c.is_finite() && *c >= 0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::serve_once;
    use serde_json::{Map, json};

    fn request(attempt: u32, feedback: Vec<String>) -> GenerationRequest {
        GenerationRequest {
            prompt: json!({ "task": "write a parser" }),
            inputs: Map::new(),
            model: Some("small-v2".to_string()),
            max_tokens: Some(512),
            budget: 0.5,
            language: Some("rust".to_string()),
            attempt,
            feedback,
        }
    }

    #[tokio::test]
    async fn test_sends_request_and_reads_usage() {
        let (url, server) = serve_once(
            200,
            r#"{"content":"fn parse() {}","tokens_in":120,"tokens_out":40}"#,
        )
        .await;
        let gateway = HttpGateway::new(url, None).unwrap();

        let outcome = gateway
            .generator("writer")
            .generate(&request(2, vec!["style: line too long".to_string()]))
            .await
            .unwrap();

        assert_eq!(outcome.content, "fn parse() {}");
        assert_eq!(outcome.tokens_in, 120);
        assert_eq!(outcome.tokens_out, 40);
        assert_eq!(outcome.cost, None);
        assert_eq!(outcome.model.as_deref(), Some("small-v2"));

        let captured = server.await.unwrap();
        assert!(captured.request_line.starts_with("POST /generate/writer "));
        assert_eq!(captured.body["prompt"]["task"], "write a parser");
        assert_eq!(captured.body["attempt"], 2);
        assert_eq!(captured.body["max_tokens"], 512);
        assert_eq!(captured.body["feedback"][0], "style: line too long");
    }

    #[tokio::test]
    async fn test_first_attempt_omits_feedback() {
        let (url, server) = serve_once(200, r#"{"content":"ok","cost":0.01}"#).await;
        let gateway = HttpGateway::new(url, None).unwrap();

        let outcome = gateway
            .generator("writer")
            .generate(&request(1, Vec::new()))
            .await
            .unwrap();
        assert_eq!(outcome.cost, Some(0.01));

        let captured = server.await.unwrap();
        assert!(captured.body.get("feedback").is_none());
    }

    #[tokio::test]
    async fn test_malformed_reply_is_permanent() {
        let (url, _server) = serve_once(200, r#"{"unexpected":true}"#).await;
        let gateway = HttpGateway::new(url, None).unwrap();

        let err = gateway
            .generator("writer")
            .generate(&request(1, Vec::new()))
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_throttled_generation_is_transient() {
        let (url, _server) = serve_once(429, "").await;
        let gateway = HttpGateway::new(url, None).unwrap();

        let err = gateway
            .generator("writer")
            .generate(&request(1, Vec::new()))
            .await
            .unwrap_err();
        assert!(err.retryable);
    }
}
