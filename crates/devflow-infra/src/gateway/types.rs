//! Wire types for the gateway's JSON API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `POST /actions/{target}/{action}`.
#[derive(Debug, Serialize)]
pub struct ActionRequestBody<'a> {
    pub inputs: &'a Map<String, Value>,
}

/// Reply to an action call.
#[derive(Debug, Deserialize)]
pub struct ActionResponseBody {
    #[serde(default)]
    pub outputs: Value,
    #[serde(default)]
    pub cost: Option<f64>,
}

/// Body of `POST /generate/{target}`.
#[derive(Debug, Serialize)]
pub struct GenerateRequestBody<'a> {
    pub prompt: &'a Value,
    pub inputs: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub budget: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<&'a str>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "no_feedback")]
    pub feedback: &'a [String],
}

/// Reply to a generation request.
#[derive(Debug, Deserialize)]
pub struct GenerateResponseBody {
    pub content: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost: Option<f64>,
}

fn no_feedback(feedback: &&[String]) -> bool {
    feedback.is_empty()
}
