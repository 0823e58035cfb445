//! Quality gate types: the artifact under review, gate reports and the
//! pipeline verdict.

use serde::{Deserialize, Serialize};

/// A generated artifact (code, config, prose) awaiting validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub content: String,
    /// Language hint such as `rust`, `python`, `json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Artifact {
    pub fn new(content: impl Into<String>, language: Option<&str>) -> Self {
        Self {
            content: content.into(),
            language: language.map(|l| l.to_ascii_lowercase()),
        }
    }
}

/// What the artifact was produced for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub requires_tests: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A single finding reported by a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub message: String,
    /// 1-based line number, when the finding is line-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

/// One gate's contribution to the overall score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub gate: String,
    /// Score in `[0, 1]`.
    pub score: f64,
    pub weight: f64,
    /// Minimum score for a critical gate; `None` for non-critical gates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<QualityIssue>,
}

impl GateReport {
    pub fn is_critical(&self) -> bool {
        self.floor.is_some()
    }

    /// True when a critical gate scored below its floor.
    pub fn below_floor(&self) -> bool {
        self.floor.is_some_and(|floor| self.score < floor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityVerdict {
    Approve,
    RequireHumanReview,
    Regenerate,
}

impl std::fmt::Display for QualityVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityVerdict::Approve => write!(f, "approve"),
            QualityVerdict::RequireHumanReview => write!(f, "require_human_review"),
            QualityVerdict::Regenerate => write!(f, "regenerate"),
        }
    }
}

/// Aggregated pipeline outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub gates: Vec<GateReport>,
    /// Weighted average of the gates that ran.
    pub overall: f64,
    pub verdict: QualityVerdict,
    /// The critical gate that stopped the pipeline early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_circuited_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_report_floor_checks() {
        let report = GateReport {
            gate: "security".into(),
            score: 0.3,
            weight: 1.0,
            floor: Some(0.6),
            issues: vec![],
        };
        assert!(report.is_critical());
        assert!(report.below_floor());

        let style = GateReport {
            gate: "style".into(),
            score: 0.1,
            weight: 0.5,
            floor: None,
            issues: vec![],
        };
        assert!(!style.is_critical());
        assert!(!style.below_floor());
    }

    #[test]
    fn test_artifact_language_lowercased() {
        let artifact = Artifact::new("fn main() {}", Some("Rust"));
        assert_eq!(artifact.language.as_deref(), Some("rust"));
    }
}
