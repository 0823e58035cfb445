//! The quality gate interface.

use devflow_types::quality::{Artifact, QualityIssue, Severity, TaskContext};

/// Score and findings from one gate.
#[derive(Debug, Clone, PartialEq)]
pub struct GateScore {
    /// Clamped to `[0, 1]` by the pipeline.
    pub score: f64,
    pub issues: Vec<QualityIssue>,
}

impl GateScore {
    pub fn new(score: f64, issues: Vec<QualityIssue>) -> Self {
        Self { score, issues }
    }

    pub fn perfect() -> Self {
        Self::new(1.0, Vec::new())
    }
}

/// An independent validator for generated artifacts.
pub trait QualityGate: Send + Sync {
    fn name(&self) -> &str;

    /// Relative weight in the overall score.
    fn weight(&self) -> f64 {
        1.0
    }

    /// Hard floor for critical gates. Scoring below it short-circuits the
    /// pipeline with `Regenerate`.
    fn critical_floor(&self) -> Option<f64> {
        None
    }

    fn evaluate(&self, artifact: &Artifact, task: &TaskContext) -> GateScore;
}

pub(crate) fn issue(severity: Severity, message: impl Into<String>, line: Option<usize>) -> QualityIssue {
    QualityIssue {
        severity,
        message: message.into(),
        line,
    }
}

/// Score after subtracting per-issue penalties, floored at zero.
pub(crate) fn penalized(issues: &[QualityIssue], penalty: impl Fn(Severity) -> f64) -> f64 {
    let total: f64 = issues.iter().map(|i| penalty(i.severity)).sum();
    (1.0 - total).max(0.0)
}
