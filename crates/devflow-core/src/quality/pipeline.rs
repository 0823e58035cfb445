//! Ordered gate evaluation and verdict routing.

use std::sync::Arc;

use devflow_types::config::QualityConfig;
use devflow_types::quality::{
    Artifact, GateReport, QualityGateResult, QualityVerdict, TaskContext,
};

use super::gate::QualityGate;
use super::gates::{CoverageGate, SecurityGate, StyleGate, SyntaxGate};

/// Runs gates in order and routes the artifact.
///
/// A critical gate scoring below its floor stops the pipeline with
/// `Regenerate`. Otherwise the weighted average decides:
/// `>= approve_threshold` approves, `>= review_threshold` asks for human
/// review, anything lower regenerates.
#[derive(Clone)]
pub struct QualityPipeline {
    gates: Vec<Arc<dyn QualityGate>>,
    config: QualityConfig,
}

impl std::fmt::Debug for QualityPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.gates.iter().map(|g| g.name()).collect();
        f.debug_struct("QualityPipeline")
            .field("gates", &names)
            .field("config", &self.config)
            .finish()
    }
}

impl QualityPipeline {
    /// Pipeline with the built-in gates: syntax, security, style, coverage.
    pub fn new(config: QualityConfig) -> Self {
        Self::with_gates(
            config,
            vec![
                Arc::new(SyntaxGate),
                Arc::new(SecurityGate::new()),
                Arc::new(StyleGate::default()),
                Arc::new(CoverageGate),
            ],
        )
    }

    pub fn with_gates(config: QualityConfig, gates: Vec<Arc<dyn QualityGate>>) -> Self {
        Self { gates, config }
    }

    pub fn gate_names(&self) -> Vec<&str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub fn validate(&self, artifact: &Artifact, task: &TaskContext) -> QualityGateResult {
        let mut reports = Vec::with_capacity(self.gates.len());

        for gate in &self.gates {
            let scored = gate.evaluate(artifact, task);
            let report = GateReport {
                gate: gate.name().to_string(),
                score: if scored.score.is_finite() {
                    scored.score.clamp(0.0, 1.0)
                } else {
                    0.0
                },
                weight: gate.weight().max(0.0),
                floor: gate.critical_floor(),
                issues: scored.issues,
            };
            let stop = report.below_floor();
            reports.push(report);

            if stop {
                let overall = weighted_average(&reports);
                tracing::debug!(
                    step = %task.step,
                    gate = gate.name(),
                    "critical quality gate below floor, short-circuiting"
                );
                return QualityGateResult {
                    gates: reports,
                    overall,
                    verdict: QualityVerdict::Regenerate,
                    short_circuited_by: Some(gate.name().to_string()),
                };
            }
        }

        let overall = weighted_average(&reports);
        let verdict = if overall >= self.config.approve_threshold {
            QualityVerdict::Approve
        } else if overall >= self.config.review_threshold {
            QualityVerdict::RequireHumanReview
        } else {
            QualityVerdict::Regenerate
        };
        tracing::debug!(step = %task.step, overall, verdict = %verdict, "quality gates evaluated");

        QualityGateResult {
            gates: reports,
            overall,
            verdict,
            short_circuited_by: None,
        }
    }
}

fn weighted_average(reports: &[GateReport]) -> f64 {
    let total_weight: f64 = reports.iter().map(|r| r.weight).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    reports.iter().map(|r| r.score * r.weight).sum::<f64>() / total_weight
}
