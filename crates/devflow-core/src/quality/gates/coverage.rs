//! Test coverage estimate.
//!
//! Counts test functions against implementation functions. Only applies
//! when the task requires tests.

use std::sync::LazyLock;

use devflow_types::quality::{Artifact, Severity, TaskContext};
use regex::Regex;

use crate::quality::gate::{GateScore, QualityGate, issue};

static FUNCTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:fn|def|func|function)\s+\w+").ok()
});

static TEST: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?m)#\[(?:tokio::)?test\b|^\s*(?:async\s+)?def\s+test_\w+|^\s*func\s+Test\w+|^\s*(?:it|test)\s*\(",
    )
    .ok()
});

fn count(pattern: &LazyLock<Option<Regex>>, content: &str) -> usize {
    pattern
        .as_ref()
        .map_or(0, |re| re.find_iter(content).count())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoverageGate;

impl QualityGate for CoverageGate {
    fn name(&self) -> &str {
        "coverage"
    }

    fn weight(&self) -> f64 {
        0.75
    }

    fn evaluate(&self, artifact: &Artifact, task: &TaskContext) -> GateScore {
        if !task.requires_tests {
            return GateScore::perfect();
        }

        let tests = count(&TEST, &artifact.content);
        // Rust and Python tests are functions too.
        let functions = count(&FUNCTION, &artifact.content).saturating_sub(tests);

        if tests == 0 {
            return GateScore::new(
                0.0,
                vec![issue(Severity::Error, "no tests found", None)],
            );
        }
        if functions == 0 {
            return GateScore::perfect();
        }

        let ratio = (tests as f64 / functions as f64).min(1.0);
        let issues = if ratio < 1.0 {
            vec![issue(
                Severity::Warning,
                format!("{tests} tests for {functions} functions"),
                None,
            )]
        } else {
            Vec::new()
        };
        GateScore::new(ratio, issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(requires_tests: bool) -> TaskContext {
        TaskContext {
            step: "generate".to_string(),
            language: Some("rust".to_string()),
            requires_tests,
        }
    }

    #[test]
    fn test_not_required_scores_full() {
        let artifact = Artifact::new("fn a() {}\nfn b() {}\n", Some("rust"));
        assert_eq!(CoverageGate.evaluate(&artifact, &task(false)).score, 1.0);
    }

    #[test]
    fn test_missing_tests_score_zero() {
        let artifact = Artifact::new("pub fn a() {}\n", Some("rust"));
        let result = CoverageGate.evaluate(&artifact, &task(true));
        assert_eq!(result.score, 0.0);
        assert_eq!(result.issues[0].message, "no tests found");
    }

    #[test]
    fn test_ratio_of_tests_to_functions() {
        let rust = "pub fn a() {}\npub fn b() {}\n\n#[cfg(test)]\nmod tests {\n    #[test]\n    fn a_works() {}\n}\n";
        let result = CoverageGate.evaluate(&Artifact::new(rust, Some("rust")), &task(true));
        assert!((result.score - 0.5).abs() < 1e-12, "{result:?}");

        let python = "def add(a, b):\n    return a + b\n\ndef test_add():\n    assert add(1, 2) == 3\n";
        let result = CoverageGate.evaluate(&Artifact::new(python, Some("python")), &task(true));
        assert_eq!(result.score, 1.0);
    }
}
