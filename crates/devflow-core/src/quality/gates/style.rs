//! Style and consistency checks.

use devflow_types::quality::{Artifact, Severity, TaskContext};

use crate::quality::gate::{GateScore, QualityGate, issue, penalized};

/// Long lines, trailing whitespace, mixed indentation and leftover markers.
#[derive(Debug, Clone, Copy)]
pub struct StyleGate {
    pub max_line_length: usize,
}

impl Default for StyleGate {
    fn default() -> Self {
        Self {
            max_line_length: 120,
        }
    }
}

fn penalty(severity: Severity) -> f64 {
    match severity {
        Severity::Critical | Severity::Error => 0.2,
        Severity::Warning => 0.05,
        Severity::Info => 0.02,
    }
}

impl QualityGate for StyleGate {
    fn name(&self) -> &str {
        "style"
    }

    fn weight(&self) -> f64 {
        0.5
    }

    fn evaluate(&self, artifact: &Artifact, _task: &TaskContext) -> GateScore {
        let mut issues = Vec::new();
        let mut tab_indented = false;
        let mut space_indented = false;

        for (index, line) in artifact.content.lines().enumerate() {
            let number = Some(index + 1);
            let width = line.chars().count();
            if width > self.max_line_length {
                issues.push(issue(
                    Severity::Warning,
                    format!("line is {width} characters (max {})", self.max_line_length),
                    number,
                ));
            }
            if line.ends_with(' ') || line.ends_with('\t') {
                issues.push(issue(Severity::Info, "trailing whitespace", number));
            }
            match line.chars().next() {
                Some('\t') => tab_indented = true,
                Some(' ') => space_indented = true,
                _ => {}
            }
            if line.contains("TODO") || line.contains("FIXME") || line.contains("XXX:") {
                issues.push(issue(Severity::Info, "unresolved marker", number));
            }
        }

        if tab_indented && space_indented {
            issues.push(issue(
                Severity::Warning,
                "mixed tab and space indentation",
                None,
            ));
        }

        GateScore::new(penalized(&issues, penalty), issues)
    }
}
