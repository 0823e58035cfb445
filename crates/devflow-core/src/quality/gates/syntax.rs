//! Syntactic validity.
//!
//! Structured formats (JSON, YAML, TOML) are parsed. Everything else gets a
//! delimiter balance check that skips string literals and comments.

use devflow_types::quality::{Artifact, QualityIssue, Severity, TaskContext};

use crate::quality::gate::{GateScore, QualityGate, issue};

/// Score for artifacts with unbalanced delimiters. Below the floor.
const UNBALANCED_SCORE: f64 = 0.3;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyntaxGate;

impl QualityGate for SyntaxGate {
    fn name(&self) -> &str {
        "syntax"
    }

    fn critical_floor(&self) -> Option<f64> {
        Some(0.5)
    }

    fn evaluate(&self, artifact: &Artifact, task: &TaskContext) -> GateScore {
        if artifact.content.trim().is_empty() {
            return GateScore::new(
                0.0,
                vec![issue(Severity::Critical, "artifact is empty", None)],
            );
        }

        let language = artifact
            .language
            .as_deref()
            .or(task.language.as_deref())
            .unwrap_or("")
            .to_ascii_lowercase();

        let parsed = match language.as_str() {
            "json" => Some(
                serde_json::from_str::<serde_json::Value>(&artifact.content)
                    .map(|_| ())
                    .map_err(|e| (e.to_string(), Some(e.line()))),
            ),
            "yaml" | "yml" => Some(
                serde_yaml_ng::from_str::<serde_yaml_ng::Value>(&artifact.content)
                    .map(|_| ())
                    .map_err(|e| (e.to_string(), e.location().map(|l| l.line()))),
            ),
            "toml" => Some(
                artifact
                    .content
                    .parse::<toml::Table>()
                    .map(|_| ())
                    .map_err(|e| (e.message().to_string(), None)),
            ),
            _ => None,
        };

        match parsed {
            Some(Ok(())) => GateScore::perfect(),
            Some(Err((message, line))) => GateScore::new(
                0.0,
                vec![issue(
                    Severity::Critical,
                    format!("{language} parse error: {message}"),
                    line,
                )],
            ),
            None => {
                let issues = check_delimiters(&artifact.content, &language);
                if issues.is_empty() {
                    GateScore::perfect()
                } else {
                    GateScore::new(UNBALANCED_SCORE, issues)
                }
            }
        }
    }
}

fn hash_comments(language: &str) -> bool {
    matches!(
        language,
        "python" | "py" | "ruby" | "rb" | "shell" | "sh" | "bash" | "perl"
    )
}

/// Report unmatched or unclosed `()`, `[]`, `{}` and unterminated strings.
fn check_delimiters(source: &str, language: &str) -> Vec<QualityIssue> {
    let rust = language == "rust" || language == "rs";
    let hash = hash_comments(language);
    let chars: Vec<char> = source.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut issues = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if next == Some('/') && !hash => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '#' if hash => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') && !hash => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 2;
                continue;
            }
            '\'' if rust => {
                // Char literal ('a', '\n'); otherwise a lifetime.
                let close = if next == Some('\\') { i + 3 } else { i + 2 };
                if chars.get(close) == Some(&'\'') {
                    i = close + 1;
                    continue;
                }
            }
            '"' | '\'' | '`' => {
                let start_line = line;
                i += 1;
                while i < chars.len() && chars[i] != c {
                    if chars[i] == '\\' {
                        i += 1;
                    } else if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    issues.push(issue(
                        Severity::Error,
                        "unterminated string literal",
                        Some(start_line),
                    ));
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => issues.push(issue(
                        Severity::Error,
                        format!("'{c}' closes '{open}' opened on line {open_line}"),
                        Some(line),
                    )),
                    None => issues.push(issue(
                        Severity::Error,
                        format!("unmatched '{c}'"),
                        Some(line),
                    )),
                }
            }
            _ => {}
        }
        i += 1;
    }

    for (open, open_line) in stack {
        issues.push(issue(
            Severity::Error,
            format!("'{open}' is never closed"),
            Some(open_line),
        ));
    }
    issues
}
