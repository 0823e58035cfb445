//! Variable resolver for `${...}` expressions.
//!
//! Templates mix literal text with placeholders. A template that consists of
//! exactly one placeholder yields the typed value of its expression; anything
//! else renders every placeholder to text and concatenates. `$${` is a
//! literal `${`.
//!
//! Placeholder bodies and bare conditions are JEXL expressions evaluated by
//! `jexl_eval::Evaluator` with a fixed set of transforms (`name|upper`,
//! `title|replace(' ', '-')`, ...). JEXL reads a missing name as `null`, so
//! every referenced path is checked against the scope first: a name that is
//! not in scope is an error ([`ResolveError::Unresolved`]) unless it sits on
//! the left of `||`, which is how defaults are written:
//! `${reviewer || 'triage-bot'}`.
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, Utc};
use jexl_eval::Evaluator;
use jexl_eval::error::EvaluationError;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Name that evaluates to the current time (RFC 3339) unless the scope
/// defines it.
pub const NOW: &str = "now";

/// Transforms available after `|`.
pub const TRANSFORMS: [&str; 16] = [
    "upper",
    "lower",
    "trim",
    "replace",
    "length",
    "contains",
    "starts_with",
    "ends_with",
    "split",
    "join",
    "string",
    "number",
    "json",
    "format_date",
    "not",
    "default",
];

// ---------------------------------------------------------------------------
// Errors and scope
// ---------------------------------------------------------------------------

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("unresolved variable '{0}'")]
    Unresolved(String),

    #[error("syntax error in '{expr}': {message}")]
    Syntax { expr: String, message: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),
}

/// Anything variables can be looked up in.
pub trait Scope {
    fn get(&self, name: &str) -> Option<&Value>;
}

impl Scope for HashMap<String, Value> {
    fn get(&self, name: &str) -> Option<&Value> {
        HashMap::get(self, name)
    }
}

impl Scope for BTreeMap<String, Value> {
    fn get(&self, name: &str) -> Option<&Value> {
        BTreeMap::get(self, name)
    }
}

impl Scope for Map<String, Value> {
    fn get(&self, name: &str) -> Option<&Value> {
        Map::get(self, name)
    }
}

/// A variable reference found by static analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// First path segment (the context variable name).
    pub root: String,
    /// True when the reference sits on the left of `||`.
    pub defaulted: bool,
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Resolve a template string against a scope.
pub fn resolve(template: &str, scope: &dyn Scope) -> Result<Value, ResolveError> {
    let segments = parse_template(template)?;
    if let [Segment::Expr(body)] = segments.as_slice() {
        return eval(body, scope);
    }
    let mut rendered = String::new();
    for segment in &segments {
        match segment {
            Segment::Text(text) => rendered.push_str(text),
            Segment::Expr(body) => rendered.push_str(&value_to_string(&eval(body, scope)?)),
        }
    }
    Ok(Value::String(rendered))
}

/// Resolve every string inside a (possibly nested) value.
pub fn resolve_value(value: &Value, scope: &dyn Scope) -> Result<Value, ResolveError> {
    match value {
        Value::String(template) => resolve(template, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, scope)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluate an expression written either as a template (`${a > 1}`) or bare
/// (`a > 1`).
pub fn evaluate(source: &str, scope: &dyn Scope) -> Result<Value, ResolveError> {
    if source.contains("${") {
        resolve(source, scope)
    } else {
        eval(source, scope)
    }
}

/// Evaluate a condition with JavaScript-like truthiness.
pub fn evaluate_condition(source: &str, scope: &dyn Scope) -> Result<bool, ResolveError> {
    evaluate(source, scope).map(|value| value_to_bool(&value))
}

/// List the variables a template references. Placeholder syntax is checked.
pub fn references(template: &str) -> Result<Vec<Reference>, ResolveError> {
    let mut refs = Vec::new();
    for segment in parse_template(template)? {
        if let Segment::Expr(body) = segment {
            refs.extend(body_references(&body)?);
        }
    }
    Ok(refs)
}

/// List the variables an expression (template or bare) references.
pub fn expression_references(source: &str) -> Result<Vec<Reference>, ResolveError> {
    if source.contains("${") {
        references(source)
    } else {
        body_references(source)
    }
}

/// List the variables referenced by every string inside a value.
pub fn value_references(value: &Value) -> Result<Vec<Reference>, ResolveError> {
    let mut refs = Vec::new();
    walk_strings(value, &mut |template: &str| {
        refs.extend(references(template)?);
        Ok(())
    })?;
    Ok(refs)
}

fn walk_strings(
    value: &Value,
    visit: &mut dyn FnMut(&str) -> Result<(), ResolveError>,
) -> Result<(), ResolveError> {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().try_for_each(|item| walk_strings(item, visit)),
        Value::Object(map) => map.values().try_for_each(|item| walk_strings(item, visit)),
        _ => Ok(()),
    }
}

/// Extract a dotted result path (`issue.labels[0]`, `items.2.name`) from a
/// value. An empty path or `.` returns the value itself.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() || path == "." {
        return Some(value);
    }
    let mut current = value;
    for part in path.split('.') {
        let (key, indexes) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        let mut rest = indexes;
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let index: usize = stripped[..close].trim().parse().ok()?;
            current = current.as_array()?.get(index)?;
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(current)
}

/// JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Render a value for string interpolation. Strings are inserted verbatim,
/// everything else as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => normalize_numbers(other.clone()).to_string(),
    }
}

// ---------------------------------------------------------------------------
// Template splitting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Expr(String),
}

fn parse_template(template: &str) -> Result<Vec<Segment>, ResolveError> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find("${") {
        if rest[..pos].ends_with('$') {
            text.push_str(&rest[..pos - 1]);
            text.push_str("${");
            rest = &rest[pos + 2..];
            continue;
        }
        text.push_str(&rest[..pos]);
        let body_start = pos + 2;
        let close = find_closing_brace(&rest[body_start..]).ok_or_else(|| ResolveError::Syntax {
            expr: template.to_string(),
            message: "unterminated '${'".to_string(),
        })?;
        let body = rest[body_start..body_start + close].trim();
        if body.is_empty() {
            return Err(ResolveError::Syntax {
                expr: template.to_string(),
                message: "empty expression".to_string(),
            });
        }
        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(&mut text)));
        }
        segments.push(Segment::Expr(body.to_string()));
        rest = &rest[body_start + close + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() || segments.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

/// Byte offset of the `}` closing a placeholder body, skipping quoted text.
fn find_closing_brace(body: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in body.char_indices() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '}' => return Some(idx),
                _ => {}
            },
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

thread_local! {
    static EVALUATOR: Evaluator<'static> = build_evaluator();
}

/// Evaluate one expression body against `scope`.
///
/// Syntax errors win over unresolved names, which win over type errors.
fn eval(body: &str, scope: &dyn Scope) -> Result<Value, ResolveError> {
    let paths = scan(body)?;

    let mut context = Map::new();
    let mut unresolved: Option<String> = None;
    for path in &paths {
        let root = scope.get(&path.root).cloned().or_else(|| {
            (path.root == NOW).then(|| Value::String(Utc::now().to_rfc3339()))
        });
        if !path.defaulted && unresolved.is_none() && !path.resolves(root.as_ref()) {
            unresolved = Some(path.describe());
        }
        if !context.contains_key(&path.root) {
            context.insert(
                path.root.clone(),
                root.map(float_numbers).unwrap_or(Value::Null),
            );
        }
    }

    let context = Value::Object(context);
    let evaluated = EVALUATOR.with(|evaluator| {
        evaluator
            .eval_in_context(body, &context)
            .map_err(|e| classify(body, e))
    });
    match (evaluated, unresolved) {
        (Err(syntax @ ResolveError::Syntax { .. }), _) => Err(syntax),
        (_, Some(path)) => Err(ResolveError::Unresolved(path)),
        (Err(other), None) => Err(other),
        (Ok(value), None) => Ok(normalize_numbers(value)),
    }
}

fn classify(body: &str, error: EvaluationError) -> ResolveError {
    match error {
        EvaluationError::ParseError(_) => ResolveError::Syntax {
            expr: body.to_string(),
            message: error.to_string(),
        },
        other => ResolveError::Type(other.to_string()),
    }
}

/// Static reference list of one body. Syntax is checked by evaluating the
/// body with every referenced name bound to `null`.
fn body_references(body: &str) -> Result<Vec<Reference>, ResolveError> {
    let paths = scan(body)?;
    let context = Value::Object(
        paths
            .iter()
            .map(|path| (path.root.clone(), Value::Null))
            .collect(),
    );
    let checked = EVALUATOR.with(|evaluator| {
        evaluator
            .eval_in_context(body, &context)
            .map(|_| ())
            .map_err(|e| classify(body, e))
    });
    if let Err(syntax @ ResolveError::Syntax { .. }) = checked {
        return Err(syntax);
    }
    Ok(paths
        .into_iter()
        .filter(|path| path.root != NOW)
        .map(|path| Reference {
            root: path.root,
            defaulted: path.defaulted,
        })
        .collect())
}

/// JEXL arithmetic works on floats; the context is handed over that way so
/// `count == 3` compares like for like.
fn float_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map_or(Value::Number(n), Value::Number),
        Value::Array(items) => Value::Array(items.into_iter().map(float_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, float_numbers(item)))
                .collect(),
        ),
        other => other,
    }
}

/// Integral floats become JSON integers so they render without a fraction.
fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Value::from(f as i64)
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, normalize_numbers(item)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

static NULL: Value = Value::Null;

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&NULL)
}

fn text(args: &[Value], index: usize) -> String {
    value_to_string(arg(args, index))
}

fn build_evaluator() -> Evaluator<'static> {
    Evaluator::new()
        .with_transform("upper", |args: &[Value]| {
            Ok(json!(text(args, 0).to_uppercase()))
        })
        .with_transform("lower", |args: &[Value]| {
            Ok(json!(text(args, 0).to_lowercase()))
        })
        .with_transform("trim", |args: &[Value]| Ok(json!(text(args, 0).trim())))
        .with_transform("replace", |args: &[Value]| {
            Ok(json!(text(args, 0).replace(&text(args, 1), &text(args, 2))))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match arg(args, 0) {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => anyhow::bail!("length of {}", type_name(other)),
            };
            Ok(json!(len))
        })
        .with_transform("contains", |args: &[Value]| {
            let needle = arg(args, 1);
            let found = match arg(args, 0) {
                Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
                Value::Object(map) => map.contains_key(&value_to_string(needle)),
                subject => value_to_string(subject).contains(&value_to_string(needle)),
            };
            Ok(json!(found))
        })
        .with_transform("starts_with", |args: &[Value]| {
            Ok(json!(text(args, 0).starts_with(&text(args, 1))))
        })
        .with_transform("ends_with", |args: &[Value]| {
            Ok(json!(text(args, 0).ends_with(&text(args, 1))))
        })
        .with_transform("split", |args: &[Value]| {
            let separator = text(args, 1);
            let parts: Vec<String> = text(args, 0)
                .split(separator.as_str())
                .map(str::to_string)
                .collect();
            Ok(json!(parts))
        })
        .with_transform("join", |args: &[Value]| {
            let Some(items) = arg(args, 0).as_array() else {
                anyhow::bail!("join of {}", type_name(arg(args, 0)));
            };
            let parts: Vec<String> = items.iter().map(value_to_string).collect();
            Ok(json!(parts.join(&text(args, 1))))
        })
        .with_transform("string", |args: &[Value]| Ok(json!(text(args, 0))))
        .with_transform("number", |args: &[Value]| match arg(args, 0) {
            Value::Number(n) => Ok(Value::Number(n.clone())),
            Value::Bool(b) => Ok(json!(u8::from(*b))),
            other => {
                let raw = value_to_string(other);
                let parsed: f64 = raw
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("cannot convert '{raw}' to a number"))?;
                Ok(json!(parsed))
            }
        })
        .with_transform("json", |args: &[Value]| {
            Ok(json!(normalize_numbers(arg(args, 0).clone()).to_string()))
        })
        .with_transform("format_date", |args: &[Value]| {
            let raw = text(args, 0);
            let format = text(args, 1);
            let date = parse_date(&raw).ok_or_else(|| anyhow::anyhow!("'{raw}' is not a date"))?;
            let mut rendered = String::new();
            write!(rendered, "{}", date.format(&format))
                .map_err(|_| anyhow::anyhow!("invalid date format '{format}'"))?;
            Ok(json!(rendered))
        })
        .with_transform("not", |args: &[Value]| Ok(json!(!value_to_bool(arg(args, 0)))))
        .with_transform("default", |args: &[Value]| {
            let subject = arg(args, 0);
            Ok(if subject.is_null() {
                arg(args, 1).clone()
            } else {
                subject.clone()
            })
        })
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw == NOW {
        return Some(Utc::now());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Reference scan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum PathStep {
    Field(String),
    Index(usize),
    Key(String),
}

/// A variable path as written in an expression. Path steps stop at the
/// first computed index.
#[derive(Debug, Clone)]
struct PathRef {
    root: String,
    steps: Vec<PathStep>,
    defaulted: bool,
}

impl PathRef {
    fn resolves(&self, root: Option<&Value>) -> bool {
        let Some(mut current) = root else {
            return false;
        };
        for step in &self.steps {
            let next = match step {
                PathStep::Field(name) | PathStep::Key(name) => current.get(name.as_str()),
                PathStep::Index(index) => current.get(*index),
            };
            match next {
                Some(value) => current = value,
                None => return false,
            }
        }
        true
    }

    fn describe(&self) -> String {
        let mut out = self.root.clone();
        for step in &self.steps {
            match step {
                PathStep::Field(name) => {
                    out.push('.');
                    out.push_str(name);
                }
                PathStep::Index(index) => {
                    let _ = write!(out, "[{index}]");
                }
                PathStep::Key(key) => {
                    let _ = write!(out, "['{key}']");
                }
            }
        }
        out
    }
}

const KEYWORDS: [&str; 4] = ["true", "false", "null", "in"];

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Collect variable paths and check transform names.
fn scan(body: &str) -> Result<Vec<PathRef>, ResolveError> {
    let syntax = |message: &str| ResolveError::Syntax {
        expr: body.to_string(),
        message: message.to_string(),
    };
    let chars: Vec<char> = body.chars().collect();
    let mut paths = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                i = skip_string(&chars, i).ok_or_else(|| syntax("unterminated string literal"))?;
            }
            '|' if chars.get(i + 1) == Some(&'|') => i += 2,
            '|' => {
                i = skip_whitespace(&chars, i + 1);
                let (name, end) = read_ident(&chars, i);
                if name.is_empty() {
                    return Err(syntax("expected a transform name after '|'"));
                }
                if !TRANSFORMS.contains(&name.as_str()) {
                    return Err(ResolveError::UnknownFunction(name));
                }
                i = end;
            }
            '.' => {
                // Field access on a computed value, e.g. `(a).b`.
                let (_, end) = read_ident(&chars, skip_whitespace(&chars, i + 1));
                i = end.max(i + 1);
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
            }
            c if is_ident_start(c) => {
                let (root, end) = read_ident(&chars, i);
                i = end;
                if KEYWORDS.contains(&root.as_str()) {
                    continue;
                }
                let (steps, end) = read_steps(&chars, i);
                i = end;
                paths.push(PathRef {
                    root,
                    steps,
                    defaulted: left_of_or(&chars, i),
                });
            }
            _ => i += 1,
        }
    }
    Ok(paths)
}

fn read_ident(chars: &[char], start: usize) -> (String, usize) {
    if !chars.get(start).is_some_and(|c| is_ident_start(*c)) {
        return (String::new(), start);
    }
    let mut end = start;
    while end < chars.len() && is_ident_char(chars[end]) {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

/// Literal path steps after a root: `.field`, `[0]`, `['key']`.
fn read_steps(chars: &[char], mut i: usize) -> (Vec<PathStep>, usize) {
    let mut steps = Vec::new();
    loop {
        match chars.get(i) {
            Some('.') => {
                let (field, end) = read_ident(chars, i + 1);
                if field.is_empty() {
                    return (steps, i);
                }
                steps.push(PathStep::Field(field));
                i = end;
            }
            Some('[') => {
                let Some(close) = chars[i..].iter().position(|c| *c == ']') else {
                    return (steps, i);
                };
                let inner: String = chars[i + 1..i + close].iter().collect();
                let inner = inner.trim();
                let quoted = inner.len() >= 2
                    && ((inner.starts_with('\'') && inner.ends_with('\''))
                        || (inner.starts_with('"') && inner.ends_with('"')));
                if let Ok(index) = inner.parse::<usize>() {
                    steps.push(PathStep::Index(index));
                } else if quoted && !inner[1..inner.len() - 1].contains(['\'', '"', '\\']) {
                    steps.push(PathStep::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    // Computed index: scanned as ordinary expression text.
                    return (steps, i);
                }
                i += close + 1;
            }
            _ => return (steps, i),
        }
    }
}

/// Whether the expression text after `start` continues with `||` before
/// the current operand ends at `?` or `:`.
fn left_of_or(chars: &[char], start: usize) -> bool {
    let mut depth = 0i32;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\'' | '"' => match skip_string(chars, i) {
                Some(end) => {
                    i = end;
                    continue;
                }
                None => return false,
            },
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = (depth - 1).max(0),
            '?' | ':' if depth == 0 => return false,
            '|' if chars.get(i + 1) == Some(&'|') => {
                if depth == 0 {
                    return true;
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// Index just past the string literal opening at `start`.
fn skip_string(chars: &[char], start: usize) -> Option<usize> {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while chars.get(i).is_some_and(|c| c.is_whitespace()) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        vars.insert("name".into(), json!("Ada"));
        vars.insert("count".into(), json!(3));
        vars.insert("empty".into(), json!(""));
        vars.insert(
            "issue".into(),
            json!({"title": "Crash on start", "labels": ["bug", "p1"], "meta": {"id": 42}}),
        );
        vars.insert("when".into(), json!("2024-03-05T10:15:00Z"));
        vars
    }

    #[test]
    fn test_single_placeholder_keeps_type() {
        let s = scope();
        assert_eq!(resolve("${count}", &s).unwrap(), json!(3));
        assert_eq!(resolve("${issue.labels}", &s).unwrap(), json!(["bug", "p1"]));
        assert_eq!(resolve("${issue.meta}", &s).unwrap(), json!({"id": 42}));
    }

    #[test]
    fn test_mixed_template_renders_string() {
        let s = scope();
        assert_eq!(
            resolve("Hello ${name}, ${count} new", &s).unwrap(),
            json!("Hello Ada, 3 new")
        );
    }

    #[test]
    fn test_plain_text_passes_through() {
        let s = scope();
        assert_eq!(resolve("no placeholders", &s).unwrap(), json!("no placeholders"));
        assert_eq!(resolve("", &s).unwrap(), json!(""));
    }

    #[test]
    fn test_dotted_paths_and_indexes() {
        let s = scope();
        assert_eq!(resolve("${issue.meta.id}", &s).unwrap(), json!(42));
        assert_eq!(resolve("${issue.labels[1]}", &s).unwrap(), json!("p1"));
        assert_eq!(resolve("${issue['title']}", &s).unwrap(), json!("Crash on start"));
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let s = scope();
        assert_eq!(
            resolve("${reviewer}", &s).unwrap_err(),
            ResolveError::Unresolved("reviewer".into())
        );
        assert_eq!(
            resolve("${issue.owner}", &s).unwrap_err(),
            ResolveError::Unresolved("issue.owner".into())
        );
        assert_eq!(
            resolve("${issue.labels[9]}", &s).unwrap_err(),
            ResolveError::Unresolved("issue.labels[9]".into())
        );
        assert_eq!(
            resolve("${count > 1 && reviewer == 'x'}", &s).unwrap_err(),
            ResolveError::Unresolved("reviewer".into())
        );
    }

    #[test]
    fn test_default_value_form() {
        let s = scope();
        assert_eq!(resolve("${reviewer || 'triage-bot'}", &s).unwrap(), json!("triage-bot"));
        assert_eq!(resolve("${name || 'nobody'}", &s).unwrap(), json!("Ada"));
        assert_eq!(resolve("${empty || 'fallback'}", &s).unwrap(), json!("fallback"));
        assert_eq!(resolve("${issue.owner || null}", &s).unwrap(), json!(null));
    }

    #[test]
    fn test_transforms() {
        let s = scope();
        assert_eq!(resolve("${name|upper}", &s).unwrap(), json!("ADA"));
        assert_eq!(resolve("${'ABC'|lower}", &s).unwrap(), json!("abc"));
        assert_eq!(
            resolve("${issue.title|replace(' ', '-')}", &s).unwrap(),
            json!("Crash-on-start")
        );
        assert_eq!(resolve("${issue.labels|length}", &s).unwrap(), json!(2));
        assert_eq!(resolve("${issue.labels|contains('bug')}", &s).unwrap(), json!(true));
        assert_eq!(resolve("${issue.labels|join(', ')}", &s).unwrap(), json!("bug, p1"));
        assert_eq!(resolve("${'a,b'|split(',')}", &s).unwrap(), json!(["a", "b"]));
        assert_eq!(resolve("${('2.5'|number) * 2}", &s).unwrap(), json!(5));
        assert_eq!(resolve("${count|string}", &s).unwrap(), json!("3"));
        assert_eq!(resolve("${issue.meta|json}", &s).unwrap(), json!("{\"id\":42}"));
        assert_eq!(
            resolve("${when|format_date('%Y-%m-%d')}", &s).unwrap(),
            json!("2024-03-05")
        );
        assert_eq!(
            resolve("${'2024-01-31'|format_date('%d/%m')}", &s).unwrap(),
            json!("31/01")
        );
        assert_eq!(resolve("${name|trim|lower}", &s).unwrap(), json!("ada"));
    }

    #[test]
    fn test_now_is_builtin_unless_shadowed() {
        let s = scope();
        let today = Utc::now().format("%Y").to_string();
        assert_eq!(resolve("${now|format_date('%Y')}", &s).unwrap(), json!(today));

        let mut shadowed = scope();
        shadowed.insert("now".into(), json!("2020-01-01"));
        assert_eq!(resolve("${now}", &shadowed).unwrap(), json!("2020-01-01"));
        assert!(references("${now}").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let s = scope();
        assert_eq!(
            resolve("${name|shell('ls')}", &s).unwrap_err(),
            ResolveError::UnknownFunction("shell".into())
        );
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let s = scope();
        assert_eq!(resolve("${count + 1}", &s).unwrap(), json!(4));
        assert_eq!(resolve("${count / 2}", &s).unwrap(), json!(1.5));
        assert_eq!(resolve("${(count + 1) * 2 - 1}", &s).unwrap(), json!(7));
        assert_eq!(resolve("${count == 3}", &s).unwrap(), json!(true));
        assert_eq!(resolve("${count >= 3 && name == 'Ada'}", &s).unwrap(), json!(true));
        assert_eq!(resolve("${(count > 5)|not}", &s).unwrap(), json!(true));
        assert_eq!(resolve("${(count > 5) ? 'many' : 'few'}", &s).unwrap(), json!("few"));
        assert_eq!(resolve("${'bug' in issue.labels}", &s).unwrap(), json!(true));
        assert!(matches!(
            resolve("${'abc'|number}", &s).unwrap_err(),
            ResolveError::Type(_)
        ));
    }

    #[test]
    fn test_escaped_placeholder() {
        let s = scope();
        assert_eq!(resolve("cost: $${count}", &s).unwrap(), json!("cost: ${count}"));
    }

    #[test]
    fn test_brace_inside_string_literal() {
        let s = scope();
        assert_eq!(resolve("${'{' + name + '}'}", &s).unwrap(), json!("{Ada}"));
    }

    #[test]
    fn test_syntax_errors() {
        let s = scope();
        assert!(matches!(resolve("${count +}", &s), Err(ResolveError::Syntax { .. })));
        assert!(matches!(resolve("${count", &s), Err(ResolveError::Syntax { .. })));
        assert!(matches!(resolve("${}", &s), Err(ResolveError::Syntax { .. })));
        assert!(matches!(resolve("${a b}", &s), Err(ResolveError::Syntax { .. })));
        assert!(matches!(references("${1 +}"), Err(ResolveError::Syntax { .. })));
    }

    #[test]
    fn test_conditions_bare_and_templated() {
        let s = scope();
        assert!(evaluate_condition("count > 2", &s).unwrap());
        assert!(evaluate_condition("${count > 2}", &s).unwrap());
        assert!(!evaluate_condition("${empty}", &s).unwrap());
        assert!(!evaluate_condition("missing || false", &s).unwrap());
        assert!(evaluate_condition("issue.labels|contains('p1')", &s).unwrap());
        assert_eq!(evaluate("[1, 2]", &s).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_resolve_value_nested() {
        let s = scope();
        let input = json!({"title": "${issue.title}", "tags": ["${name}", 7], "n": 1});
        assert_eq!(
            resolve_value(&input, &s).unwrap(),
            json!({"title": "Crash on start", "tags": ["Ada", 7], "n": 1})
        );
    }

    #[test]
    fn test_references_mark_defaults() {
        let refs = references("${a.b + c} and ${d || e}").unwrap();
        let roots: Vec<(&str, bool)> = refs.iter().map(|r| (r.root.as_str(), r.defaulted)).collect();
        assert_eq!(
            roots,
            vec![("a", false), ("c", false), ("d", true), ("e", false)]
        );
        let refs = expression_references("x > 1 && (y|upper) == 'Y'").unwrap();
        let roots: Vec<&str> = refs.iter().map(|r| r.root.as_str()).collect();
        assert_eq!(roots, vec!["x", "y"]);
        let refs = expression_references("(a.b + c[i]) || 'none'").unwrap();
        assert!(refs.iter().all(|r| r.defaulted), "{refs:?}");
        let refs = value_references(&json!({"k": ["${m}", "text"]})).unwrap();
        assert_eq!(refs[0].root, "m");
    }

    #[test]
    fn test_string_contents_are_not_references() {
        let refs = expression_references("name == 'x.y || z' && \"q\" != w").unwrap();
        let roots: Vec<(&str, bool)> = refs.iter().map(|r| (r.root.as_str(), r.defaulted)).collect();
        assert_eq!(roots, vec![("name", false), ("w", false)]);
    }

    #[test]
    fn test_extract_path() {
        let value = json!({"issue": {"labels": ["bug", "p1"], "items": [{"name": "x"}]}});
        assert_eq!(extract_path(&value, "issue.labels[1]"), Some(&json!("p1")));
        assert_eq!(extract_path(&value, "issue.items.0.name"), Some(&json!("x")));
        assert_eq!(extract_path(&value, "."), Some(&value));
        assert_eq!(extract_path(&value, "issue.missing"), None);
        assert_eq!(extract_path(&value, "issue.labels[5]"), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!value_to_bool(&json!(null)));
        assert!(!value_to_bool(&json!(0)));
        assert!(!value_to_bool(&json!("")));
        assert!(value_to_bool(&json!("false")));
        assert!(value_to_bool(&json!([])));
        assert!(value_to_bool(&json!({})));
    }
}
