//! Variable interpolation for `{{ scope.path }}` references
//!
//! Supports:
//! - {{input.NAME}}, {{env.NAME}}, {{runtime.NAME}}, {{config.NAME}}
//! - {{STEP_ID.path.to.field}} for recorded step outputs
//! - {{header.NAME}} is valid syntax but never resolves at interpolation time
//!
//! Resolution never fails in `resolve`: a reference that cannot be resolved is
//! left in the text verbatim. Use `validate_references` to find out why.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::LazyLock;

use super::context::{Scope, VariablePool};

static REFERENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap());

/// Errors that can occur while looking up a single reference
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpolationError {
    #[error("Invalid reference syntax: {0}")]
    InvalidSyntax(String),

    #[error("Variable not found: {scope}.{key}")]
    MissingKey { scope: String, key: String },

    #[error("No output recorded for step '{0}'")]
    UnknownStep(String),

    #[error("Path segment '{segment}' not found in {reference}")]
    PathNotFound { reference: String, segment: String },

    #[error("Header references are only available while a response is in flight: {0}")]
    HeaderUnavailable(String),
}

/// Parsed target of a reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceTarget<'a> {
    Scoped { scope: Scope, path: Vec<&'a str> },
    Header(&'a str),
    Step { step_id: &'a str, path: Vec<&'a str> },
}

/// Split a raw reference (without braces) into its target
pub fn parse_reference(reference: &str) -> Result<ReferenceTarget<'_>, InterpolationError> {
    let trimmed = reference.trim();
    let parts: Vec<&str> = trimmed.split('.').collect();

    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(InterpolationError::InvalidSyntax(reference.to_string()));
    }

    let head = parts[0];
    let rest = parts[1..].to_vec();

    // Header names may contain dots, so keep everything after the prefix
    if head == "header" {
        if rest.is_empty() {
            return Err(InterpolationError::InvalidSyntax(reference.to_string()));
        }
        return Ok(ReferenceTarget::Header(&trimmed[head.len() + 1..]));
    }

    match Scope::from_reference_prefix(head) {
        Some(scope) => {
            if rest.is_empty() {
                return Err(InterpolationError::InvalidSyntax(format!(
                    "{} references must name a key, got: {}",
                    scope, reference
                )));
            }
            Ok(ReferenceTarget::Scoped { scope, path: rest })
        }
        None => Ok(ReferenceTarget::Step {
            step_id: head,
            path: rest,
        }),
    }
}

/// Whether a leading segment names a scope rather than a step. Steps with
/// such an id can never be referenced.
pub fn is_reserved_prefix(segment: &str) -> bool {
    segment == "header" || Scope::from_reference_prefix(segment).is_some()
}

/// Resolve a single reference to its value
pub fn try_resolve_reference(
    reference: &str,
    pool: &VariablePool,
) -> Result<Value, InterpolationError> {
    match parse_reference(reference)? {
        ReferenceTarget::Header(name) => {
            Err(InterpolationError::HeaderUnavailable(name.to_string()))
        }
        ReferenceTarget::Scoped { scope, path } => {
            let key = path[0];
            let root = pool
                .get(scope, key)
                .ok_or_else(|| InterpolationError::MissingKey {
                    scope: scope.to_string(),
                    key: key.to_string(),
                })?;
            navigate(root, &path[1..], reference).cloned()
        }
        ReferenceTarget::Step { step_id, path } => {
            let output = pool
                .step_output(step_id)
                .ok_or_else(|| InterpolationError::UnknownStep(step_id.to_string()))?;
            navigate(output, &path, reference).cloned()
        }
    }
}

/// Walk a dotted path. Every intermediate value must be an object holding the
/// next key, or an array indexed by a number.
pub fn navigate<'v>(
    root: &'v Value,
    path: &[&str],
    reference: &str,
) -> Result<&'v Value, InterpolationError> {
    let mut current = root;
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(*segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| InterpolationError::PathNotFound {
            reference: reference.to_string(),
            segment: segment.to_string(),
        })?;
    }
    Ok(current)
}

/// String form of a resolved value
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_with(input: &str, pool: &VariablePool, render: impl Fn(&Value) -> String) -> String {
    REFERENCE_REGEX
        .replace_all(input, |caps: &regex::Captures| {
            let full_match = &caps[0];
            match try_resolve_reference(&caps[1], pool) {
                Ok(value) => render(&value),
                Err(_) => full_match.to_string(),
            }
        })
        .into_owned()
}

/// Replace every resolvable reference in `input`; unresolvable ones stay as-is
pub fn resolve(input: &str, pool: &VariablePool) -> String {
    resolve_with(input, pool, stringify)
}

/// `resolve` for serialized JSON text. References only occur inside JSON
/// strings there, so each substituted value is escaped as string content.
pub fn resolve_json_text(input: &str, pool: &VariablePool) -> String {
    resolve_with(input, pool, |value| {
        let quoted = Value::String(stringify(value)).to_string();
        quoted
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(quoted)
    })
}

/// Raw references in the order they appear
pub fn extract_references(input: &str) -> Vec<String> {
    REFERENCE_REGEX
        .captures_iter(input)
        .map(|cap| cap[1].trim().to_string())
        .collect()
}

/// Which kinds of variables a text refers to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableTypes {
    pub input: bool,
    pub env: bool,
    pub runtime: bool,
    pub config: bool,
    pub header: bool,
    /// Step ids referenced implicitly
    pub steps: BTreeSet<String>,
}

impl VariableTypes {
    pub fn is_empty(&self) -> bool {
        !self.input
            && !self.env
            && !self.runtime
            && !self.config
            && !self.header
            && self.steps.is_empty()
    }
}

/// Summarise the variable kinds used by a text
pub fn variable_types(input: &str) -> VariableTypes {
    let mut types = VariableTypes::default();
    for reference in extract_references(input) {
        match parse_reference(&reference) {
            Ok(ReferenceTarget::Scoped { scope, .. }) => match scope {
                Scope::Input => types.input = true,
                Scope::Env => types.env = true,
                Scope::Runtime => types.runtime = true,
                Scope::Config => types.config = true,
                Scope::Steps => {}
            },
            Ok(ReferenceTarget::Header(_)) => types.header = true,
            Ok(ReferenceTarget::Step { step_id, .. }) => {
                types.steps.insert(step_id.to_string());
            }
            Err(_) => {}
        }
    }
    types
}

/// Interpolate every string inside a JSON value, preserving structure
pub fn interpolate_value(value: &Value, pool: &VariablePool) -> Value {
    match value {
        Value::String(s) => Value::String(resolve(s, pool)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, pool)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, pool)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Outcome of checking one reference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceCheck {
    pub reference: String,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// References split by whether they currently resolve
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReferenceReport {
    pub valid: Vec<ReferenceCheck>,
    pub invalid: Vec<ReferenceCheck>,
}

impl ReferenceReport {
    pub fn all_resolved(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Check a list of references against the current pool
pub fn validate_references<S: AsRef<str>>(references: &[S], pool: &VariablePool) -> ReferenceReport {
    let mut report = ReferenceReport::default();
    for reference in references {
        let reference = reference.as_ref();
        match try_resolve_reference(reference, pool) {
            Ok(_) => report.valid.push(ReferenceCheck {
                reference: reference.to_string(),
                resolved: true,
                reason: None,
            }),
            Err(e) => report.invalid.push(ReferenceCheck {
                reference: reference.to_string(),
                resolved: false,
                reason: Some(e.to_string()),
            }),
        }
    }
    report
}
