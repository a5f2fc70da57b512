//! Diagnostics Engine
//!
//! Every condition worth reporting during build, resolution, execution or
//! resume becomes a [`Diagnostic`]. Inputs arrive in several shapes (plain
//! messages from steps, JSON objects from adapters, ready-made entries) and
//! are normalized into one entry type here.
//!
//! # Modes
//!
//! - [`DiagnosticsMode::Default`]: warnings are reported, the run proceeds.
//! - [`DiagnosticsMode::Strict`]: `requirement` and `pipeline` warnings are
//!   promoted to errors, which aborts the run.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Warn,
    Error,
}

/// Which part of the system produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// A contract, pack or plugin minimum capability is unmet
    Requirement,
    /// Reported by the executor or by a step through its reporter
    Pipeline,
    /// Duplicate packs, unknown plugins or extension points
    Recipe,
    /// Invalid or expired tokens, mismatched continuations
    Resume,
    /// Provider lookup failures during adapter resolution
    Adapter,
    /// A rollback handler failed
    Rollback,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Requirement => "requirement",
            Kind::Pipeline => "pipeline",
            Kind::Recipe => "recipe",
            Kind::Resume => "resume",
            Kind::Adapter => "adapter",
            Kind::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// How warnings are escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticsMode {
    #[default]
    Default,
    Strict,
}

/// One reportable condition. Never mutated once collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: Level,
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Diagnostic {
    pub fn warn(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            level: Level::Warn,
            kind,
            code: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn error(kind: Kind, message: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            ..Self::warn(kind, message)
        }
    }

    /// Attaches a stable machine-readable code such as `recipe.duplicatePack`.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == Level::Error
    }

    /// Creates a requirement diagnostic naming the recipe and capability.
    pub fn requirement(recipe: &str, capability: &str) -> Self {
        Self::warn(
            Kind::Requirement,
            format!(
                "Recipe \"{}\" requires capability \"{}\"",
                recipe, capability
            ),
        )
        .with_code("requirement.missingCapability")
        .with_data(serde_json::json!({ "recipe": recipe, "capability": capability }))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            Level::Warn => "warn",
            Level::Error => "error",
        };
        write!(f, "[{} {}] {}", level, self.kind, self.message)
    }
}

/// Heterogeneous diagnostic input accepted by [`normalize`].
#[derive(Debug, Clone)]
pub enum DiagnosticInput {
    Message(String),
    Entry(Diagnostic),
    Json(Value),
}

impl From<&str> for DiagnosticInput {
    fn from(message: &str) -> Self {
        DiagnosticInput::Message(message.to_string())
    }
}

impl From<String> for DiagnosticInput {
    fn from(message: String) -> Self {
        DiagnosticInput::Message(message)
    }
}

impl From<Diagnostic> for DiagnosticInput {
    fn from(entry: Diagnostic) -> Self {
        DiagnosticInput::Entry(entry)
    }
}

impl From<Value> for DiagnosticInput {
    fn from(value: Value) -> Self {
        DiagnosticInput::Json(value)
    }
}

/// Normalizes any diagnostic input into a [`Diagnostic`].
///
/// Plain messages and unrecognized JSON become `pipeline` warnings.
/// JSON objects may carry `level`, `kind`, `code`, `message` and `data`.
pub fn normalize(input: impl Into<DiagnosticInput>) -> Diagnostic {
    match input.into() {
        DiagnosticInput::Message(message) => Diagnostic::warn(Kind::Pipeline, message),
        DiagnosticInput::Entry(entry) => entry,
        DiagnosticInput::Json(value) => normalize_json(value),
    }
}

fn normalize_json(value: Value) -> Diagnostic {
    let Value::Object(ref map) = value else {
        let message = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        return Diagnostic::warn(Kind::Pipeline, message);
    };

    let Some(message) = map.get("message").and_then(Value::as_str) else {
        return Diagnostic::warn(Kind::Pipeline, value.to_string());
    };

    let level = map
        .get("level")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(Level::Warn);
    let kind = map
        .get("kind")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(Kind::Pipeline);

    Diagnostic {
        level,
        kind,
        code: map.get("code").and_then(Value::as_str).map(str::to_string),
        message: message.to_string(),
        data: map.get("data").cloned(),
    }
}

/// Returns true if a warning of this kind is promoted under strict mode.
fn escalates(kind: Kind) -> bool {
    matches!(kind, Kind::Requirement | Kind::Pipeline)
}

/// Applies the escalation policy of `mode` to a list of diagnostics.
pub fn apply_mode(mode: DiagnosticsMode, diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    match mode {
        DiagnosticsMode::Default => diagnostics,
        DiagnosticsMode::Strict => diagnostics
            .into_iter()
            .map(|mut d| {
                if d.level == Level::Warn && escalates(d.kind) {
                    d.level = Level::Error;
                }
                d
            })
            .collect(),
    }
}

/// Returns true if any diagnostic is at error level.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// Append-only diagnostics sink.
///
/// Owned by the executor and lent to each step for the duration of one call.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    entries: Vec<Diagnostic>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a reporter with diagnostics carried over from an earlier phase.
    pub fn with_entries(entries: Vec<Diagnostic>) -> Self {
        Self { entries }
    }

    pub fn report(&mut self, input: impl Into<DiagnosticInput>) {
        self.entries.push(normalize(input));
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = Diagnostic>) {
        self.entries.extend(entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Entries recorded at or after position `from`.
    pub fn since(&self, from: usize) -> &[Diagnostic] {
        &self.entries[from.min(self.entries.len())..]
    }

    /// Removes and returns the entries recorded at or after `at`.
    pub fn split_off(&mut self, at: usize) -> Vec<Diagnostic> {
        let at = at.min(self.entries.len());
        self.entries.split_off(at)
    }

    pub fn into_entries(self) -> Vec<Diagnostic> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_plain_message() {
        let d = normalize("model timed out");
        assert_eq!(d.level, Level::Warn);
        assert_eq!(d.kind, Kind::Pipeline);
        assert_eq!(d.message, "model timed out");
    }

    #[test]
    fn test_normalize_json_object() {
        let d = normalize(json!({
            "level": "error",
            "kind": "resume",
            "code": "resume.badShape",
            "message": "continuation missing decision",
            "data": { "field": "decision" }
        }));
        assert_eq!(d.level, Level::Error);
        assert_eq!(d.kind, Kind::Resume);
        assert_eq!(d.code.as_deref(), Some("resume.badShape"));
        assert_eq!(d.data, Some(json!({ "field": "decision" })));
    }

    #[test]
    fn test_normalize_json_unknown_kind_falls_back() {
        let d = normalize(json!({ "kind": "telemetry", "message": "hi" }));
        assert_eq!(d.kind, Kind::Pipeline);
        assert_eq!(d.level, Level::Warn);
    }

    #[test]
    fn test_normalize_json_without_message_is_stringified() {
        let d = normalize(json!({ "retries": 3 }));
        assert_eq!(d.kind, Kind::Pipeline);
        assert!(d.message.contains("retries"));

        let d = normalize(json!(42));
        assert_eq!(d.message, "42");
    }

    #[test]
    fn test_strict_escalates_requirement_and_pipeline_only() {
        let input = vec![
            Diagnostic::requirement("agent", "model"),
            Diagnostic::warn(Kind::Pipeline, "slow"),
            Diagnostic::warn(Kind::Recipe, "duplicate pack"),
        ];

        let default = apply_mode(DiagnosticsMode::Default, input.clone());
        assert!(!has_errors(&default));

        let strict = apply_mode(DiagnosticsMode::Strict, input);
        assert_eq!(strict[0].level, Level::Error);
        assert_eq!(strict[1].level, Level::Error);
        assert_eq!(strict[2].level, Level::Warn);
    }

    #[test]
    fn test_requirement_message_names_recipe_and_capability() {
        let d = Diagnostic::requirement("rag", "retriever");
        assert!(d.message.contains("rag"));
        assert!(d.message.contains("retriever"));
        assert_eq!(d.kind, Kind::Requirement);
    }

    #[test]
    fn test_reporter_since() {
        let mut reporter = Reporter::with_entries(vec![Diagnostic::warn(Kind::Recipe, "old")]);
        let mark = reporter.len();
        reporter.report("new");
        assert_eq!(reporter.since(mark).len(), 1);
        assert_eq!(reporter.since(mark)[0].message, "new");
        assert_eq!(reporter.since(99).len(), 0);
    }

    #[test]
    fn test_diagnostic_serializes_lowercase() {
        let d = Diagnostic::error(Kind::Resume, "bad token");
        let value = serde_json::to_value(&d).unwrap();
        assert_eq!(value["level"], "error");
        assert_eq!(value["kind"], "resume");
        assert!(value.get("code").is_none());
    }
}
