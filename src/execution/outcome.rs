//! Run Outcomes
//!
//! Every run and resume ends in exactly one [`Outcome`]. Serialized, the
//! status is a `status` tag:
//!
//! ```json
//! { "status": "ok", "artefact": {}, "trace": [], "diagnostics": [] }
//! { "status": "error", "error": { "message": "..." }, "trace": [], "diagnostics": [] }
//! { "status": "paused", "token": "t1", "pauseKind": "external", "partialArtefact": {}, "diagnostics": [] }
//! { "status": "needs-human", "token": "t1", "artefact": {}, "diagnostics": [] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diagnostics::Diagnostic;
use crate::recipe::StepId;

use super::step::PauseKind;
use super::trace::Trace;

/// What went wrong in an error outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub message: String,
    /// Step that failed, if the failure happened inside a step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepId>,
}

impl OutcomeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step: None,
        }
    }

    pub fn at_step(message: impl Into<String>, step: StepId) -> Self {
        Self {
            message: message.into(),
            step: Some(step),
        }
    }
}

/// Terminal result of a run or resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    Ok {
        artefact: Value,
        trace: Trace,
        diagnostics: Vec<Diagnostic>,
    },
    Error {
        error: OutcomeError,
        trace: Trace,
        diagnostics: Vec<Diagnostic>,
    },
    #[serde(rename_all = "camelCase")]
    Paused {
        token: String,
        pause_kind: PauseKind,
        partial_artefact: Value,
        diagnostics: Vec<Diagnostic>,
    },
    NeedsHuman {
        token: String,
        artefact: Value,
        diagnostics: Vec<Diagnostic>,
    },
}

impl Outcome {
    /// An error outcome raised outside any step.
    pub fn error(message: impl Into<String>, diagnostics: Vec<Diagnostic>) -> Self {
        Outcome::Error {
            error: OutcomeError::new(message),
            trace: Trace::new(),
            diagnostics,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Ok { .. } => "ok",
            Outcome::Error { .. } => "error",
            Outcome::Paused { .. } => "paused",
            Outcome::NeedsHuman { .. } => "needs-human",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error { .. })
    }

    /// True for both `paused` and `needs-human`.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Outcome::Paused { .. } | Outcome::NeedsHuman { .. })
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            Outcome::Ok { diagnostics, .. }
            | Outcome::Error { diagnostics, .. }
            | Outcome::Paused { diagnostics, .. }
            | Outcome::NeedsHuman { diagnostics, .. } => diagnostics,
        }
    }

    /// The final artefact, or the partial one while suspended.
    pub fn artefact(&self) -> Option<&Value> {
        match self {
            Outcome::Ok { artefact, .. } | Outcome::NeedsHuman { artefact, .. } => Some(artefact),
            Outcome::Paused { partial_artefact, .. } => Some(partial_artefact),
            Outcome::Error { .. } => None,
        }
    }

    /// The pause token of a suspended outcome.
    pub fn token(&self) -> Option<&str> {
        match self {
            Outcome::Paused { token, .. } | Outcome::NeedsHuman { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Outcome::Error { error, .. } => Some(&error.message),
            _ => None,
        }
    }

    pub fn trace(&self) -> Option<&Trace> {
        match self {
            Outcome::Ok { trace, .. } | Outcome::Error { trace, .. } => Some(trace),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Kind;
    use serde_json::json;

    #[test]
    fn test_status_tags() {
        let ok = Outcome::Ok {
            artefact: json!({ "a": 1 }),
            trace: Trace::new(),
            diagnostics: vec![],
        };
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["artefact"], json!({ "a": 1 }));

        let human = Outcome::NeedsHuman {
            token: "t1".into(),
            artefact: json!(null),
            diagnostics: vec![],
        };
        assert_eq!(serde_json::to_value(&human).unwrap()["status"], "needs-human");
        assert_eq!(human.status(), "needs-human");
    }

    #[test]
    fn test_paused_accessors() {
        let paused = Outcome::Paused {
            token: "t1".into(),
            pause_kind: PauseKind::External,
            partial_artefact: json!({ "draft": true }),
            diagnostics: vec![Diagnostic::warn(Kind::Pipeline, "slow")],
        };

        assert!(paused.is_suspended());
        assert_eq!(paused.token(), Some("t1"));
        assert_eq!(paused.artefact(), Some(&json!({ "draft": true })));
        assert_eq!(paused.diagnostics().len(), 1);
        assert!(paused.trace().is_none());

        let value = serde_json::to_value(&paused).unwrap();
        assert_eq!(value["pauseKind"], "external");
    }

    #[test]
    fn test_error_roundtrip() {
        let outcome = Outcome::error("Resume token is invalid or expired.", vec![]);
        assert_eq!(outcome.error_message(), Some("Resume token is invalid or expired."));

        let decoded: Outcome =
            serde_json::from_value(serde_json::to_value(&outcome).unwrap()).unwrap();
        assert_eq!(decoded, outcome);
    }
}
