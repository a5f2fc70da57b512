//! Pause Snapshots
//!
//! Durable records of suspended runs. A [`PauseSnapshot`] wraps the
//! [`ExecutorSnapshot`] (graph position, working state, diagnostics, trace)
//! with the metadata needed to find and expire it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diagnostics::Diagnostic;
use crate::execution::{PauseKind, Trace, WorkingState};
use crate::recipe::StepId;

/// A completed step eligible for compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub step: StepId,
    /// Data the step attached via `remember_for_rollback`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Everything the executor needs to continue a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    /// Completed steps in completion order
    pub completed: Vec<StepId>,
    /// The step that requested the pause; it runs again on resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<StepId>,
    pub state: WorkingState,
    pub input: Value,
    /// Steps with rollback handlers, in execution order
    #[serde(default)]
    pub executed: Vec<RollbackRecord>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default)]
    pub trace: Trace,
}

/// Durable record of a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseSnapshot {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_key: Option<String>,
    /// Name of the recipe that paused
    pub recipe: String,
    pub pause_kind: PauseKind,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Step-owned data supplied with the pause request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub partial_artefact: Value,
    pub executor: ExecutorSnapshot,
}

impl PauseSnapshot {
    pub fn new(
        token: impl Into<String>,
        recipe: impl Into<String>,
        pause_kind: PauseKind,
        executor: ExecutorSnapshot,
    ) -> Self {
        let now = Utc::now();
        Self {
            token: token.into(),
            resume_key: None,
            recipe: recipe.into(),
            pause_kind,
            created_at: now,
            last_accessed_at: now,
            expires_at: None,
            payload: None,
            partial_artefact: Value::Null,
            executor,
        }
    }

    pub fn with_resume_key(mut self, key: Option<String>) -> Self {
        self.resume_key = key;
        self
    }

    pub fn with_payload(mut self, payload: Option<Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_partial(mut self, partial: Value) -> Self {
        self.partial_artefact = partial;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Marks the snapshot as accessed now and, with a TTL, moves the expiry
    /// to `now + ttl`.
    pub fn touch(&mut self, ttl: Option<Duration>) {
        let now = Utc::now();
        self.last_accessed_at = now;
        if let Some(ttl) = ttl {
            self.expires_at = expiry(now, ttl);
        }
    }
}

/// `now + ttl`, or no expiry when the sum is not representable.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn executor_snapshot() -> ExecutorSnapshot {
        let mut state = WorkingState::new();
        state.set("agent", json!({ "turns": 1 }));
        ExecutorSnapshot {
            completed: vec![StepId::from("agent.plan")],
            paused_at: Some(StepId::from("agent.review")),
            state,
            input: json!({ "q": "hi" }),
            executed: vec![RollbackRecord {
                step: StepId::from("agent.plan"),
                data: Some(json!({ "ticket": 7 })),
            }],
            diagnostics: vec![],
            trace: Trace::new(),
        }
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snapshot = PauseSnapshot::new("t1", "agent", PauseKind::Human, executor_snapshot())
            .with_resume_key(Some("thread-1".into()))
            .with_partial(json!({ "draft": "..." }));

        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: PauseSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.executor.state.get("agent"), Some(&json!({ "turns": 1 })));
    }

    #[test]
    fn test_expiry_and_touch() {
        let mut snapshot = PauseSnapshot::new("t1", "agent", PauseKind::External, executor_snapshot());
        assert!(!snapshot.is_expired());

        snapshot.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(snapshot.is_expired());

        snapshot.touch(Some(Duration::from_secs(60)));
        assert!(!snapshot.is_expired());
        assert!(snapshot.expires_at.unwrap() > snapshot.last_accessed_at);
    }

    #[test]
    fn test_touch_without_ttl_keeps_expiry() {
        let mut snapshot = PauseSnapshot::new("t1", "agent", PauseKind::External, executor_snapshot());
        snapshot.touch(None);
        assert!(snapshot.expires_at.is_none());
    }
}
