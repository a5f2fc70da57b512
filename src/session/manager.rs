//! Pause/Resume Manager
//!
//! Turns executor output into outcomes:
//! - A pause is persisted as a [`PauseSnapshot`] under its token
//! - A failure rolls back the steps in the active rollback scope
//! - A pause during a resume rolls back the steps of that resume (or of the
//!   whole run, with [`RollbackScope::Run`])
//!
//! Resuming claims the snapshot atomically. When a direct token lookup
//! misses, the token is tried as a resume key.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::diagnostics::{apply_mode, Diagnostic, DiagnosticsMode, Kind};
use crate::error::Result;
use crate::execution::{rollback, ExecutorOutput, Outcome, OutcomeError, PauseKind};
use crate::recipe::StepGraph;

use super::snapshot::{ExecutorSnapshot, PauseSnapshot};
use super::store::SessionStore;

/// Message of the diagnostic returned for unknown or expired tokens.
pub const INVALID_TOKEN_MESSAGE: &str = "Resume token is invalid or expired.";

/// Which executed steps are compensated when a resumed run fails or pauses
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackScope {
    /// Only steps executed during the current resume
    #[default]
    Resume,
    /// Every executed step of the run, including those before the pause
    Run,
}

/// Persists pauses and performs rollbacks against one session store.
#[derive(Clone)]
pub struct PauseManager {
    store: Arc<dyn SessionStore>,
    ttl: Option<Duration>,
    scope: RollbackScope,
}

impl PauseManager {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Option<Duration>, scope: RollbackScope) -> Self {
        Self { store, ttl, scope }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn scope(&self) -> RollbackScope {
        self.scope
    }

    /// Removes and returns the snapshot for `token`.
    ///
    /// Falls back to treating `token` as a resume key. On a miss, returns
    /// the invalid-token diagnostic.
    pub fn claim(&self, token: &str) -> std::result::Result<PauseSnapshot, Vec<Diagnostic>> {
        match self.try_claim(token) {
            Ok(Some(snapshot)) => {
                info!("Loaded snapshot '{}' for recipe '{}'", snapshot.token, snapshot.recipe);
                Ok(snapshot)
            }
            Ok(None) => {
                warn!("No snapshot for token '{}'", token);
                Err(vec![Diagnostic::error(Kind::Resume, INVALID_TOKEN_MESSAGE)
                    .with_code("resume.invalidToken")
                    .with_data(serde_json::json!({ "token": token }))])
            }
            Err(e) => {
                error!("Session store failed while claiming '{}': {}", token, e);
                Err(vec![Diagnostic::error(Kind::Resume, format!("Session store error: {}", e))
                    .with_code("resume.storeError")])
            }
        }
    }

    fn try_claim(&self, token: &str) -> Result<Option<PauseSnapshot>> {
        if let Some(snapshot) = self.store.take(token)? {
            return Ok(Some(snapshot));
        }
        match self.store.lookup_resume_key(token)? {
            Some(real) => self.store.take(&real),
            None => Ok(None),
        }
    }

    /// Puts a claimed snapshot back unchanged.
    pub fn restore(&self, snapshot: &PauseSnapshot) -> Vec<Diagnostic> {
        match self.store.set(&snapshot.token, snapshot, None) {
            Ok(()) => Vec::new(),
            Err(e) => {
                error!("Failed to restore snapshot '{}': {}", snapshot.token, e);
                vec![Diagnostic::error(
                    Kind::Resume,
                    format!("Failed to restore snapshot '{}': {}", snapshot.token, e),
                )
                .with_code("resume.storeError")]
            }
        }
    }

    pub fn touch(&self, token: &str) -> Result<bool> {
        self.store.touch(token, self.ttl)
    }

    pub fn sweep(&self) -> Result<usize> {
        self.store.sweep()
    }

    /// Drops a suspended run of `recipe`: deletes its snapshot and rolls
    /// back every executed step in reverse order. Returns the diagnostics
    /// produced.
    ///
    /// A snapshot owned by another recipe is put back untouched.
    pub fn abort(&self, recipe: &str, token: &str, graph: &StepGraph) -> Vec<Diagnostic> {
        let mut snapshot = match self.claim(token) {
            Ok(snapshot) => snapshot,
            Err(diagnostics) => return diagnostics,
        };
        if snapshot.recipe != recipe {
            warn!(
                "Refusing to abort '{}': owned by recipe '{}', not '{}'",
                snapshot.token, snapshot.recipe, recipe
            );
            let mut diagnostics = vec![recipe_mismatch(token, &snapshot.recipe, recipe)];
            diagnostics.extend(self.restore(&snapshot));
            return diagnostics;
        }
        info!("Aborting run '{}'", snapshot.token);
        let executor = &mut snapshot.executor;
        rollback(
            graph,
            &executor.executed,
            &executor.state,
            &executor.input,
            &mut executor.trace,
        )
    }

    /// Converts executor output into an outcome.
    ///
    /// `resumed` is true when the output comes from continuing a snapshot.
    pub fn settle(
        &self,
        recipe: &str,
        graph: &StepGraph,
        output: ExecutorOutput,
        mode: DiagnosticsMode,
        resumed: bool,
    ) -> Outcome {
        match output {
            ExecutorOutput::Completed {
                artefact,
                trace,
                diagnostics,
            } => Outcome::Ok {
                artefact,
                trace,
                diagnostics: apply_mode(mode, diagnostics),
            },
            ExecutorOutput::Failed {
                error,
                mut snapshot,
                run_start,
            } => {
                let start = self.rollback_start(run_start);
                compensate(graph, &mut snapshot, start);
                Outcome::Error {
                    error,
                    trace: snapshot.trace,
                    diagnostics: apply_mode(mode, snapshot.diagnostics),
                }
            }
            ExecutorOutput::Paused {
                pause,
                mut snapshot,
                run_start,
            } => {
                if resumed {
                    let start = self.rollback_start(run_start);
                    compensate(graph, &mut snapshot, start);
                    snapshot.executed.truncate(start);
                }

                let persisted = PauseSnapshot::new(&pause.token, recipe, pause.kind, snapshot)
                    .with_resume_key(pause.resume_key.clone())
                    .with_payload(pause.payload.clone())
                    .with_partial(pause.partial.clone());

                if let Err(e) = self.store.set(&pause.token, &persisted, self.ttl) {
                    error!("Failed to persist pause '{}': {}", pause.token, e);
                    let mut snapshot = persisted.executor;
                    snapshot.diagnostics.extend(pause.reports);
                    compensate(graph, &mut snapshot, 0);
                    return Outcome::Error {
                        error: OutcomeError::new(format!(
                            "Failed to persist pause '{}': {}",
                            pause.token, e
                        )),
                        trace: snapshot.trace,
                        diagnostics: apply_mode(mode, snapshot.diagnostics),
                    };
                }
                info!("Persisted pause '{}' for recipe '{}'", pause.token, recipe);

                let mut diagnostics = persisted.executor.diagnostics;
                diagnostics.extend(pause.reports);
                let diagnostics = apply_mode(mode, diagnostics);
                match pause.kind {
                    PauseKind::Human => Outcome::NeedsHuman {
                        token: pause.token,
                        artefact: pause.partial,
                        diagnostics,
                    },
                    kind => Outcome::Paused {
                        token: pause.token,
                        pause_kind: kind,
                        partial_artefact: pause.partial,
                        diagnostics,
                    },
                }
            }
        }
    }

    fn rollback_start(&self, run_start: usize) -> usize {
        match self.scope {
            RollbackScope::Resume => run_start,
            RollbackScope::Run => 0,
        }
    }
}

/// Error for a token presented to a recipe that does not own it.
pub fn recipe_mismatch(token: &str, owner: &str, recipe: &str) -> Diagnostic {
    Diagnostic::error(
        Kind::Resume,
        format!("Token '{}' belongs to recipe '{}', not '{}'", token, owner, recipe),
    )
    .with_code("resume.recipeMismatch")
}

/// Rolls back `snapshot.executed[start..]`, appending any diagnostics.
fn compensate(graph: &StepGraph, snapshot: &mut ExecutorSnapshot, start: usize) {
    let start = start.min(snapshot.executed.len());
    let diagnostics = rollback(
        graph,
        &snapshot.executed[start..],
        &snapshot.state,
        &snapshot.input,
        &mut snapshot.trace,
    );
    snapshot.diagnostics.extend(diagnostics);
}

impl std::fmt::Debug for PauseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseManager")
            .field("ttl", &self.ttl)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterBundle;
    use crate::execution::{Executor, PauseRequest, StepError, StepOutput};
    use crate::recipe::{Pack, StepBuilder};
    use crate::session::InMemorySessionStore;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Fixture {
        graph: Arc<StepGraph>,
        rolled_back: Arc<Mutex<Vec<String>>>,
        store: Arc<InMemorySessionStore>,
    }

    fn tracked(builder: StepBuilder, log: &Arc<Mutex<Vec<String>>>) -> StepBuilder {
        let log = Arc::clone(log);
        builder.rollback(move |ctx| {
            log.lock().push(ctx.step.name().to_string());
            Ok(())
        })
    }

    /// `first` then `gate` (pauses until resumed with "go", fails on "fail")
    /// then `last`, which pauses once. Every step records its rollback.
    fn fixture() -> Fixture {
        let rolled_back = Arc::new(Mutex::new(Vec::new()));
        let first = StepBuilder::sync("first", |_| Ok(StepOutput::set("first", json!(1))));
        let gate = StepBuilder::sync("gate", |ctx| match ctx.resume_input().and_then(|v| v.as_str()) {
            Some("go") => Ok(StepOutput::set("gate", json!("open"))),
            Some("fail") => Err(StepError::msg("rejected")),
            _ => Ok(StepOutput::pause(
                PauseRequest::external().token("t1").resume_key("thread-1"),
            )),
        })
        .depends_on("first");
        let last = StepBuilder::sync("last", |ctx| {
            if ctx.is_resuming() {
                Ok(StepOutput::Continue)
            } else {
                Ok(StepOutput::pause(PauseRequest::external().token("t2")))
            }
        })
        .depends_on("gate");
        let pack = Pack::new("p")
            .step(tracked(first, &rolled_back))
            .step(tracked(gate, &rolled_back))
            .step(tracked(last, &rolled_back));
        let (graph, _) = StepGraph::compile([&pack], &[]).unwrap();
        Fixture {
            graph: Arc::new(graph),
            rolled_back,
            store: Arc::new(InMemorySessionStore::new()),
        }
    }

    fn manager(fixture: &Fixture, scope: RollbackScope) -> PauseManager {
        PauseManager::new(fixture.store.clone(), None, scope)
    }

    fn start(fixture: &Fixture, manager: &PauseManager) -> Outcome {
        let output = Executor::new(fixture.graph.clone(), AdapterBundle::new(), json!({})).run_blocking();
        manager.settle("demo", &fixture.graph, output, DiagnosticsMode::Default, false)
    }

    fn resume(fixture: &Fixture, manager: &PauseManager, token: &str, input: &str) -> Outcome {
        let snapshot = manager.claim(token).unwrap();
        let output = Executor::from_snapshot(
            fixture.graph.clone(),
            AdapterBundle::new(),
            snapshot.executor,
            Some(json!(input)),
        )
        .run_blocking();
        manager.settle("demo", &fixture.graph, output, DiagnosticsMode::Default, true)
    }

    #[test]
    fn test_pause_persists_without_rollback() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Resume);

        let outcome = start(&fixture, &manager);

        assert_eq!(outcome.status(), "paused");
        assert_eq!(outcome.token(), Some("t1"));
        assert_eq!(fixture.store.len(), 1);
        assert!(fixture.rolled_back.lock().is_empty());
    }

    #[test]
    fn test_second_pause_rolls_back_resume_steps_only() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Resume);
        start(&fixture, &manager);

        let outcome = resume(&fixture, &manager, "t1", "go");

        assert_eq!(outcome.token(), Some("t2"));
        assert_eq!(*fixture.rolled_back.lock(), vec!["gate"]);
        let stored = fixture.store.get("t2").unwrap().unwrap();
        assert_eq!(stored.executor.executed.len(), 1);
    }

    #[test]
    fn test_run_scope_rolls_back_everything_on_failure() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Run);
        start(&fixture, &manager);

        let outcome = resume(&fixture, &manager, "t1", "fail");

        assert_eq!(outcome.error_message(), Some("rejected"));
        assert_eq!(*fixture.rolled_back.lock(), vec!["first"]);
    }

    #[test]
    fn test_resume_scope_failure_skips_pre_pause_steps() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Resume);
        start(&fixture, &manager);

        let outcome = resume(&fixture, &manager, "t1", "fail");

        assert!(outcome.is_error());
        assert!(fixture.rolled_back.lock().is_empty());
    }

    #[test]
    fn test_claim_falls_back_to_resume_key() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Resume);
        start(&fixture, &manager);

        let snapshot = manager.claim("thread-1").unwrap();
        assert_eq!(snapshot.token, "t1");
        assert!(manager.claim("t1").is_err());
    }

    #[test]
    fn test_invalid_token_diagnostic() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Resume);

        let diagnostics = manager.claim("missing").unwrap_err();
        assert_eq!(diagnostics[0].message, INVALID_TOKEN_MESSAGE);
        assert_eq!(diagnostics[0].kind, Kind::Resume);
    }

    #[test]
    fn test_abort_rolls_back_whole_run() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Resume);
        start(&fixture, &manager);
        resume(&fixture, &manager, "t1", "go");
        fixture.rolled_back.lock().clear();

        let diagnostics = manager.abort("demo", "t2", &fixture.graph);

        assert!(diagnostics.is_empty());
        assert_eq!(*fixture.rolled_back.lock(), vec!["first"]);
        assert!(fixture.store.is_empty());
    }

    #[test]
    fn test_restore_puts_snapshot_back() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Resume);
        start(&fixture, &manager);

        let snapshot = manager.claim("t1").unwrap();
        assert!(fixture.store.is_empty());
        assert!(manager.restore(&snapshot).is_empty());
        assert!(fixture.store.get("t1").unwrap().is_some());
    }

    #[test]
    fn test_abort_by_other_recipe_keeps_snapshot() {
        let fixture = fixture();
        let manager = manager(&fixture, RollbackScope::Resume);
        start(&fixture, &manager);

        let diagnostics = manager.abort("chat", "t1", &fixture.graph);

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code.as_deref(), Some("resume.recipeMismatch"));
        assert!(diagnostics[0].is_error());
        assert!(fixture.rolled_back.lock().is_empty());
        assert_eq!(fixture.store.get("t1").unwrap().unwrap().recipe, "demo");
    }

    #[test]
    fn test_paused_outcome_carries_pausing_step_reports() {
        let ask = StepBuilder::sync("ask", |ctx| {
            ctx.report("asked reviewer");
            Ok(StepOutput::pause(PauseRequest::external().token("d1")))
        });
        let (graph, _) = StepGraph::compile([&Pack::new("p").step(ask)], &[]).unwrap();
        let store = Arc::new(InMemorySessionStore::new());
        let manager = PauseManager::new(store.clone(), None, RollbackScope::Resume);

        let output = Executor::new(Arc::new(graph.clone()), AdapterBundle::new(), json!({})).run_blocking();
        let outcome = manager.settle("demo", &graph, output, DiagnosticsMode::Default, false);

        assert_eq!(outcome.diagnostics().len(), 1);
        assert_eq!(outcome.diagnostics()[0].message, "asked reviewer");
        assert!(store.get("d1").unwrap().unwrap().executor.diagnostics.is_empty());
    }
}
