//! Pipeline Executor
//!
//! Walks a compiled [`StepGraph`] one step at a time:
//! - Picks the next ready step (dependencies, then priority, then id)
//! - Lends the step its context: adapters, input, state and the reporter
//! - Applies state updates and records rollback data
//! - Stops at the first failure or pause request
//!
//! The state machine is shared by two drivers. [`Executor::run`] awaits
//! every step; [`Executor::run_blocking`] calls synchronous steps inline and
//! only creates a current-thread runtime when it meets an async step.
//!
//! Executors never persist anything themselves. A suspended or failed run
//! comes back as an [`ExecutorOutput`] carrying an [`ExecutorSnapshot`];
//! the pause manager decides what to store and what to roll back.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::adapters::AdapterBundle;
use crate::diagnostics::{apply_mode, has_errors, Diagnostic, DiagnosticsMode, Kind, Reporter};
use crate::recipe::{StepGraph, StepId, StepSpec};
use crate::session::{ExecutorSnapshot, RollbackRecord};

use super::outcome::OutcomeError;
use super::planner::ExecutionPlanner;
use super::state::WorkingState;
use super::step::{PauseKind, PauseRequest, RollbackContext, StepContext, StepOutput, StepResult};
use super::trace::{Trace, TraceEventKind};

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStatus {
    Ready,
    Running,
    Ok,
    Error,
    Paused,
}

/// A pause request with its token resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PauseInfo {
    pub token: String,
    pub kind: PauseKind,
    pub resume_key: Option<String>,
    pub partial: Value,
    pub payload: Option<Value>,
    /// What the pausing step reported. Kept out of the snapshot because the
    /// step reports again when it re-runs on resume.
    pub reports: Vec<Diagnostic>,
}

/// Terminal result of an executor.
#[derive(Debug, Clone)]
pub enum ExecutorOutput {
    Completed {
        artefact: Value,
        trace: Trace,
        diagnostics: Vec<Diagnostic>,
    },
    Failed {
        error: OutcomeError,
        snapshot: ExecutorSnapshot,
        /// Index into `snapshot.executed` where this invocation started
        run_start: usize,
    },
    Paused {
        pause: PauseInfo,
        snapshot: ExecutorSnapshot,
        run_start: usize,
    },
}

impl ExecutorOutput {
    pub fn status(&self) -> ExecutorStatus {
        match self {
            ExecutorOutput::Completed { .. } => ExecutorStatus::Ok,
            ExecutorOutput::Failed { .. } => ExecutorStatus::Error,
            ExecutorOutput::Paused { .. } => ExecutorStatus::Paused,
        }
    }
}

enum Halt {
    Fail(OutcomeError),
    /// The pausing step, its request and where its reports start
    Pause(StepId, PauseRequest, usize),
}

/// Executes one run of a step graph.
pub struct Executor {
    planner: ExecutionPlanner,
    adapters: AdapterBundle,
    input: Value,
    state: WorkingState,
    reporter: Reporter,
    trace: Trace,
    executed: Vec<RollbackRecord>,
    run_start: usize,
    /// Leading reporter entries replayed from a snapshot
    seeded: usize,
    resume_step: Option<StepId>,
    resume_input: Option<Value>,
    mode: DiagnosticsMode,
    status: ExecutorStatus,
}

impl Executor {
    /// A fresh run.
    pub fn new(graph: Arc<StepGraph>, adapters: AdapterBundle, input: Value) -> Self {
        Self {
            planner: ExecutionPlanner::new(graph),
            adapters,
            input,
            state: WorkingState::new(),
            reporter: Reporter::new(),
            trace: Trace::new(),
            executed: Vec::new(),
            run_start: 0,
            seeded: 0,
            resume_step: None,
            resume_input: None,
            mode: DiagnosticsMode::Default,
            status: ExecutorStatus::Ready,
        }
    }

    /// Continues a suspended run. Snapshot diagnostics are replayed; the
    /// step that paused runs again and receives `resume_input` (`null` when
    /// none is given).
    pub fn from_snapshot(
        graph: Arc<StepGraph>,
        adapters: AdapterBundle,
        snapshot: ExecutorSnapshot,
        resume_input: Option<Value>,
    ) -> Self {
        let run_start = snapshot.executed.len();
        let seeded = snapshot.diagnostics.len();
        Self {
            planner: ExecutionPlanner::from_completed(graph, &snapshot.completed),
            adapters,
            input: snapshot.input,
            state: snapshot.state,
            reporter: Reporter::with_entries(snapshot.diagnostics),
            trace: snapshot.trace,
            executed: snapshot.executed,
            run_start,
            seeded,
            resume_step: snapshot.paused_at,
            resume_input,
            mode: DiagnosticsMode::Default,
            status: ExecutorStatus::Ready,
        }
    }

    pub fn with_mode(mut self, mode: DiagnosticsMode) -> Self {
        self.mode = mode;
        self
    }

    /// Adds diagnostics collected before execution (build, resolution).
    ///
    /// On a resumed run each entry cancels one equal entry replayed from the
    /// snapshot, so rebuilt diagnostics are not counted twice. Everything
    /// else is kept, repeats included.
    pub fn with_diagnostics(mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) -> Self {
        let seeded = self.seeded.min(self.reporter.len());
        let mut replayed = vec![false; seeded];
        for diagnostic in diagnostics {
            let matched = self.reporter.entries()[..seeded]
                .iter()
                .zip(&replayed)
                .position(|(entry, used)| !used && *entry == diagnostic);
            match matched {
                Some(index) => replayed[index] = true,
                None => self.reporter.extend([diagnostic]),
            }
        }
        self
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status
    }

    pub fn state(&self) -> &WorkingState {
        &self.state
    }

    /// Drives the run to a terminal output, awaiting async steps.
    pub async fn run(mut self) -> ExecutorOutput {
        self.start();
        while let Some(spec) = self.next_step() {
            let mark = self.reporter.len();
            let resume = self.resume_input_for(&spec.id);
            let (result, data) = {
                let mut ctx = StepContext::new(
                    &spec.id,
                    &self.adapters,
                    &self.input,
                    &self.state,
                    &mut self.reporter,
                    resume.as_ref(),
                );
                let result = spec.apply.invoke(&mut ctx).await;
                (result, ctx.take_rollback_data())
            };
            if let Some(halt) = self.settle(&spec, result, data, mark) {
                return self.halt(halt);
            }
        }
        self.complete()
    }

    /// Drives the run without an ambient async runtime.
    ///
    /// Called from within an async context, the first asynchronous step
    /// fails the run; use [`Executor::run`] there.
    pub fn run_blocking(mut self) -> ExecutorOutput {
        let mut runtime = None;
        self.start();
        while let Some(spec) = self.next_step() {
            let mark = self.reporter.len();
            let resume = self.resume_input_for(&spec.id);
            let (result, data) = {
                let mut ctx = StepContext::new(
                    &spec.id,
                    &self.adapters,
                    &self.input,
                    &self.state,
                    &mut self.reporter,
                    resume.as_ref(),
                );
                let result = spec.apply.invoke_blocking(&mut ctx, &mut runtime);
                (result, ctx.take_rollback_data())
            };
            if let Some(halt) = self.settle(&spec, result, data, mark) {
                return self.halt(halt);
            }
        }
        self.complete()
    }

    fn start(&mut self) {
        let (done, total) = self.planner.progress();
        info!("Starting run: {}/{} steps already completed", done, total);
        self.status = ExecutorStatus::Running;
    }

    fn next_step(&mut self) -> Option<StepSpec> {
        let spec = self.planner.next_step()?.clone();
        debug!("Running step '{}'", spec.id);
        self.trace.record(&spec.id, TraceEventKind::Started);
        Some(spec)
    }

    fn resume_input_for(&mut self, step: &StepId) -> Option<Value> {
        if self.resume_step.as_ref() == Some(step) {
            self.resume_step = None;
            Some(self.resume_input.take().unwrap_or(Value::Null))
        } else {
            None
        }
    }

    fn settle(
        &mut self,
        spec: &StepSpec,
        result: StepResult,
        rollback_data: Option<Value>,
        mark: usize,
    ) -> Option<Halt> {
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                error!("Step '{}' failed: {}", spec.id, err);
                self.trace.record(&spec.id, TraceEventKind::Failed);
                return Some(Halt::Fail(OutcomeError::at_step(err.to_string(), spec.id.clone())));
            }
        };

        let patch = match output {
            StepOutput::Pause(request) => {
                info!("Step '{}' requested a pause ({:?})", spec.id, request.kind);
                self.trace.record(&spec.id, TraceEventKind::Paused);
                return Some(Halt::Pause(spec.id.clone(), request, mark));
            }
            StepOutput::Update(patch) => Some(patch),
            StepOutput::Continue => None,
        };

        if let Some(patch) = patch {
            self.state.apply(patch);
        }
        if spec.rollback.is_some() || rollback_data.is_some() {
            self.executed.push(RollbackRecord {
                step: spec.id.clone(),
                data: rollback_data,
            });
        }
        self.planner.mark_step_completed(&spec.id);
        self.trace.record(&spec.id, TraceEventKind::Completed);
        debug!("Step '{}' completed", spec.id);

        if self.mode == DiagnosticsMode::Strict {
            let reported = apply_mode(self.mode, self.reporter.since(mark).to_vec());
            if has_errors(&reported) {
                warn!("Step '{}' reported diagnostics escalated by strict mode", spec.id);
                return Some(Halt::Fail(OutcomeError::at_step(
                    format!("Step '{}' reported warnings in strict mode", spec.id),
                    spec.id.clone(),
                )));
            }
        }
        None
    }

    fn snapshot(self, paused_at: Option<StepId>) -> (ExecutorSnapshot, usize) {
        let snapshot = ExecutorSnapshot {
            completed: self.planner.completed().to_vec(),
            paused_at,
            state: self.state,
            input: self.input,
            executed: self.executed,
            diagnostics: self.reporter.into_entries(),
            trace: self.trace,
        };
        (snapshot, self.run_start)
    }

    fn halt(mut self, halt: Halt) -> ExecutorOutput {
        match halt {
            Halt::Fail(error) => {
                self.status = ExecutorStatus::Error;
                let (snapshot, run_start) = self.snapshot(None);
                ExecutorOutput::Failed {
                    error,
                    snapshot,
                    run_start,
                }
            }
            Halt::Pause(step, request, mark) => {
                self.status = ExecutorStatus::Paused;
                let reports = self.reporter.split_off(mark);
                let token = request
                    .token
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let partial = request.partial.unwrap_or_else(|| self.state.to_value());
                let pause = PauseInfo {
                    token,
                    kind: request.kind,
                    resume_key: request.resume_key,
                    partial,
                    payload: request.payload,
                    reports,
                };
                let (snapshot, run_start) = self.snapshot(Some(step));
                ExecutorOutput::Paused {
                    pause,
                    snapshot,
                    run_start,
                }
            }
        }
    }

    fn complete(mut self) -> ExecutorOutput {
        self.status = ExecutorStatus::Ok;
        let (done, total) = self.planner.progress();
        info!("Run completed: {}/{} steps", done, total);
        ExecutorOutput::Completed {
            artefact: self.state.to_value(),
            trace: self.trace,
            diagnostics: apply_mode(self.mode, self.reporter.into_entries()),
        }
    }
}

/// Runs rollback handlers for `records` in reverse order.
///
/// Handler failures become `rollback` warnings; they never stop the
/// remaining handlers.
pub fn rollback(
    graph: &StepGraph,
    records: &[RollbackRecord],
    state: &WorkingState,
    input: &Value,
    trace: &mut Trace,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for record in records.iter().rev() {
        let Some(spec) = graph.get(&record.step) else {
            diagnostics.push(
                Diagnostic::warn(
                    Kind::Rollback,
                    format!("Cannot roll back step '{}': no longer part of the graph", record.step),
                )
                .with_code("rollback.unknownStep"),
            );
            continue;
        };
        let Some(handler) = &spec.rollback else {
            continue;
        };

        info!("Rolling back step '{}'", record.step);
        let ctx = RollbackContext {
            step: &record.step,
            data: record.data.as_ref(),
            input,
            state,
        };
        if let Err(err) = handler(&ctx) {
            warn!("Rollback of step '{}' failed: {}", record.step, err);
            diagnostics.push(
                Diagnostic::warn(
                    Kind::Rollback,
                    format!("Rollback of step '{}' failed: {}", record.step, err),
                )
                .with_code("rollback.failed")
                .with_data(serde_json::json!({ "step": record.step })),
            );
        }
        trace.record(&record.step, TraceEventKind::RolledBack);
    }
    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::step::{OwnedStepContext, StepError};
    use crate::recipe::{Pack, StepBuilder};
    use parking_lot::Mutex;
    use serde_json::json;

    fn graph(packs: &[Pack]) -> Arc<StepGraph> {
        let (graph, _) = StepGraph::compile(packs, &[]).unwrap();
        Arc::new(graph)
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> StepBuilder {
        let log = Arc::clone(log);
        let label = name.to_string();
        StepBuilder::sync(name, move |ctx| {
            log.lock().push(ctx.step().to_string());
            Ok(StepOutput::set(label.clone(), json!(true)))
        })
    }

    #[test]
    fn test_cross_pack_order_and_artefact() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = Pack::new("A").step(recorder(&log, "seed"));
        let b = Pack::new("B").step(recorder(&log, "run").depends_on("A.seed"));

        let output = Executor::new(graph(&[b, a]), AdapterBundle::new(), json!({})).run_blocking();

        assert_eq!(*log.lock(), vec!["A.seed", "B.run"]);
        match output {
            ExecutorOutput::Completed { artefact, trace, .. } => {
                assert_eq!(artefact, json!({ "seed": true, "run": true }));
                assert_eq!(trace.completed().len(), 2);
            }
            other => panic!("unexpected output: {:?}", other.status()),
        }
    }

    #[test]
    fn test_step_error_halts_with_snapshot() {
        let pack = Pack::new("p")
            .step(StepBuilder::sync("ok", |_| Ok(StepOutput::set("x", json!(1)))).rollback(|_| Ok(())))
            .step(StepBuilder::sync("boom", |_| Err(StepError::msg("kaput"))).depends_on("ok"))
            .step(StepBuilder::sync("never", |_| Ok(StepOutput::Continue)).depends_on("boom"));

        let output = Executor::new(graph(&[pack]), AdapterBundle::new(), json!(null)).run_blocking();

        match output {
            ExecutorOutput::Failed { error, snapshot, run_start } => {
                assert_eq!(error.message, "kaput");
                assert_eq!(error.step, Some(StepId::from("p.boom")));
                assert_eq!(snapshot.completed, vec![StepId::from("p.ok")]);
                assert_eq!(snapshot.executed.len(), 1);
                assert_eq!(run_start, 0);
            }
            other => panic!("unexpected output: {:?}", other.status()),
        }
    }

    #[test]
    fn test_pause_keeps_step_pending_and_resume_reruns_it() {
        let approve = StepBuilder::sync("approve", |ctx| match ctx.resume_input() {
            Some(decision) => Ok(StepOutput::set("decision", decision.clone())),
            None => Ok(StepOutput::pause(PauseRequest::human().token("t1"))),
        });
        let pack = Pack::new("hitl")
            .step(StepBuilder::sync("draft", |_| Ok(StepOutput::set("draft", json!("v1")))))
            .step(approve.depends_on("draft"));
        let graph = graph(&[pack]);

        let output = Executor::new(graph.clone(), AdapterBundle::new(), json!({})).run_blocking();
        let ExecutorOutput::Paused { pause, snapshot, .. } = output else {
            panic!("expected pause");
        };
        assert_eq!(pause.token, "t1");
        assert_eq!(pause.kind, PauseKind::Human);
        assert_eq!(pause.partial, json!({ "draft": "v1" }));
        assert_eq!(snapshot.paused_at, Some(StepId::from("hitl.approve")));
        assert_eq!(snapshot.completed, vec![StepId::from("hitl.draft")]);

        let resumed = Executor::from_snapshot(graph, AdapterBundle::new(), snapshot, Some(json!("yes")))
            .run_blocking();
        match resumed {
            ExecutorOutput::Completed { artefact, .. } => {
                assert_eq!(artefact, json!({ "draft": "v1", "decision": "yes" }));
            }
            other => panic!("unexpected output: {:?}", other.status()),
        }
    }

    #[test]
    fn test_generated_token_when_absent() {
        let pack = Pack::new("p").step(StepBuilder::sync("wait", |_| {
            Ok(StepOutput::pause(PauseRequest::external()))
        }));
        let output = Executor::new(graph(&[pack]), AdapterBundle::new(), json!({})).run_blocking();
        let ExecutorOutput::Paused { pause, .. } = output else {
            panic!("expected pause");
        };
        assert!(uuid::Uuid::parse_str(&pause.token).is_ok());
    }

    #[test]
    fn test_strict_mode_aborts_after_step_warning() {
        let pack = Pack::new("p")
            .step(StepBuilder::sync("noisy", |ctx| {
                ctx.warn("fallback model used");
                Ok(StepOutput::Continue)
            }))
            .step(StepBuilder::sync("after", |_| Ok(StepOutput::set("after", json!(1)))).depends_on("noisy"));
        let graph = graph(&[pack]);

        let lenient = Executor::new(graph.clone(), AdapterBundle::new(), json!({})).run_blocking();
        assert_eq!(lenient.status(), ExecutorStatus::Ok);

        let strict = Executor::new(graph, AdapterBundle::new(), json!({}))
            .with_mode(DiagnosticsMode::Strict)
            .run_blocking();
        match strict {
            ExecutorOutput::Failed { error, snapshot, .. } => {
                assert_eq!(error.step, Some(StepId::from("p.noisy")));
                assert!(!snapshot.state.contains("after"));
            }
            other => panic!("unexpected output: {:?}", other.status()),
        }
    }

    #[tokio::test]
    async fn test_async_and_sync_steps_mix() {
        let pack = Pack::new("p")
            .step(StepBuilder::from_async_fn("fetch", |_ctx: OwnedStepContext| async move {
                tokio::task::yield_now().await;
                Ok(StepOutput::set("fetched", json!([1, 2])))
            }))
            .step(
                StepBuilder::sync("count", |ctx| {
                    let n = ctx.state().get("fetched").and_then(Value::as_array).map_or(0, Vec::len);
                    Ok(StepOutput::set("count", json!(n)))
                })
                .depends_on("fetch"),
            );

        let output = Executor::new(graph(&[pack]), AdapterBundle::new(), json!({})).run().await;
        match output {
            ExecutorOutput::Completed { artefact, .. } => assert_eq!(artefact["count"], 2),
            other => panic!("unexpected output: {:?}", other.status()),
        }
    }

    #[test]
    fn test_rollback_reverse_order_and_failures_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (l1, l2) = (Arc::clone(&log), Arc::clone(&log));
        let pack = Pack::new("p")
            .step(
                StepBuilder::sync("one", |ctx| {
                    ctx.remember_for_rollback(json!("r1"));
                    Ok(StepOutput::Continue)
                })
                .rollback(move |ctx| {
                    l1.lock().push(format!("{}:{}", ctx.step, ctx.data.cloned().unwrap_or_default()));
                    Ok(())
                }),
            )
            .step(
                StepBuilder::sync("two", |_| Ok(StepOutput::Continue))
                    .depends_on("one")
                    .rollback(move |ctx| {
                        l2.lock().push(ctx.step.to_string());
                        Err(StepError::msg("compensation failed"))
                    }),
            );
        let graph = graph(&[pack]);

        let output = Executor::new(graph.clone(), AdapterBundle::new(), json!({})).run_blocking();
        let ExecutorOutput::Completed { .. } = output else {
            panic!("expected completion");
        };

        let records = vec![
            RollbackRecord { step: StepId::from("p.one"), data: Some(json!("r1")) },
            RollbackRecord { step: StepId::from("p.two"), data: None },
        ];
        let mut trace = Trace::new();
        let diagnostics = rollback(&graph, &records, &WorkingState::new(), &json!({}), &mut trace);

        assert_eq!(*log.lock(), vec!["p.two".to_string(), "p.one:\"r1\"".to_string()]);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, Kind::Rollback);
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn test_repeated_compile_diagnostics_are_kept() {
        let pack = Pack::new("p").step(StepBuilder::sync("only", |_| Ok(StepOutput::Continue)));
        let duplicate = Diagnostic::warn(Kind::Recipe, "Pack 'x' registered more than once");

        let output = Executor::new(graph(&[pack]), AdapterBundle::new(), json!({}))
            .with_diagnostics(vec![duplicate.clone(), duplicate.clone()])
            .run_blocking();

        let ExecutorOutput::Completed { diagnostics, .. } = output else {
            panic!("expected completion");
        };
        assert_eq!(diagnostics, vec![duplicate.clone(), duplicate]);
    }

    #[test]
    fn test_resume_replays_reports_once() {
        let duplicate = Diagnostic::warn(Kind::Recipe, "Pack 'x' registered more than once");
        let ask = StepBuilder::sync("ask", |ctx| {
            ctx.report("asked reviewer");
            match ctx.resume_input() {
                Some(answer) => Ok(StepOutput::set("answer", answer.clone())),
                None => Ok(StepOutput::pause(PauseRequest::external().token("d1"))),
            }
        });
        let pack = Pack::new("p")
            .step(StepBuilder::sync("before", |ctx| {
                ctx.warn("cache cold");
                Ok(StepOutput::Continue)
            }))
            .step(ask.depends_on("before"));
        let graph = graph(&[pack]);
        let compiled = vec![duplicate.clone(), duplicate.clone()];

        let output = Executor::new(graph.clone(), AdapterBundle::new(), json!({}))
            .with_diagnostics(compiled.clone())
            .run_blocking();
        let ExecutorOutput::Paused { pause, snapshot, .. } = output else {
            panic!("expected pause");
        };
        assert_eq!(pause.reports.len(), 1);
        assert_eq!(pause.reports[0].message, "asked reviewer");
        assert_eq!(snapshot.diagnostics.len(), 3);

        let resumed = Executor::from_snapshot(graph, AdapterBundle::new(), snapshot, Some(json!("yes")))
            .with_diagnostics(compiled)
            .run_blocking();
        let ExecutorOutput::Completed { diagnostics, .. } = resumed else {
            panic!("expected completion");
        };
        let count = |message: &str| diagnostics.iter().filter(|d| d.message == message).count();
        assert_eq!(count("Pack 'x' registered more than once"), 2);
        assert_eq!(count("cache cold"), 1);
        assert_eq!(count("asked reviewer"), 1);
    }

    #[tokio::test]
    async fn test_async_closure_reports_reach_outcome() {
        let pack = Pack::new("p").step(
            StepBuilder::from_async_fn("fetch", |ctx: OwnedStepContext| async move {
                ctx.warn("provider slow");
                ctx.remember_for_rollback(json!("lease-1"));
                Ok(StepOutput::Continue)
            })
            .rollback(|_| Ok(())),
        );

        let output = Executor::new(graph(&[pack]), AdapterBundle::new(), json!({})).run().await;
        match output {
            ExecutorOutput::Completed { diagnostics, .. } => {
                assert_eq!(diagnostics.len(), 1);
                assert_eq!(diagnostics[0].message, "provider slow");
            }
            other => panic!("unexpected output: {:?}", other.status()),
        }
    }
}
