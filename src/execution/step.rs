//! Individual Step Execution
//!
//! Defines what a step receives ([`StepContext`]), what it may return
//! ([`StepOutput`]) and how the executor calls it. Steps are either
//! synchronous closures or [`AsyncStep`] implementations; both receive the
//! same context.
//!
//! A step may:
//! - return [`StepOutput::Continue`] (no change)
//! - return [`StepOutput::Update`] with a [`StatePatch`]
//! - return [`StepOutput::Pause`] to suspend the run
//! - fail with a [`StepError`], which ends the run with an error outcome

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::adapters::{AdapterBundle, AdapterError};
use crate::diagnostics::{normalize, Diagnostic, DiagnosticInput, Kind, Reporter};
use crate::recipe::StepId;

use super::state::{StatePatch, WorkingState};

/// Failure raised by a step or a rollback handler.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("State error: {0}")]
    State(#[from] serde_json::Error),
}

impl StepError {
    pub fn msg(message: impl Into<String>) -> Self {
        StepError::Message(message.into())
    }
}

pub type StepResult = Result<StepOutput, StepError>;

/// Why a run is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseKind {
    /// Waiting on a person; surfaces as a `needs-human` outcome
    Human,
    /// Waiting on an external system callback
    #[default]
    External,
    /// Suspended by the engine or a host application
    System,
}

/// A step's request to suspend the run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PauseRequest {
    pub token: Option<String>,
    pub kind: PauseKind,
    pub resume_key: Option<String>,
    pub partial: Option<Value>,
    pub payload: Option<Value>,
}

impl PauseRequest {
    pub fn new(kind: PauseKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn human() -> Self {
        Self::new(PauseKind::Human)
    }

    pub fn external() -> Self {
        Self::new(PauseKind::External)
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Secondary lookup key, e.g. a conversation thread id.
    pub fn resume_key(mut self, key: impl Into<String>) -> Self {
        self.resume_key = Some(key.into());
        self
    }

    /// Artefact exposed to the caller while the run is suspended.
    pub fn partial(mut self, partial: Value) -> Self {
        self.partial = Some(partial);
        self
    }

    /// Step-owned data stored with the snapshot.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// What a step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Continue,
    Update(StatePatch),
    Pause(PauseRequest),
}

impl StepOutput {
    /// Shorthand for an update writing one namespace.
    pub fn set(namespace: impl Into<String>, value: Value) -> Self {
        StepOutput::Update(StatePatch::new().set(namespace, value))
    }

    pub fn pause(request: PauseRequest) -> Self {
        StepOutput::Pause(request)
    }
}

/// Everything a step can see for the duration of one call.
pub struct StepContext<'a> {
    step: &'a StepId,
    adapters: &'a AdapterBundle,
    input: &'a Value,
    state: &'a WorkingState,
    reporter: &'a mut Reporter,
    resume: Option<&'a Value>,
    rollback_data: Option<Value>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        step: &'a StepId,
        adapters: &'a AdapterBundle,
        input: &'a Value,
        state: &'a WorkingState,
        reporter: &'a mut Reporter,
        resume: Option<&'a Value>,
    ) -> Self {
        Self {
            step,
            adapters,
            input,
            state,
            reporter,
            resume,
            rollback_data: None,
        }
    }

    pub fn step(&self) -> &StepId {
        self.step
    }

    pub fn adapters(&self) -> &AdapterBundle {
        self.adapters
    }

    /// The run's input.
    pub fn input(&self) -> &Value {
        self.input
    }

    pub fn state(&self) -> &WorkingState {
        self.state
    }

    /// Input supplied when resuming, `null` if the caller gave none. Only
    /// the step that paused sees it.
    pub fn resume_input(&self) -> Option<&Value> {
        self.resume
    }

    pub fn is_resuming(&self) -> bool {
        self.resume.is_some()
    }

    pub fn report(&mut self, input: impl Into<DiagnosticInput>) {
        self.reporter.report(input);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.reporter.extend([Diagnostic::warn(Kind::Pipeline, message)]);
    }

    /// Stores data handed to this step's rollback handler if the run is
    /// later compensated.
    pub fn remember_for_rollback(&mut self, data: Value) {
        self.rollback_data = Some(data);
    }

    pub(crate) fn take_rollback_data(&mut self) -> Option<Value> {
        self.rollback_data.take()
    }

    /// An owned copy for futures that must not borrow the executor.
    /// Pass it back to [`StepContext::absorb`] to keep what it recorded.
    pub fn to_owned_context(&self) -> OwnedStepContext {
        OwnedStepContext {
            step: self.step.clone(),
            adapters: self.adapters.clone(),
            input: self.input.clone(),
            state: self.state.clone(),
            resume: self.resume.cloned(),
            sink: Arc::new(Mutex::new(OwnedSink::default())),
        }
    }

    /// Moves diagnostics and rollback data recorded on an owned context
    /// into this one.
    pub fn absorb(&mut self, owned: &OwnedStepContext) {
        let mut sink = owned.sink.lock();
        self.reporter.extend(sink.diagnostics.drain(..));
        if let Some(data) = sink.rollback_data.take() {
            self.rollback_data = Some(data);
        }
    }
}

#[derive(Debug, Default)]
struct OwnedSink {
    diagnostics: Vec<Diagnostic>,
    rollback_data: Option<Value>,
}

/// Owned counterpart of [`StepContext`] used by closure-based async steps.
///
/// Clones share one sink, so reports made from any clone reach the run.
#[derive(Debug, Clone)]
pub struct OwnedStepContext {
    pub step: StepId,
    pub adapters: AdapterBundle,
    pub input: Value,
    pub state: WorkingState,
    pub resume: Option<Value>,
    sink: Arc<Mutex<OwnedSink>>,
}

impl OwnedStepContext {
    pub fn is_resuming(&self) -> bool {
        self.resume.is_some()
    }

    pub fn report(&self, input: impl Into<DiagnosticInput>) {
        self.sink.lock().diagnostics.push(normalize(input));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.sink
            .lock()
            .diagnostics
            .push(Diagnostic::warn(Kind::Pipeline, message));
    }

    pub fn remember_for_rollback(&self, data: Value) {
        self.sink.lock().rollback_data = Some(data);
    }
}

/// A step whose work suspends internally (network calls, timers).
#[async_trait]
pub trait AsyncStep: Send + Sync {
    async fn apply(&self, ctx: &mut StepContext<'_>) -> StepResult;
}

struct FnAsyncStep<F>(F);

#[async_trait]
impl<F, Fut> AsyncStep for FnAsyncStep<F>
where
    F: Fn(OwnedStepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult> + Send,
{
    async fn apply(&self, ctx: &mut StepContext<'_>) -> StepResult {
        let owned = ctx.to_owned_context();
        let result = (self.0)(owned.clone()).await;
        ctx.absorb(&owned);
        result
    }
}

pub type SyncStepFn = dyn Fn(&mut StepContext<'_>) -> StepResult + Send + Sync;

/// A step's work.
#[derive(Clone)]
pub enum StepApply {
    Sync(Arc<SyncStepFn>),
    Async(Arc<dyn AsyncStep>),
}

impl StepApply {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> StepResult + Send + Sync + 'static,
    {
        StepApply::Sync(Arc::new(f))
    }

    /// Wraps an async closure receiving an owned context.
    pub fn from_async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(OwnedStepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        StepApply::Async(Arc::new(FnAsyncStep(f)))
    }

    pub fn handler(step: impl AsyncStep + 'static) -> Self {
        StepApply::Async(Arc::new(step))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, StepApply::Async(_))
    }

    /// Calls the step, awaiting it if asynchronous.
    pub(crate) async fn invoke(&self, ctx: &mut StepContext<'_>) -> StepResult {
        match self {
            StepApply::Sync(f) => f(ctx),
            StepApply::Async(step) => step.apply(ctx).await,
        }
    }

    /// Calls the step without an ambient async runtime.
    ///
    /// Synchronous steps run inline. A current-thread runtime is created on
    /// the first asynchronous step and reused for the rest of the run. An
    /// asynchronous step met inside an ambient runtime fails instead of
    /// blocking that runtime's thread.
    pub(crate) fn invoke_blocking(
        &self,
        ctx: &mut StepContext<'_>,
        runtime: &mut Option<tokio::runtime::Runtime>,
    ) -> StepResult {
        match self {
            StepApply::Sync(f) => f(ctx),
            StepApply::Async(step) => {
                if tokio::runtime::Handle::try_current().is_ok() {
                    return Err(StepError::msg(format!(
                        "Async step '{}' cannot run on a blocking call inside an async runtime; use the async entry point",
                        ctx.step()
                    )));
                }
                if runtime.is_none() {
                    debug!("Starting current-thread runtime for async step '{}'", ctx.step());
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(|e| StepError::msg(format!("Failed to start runtime: {}", e)))?;
                    *runtime = Some(rt);
                }
                match runtime.as_ref() {
                    Some(rt) => rt.block_on(step.apply(ctx)),
                    None => Err(StepError::msg("Async runtime unavailable")),
                }
            }
        }
    }
}

impl std::fmt::Debug for StepApply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepApply::Sync(_) => f.write_str("StepApply::Sync"),
            StepApply::Async(_) => f.write_str("StepApply::Async"),
        }
    }
}

/// What a rollback handler sees.
pub struct RollbackContext<'a> {
    pub step: &'a StepId,
    pub data: Option<&'a Value>,
    pub input: &'a Value,
    pub state: &'a WorkingState,
}

pub type RollbackFn = Arc<dyn Fn(&RollbackContext<'_>) -> Result<(), StepError> + Send + Sync>;
