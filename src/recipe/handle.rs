//! Recipe Handles
//!
//! A [`RecipeHandle`] wraps a [`RecipeFactory`] (a name and a function from
//! configuration to [`RecipeDefinition`]) together with whatever the caller
//! layered on top: extra packs, other handles, default adapters, plugins and
//! configuration patches. The definition is rebuilt from the factory every
//! time it is needed, so `configure` always takes effect.
//!
//! # Example
//!
//! ```rust,no_run
//! use recipeflow::recipe::{Pack, RecipeDefinition, RecipeHandle, RunOptions, StepBuilder};
//! use recipeflow::execution::StepOutput;
//! use recipeflow::Runtime;
//! use serde_json::json;
//!
//! let greet = Pack::new("chat").step(StepBuilder::sync("greet", |ctx| {
//!     Ok(StepOutput::set("reply", json!(format!("hello {}", ctx.input()["name"]))))
//! }));
//! let handle = RecipeHandle::from_fn("chat.simple", move |_| {
//!     RecipeDefinition::new("chat.simple").pack(greet.clone())
//! });
//!
//! let runtime = Runtime::default();
//! let outcome = handle.run_blocking(&runtime, json!({ "name": "Ada" }), RunOptions::default());
//! println!("{}", outcome.status());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use crate::adapters::{resolve, AdapterBundle, AdapterHandle, Capability, Explain, Plugin, Resolution, ResolveRequest};
use crate::diagnostics::{apply_mode, has_errors, Diagnostic, DiagnosticsMode, Kind};
use crate::error::Result;
use crate::execution::{execution_order, Executor, Outcome, OutcomeError};
use crate::runtime::Runtime;
use crate::session::{recipe_mismatch, PauseManager, PauseSnapshot};

use super::definition::{Plan, RecipeDefinition};
use super::graph::StepGraph;
use super::pack::{Pack, StepId};

type ResolveFn = dyn Fn(&Value) -> RecipeDefinition + Send + Sync;

/// A named recipe whose definition depends on configuration.
#[derive(Clone)]
pub struct RecipeFactory {
    name: String,
    resolve: Arc<ResolveFn>,
}

impl RecipeFactory {
    pub fn new<F>(name: impl Into<String>, resolve: F) -> Self
    where
        F: Fn(&Value) -> RecipeDefinition + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            resolve: Arc::new(resolve),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self, config: &Value) -> RecipeDefinition {
        (self.resolve)(config)
    }
}

impl fmt::Debug for RecipeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeFactory").field("name", &self.name).finish()
    }
}

/// Something that can be layered onto a handle with [`RecipeHandle::with`].
#[derive(Debug, Clone)]
pub enum Usable {
    Pack(Pack),
    Handle(RecipeHandle),
}

impl From<Pack> for Usable {
    fn from(pack: Pack) -> Self {
        Usable::Pack(pack)
    }
}

impl From<RecipeHandle> for Usable {
    fn from(handle: RecipeHandle) -> Self {
        Usable::Handle(handle)
    }
}

impl From<&RecipeHandle> for Usable {
    fn from(handle: &RecipeHandle) -> Self {
        Usable::Handle(handle.clone())
    }
}

/// Call-time overrides for [`RecipeHandle::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Adapters with the highest precedence
    pub adapters: AdapterBundle,
    /// Provider ids from the runtime's provider registry, by capability
    pub providers: BTreeMap<Capability, String>,
    /// Overrides the runtime's diagnostics mode
    pub diagnostics: Option<DiagnosticsMode>,
}

impl RunOptions {
    pub fn adapter(mut self, handle: AdapterHandle) -> Self {
        self.adapters.insert(handle);
        self
    }

    pub fn provider(mut self, capability: Capability, id: impl Into<String>) -> Self {
        self.providers.insert(capability, id.into());
        self
    }

    pub fn diagnostics(mut self, mode: DiagnosticsMode) -> Self {
        self.diagnostics = Some(mode);
        self
    }
}

/// Call-time input and overrides for [`RecipeHandle::resume`].
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Handed to the paused step through `StepContext::resume_input`
    pub input: Option<Value>,
    pub adapters: AdapterBundle,
    pub providers: BTreeMap<Capability, String>,
    pub diagnostics: Option<DiagnosticsMode>,
}

impl ResumeOptions {
    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn adapter(mut self, handle: AdapterHandle) -> Self {
        self.adapters.insert(handle);
        self
    }

    pub fn provider(mut self, capability: Capability, id: impl Into<String>) -> Self {
        self.providers.insert(capability, id.into());
        self
    }

    pub fn diagnostics(mut self, mode: DiagnosticsMode) -> Self {
        self.diagnostics = Some(mode);
        self
    }
}

/// A runnable graph with its resolved adapters.
#[derive(Debug, Clone)]
pub struct CompiledRecipe {
    pub name: String,
    pub graph: Arc<StepGraph>,
    pub resolution: Resolution,
    /// Definition, resolution and graph diagnostics, unmoded
    pub diagnostics: Vec<Diagnostic>,
}

impl CompiledRecipe {
    pub fn explain(&self) -> &Explain {
        &self.resolution.explain
    }

    pub fn adapters(&self) -> &AdapterBundle {
        &self.resolution.adapters
    }

    /// The order a fresh run would execute steps in.
    pub fn execution_order(&self) -> Vec<StepId> {
        execution_order(Arc::clone(&self.graph))
    }
}

/// An executor ready to continue a claimed snapshot.
struct Continuation {
    executor: Executor,
    graph: Arc<StepGraph>,
    manager: PauseManager,
    mode: DiagnosticsMode,
}

/// Composition surface over a recipe factory.
#[derive(Debug, Clone)]
pub struct RecipeHandle {
    factory: RecipeFactory,
    config: Value,
    extras: Vec<Usable>,
    defaults: AdapterBundle,
    plugins: Vec<Plugin>,
}

impl RecipeHandle {
    pub fn new(factory: RecipeFactory) -> Self {
        Self {
            factory,
            config: Value::Object(Default::default()),
            extras: Vec::new(),
            defaults: AdapterBundle::new(),
            plugins: Vec::new(),
        }
    }

    pub fn from_fn<F>(name: impl Into<String>, resolve: F) -> Self
    where
        F: Fn(&Value) -> RecipeDefinition + Send + Sync + 'static,
    {
        Self::new(RecipeFactory::new(name, resolve))
    }

    pub fn name(&self) -> &str {
        self.factory.name()
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Layers a pack or another handle's definition on top, with the
    /// duplicate-pack policy of [`RecipeDefinition::add_pack`].
    pub fn with(mut self, usable: impl Into<Usable>) -> Self {
        self.extras.push(usable.into());
        self
    }

    /// Adds default adapters above the definition's own defaults.
    pub fn defaults(mut self, defaults: AdapterBundle) -> Self {
        self.defaults.layer(&defaults);
        self
    }

    pub fn default_adapter(mut self, handle: AdapterHandle) -> Self {
        self.defaults.insert(handle);
        self
    }

    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Shallow-merges `patch` into the configuration. A non-object patch
    /// replaces the configuration.
    pub fn configure(mut self, patch: Value) -> Self {
        match (&mut self.config, patch) {
            (Value::Object(current), Value::Object(patch)) => {
                for (key, value) in patch {
                    current.insert(key, value);
                }
            }
            (current, patch) => *current = patch,
        }
        self
    }

    /// The factory's definition with every layer applied.
    pub fn definition(&self) -> RecipeDefinition {
        let mut definition = self.factory.definition(&self.config);
        for extra in &self.extras {
            match extra {
                Usable::Pack(pack) => definition.add_pack(pack.clone()),
                Usable::Handle(handle) => definition.merge(handle.definition()),
            }
        }
        definition.add_defaults(&self.defaults);
        for plugin in &self.plugins {
            definition.add_plugin(plugin.clone());
        }
        definition
    }

    pub fn plan(&self) -> Plan {
        self.definition().plan()
    }

    /// Resolution introspection without compiling the graph.
    pub fn explain(&self, runtime: &Runtime) -> Explain {
        let definition = self.definition();
        let packs = definition.pack_list();
        let no_adapters = AdapterBundle::new();
        let no_providers = BTreeMap::new();
        let resolution = resolve(ResolveRequest {
            recipe: self.name(),
            registry: runtime.registry(),
            providers: runtime.providers(),
            plugins: definition.plugins(),
            packs: &packs,
            defaults: definition.defaults(),
            overrides: &no_adapters,
            provider_overrides: &no_providers,
        });
        resolution.explain
    }

    /// Resolves adapters and compiles the graph without running it.
    pub fn build(&self, runtime: &Runtime) -> Result<CompiledRecipe> {
        self.compile(runtime, &AdapterBundle::new(), &BTreeMap::new())
    }

    fn compile(
        &self,
        runtime: &Runtime,
        adapters: &AdapterBundle,
        providers: &BTreeMap<Capability, String>,
    ) -> Result<CompiledRecipe> {
        let definition = self.definition();
        let packs = definition.pack_list();
        let resolution = resolve(ResolveRequest {
            recipe: self.name(),
            registry: runtime.registry(),
            providers: runtime.providers(),
            plugins: definition.plugins(),
            packs: &packs,
            defaults: definition.defaults(),
            overrides: adapters,
            provider_overrides: providers,
        });
        let (graph, graph_diagnostics) = StepGraph::compile(&packs, &resolution.hooks)?;

        let mut diagnostics = definition.diagnostics().to_vec();
        diagnostics.extend(resolution.diagnostics.iter().cloned());
        diagnostics.extend(graph_diagnostics);

        Ok(CompiledRecipe {
            name: self.name().to_string(),
            graph: Arc::new(graph),
            resolution,
            diagnostics,
        })
    }

    fn mode(runtime: &Runtime, requested: Option<DiagnosticsMode>) -> DiagnosticsMode {
        requested.unwrap_or(runtime.config().diagnostics)
    }

    /// Compiles and checks diagnostics; an `Err` is the terminal outcome.
    fn prepare_run(
        &self,
        runtime: &Runtime,
        input: Value,
        options: RunOptions,
    ) -> std::result::Result<(Executor, Arc<StepGraph>, DiagnosticsMode), Outcome> {
        let mode = Self::mode(runtime, options.diagnostics);
        let compiled = self
            .compile(runtime, &options.adapters, &options.providers)
            .map_err(|e| self.build_failure(e, mode))?;

        let checked = apply_mode(mode, compiled.diagnostics.clone());
        if has_errors(&checked) {
            warn!("Recipe '{}' failed diagnostics checks before execution", self.name());
            return Err(Outcome::error(
                format!("Recipe '{}' failed diagnostics checks", self.name()),
                checked,
            ));
        }

        info!("Running recipe '{}' ({} steps)", self.name(), compiled.graph.len());
        let executor = Executor::new(
            Arc::clone(&compiled.graph),
            compiled.resolution.adapters,
            input,
        )
        .with_mode(mode)
        .with_diagnostics(compiled.diagnostics);
        Ok((executor, compiled.graph, mode))
    }

    fn build_failure(&self, error: crate::error::EngineError, mode: DiagnosticsMode) -> Outcome {
        warn!("Failed to build recipe '{}': {}", self.name(), error);
        let mut diagnostics = self.definition().diagnostics().to_vec();
        diagnostics.push(
            Diagnostic::error(Kind::Recipe, error.to_string()).with_code("recipe.buildFailed"),
        );
        Outcome::error(
            format!("Failed to build recipe '{}': {}", self.name(), error),
            apply_mode(mode, diagnostics),
        )
    }

    /// Builds and executes the recipe, awaiting async steps.
    pub async fn run(&self, runtime: &Runtime, input: Value, options: RunOptions) -> Outcome {
        let (executor, graph, mode) = match self.prepare_run(runtime, input, options) {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        };
        let output = executor.run().await;
        runtime.pauses().settle(self.name(), &graph, output, mode, false)
    }

    /// Builds and executes the recipe on the calling thread.
    pub fn run_blocking(&self, runtime: &Runtime, input: Value, options: RunOptions) -> Outcome {
        let (executor, graph, mode) = match self.prepare_run(runtime, input, options) {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        };
        let output = executor.run_blocking();
        runtime.pauses().settle(self.name(), &graph, output, mode, false)
    }

    /// Claims the snapshot, re-resolves adapters with the resume overrides
    /// and prepares the executor. The snapshot is put back whenever the
    /// resume stops before execution.
    fn prepare_resume(
        &self,
        runtime: &Runtime,
        token: &str,
        options: ResumeOptions,
    ) -> std::result::Result<Continuation, Outcome> {
        let mode = Self::mode(runtime, options.diagnostics);
        let manager = runtime.pauses();

        let snapshot = manager.claim(token).map_err(|diagnostics| {
            let message = diagnostics
                .first()
                .map(|d| d.message.clone())
                .unwrap_or_else(|| crate::session::INVALID_TOKEN_MESSAGE.to_string());
            Outcome::error(message, apply_mode(mode, diagnostics))
        })?;

        if snapshot.recipe != self.name() {
            let diagnostic = recipe_mismatch(token, &snapshot.recipe, self.name());
            return Err(Self::abandon(&manager, &snapshot, vec![diagnostic], mode));
        }

        let compiled = match self.compile(runtime, &options.adapters, &options.providers) {
            Ok(compiled) => compiled,
            Err(e) => {
                let diagnostic = Diagnostic::error(Kind::Recipe, e.to_string())
                    .with_code("recipe.buildFailed");
                return Err(Self::abandon(&manager, &snapshot, vec![diagnostic], mode));
            }
        };

        let checked = apply_mode(mode, compiled.diagnostics.clone());
        if has_errors(&checked) {
            warn!("Resume of '{}' short-circuited by resolution diagnostics", token);
            return Err(Self::abandon(&manager, &snapshot, compiled.diagnostics, mode));
        }

        info!("Resuming recipe '{}' from token '{}'", self.name(), snapshot.token);
        let executor = Executor::from_snapshot(
            Arc::clone(&compiled.graph),
            compiled.resolution.adapters,
            snapshot.executor,
            options.input,
        )
        .with_mode(mode)
        .with_diagnostics(compiled.diagnostics);

        Ok(Continuation {
            executor,
            graph: compiled.graph,
            manager,
            mode,
        })
    }

    /// Restores a claimed snapshot and reports why the resume stopped.
    fn abandon(
        manager: &PauseManager,
        snapshot: &PauseSnapshot,
        diagnostics: Vec<Diagnostic>,
        mode: DiagnosticsMode,
    ) -> Outcome {
        let mut all = snapshot.executor.diagnostics.clone();
        all.extend(diagnostics);
        all.extend(manager.restore(snapshot));
        let all = apply_mode(mode, all);
        let message = all
            .iter()
            .find(|d| d.is_error())
            .map(|d| d.message.clone())
            .unwrap_or_else(|| format!("Resume of '{}' failed", snapshot.token));
        Outcome::Error {
            error: OutcomeError::new(message),
            trace: snapshot.executor.trace.clone(),
            diagnostics: all,
        }
    }

    /// Continues a paused run, awaiting async steps.
    pub async fn resume(&self, runtime: &Runtime, token: &str, options: ResumeOptions) -> Outcome {
        let continuation = match self.prepare_resume(runtime, token, options) {
            Ok(continuation) => continuation,
            Err(outcome) => return outcome,
        };
        let output = continuation.executor.run().await;
        continuation
            .manager
            .settle(self.name(), &continuation.graph, output, continuation.mode, true)
    }

    /// Continues a paused run on the calling thread.
    pub fn resume_blocking(&self, runtime: &Runtime, token: &str, options: ResumeOptions) -> Outcome {
        let continuation = match self.prepare_resume(runtime, token, options) {
            Ok(continuation) => continuation,
            Err(outcome) => return outcome,
        };
        let output = continuation.executor.run_blocking();
        continuation
            .manager
            .settle(self.name(), &continuation.graph, output, continuation.mode, true)
    }

    /// Discards a paused run of this recipe, rolling back every step it
    /// executed. Tokens owned by other recipes are left in place.
    pub fn abort(&self, runtime: &Runtime, token: &str) -> Vec<Diagnostic> {
        match self.build(runtime) {
            Ok(compiled) => runtime.pauses().abort(self.name(), token, &compiled.graph),
            Err(e) => vec![Diagnostic::error(Kind::Recipe, e.to_string()).with_code("recipe.buildFailed")],
        }
    }
}
