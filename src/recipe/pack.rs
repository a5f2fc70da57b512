//! Packs and Step Specifications
//!
//! A [`Pack`] is a named, reusable group of steps. Steps are declared with a
//! [`StepBuilder`] and normalized into a [`StepSpec`] when added to a pack:
//! the step's id becomes `pack.step` and unqualified `depends_on` names are
//! resolved against the same pack.
//!
//! # Example
//!
//! ```
//! use recipeflow::execution::StepOutput;
//! use recipeflow::recipe::{Pack, StepBuilder};
//! use serde_json::json;
//!
//! let pack = Pack::new("ingest")
//!     .step(StepBuilder::sync("load", |_| Ok(StepOutput::set("ingest.docs", json!([])))))
//!     .step(
//!         StepBuilder::sync("chunk", |_| Ok(StepOutput::Continue))
//!             .depends_on("load")
//!             .label("Chunk documents"),
//!     )
//!     .minimum_capabilities(["embedder"]);
//!
//! assert_eq!(pack.len(), 2);
//! assert!(pack.get("ingest.chunk").is_some());
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::adapters::{AdapterBundle, AdapterHandle};
use crate::execution::step::{
    AsyncStep, OwnedStepContext, RollbackContext, RollbackFn, StepApply, StepContext, StepError,
    StepResult,
};

/// Normalized step identity, `pack.step`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(pack: &str, step: &str) -> Self {
        StepId(format!("{}.{}", pack.trim(), step.trim()))
    }

    /// Resolves `name` relative to `pack`. Names containing `.` are already
    /// qualified and kept as-is.
    pub fn normalize(pack: &str, name: &str) -> Self {
        let name = name.trim();
        if name.contains('.') {
            StepId(name.to_string())
        } else {
            Self::new(pack, name)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The pack segment of the id.
    pub fn pack(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(pack, _)| pack)
    }

    /// The step segment of the id.
    pub fn name(&self) -> &str {
        self.0.split_once('.').map_or("", |(_, name)| name)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        StepId(id.trim().to_string())
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// How a step treats an existing step with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// Adds a step; replacing an existing id is reported as a duplicate
    #[default]
    Extend,
    /// Deliberately replaces the step with the same id
    Override,
}

/// One executable unit of a compiled graph.
#[derive(Clone)]
pub struct StepSpec {
    pub id: StepId,
    /// Pack the step was declared in (differs from `id.pack()` for overrides)
    pub pack: String,
    pub apply: StepApply,
    pub depends_on: Vec<StepId>,
    pub priority: i32,
    pub mode: StepMode,
    pub label: Option<String>,
    pub kind: Option<String>,
    pub summary: Option<String>,
    pub rollback: Option<RollbackFn>,
}

impl fmt::Debug for StepSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSpec")
            .field("id", &self.id)
            .field("pack", &self.pack)
            .field("apply", &self.apply)
            .field("depends_on", &self.depends_on)
            .field("priority", &self.priority)
            .field("mode", &self.mode)
            .field("label", &self.label)
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

/// Declares a step before it is bound to a pack.
#[derive(Clone)]
pub struct StepBuilder {
    name: String,
    apply: StepApply,
    depends_on: Vec<String>,
    priority: i32,
    mode: StepMode,
    label: Option<String>,
    kind: Option<String>,
    summary: Option<String>,
    rollback: Option<RollbackFn>,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>, apply: StepApply) -> Self {
        Self {
            name: name.into().trim().to_string(),
            apply,
            depends_on: Vec::new(),
            priority: 0,
            mode: StepMode::Extend,
            label: None,
            kind: None,
            summary: None,
            rollback: None,
        }
    }

    /// A synchronous step.
    pub fn sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> StepResult + Send + Sync + 'static,
    {
        Self::new(name, StepApply::sync(f))
    }

    /// An asynchronous step given as a closure over an owned context.
    pub fn from_async_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OwnedStepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        Self::new(name, StepApply::from_async_fn(f))
    }

    /// An asynchronous step implemented as an [`AsyncStep`].
    pub fn handler(name: impl Into<String>, step: impl AsyncStep + 'static) -> Self {
        Self::new(name, StepApply::handler(step))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a dependency; unqualified names refer to the same pack.
    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    /// Lower values run first among ready steps. Defaults to 0.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the step as a deliberate replacement of an existing id.
    pub fn override_existing(mut self) -> Self {
        self.mode = StepMode::Override;
        self
    }

    pub fn extend(mut self) -> Self {
        self.mode = StepMode::Extend;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Attaches a compensating action run if the run is later rolled back.
    pub fn rollback<F>(mut self, f: F) -> Self
    where
        F: Fn(&RollbackContext<'_>) -> Result<(), StepError> + Send + Sync + 'static,
    {
        self.rollback = Some(Arc::new(f));
        self
    }

    /// Binds the step to `pack`, normalizing its id and dependencies.
    pub fn into_spec(self, pack: &str) -> StepSpec {
        StepSpec {
            id: StepId::normalize(pack, &self.name),
            pack: pack.to_string(),
            apply: self.apply,
            depends_on: self
                .depends_on
                .iter()
                .map(|dep| StepId::normalize(pack, dep))
                .collect(),
            priority: self.priority,
            mode: self.mode,
            label: self.label,
            kind: self.kind,
            summary: self.summary,
            rollback: self.rollback,
        }
    }
}

impl fmt::Debug for StepBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepBuilder")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A named, reusable group of steps.
#[derive(Clone, Default)]
pub struct Pack {
    name: String,
    steps: IndexMap<StepId, StepSpec>,
    minimum_capabilities: Option<Vec<String>>,
    default_adapters: AdapterBundle,
}

impl Pack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            ..Self::default()
        }
    }

    /// Builds a pack from a list of step builders.
    pub fn with_steps(name: impl Into<String>, steps: impl IntoIterator<Item = StepBuilder>) -> Self {
        steps.into_iter().fold(Self::new(name), Pack::step)
    }

    /// Adds a step. A later step with the same name replaces the earlier one.
    pub fn step(mut self, builder: StepBuilder) -> Self {
        let spec = builder.into_spec(&self.name);
        self.steps.insert(spec.id.clone(), spec);
        self
    }

    /// Replaces the contract's minimum capability list for recipes using
    /// this pack.
    pub fn minimum_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.minimum_capabilities = Some(capabilities.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a default adapter; plugin and run-time adapters take precedence.
    pub fn default_adapter(mut self, handle: AdapterHandle) -> Self {
        self.default_adapters.insert(handle);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.steps.values()
    }

    pub fn get(&self, id: &str) -> Option<&StepSpec> {
        self.steps.get(&StepId::from(id))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn declared_minimum(&self) -> Option<&[String]> {
        self.minimum_capabilities.as_deref()
    }

    pub fn default_adapters(&self) -> &AdapterBundle {
        &self.default_adapters
    }
}

impl fmt::Debug for Pack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pack")
            .field("name", &self.name)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("minimum_capabilities", &self.minimum_capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::StepOutput;

    fn noop(name: &str) -> StepBuilder {
        StepBuilder::sync(name, |_| Ok(StepOutput::Continue))
    }

    #[test]
    fn test_step_id_normalization() {
        assert_eq!(StepId::normalize("rag", "retrieve"), "rag.retrieve");
        assert_eq!(StepId::normalize("rag", "ingest.embed"), "ingest.embed");
        assert_eq!(StepId::normalize(" rag ", " answer "), "rag.answer");

        let id = StepId::new("rag", "answer");
        assert_eq!(id.pack(), "rag");
        assert_eq!(id.name(), "answer");
    }

    #[test]
    fn test_dependencies_resolved_against_own_pack() {
        let pack = Pack::new("B")
            .step(noop("prepare"))
            .step(noop("run").depends_on("prepare").depends_on("A.seed"));

        let run = pack.get("B.run").unwrap();
        assert_eq!(run.depends_on, vec![StepId::from("B.prepare"), StepId::from("A.seed")]);
        assert_eq!(run.pack, "B");
    }

    #[test]
    fn test_builder_attributes() {
        let spec = noop("answer")
            .priority(-5)
            .override_existing()
            .label("Answer")
            .kind("llm")
            .summary("Calls the model")
            .rollback(|_| Ok(()))
            .into_spec("chat");

        assert_eq!(spec.priority, -5);
        assert_eq!(spec.mode, StepMode::Override);
        assert_eq!(spec.label.as_deref(), Some("Answer"));
        assert_eq!(spec.kind.as_deref(), Some("llm"));
        assert!(spec.rollback.is_some());
    }

    #[test]
    fn test_qualified_name_targets_other_pack() {
        let spec = noop("agent.respond").override_existing().into_spec("custom");
        assert_eq!(spec.id, "agent.respond");
        assert_eq!(spec.pack, "custom");
    }

    #[test]
    fn test_pack_replaces_same_step_name() {
        let pack = Pack::with_steps("A", [noop("seed"), noop("seed").priority(3)]);
        assert_eq!(pack.len(), 1);
        assert_eq!(pack.get("A.seed").unwrap().priority, 3);
    }

    #[test]
    fn test_minimum_capabilities() {
        let pack = Pack::new("rag").minimum_capabilities(["model", "retriever"]);
        assert_eq!(
            pack.declared_minimum(),
            Some(&["model".to_string(), "retriever".to_string()][..])
        );
        assert_eq!(Pack::new("x").declared_minimum(), None);
    }
}
