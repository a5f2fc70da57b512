//! Step Graph Builder
//!
//! Compiles an ordered list of packs into one flat, validated graph:
//! - Flattening with step-id collision handling (override vs duplicate)
//! - Lifecycle hook attachment after extension points
//! - Reference integrity (every `depends_on` target exists)
//! - Cycle detection (Kahn's algorithm)

use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use log::{debug, info};

use crate::adapters::LifecycleHook;
use crate::diagnostics::{Diagnostic, Kind};
use crate::error::{EngineError, Result};

use super::pack::{Pack, StepId, StepMode, StepSpec};

/// Steps after collision handling, before validation.
#[derive(Debug, Default)]
pub(crate) struct Flattened {
    pub steps: IndexMap<StepId, StepSpec>,
    pub overrides: Vec<String>,
    pub duplicates: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Flattened {
    fn insert(&mut self, spec: StepSpec) {
        if let Some(existing) = self.steps.get(&spec.id) {
            match spec.mode {
                StepMode::Override => {
                    self.overrides
                        .push(format!("{} overrides {}", spec.pack, spec.id));
                }
                StepMode::Extend => {
                    self.duplicates.push(spec.id.to_string());
                    self.diagnostics.push(
                        Diagnostic::warn(
                            Kind::Pipeline,
                            format!(
                                "Step '{}' from pack '{}' replaces the one declared by pack '{}'",
                                spec.id, spec.pack, existing.pack
                            ),
                        )
                        .with_code("pipeline.duplicateStep")
                        .with_data(serde_json::json!({ "step": spec.id })),
                    );
                }
            }
            debug!("Step '{}' replaced by pack '{}'", spec.id, spec.pack);
        }
        self.steps.insert(spec.id.clone(), spec);
    }
}

/// Flattens packs in order; later steps replace earlier ones with the same id.
pub(crate) fn flatten<'a>(packs: impl IntoIterator<Item = &'a Pack>) -> Flattened {
    let mut flat = Flattened::default();
    for pack in packs {
        for spec in pack.steps() {
            flat.insert(spec.clone());
        }
    }
    flat
}

/// A validated, executable step graph.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    steps: IndexMap<StepId, StepSpec>,
    topological: Vec<StepId>,
    overrides: Vec<String>,
    duplicates: Vec<String>,
}

impl StepGraph {
    /// Compiles packs and hooks into a graph.
    ///
    /// Returns the graph together with the warnings produced while
    /// flattening. Fails on unknown dependencies and cycles.
    pub fn compile<'a>(
        packs: impl IntoIterator<Item = &'a Pack>,
        hooks: &[LifecycleHook],
    ) -> Result<(Self, Vec<Diagnostic>)> {
        let mut flat = flatten(packs);

        for hook in hooks {
            let point = StepId::from(hook.extension_point.as_str());
            if !flat.steps.contains_key(&point) {
                flat.diagnostics.push(
                    Diagnostic::warn(
                        Kind::Recipe,
                        format!(
                            "Plugin '{}' targets extension point '{}' which is not a step of this recipe",
                            hook.plugin, point
                        ),
                    )
                    .with_code("recipe.unknownExtensionPoint"),
                );
                continue;
            }
            let spec = hook
                .step
                .clone()
                .depends_on(point.as_str())
                .into_spec(&hook_pack(&hook.plugin));
            debug!("Attached hook '{}' after '{}'", spec.id, point);
            flat.insert(spec);
        }

        validate_references(&flat.steps)?;
        let topological = topological_sort(&flat.steps)?;

        info!(
            "Compiled step graph: {} steps, {} overrides, {} duplicates",
            flat.steps.len(),
            flat.overrides.len(),
            flat.duplicates.len()
        );

        let graph = Self {
            steps: flat.steps,
            topological,
            overrides: flat.overrides,
            duplicates: flat.duplicates,
        };
        Ok((graph, flat.diagnostics))
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepSpec> {
        self.steps.values()
    }

    pub fn get(&self, id: &StepId) -> Option<&StepSpec> {
        self.steps.get(id)
    }

    pub fn contains(&self, id: &StepId) -> bool {
        self.steps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// One valid dependency order (not necessarily the execution order).
    pub fn topological_order(&self) -> &[StepId] {
        &self.topological
    }

    pub fn overrides(&self) -> &[String] {
        &self.overrides
    }

    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }
}

fn validate_references(steps: &IndexMap<StepId, StepSpec>) -> Result<()> {
    for spec in steps.values() {
        for dep in &spec.depends_on {
            if !steps.contains_key(dep) {
                return Err(EngineError::UnknownDependency {
                    step: spec.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn topological_sort(steps: &IndexMap<StepId, StepSpec>) -> Result<Vec<StepId>> {
    let mut in_degree: HashMap<&StepId, usize> = HashMap::new();
    let mut successors: HashMap<&StepId, Vec<&StepId>> = HashMap::new();

    for spec in steps.values() {
        let mut deps: Vec<&StepId> = spec.depends_on.iter().collect();
        deps.sort();
        deps.dedup();
        in_degree.insert(&spec.id, deps.len());
        for dep in deps {
            successors.entry(dep).or_default().push(&spec.id);
        }
    }

    let mut queue: VecDeque<&StepId> = steps
        .keys()
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();
    let mut sorted: Vec<StepId> = Vec::with_capacity(steps.len());

    while let Some(current) = queue.pop_front() {
        sorted.push(current.clone());
        for next in successors.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if sorted.len() != steps.len() {
        let mut members: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        members.sort();
        return Err(EngineError::Cycle(members.join(", ")));
    }

    debug!("Topological order: {:?}", sorted);
    Ok(sorted)
}

/// Pack segment for a plugin's hook step. Step ids split on the first `.`,
/// so dots in the plugin key become `_`.
fn hook_pack(plugin: &str) -> String {
    plugin.replace('.', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Plugin;
    use crate::execution::StepOutput;
    use crate::recipe::StepBuilder;

    fn noop(name: &str) -> StepBuilder {
        StepBuilder::sync(name, |_| Ok(StepOutput::Continue))
    }

    #[test]
    fn test_compile_cross_pack_dependency() {
        let a = Pack::new("A").step(noop("seed"));
        let b = Pack::new("B").step(noop("run").depends_on("A.seed"));

        let (graph, diagnostics) = StepGraph::compile([&a, &b], &[]).unwrap();

        assert_eq!(graph.len(), 2);
        assert!(diagnostics.is_empty());
        assert_eq!(
            graph.topological_order(),
            &[StepId::from("A.seed"), StepId::from("B.run")]
        );
    }

    #[test]
    fn test_unknown_dependency_fails() {
        let b = Pack::new("B").step(noop("run").depends_on("A.seed"));
        let err = StepGraph::compile([&b], &[]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownDependency { ref step, ref dependency }
                if step == "B.run" && dependency == "A.seed"
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let pack = Pack::new("p")
            .step(noop("a").depends_on("b"))
            .step(noop("b").depends_on("a"))
            .step(noop("c"));

        let err = StepGraph::compile([&pack], &[]).unwrap_err();
        match err {
            EngineError::Cycle(members) => assert_eq!(members, "p.a, p.b"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_override_replaces_without_duplicate() {
        let base = Pack::new("agent").step(noop("respond"));
        let custom = Pack::new("custom").step(noop("agent.respond").override_existing());

        let (graph, diagnostics) = StepGraph::compile([&base, &custom], &[]).unwrap();

        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get(&StepId::from("agent.respond")).unwrap().pack, "custom");
        assert_eq!(graph.overrides(), &["custom overrides agent.respond".to_string()]);
        assert!(graph.duplicates().is_empty());
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_extend_collision_is_duplicate() {
        let base = Pack::new("agent").step(noop("respond"));
        let other = Pack::new("other").step(noop("agent.respond").priority(2));

        let (graph, diagnostics) = StepGraph::compile([&base, &other], &[]).unwrap();

        assert_eq!(graph.get(&StepId::from("agent.respond")).unwrap().priority, 2);
        assert_eq!(graph.duplicates(), &["agent.respond".to_string()]);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].code.as_deref(), Some("pipeline.duplicateStep"));
    }

    #[test]
    fn test_hook_attached_after_extension_point() {
        let agent = Pack::new("agent").step(noop("respond"));
        let hooks = vec![
            Plugin::new("audit")
                .on("agent.respond", |_| noop("record"))
                .materialize()
                .unwrap(),
            Plugin::new("lost")
                .on("agent.plan", |_| noop("record"))
                .materialize()
                .unwrap(),
        ];

        let (graph, diagnostics) = StepGraph::compile([&agent], &hooks).unwrap();

        let hook = graph.get(&StepId::from("audit.record")).unwrap();
        assert_eq!(hook.depends_on, vec![StepId::from("agent.respond")]);
        assert!(!graph.contains(&StepId::from("lost.record")));
        assert_eq!(
            diagnostics[0].code.as_deref(),
            Some("recipe.unknownExtensionPoint")
        );
    }

    #[test]
    fn test_dotted_plugin_key_keeps_hook_in_one_pack() {
        let agent = Pack::new("agent").step(noop("respond"));
        let hooks = vec![Plugin::new("memory.default")
            .on("agent.respond", |_| noop("record"))
            .materialize()
            .unwrap()];

        let (graph, _) = StepGraph::compile([&agent], &hooks).unwrap();

        let hook = graph.get(&StepId::from("memory_default.record")).unwrap();
        assert_eq!(hook.id.pack(), "memory_default");
        assert_eq!(hook.id.name(), "record");
        assert_eq!(hook.pack, "memory_default");
    }
}
