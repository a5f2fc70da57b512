//! Recipe Definitions
//!
//! A [`RecipeDefinition`] is the merged set of packs, default adapters and
//! plugins behind one handle. Packs are keyed by name: a later pack with the
//! same name replaces the earlier one wholesale and a `recipe.duplicatePack`
//! warning is recorded.

use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::adapters::{AdapterBundle, AdapterHandle, Plugin};
use crate::diagnostics::{Diagnostic, Kind};

use super::graph::flatten;
use super::pack::{Pack, StepId, StepMode};

/// Packs, defaults and plugins for one recipe.
#[derive(Debug, Clone, Default)]
pub struct RecipeDefinition {
    name: String,
    packs: IndexMap<String, Pack>,
    defaults: AdapterBundle,
    plugins: Vec<Plugin>,
    diagnostics: Vec<Diagnostic>,
}

impl RecipeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn pack(mut self, pack: Pack) -> Self {
        self.add_pack(pack);
        self
    }

    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn default_adapter(mut self, handle: AdapterHandle) -> Self {
        self.defaults.insert(handle);
        self
    }

    /// Adds a pack, replacing any pack with the same name.
    pub fn add_pack(&mut self, pack: Pack) {
        let name = pack.name().to_string();
        if self.packs.contains_key(&name) {
            warn!("Pack '{}' registered twice; keeping the later one", name);
            self.diagnostics.push(
                Diagnostic::warn(Kind::Recipe, format!("Duplicate pack '{}' replaced", name))
                    .with_code("recipe.duplicatePack")
                    .with_data(serde_json::json!({ "pack": name })),
            );
            // Later registration moves to the end
            self.packs.shift_remove(&name);
        }
        self.packs.insert(name, pack);
    }

    pub fn add_defaults(&mut self, defaults: &AdapterBundle) {
        self.defaults.layer(defaults);
    }

    pub fn add_plugin(&mut self, plugin: Plugin) {
        self.plugins.push(plugin);
    }

    pub fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Merges another definition using the same duplicate policy.
    pub fn merge(&mut self, other: RecipeDefinition) {
        for pack in other.packs.into_values() {
            self.add_pack(pack);
        }
        self.defaults.layer(&other.defaults);
        self.plugins.extend(other.plugins);
        self.diagnostics.extend(other.diagnostics);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn packs(&self) -> impl Iterator<Item = &Pack> {
        self.packs.values()
    }

    pub fn pack_list(&self) -> Vec<Pack> {
        self.packs.values().cloned().collect()
    }

    pub fn get_pack(&self, name: &str) -> Option<&Pack> {
        self.packs.get(name)
    }

    pub fn defaults(&self) -> &AdapterBundle {
        &self.defaults
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Flattened step list for introspection, without validation.
    ///
    /// Steps are grouped by the pack that declared them (definition order)
    /// and sorted by id within a pack. This is a display order only.
    pub fn plan(&self) -> Plan {
        let flat = flatten(self.packs.values());

        let mut packs: Vec<PlanPack> = self
            .packs
            .keys()
            .map(|name| PlanPack {
                name: name.clone(),
                steps: Vec::new(),
            })
            .collect();

        for spec in flat.steps.values() {
            let step = PlanStep {
                id: spec.id.clone(),
                depends_on: spec.depends_on.clone(),
                priority: spec.priority,
                mode: spec.mode,
                label: spec.label.clone(),
                kind: spec.kind.clone(),
                summary: spec.summary.clone(),
                is_async: spec.apply.is_async(),
                has_rollback: spec.rollback.is_some(),
            };
            if let Some(group) = packs.iter_mut().find(|p| p.name == spec.pack) {
                group.steps.push(step);
            }
        }
        for group in &mut packs {
            group.steps.sort_by(|a, b| a.id.cmp(&b.id));
        }

        let mut diagnostics = self.diagnostics.clone();
        diagnostics.extend(flat.diagnostics);

        Plan {
            recipe: self.name.clone(),
            packs,
            overrides: flat.overrides,
            duplicates: flat.duplicates,
            plugins: self.plugins.iter().map(|p| p.key().to_string()).collect(),
            diagnostics,
        }
    }
}

/// Serializable view of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub recipe: String,
    pub packs: Vec<PlanPack>,
    pub overrides: Vec<String>,
    pub duplicates: Vec<String>,
    pub plugins: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Plan {
    /// Step ids in display order.
    pub fn step_ids(&self) -> Vec<&StepId> {
        self.packs
            .iter()
            .flat_map(|p| p.steps.iter().map(|s| &s.id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPack {
    pub name: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub depends_on: Vec<StepId>,
    pub priority: i32,
    pub mode: StepMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub is_async: bool,
    pub has_rollback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::StepOutput;
    use crate::recipe::StepBuilder;

    fn noop(name: &str) -> StepBuilder {
        StepBuilder::sync(name, |_| Ok(StepOutput::Continue))
    }

    #[test]
    fn test_duplicate_pack_replaced_with_single_diagnostic() {
        let definition = RecipeDefinition::new("agent")
            .pack(Pack::new("tools").step(noop("first")))
            .pack(Pack::new("tools").step(noop("second")));

        let packs: Vec<_> = definition.packs().collect();
        assert_eq!(packs.len(), 1);
        assert!(packs[0].get("tools.second").is_some());
        assert!(packs[0].get("tools.first").is_none());

        let duplicates: Vec<_> = definition
            .diagnostics()
            .iter()
            .filter(|d| d.code.as_deref() == Some("recipe.duplicatePack"))
            .collect();
        assert_eq!(duplicates.len(), 1);
    }

    #[test]
    fn test_plan_groups_by_pack_and_sorts() {
        let definition = RecipeDefinition::new("demo")
            .pack(Pack::new("B").step(noop("zeta")).step(noop("alpha")))
            .pack(Pack::new("A").step(noop("seed")));

        let plan = definition.plan();
        let ids: Vec<_> = plan.step_ids().iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["B.alpha", "B.zeta", "A.seed"]);
    }

    #[test]
    fn test_plan_lists_overrides_under_overriding_pack() {
        let definition = RecipeDefinition::new("agent")
            .pack(Pack::new("agent").step(noop("respond")).step(noop("plan")))
            .pack(Pack::new("custom").step(noop("agent.respond").override_existing()));

        let plan = definition.plan();
        assert_eq!(plan.overrides, vec!["custom overrides agent.respond"]);
        assert_eq!(plan.packs[0].steps.len(), 1);
        assert_eq!(plan.packs[1].steps[0].id, "agent.respond");
    }

    #[test]
    fn test_plan_is_stable() {
        let definition = RecipeDefinition::new("demo")
            .pack(Pack::new("A").step(noop("seed")))
            .pack(Pack::new("B").step(noop("run").depends_on("A.seed")));

        assert_eq!(definition.plan(), definition.plan());
        let value = serde_json::to_value(definition.plan()).unwrap();
        assert_eq!(value["packs"][1]["steps"][0]["depends_on"][0], "A.seed");
    }

    #[test]
    fn test_merge_uses_duplicate_policy() {
        let mut base = RecipeDefinition::new("agent").pack(Pack::new("memory"));
        let other = RecipeDefinition::new("memory-kit")
            .pack(Pack::new("memory").step(noop("load")))
            .plugin(Plugin::new("memory.default"));

        base.merge(other);

        assert_eq!(base.get_pack("memory").unwrap().len(), 1);
        assert_eq!(base.plugins().len(), 1);
        assert_eq!(base.diagnostics().len(), 1);
    }
}
