//! Recipe Registry
//!
//! Static catalog of [`RecipeContract`]s and of the plugins contracts name as
//! defaults. The registry is built once at startup and passed by reference;
//! nothing in the crate holds a process-wide catalog.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::adapters::Plugin;

/// The shape of a workflow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecipeContract {
    pub name: String,
    #[serde(default)]
    pub minimum_capabilities: Vec<String>,
    #[serde(default)]
    pub default_plugins: Vec<String>,
    #[serde(default)]
    pub extension_points: Vec<String>,
}

impl RecipeContract {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.minimum_capabilities.push(capability.into());
        self
    }

    pub fn default_plugin(mut self, key: impl Into<String>) -> Self {
        self.default_plugins.push(key.into());
        self
    }

    pub fn extension_point(mut self, step: impl Into<String>) -> Self {
        self.extension_points.push(step.into());
        self
    }

    pub fn has_extension_point(&self, step: &str) -> bool {
        self.extension_points.iter().any(|p| p == step)
    }
}

/// Catalog of contracts and default plugins.
#[derive(Debug, Clone, Default)]
pub struct RecipeRegistry {
    contracts: BTreeMap<String, RecipeContract>,
    plugins: BTreeMap<String, Plugin>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard contracts.
    ///
    /// | contract | minimum capabilities |
    /// |---|---|
    /// | `agent` | model, tools |
    /// | `rag` | model, retriever |
    /// | `ingest` | embedder, vector_store |
    /// | `chat.simple` | model |
    /// | `hitl` | model |
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry
            .register(
                RecipeContract::new("agent")
                    .requires("model")
                    .requires("tools")
                    .extension_point("agent.plan")
                    .extension_point("agent.respond"),
            )
            .register(
                RecipeContract::new("rag")
                    .requires("model")
                    .requires("retriever")
                    .extension_point("rag.retrieve")
                    .extension_point("rag.answer"),
            )
            .register(
                RecipeContract::new("ingest")
                    .requires("embedder")
                    .requires("vector_store")
                    .extension_point("ingest.chunk")
                    .extension_point("ingest.embed")
                    .extension_point("ingest.index"),
            )
            .register(
                RecipeContract::new("chat.simple")
                    .requires("model")
                    .extension_point("chat.respond"),
            )
            .register(
                RecipeContract::new("hitl")
                    .requires("model")
                    .extension_point("hitl.review"),
            );
        registry
    }

    /// Adds or replaces a contract.
    pub fn register(&mut self, contract: RecipeContract) -> &mut Self {
        debug!("Registered recipe contract '{}'", contract.name);
        self.contracts.insert(contract.name.clone(), contract);
        self
    }

    /// Adds or replaces a plugin that contracts may name as a default.
    pub fn register_plugin(&mut self, plugin: Plugin) -> &mut Self {
        debug!("Registered default plugin '{}'", plugin.key());
        self.plugins.insert(plugin.key().to_string(), plugin);
        self
    }

    pub fn contract(&self, name: &str) -> Option<&RecipeContract> {
        self.contracts.get(name)
    }

    pub fn plugin(&self, key: &str) -> Option<&Plugin> {
        self.plugins.get(key)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_contracts() {
        let registry = RecipeRegistry::standard();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["agent", "chat.simple", "hitl", "ingest", "rag"]);

        let rag = registry.contract("rag").unwrap();
        assert_eq!(rag.minimum_capabilities, vec!["model", "retriever"]);
        assert!(rag.has_extension_point("rag.answer"));
        assert!(!rag.has_extension_point("agent.respond"));
    }

    #[test]
    fn test_register_replaces_contract() {
        let mut registry = RecipeRegistry::standard();
        registry.register(RecipeContract::new("agent").requires("model"));
        assert_eq!(
            registry.contract("agent").unwrap().minimum_capabilities,
            vec!["model"]
        );
    }

    #[test]
    fn test_plugin_catalog() {
        let mut registry = RecipeRegistry::new();
        registry.register_plugin(Plugin::new("memory.default"));
        assert!(registry.plugin("memory.default").is_some());
        assert!(registry.plugin("missing").is_none());
    }

    #[test]
    fn test_contract_from_yaml() {
        let contract: RecipeContract = serde_yaml::from_str(
            "name: support\nminimum_capabilities: [model, memory]\n",
        )
        .unwrap();
        assert_eq!(contract.name, "support");
        assert!(contract.default_plugins.is_empty());
    }
}
