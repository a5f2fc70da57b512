//! Plugins
//!
//! A plugin contributes capability descriptors, live adapters, required
//! capabilities and optionally one lifecycle hook. Plugins are built in two
//! phases: [`Plugin::descriptor`] declares what the plugin offers as plain
//! data, and [`Plugin::materialize`] produces the hook step. The resolver
//! only materializes plugins that survive override resolution.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::recipe::StepBuilder;

use super::{AdapterBundle, AdapterHandle, Capability, CapabilityBundle};

/// Whether a plugin adds to or replaces another plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginMode {
    #[default]
    Extend,
    Override,
}

/// Serializable declaration of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub key: String,
    pub mode: PluginMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_key: Option<String>,
    pub capabilities: CapabilityBundle,
    /// Capabilities for which the plugin carries a live adapter
    pub adapters: Vec<Capability>,
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_point: Option<String>,
}

/// A materialized hook: a step run after a contract extension point.
#[derive(Debug, Clone)]
pub struct LifecycleHook {
    pub plugin: String,
    pub extension_point: String,
    pub step: StepBuilder,
}

pub type HookFactory = Arc<dyn Fn(&PluginDescriptor) -> StepBuilder + Send + Sync>;

#[derive(Clone)]
struct Lifecycle {
    extension_point: String,
    factory: HookFactory,
}

/// A unit contributing capabilities, adapters and requirements.
#[derive(Clone, Default)]
pub struct Plugin {
    key: String,
    mode: PluginMode,
    override_key: Option<String>,
    capabilities: CapabilityBundle,
    adapters: AdapterBundle,
    requires: Vec<String>,
    lifecycle: Option<Lifecycle>,
}

impl Plugin {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Replaces everything contributed by the plugin registered as `target`.
    pub fn overrides(mut self, target: impl Into<String>) -> Self {
        self.mode = PluginMode::Override;
        self.override_key = Some(target.into());
        self
    }

    pub fn capability(mut self, name: impl Into<String>, value: Value) -> Self {
        self.capabilities.insert(name, value);
        self
    }

    pub fn capabilities(mut self, bundle: CapabilityBundle) -> Self {
        self.capabilities.merge(&bundle);
        self
    }

    pub fn adapter(mut self, handle: AdapterHandle) -> Self {
        self.adapters.insert(handle);
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.requires.push(capability.into());
        self
    }

    /// Attaches a hook step run after `extension_point`. The factory is
    /// called only when the plugin is materialized.
    pub fn on<F>(mut self, extension_point: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&PluginDescriptor) -> StepBuilder + Send + Sync + 'static,
    {
        self.lifecycle = Some(Lifecycle {
            extension_point: extension_point.into(),
            factory: Arc::new(factory),
        });
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn mode(&self) -> PluginMode {
        self.mode
    }

    pub fn override_key(&self) -> Option<&str> {
        self.override_key.as_deref()
    }

    pub fn declared_capabilities(&self) -> &CapabilityBundle {
        &self.capabilities
    }

    pub fn adapters(&self) -> &AdapterBundle {
        &self.adapters
    }

    pub fn required(&self) -> &[String] {
        &self.requires
    }

    /// First phase: the plugin's static declaration.
    pub fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            key: self.key.clone(),
            mode: self.mode,
            override_key: self.override_key.clone(),
            capabilities: self.capabilities.clone(),
            adapters: self.adapters.capabilities(),
            requires: self.requires.clone(),
            extension_point: self.lifecycle.as_ref().map(|l| l.extension_point.clone()),
        }
    }

    /// Second phase: builds the hook step, if the plugin declares one.
    pub fn materialize(&self) -> Option<LifecycleHook> {
        let lifecycle = self.lifecycle.as_ref()?;
        let descriptor = self.descriptor();
        Some(LifecycleHook {
            plugin: self.key.clone(),
            extension_point: lifecycle.extension_point.clone(),
            step: (lifecycle.factory)(&descriptor),
        })
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("descriptor", &self.descriptor())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::EchoModel;
    use crate::execution::StepOutput;
    use serde_json::json;

    #[test]
    fn test_descriptor_lists_declarations() {
        let plugin = Plugin::new("openai")
            .capability("model", json!("gpt-4o-mini"))
            .adapter(AdapterHandle::Model(EchoModel::arc("openai:gpt-4o-mini")))
            .requires("tools");

        let descriptor = plugin.descriptor();
        assert_eq!(descriptor.key, "openai");
        assert_eq!(descriptor.mode, PluginMode::Extend);
        assert_eq!(descriptor.adapters, vec![Capability::Model]);
        assert_eq!(descriptor.requires, vec!["tools".to_string()]);
        assert!(descriptor.extension_point.is_none());
        assert!(plugin.materialize().is_none());
    }

    #[test]
    fn test_override_sets_mode_and_target() {
        let plugin = Plugin::new("anthropic").overrides("openai");
        assert_eq!(plugin.mode(), PluginMode::Override);
        assert_eq!(plugin.override_key(), Some("openai"));

        let value = serde_json::to_value(plugin.descriptor()).unwrap();
        assert_eq!(value["mode"], "override");
        assert_eq!(value["override_key"], "openai");
    }

    #[test]
    fn test_materialize_calls_factory_with_descriptor() {
        let plugin = Plugin::new("audit").on("agent.respond", |descriptor| {
            let key = descriptor.key.clone();
            StepBuilder::sync("record", move |_| Ok(StepOutput::set("audit", json!(key.clone()))))
        });

        assert_eq!(
            plugin.descriptor().extension_point.as_deref(),
            Some("agent.respond")
        );
        let hook = plugin.materialize().unwrap();
        assert_eq!(hook.plugin, "audit");
        assert_eq!(hook.extension_point, "agent.respond");
        assert_eq!(hook.step.name(), "record");
    }
}
