//! Capability & Adapter Resolver
//!
//! Merges the plugins of one recipe into a single [`Resolution`]:
//!
//! 1. Collect plugins: contract default plugins first, then the recipe's own,
//!    in registration order. A repeated key replaces the earlier plugin.
//! 2. Apply overrides: an `override` plugin removes its target from the
//!    active set; the target is reported as unused.
//! 3. Layer adapters, lowest precedence first: recipe defaults, active
//!    plugins, call-time adapters, call-time providers. Builtin providers
//!    fill whatever is still empty.
//! 4. Check the effective capabilities against the minimum list and each
//!    active plugin's requirements.
//! 5. Materialize lifecycle hooks of active plugins.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::diagnostics::{Diagnostic, Kind};
use crate::recipe::{Pack, RecipeContract, RecipeRegistry};

use super::{AdapterBundle, Capability, CapabilityBundle, LifecycleHook, Plugin, PluginMode, ProviderRegistry};

/// Inputs of one resolution.
#[derive(Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub recipe: &'a str,
    pub registry: &'a RecipeRegistry,
    pub providers: &'a ProviderRegistry,
    pub plugins: &'a [Plugin],
    pub packs: &'a [Pack],
    /// Recipe-level default adapters (handle `defaults()`)
    pub defaults: &'a AdapterBundle,
    /// Call-time adapters; the highest precedence
    pub overrides: &'a AdapterBundle,
    /// Call-time provider selection by id
    pub provider_overrides: &'a BTreeMap<Capability, String>,
}

/// Introspection of a resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explain {
    /// Plugin keys in registration order
    pub plugins: Vec<String>,
    /// Effective capabilities after overrides and adapter resolution
    pub capabilities: CapabilityBundle,
    /// Union of every plugin's raw declaration, including overridden ones
    pub declared: CapabilityBundle,
    /// `"<key> overrides <target>"`
    pub overrides: Vec<String>,
    /// Overridden and duplicate plugin keys
    pub unused: Vec<String>,
    /// `"<key> (requires <capability>)"`
    pub missing: Vec<String>,
}

/// Result of resolving capabilities and adapters for one run.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub capabilities: CapabilityBundle,
    pub adapters: AdapterBundle,
    pub minimum_capabilities: Vec<String>,
    pub hooks: Vec<LifecycleHook>,
    pub diagnostics: Vec<Diagnostic>,
    pub explain: Explain,
}

/// Resolves capabilities and adapters for a recipe.
pub fn resolve(request: ResolveRequest<'_>) -> Resolution {
    let contract = request.registry.contract(request.recipe);
    let mut diagnostics = Vec::new();
    let mut explain = Explain::default();

    // Collect plugins in registration order
    let mut registered: IndexMap<String, Plugin> = IndexMap::new();
    let defaults = contract
        .map(|c| c.default_plugins.as_slice())
        .unwrap_or_default();
    for key in defaults {
        match request.registry.plugin(key) {
            Some(plugin) => register(&mut registered, &mut explain, plugin.clone()),
            None => diagnostics.push(
                Diagnostic::warn(
                    Kind::Recipe,
                    format!("Default plugin '{}' is not registered", key),
                )
                .with_code("recipe.unknownPlugin"),
            ),
        }
    }
    for plugin in request.plugins {
        register(&mut registered, &mut explain, plugin.clone());
    }

    // Overrides
    let mut overridden: BTreeSet<String> = BTreeSet::new();
    for plugin in registered.values() {
        if plugin.mode() != PluginMode::Override {
            continue;
        }
        let Some(target) = plugin.override_key() else {
            continue;
        };
        if target != plugin.key() && registered.contains_key(target) {
            explain
                .overrides
                .push(format!("{} overrides {}", plugin.key(), target));
            if overridden.insert(target.to_string()) {
                explain.unused.push(target.to_string());
            }
        } else {
            diagnostics.push(
                Diagnostic::warn(
                    Kind::Recipe,
                    format!(
                        "Plugin '{}' overrides unknown plugin '{}'",
                        plugin.key(),
                        target
                    ),
                )
                .with_code("recipe.unknownOverrideTarget"),
            );
        }
    }

    let active: Vec<&Plugin> = registered
        .values()
        .filter(|p| !overridden.contains(p.key()))
        .collect();

    for plugin in registered.values() {
        explain.declared.merge(plugin.declared_capabilities());
    }

    // Adapters, lowest precedence first
    let mut adapters = AdapterBundle::new();
    for pack in request.packs {
        adapters.layer(pack.default_adapters());
    }
    adapters.layer(request.defaults);
    for plugin in &active {
        adapters.layer(plugin.adapters());
    }
    adapters.layer(request.overrides);
    for (capability, id) in request.provider_overrides {
        match request.providers.create(*capability, id) {
            Some(handle) => adapters.insert(handle),
            None => diagnostics.push(
                Diagnostic::error(
                    Kind::Adapter,
                    format!("Unknown provider '{}' for capability '{}'", id, capability),
                )
                .with_code("adapter.unknownProvider")
                .with_data(serde_json::json!({ "capability": capability, "provider": id })),
            ),
        }
    }
    for capability in Capability::ALL {
        if !adapters.has(capability) {
            if let Some(handle) = request.providers.builtin_default(capability) {
                debug!("Filled '{}' with builtin provider", capability);
                adapters.insert(handle);
            }
        }
    }

    // Effective capabilities: live adapters, then plugin declarations
    let mut capabilities = adapters.describe();
    for plugin in &active {
        capabilities.merge(plugin.declared_capabilities());
    }

    // Requirements
    let minimum = minimum_capabilities(request.packs, contract);
    for capability in &minimum {
        if !capabilities.is_satisfied(capability) {
            diagnostics.push(Diagnostic::requirement(request.recipe, capability));
            explain
                .missing
                .push(format!("{} (requires {})", request.recipe, capability));
        }
    }
    for plugin in &active {
        for capability in plugin.required() {
            if !capabilities.is_satisfied(capability) {
                diagnostics.push(
                    Diagnostic::warn(
                        Kind::Requirement,
                        format!(
                            "Plugin \"{}\" requires capability \"{}\"",
                            plugin.key(),
                            capability
                        ),
                    )
                    .with_code("requirement.pluginCapability")
                    .with_data(serde_json::json!({ "plugin": plugin.key(), "capability": capability })),
                );
                explain
                    .missing
                    .push(format!("{} (requires {})", plugin.key(), capability));
            }
        }
    }

    // Lifecycle hooks
    let mut hooks = Vec::new();
    for plugin in &active {
        let Some(hook) = plugin.materialize() else {
            continue;
        };
        if contract.map_or(true, |c| c.has_extension_point(&hook.extension_point)) {
            hooks.push(hook);
        } else {
            diagnostics.push(
                Diagnostic::warn(
                    Kind::Recipe,
                    format!(
                        "Plugin '{}' targets unknown extension point '{}'",
                        plugin.key(),
                        hook.extension_point
                    ),
                )
                .with_code("recipe.unknownExtensionPoint"),
            );
        }
    }

    explain.capabilities = capabilities.clone();

    info!(
        "Resolved recipe '{}': {} plugins, {} capabilities, {} missing",
        request.recipe,
        active.len(),
        capabilities.len(),
        explain.missing.len()
    );

    Resolution {
        capabilities,
        adapters,
        minimum_capabilities: minimum,
        hooks,
        diagnostics,
        explain,
    }
}

fn register(registered: &mut IndexMap<String, Plugin>, explain: &mut Explain, plugin: Plugin) {
    let key = plugin.key().to_string();
    if registered.insert(key.clone(), plugin).is_some() {
        debug!("Plugin '{}' registered twice, keeping the later one", key);
        explain.unused.push(key);
    } else {
        explain.plugins.push(key);
    }
}

/// Pack minimums replace the contract's list when any pack declares one.
fn minimum_capabilities(packs: &[Pack], contract: Option<&RecipeContract>) -> Vec<String> {
    let mut declared = false;
    let mut minimum: Vec<String> = Vec::new();
    for pack in packs {
        if let Some(list) = pack.declared_minimum() {
            declared = true;
            for capability in list {
                if !minimum.contains(capability) {
                    minimum.push(capability.clone());
                }
            }
        }
    }
    if declared {
        minimum
    } else {
        contract
            .map(|c| c.minimum_capabilities.clone())
            .unwrap_or_default()
    }
}
