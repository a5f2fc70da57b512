//! Engine Runtime
//!
//! The objects every build, run and resume needs, constructed once at
//! process start and passed by reference: the recipe registry, the provider
//! registry, the session store and the engine configuration.

use std::sync::Arc;

use log::info;

use crate::adapters::ProviderRegistry;
use crate::config::{EngineConfig, SessionStoreKind};
use crate::error::{EngineError, Result};
use crate::recipe::RecipeRegistry;
use crate::session::{FileSessionStore, InMemorySessionStore, PauseManager, SessionStore};

#[derive(Clone)]
pub struct Runtime {
    registry: Arc<RecipeRegistry>,
    providers: Arc<ProviderRegistry>,
    store: Arc<dyn SessionStore>,
    config: EngineConfig,
}

impl Runtime {
    /// Builds a runtime with the standard contracts, the builtin providers
    /// and the session store named by `config`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn SessionStore> = match config.session_store.kind {
            SessionStoreKind::Memory => Arc::new(InMemorySessionStore::new()),
            SessionStoreKind::File => {
                let dir = config.session_store.dir.clone().ok_or_else(|| {
                    EngineError::Config("file session store needs a directory".to_string())
                })?;
                Arc::new(FileSessionStore::open(dir)?)
            }
        };
        info!(
            "Runtime ready: {:?} session store, {:?} diagnostics",
            config.session_store.kind, config.diagnostics
        );
        Ok(Self {
            registry: Arc::new(RecipeRegistry::standard()),
            providers: Arc::new(ProviderRegistry::with_builtins()),
            store,
            config,
        })
    }

    pub fn with_registry(mut self, registry: RecipeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Arc::new(providers);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn registry(&self) -> &RecipeRegistry {
        &self.registry
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pauses(&self) -> PauseManager {
        PauseManager::new(
            Arc::clone(&self.store),
            self.config.pause_ttl(),
            self.config.rollback_scope,
        )
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            registry: Arc::new(RecipeRegistry::standard()),
            providers: Arc::new(ProviderRegistry::with_builtins()),
            store: Arc::new(InMemorySessionStore::new()),
            config: EngineConfig::default(),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("recipes", &self.registry.names().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}
