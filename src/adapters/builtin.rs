//! Builtin Providers
//!
//! In-process adapters that need no external service, and the
//! [`ProviderRegistry`] mapping `(capability, provider id)` to adapter
//! factories. The registry also names the builtin default used to fill a
//! capability nobody else provided.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;

use super::{
    AdapterError, AdapterHandle, Capability, Memory, Message, ScoredRecord, VectorRecord,
    VectorStore,
};

/// Provider id of the builtin in-process adapters.
pub const IN_MEMORY: &str = "in-memory";

/// Conversation memory held in process.
#[derive(Default)]
pub struct InMemoryMemory {
    threads: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Memory for InMemoryMemory {
    fn id(&self) -> &str {
        "memory:in-memory"
    }

    async fn load(&self, thread: &str) -> Result<Vec<Message>, AdapterError> {
        Ok(self.threads.read().get(thread).cloned().unwrap_or_default())
    }

    async fn save(&self, thread: &str, messages: &[Message]) -> Result<(), AdapterError> {
        self.threads
            .write()
            .insert(thread.to_string(), messages.to_vec());
        Ok(())
    }
}

/// Brute-force cosine similarity over vectors held in process.
#[derive(Default)]
pub struct InMemoryVectorStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn id(&self) -> &str {
        "vector_store:in-memory"
    }

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), AdapterError> {
        let mut stored = self.records.write();
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record);
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredRecord>, AdapterError> {
        let mut scored: Vec<ScoredRecord> = self
            .records
            .read()
            .iter()
            .map(|r| ScoredRecord {
                id: r.id.clone(),
                score: cosine(vector, &r.vector),
                metadata: r.metadata.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, AdapterError> {
        let mut stored = self.records.write();
        let before = stored.len();
        stored.retain(|r| !ids.contains(&r.id));
        Ok(before - stored.len())
    }
}

/// Builds one adapter instance.
pub type ProviderFactory = Arc<dyn Fn() -> AdapterHandle + Send + Sync>;

/// Catalog of providers, constructed at startup and passed by reference.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<(Capability, String), ProviderFactory>,
    defaults: BTreeMap<Capability, String>,
}

impl ProviderRegistry {
    /// An empty registry with no builtin defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the in-process memory and vector store registered as
    /// builtin defaults. Each factory hands out the same shared instance.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        let memory: Arc<InMemoryMemory> = Arc::new(InMemoryMemory::new());
        registry.register(Capability::Memory, IN_MEMORY, move || {
            AdapterHandle::Memory(memory.clone())
        });
        registry.set_default(Capability::Memory, IN_MEMORY);

        let vectors: Arc<InMemoryVectorStore> = Arc::new(InMemoryVectorStore::new());
        registry.register(Capability::VectorStore, IN_MEMORY, move || {
            AdapterHandle::VectorStore(vectors.clone())
        });
        registry.set_default(Capability::VectorStore, IN_MEMORY);

        registry
    }

    pub fn register<F>(&mut self, capability: Capability, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> AdapterHandle + Send + Sync + 'static,
    {
        let id = id.into();
        debug!("Registered provider {}:{}", capability, id);
        self.providers.insert((capability, id), Arc::new(factory));
        self
    }

    /// Names the provider used to fill `capability` when nothing else does.
    pub fn set_default(&mut self, capability: Capability, id: impl Into<String>) -> &mut Self {
        self.defaults.insert(capability, id.into());
        self
    }

    pub fn contains(&self, capability: Capability, id: &str) -> bool {
        self.providers.contains_key(&(capability, id.to_string()))
    }

    /// Instantiates a provider. Returns `None` for unknown providers or when
    /// the factory produced an adapter for a different capability.
    pub fn create(&self, capability: Capability, id: &str) -> Option<AdapterHandle> {
        let factory = self.providers.get(&(capability, id.to_string()))?;
        let handle = factory();
        (handle.capability() == capability).then_some(handle)
    }

    pub fn builtin_default(&self, capability: Capability) -> Option<AdapterHandle> {
        let id = self.defaults.get(&capability)?;
        self.create(capability, id)
    }

    pub fn provider_ids(&self, capability: Capability) -> Vec<&str> {
        self.providers
            .keys()
            .filter(|(c, _)| *c == capability)
            .map(|(_, id)| id.as_str())
            .collect()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers: Vec<String> = self
            .providers
            .keys()
            .map(|(c, id)| format!("{}:{}", c, id))
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &providers)
            .field("defaults", &self.defaults)
            .finish()
    }
}
