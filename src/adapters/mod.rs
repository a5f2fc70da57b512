//! Capabilities and Adapters
//!
//! A capability is a named role (`"model"`, `"tools"`, ...) that an adapter
//! fulfils. Each built-in role is an explicit trait with a fixed method set;
//! a role that nobody provides is simply absent from the resolved
//! [`AdapterBundle`], which is decided once during resolution.
//!
//! # Structure
//!
//! - [`builtin`]: in-process default providers and the [`ProviderRegistry`]
//! - [`plugin`]: plugins contributing capabilities, adapters and hooks
//! - [`resolver`]: merging plugins into one resolution, plus `explain()`

pub mod builtin;
pub mod plugin;
pub mod resolver;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use builtin::{InMemoryMemory, InMemoryVectorStore, ProviderRegistry};
pub use plugin::{LifecycleHook, Plugin, PluginDescriptor, PluginMode};
pub use resolver::{resolve, Explain, Resolution, ResolveRequest};

/// Failure reported by an adapter.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Adapter roles known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Model,
    Embedder,
    Retriever,
    VectorStore,
    Memory,
    Tools,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Model,
        Capability::Embedder,
        Capability::Retriever,
        Capability::VectorStore,
        Capability::Memory,
        Capability::Tools,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Model => "model",
            Capability::Embedder => "embedder",
            Capability::Retriever => "retriever",
            Capability::VectorStore => "vector_store",
            Capability::Memory => "memory",
            Capability::Tools => "tools",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Value,
}

/// Text generation.
#[async_trait]
pub trait Model: Send + Sync {
    /// Provider-qualified identifier, e.g. `openai:gpt-4o-mini`
    fn id(&self) -> &str;

    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, AdapterError>;
}

/// Text to vector embedding.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn id(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AdapterError>;
}

/// Document retrieval for a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn id(&self) -> &str;

    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<Document>, AdapterError>;
}

/// Vector persistence and similarity search.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn id(&self) -> &str;

    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), AdapterError>;

    async fn query(&self, vector: &[f32], limit: usize) -> Result<Vec<ScoredRecord>, AdapterError>;

    async fn delete(&self, ids: &[String]) -> Result<usize, AdapterError>;
}

/// Conversation memory keyed by thread.
#[async_trait]
pub trait Memory: Send + Sync {
    fn id(&self) -> &str;

    async fn load(&self, thread: &str) -> Result<Vec<Message>, AdapterError>;

    async fn save(&self, thread: &str, messages: &[Message]) -> Result<(), AdapterError>;
}

/// One callable tool. The `tools` capability is multi-valued.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn call(&self, arguments: Value) -> Result<Value, AdapterError>;
}

/// One adapter instance tagged with the capability it fulfils.
#[derive(Clone)]
pub enum AdapterHandle {
    Model(Arc<dyn Model>),
    Embedder(Arc<dyn Embedder>),
    Retriever(Arc<dyn Retriever>),
    VectorStore(Arc<dyn VectorStore>),
    Memory(Arc<dyn Memory>),
    Tool(Arc<dyn Tool>),
}

impl AdapterHandle {
    pub fn capability(&self) -> Capability {
        match self {
            AdapterHandle::Model(_) => Capability::Model,
            AdapterHandle::Embedder(_) => Capability::Embedder,
            AdapterHandle::Retriever(_) => Capability::Retriever,
            AdapterHandle::VectorStore(_) => Capability::VectorStore,
            AdapterHandle::Memory(_) => Capability::Memory,
            AdapterHandle::Tool(_) => Capability::Tools,
        }
    }
}

/// Live adapter instances for one run.
///
/// Read-only while a run executes.
#[derive(Clone, Default)]
pub struct AdapterBundle {
    pub model: Option<Arc<dyn Model>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub retriever: Option<Arc<dyn Retriever>>,
    pub vector_store: Option<Arc<dyn VectorStore>>,
    pub memory: Option<Arc<dyn Memory>>,
    pub tools: Vec<Arc<dyn Tool>>,
}

impl AdapterBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handle: AdapterHandle) -> Self {
        self.insert(handle);
        self
    }

    /// Inserts an adapter, replacing the slot. Tools replace by name.
    pub fn insert(&mut self, handle: AdapterHandle) {
        match handle {
            AdapterHandle::Model(a) => self.model = Some(a),
            AdapterHandle::Embedder(a) => self.embedder = Some(a),
            AdapterHandle::Retriever(a) => self.retriever = Some(a),
            AdapterHandle::VectorStore(a) => self.vector_store = Some(a),
            AdapterHandle::Memory(a) => self.memory = Some(a),
            AdapterHandle::Tool(tool) => {
                self.tools.retain(|t| t.name() != tool.name());
                self.tools.push(tool);
            }
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Model => self.model.is_some(),
            Capability::Embedder => self.embedder.is_some(),
            Capability::Retriever => self.retriever.is_some(),
            Capability::VectorStore => self.vector_store.is_some(),
            Capability::Memory => self.memory.is_some(),
            Capability::Tools => !self.tools.is_empty(),
        }
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.has(*c))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities().is_empty()
    }

    /// Layers `top` over `self`: every slot `top` fills wins, tools merge by
    /// name with `top` winning.
    pub fn layer(&mut self, top: &AdapterBundle) {
        if let Some(a) = &top.model {
            self.model = Some(Arc::clone(a));
        }
        if let Some(a) = &top.embedder {
            self.embedder = Some(Arc::clone(a));
        }
        if let Some(a) = &top.retriever {
            self.retriever = Some(Arc::clone(a));
        }
        if let Some(a) = &top.vector_store {
            self.vector_store = Some(Arc::clone(a));
        }
        if let Some(a) = &top.memory {
            self.memory = Some(Arc::clone(a));
        }
        for tool in &top.tools {
            self.insert(AdapterHandle::Tool(Arc::clone(tool)));
        }
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Describes the bundle as capability descriptors.
    pub fn describe(&self) -> CapabilityBundle {
        let mut bundle = CapabilityBundle::new();
        if let Some(a) = &self.model {
            bundle.insert(Capability::Model.as_str(), Value::from(a.id()));
        }
        if let Some(a) = &self.embedder {
            bundle.insert(Capability::Embedder.as_str(), Value::from(a.id()));
        }
        if let Some(a) = &self.retriever {
            bundle.insert(Capability::Retriever.as_str(), Value::from(a.id()));
        }
        if let Some(a) = &self.vector_store {
            bundle.insert(Capability::VectorStore.as_str(), Value::from(a.id()));
        }
        if let Some(a) = &self.memory {
            bundle.insert(Capability::Memory.as_str(), Value::from(a.id()));
        }
        if !self.tools.is_empty() {
            let names: Vec<Value> = self.tools.iter().map(|t| Value::from(t.name())).collect();
            bundle.insert(Capability::Tools.as_str(), Value::Array(names));
        }
        bundle
    }
}

impl fmt::Debug for AdapterBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterBundle")
            .field("capabilities", &self.describe())
            .finish()
    }
}

/// Named capability descriptors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityBundle {
    entries: BTreeMap<String, Value>,
}

impl CapabilityBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A capability is satisfied when present and non-empty.
    pub fn is_satisfied(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|v| !is_empty_value(v))
    }

    /// Additive union: arrays concatenate without duplicates, objects merge
    /// key by key, any other value is replaced by `other`'s.
    pub fn merge(&mut self, other: &CapabilityBundle) {
        for (name, value) in &other.entries {
            match self.entries.get_mut(name) {
                Some(existing) => merge_value(existing, value),
                None => {
                    self.entries.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

fn merge_value(existing: &mut Value, incoming: &Value) {
    match (existing, incoming) {
        (Value::Array(current), Value::Array(more)) => {
            for item in more {
                if !current.contains(item) {
                    current.push(item.clone());
                }
            }
        }
        (Value::Object(current), Value::Object(more)) => {
            for (k, v) in more {
                current.insert(k.clone(), v.clone());
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

pub(crate) fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    }
}
