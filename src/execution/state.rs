//! Working State
//!
//! The scratch space shared by the steps of one run. State is split into
//! namespaces (`"agent"`, `"ingest.chunks"`, ...) that are materialized the
//! first time a step writes them. Typed access goes through [`Slot`]s so a
//! recipe declares each namespace once together with its Rust type.
//!
//! ```
//! use recipeflow::execution::{Slot, WorkingState};
//!
//! const ANSWER: Slot<String> = Slot::new("answer");
//!
//! let mut state = WorkingState::new();
//! state.write(&ANSWER, &"42".to_string()).unwrap();
//! assert_eq!(state.read(&ANSWER).unwrap(), Some("42".to_string()));
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A typed handle on one namespace of [`WorkingState`].
#[derive(Debug)]
pub struct Slot<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> Slot<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Slot<T> {}

/// Namespaced state owned by exactly one run.
///
/// Cloning produces an independent copy; the executor never hands out shared
/// references across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkingState {
    namespaces: BTreeMap<String, Value>,
}

impl WorkingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a namespace through its slot. Absent namespaces read as `None`.
    pub fn read<T: DeserializeOwned>(&self, slot: &Slot<T>) -> Result<Option<T>, serde_json::Error> {
        self.namespaces
            .get(slot.name)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    /// Writes a namespace through its slot, replacing any previous value.
    pub fn write<T: Serialize>(&mut self, slot: &Slot<T>, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.namespaces.insert(slot.name.to_string(), value);
        Ok(())
    }

    /// Raw access to a namespace.
    pub fn get(&self, namespace: &str) -> Option<&Value> {
        self.namespaces.get(namespace)
    }

    pub fn set(&mut self, namespace: impl Into<String>, value: Value) {
        self.namespaces.insert(namespace.into(), value);
    }

    pub fn remove(&mut self, namespace: &str) -> Option<Value> {
        self.namespaces.remove(namespace)
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Iterates namespaces under a prefix, e.g. `"ingest."`.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.namespaces
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Applies a patch produced by a step.
    pub fn apply(&mut self, patch: StatePatch) {
        for (namespace, value) in patch.entries {
            match value {
                Some(value) => self.set(namespace, value),
                None => {
                    self.remove(&namespace);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// The whole state as one JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.namespaces
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// An ordered set of namespace writes (`Some`) and removals (`None`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    entries: Vec<(String, Option<Value>)>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, namespace: impl Into<String>, value: Value) -> Self {
        self.entries.push((namespace.into(), Some(value)));
        self
    }

    pub fn write<T: Serialize>(self, slot: &Slot<T>, value: &T) -> Result<Self, serde_json::Error> {
        Ok(self.set(slot.name(), serde_json::to_value(value)?))
    }

    pub fn remove(mut self, namespace: impl Into<String>) -> Self {
        self.entries.push((namespace.into(), None));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
