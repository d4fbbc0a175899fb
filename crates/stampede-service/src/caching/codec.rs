//! Serialization of computation results to and from the store's byte representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The result of a computation: a mapping from field name to value.
///
/// This is exactly what gets persisted as the cache entry, and what the subset extractor
/// selects fields from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComputationResult(BTreeMap<String, Value>);

impl ComputationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, replacing any previous value under the same name.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts the whole result into a JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.0.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for ComputationResult {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self(fields)
    }
}

impl FromIterator<(String, Value)> for ComputationResult {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl TryFrom<Value> for ComputationResult {
    type Error = CorruptEntry;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value).map_err(CorruptEntry)
    }
}

/// The bytes of a cache entry do not form a valid [`ComputationResult`].
///
/// The coordinator treats this like a cache miss and recomputes the entry.
#[derive(Debug, Error)]
#[error("corrupt cache entry: {0}")]
pub struct CorruptEntry(#[source] serde_json::Error);

/// Serializes a result into the bytes stored in the cache.
pub fn encode(result: &ComputationResult) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(result)
}

/// Parses the bytes of a cache entry.
///
/// Anything that is not a JSON object, including truncated or empty payloads, is rejected.
pub fn decode(bytes: &[u8]) -> Result<ComputationResult, CorruptEntry> {
    serde_json::from_slice(bytes).map_err(CorruptEntry)
}
