//! Order-stable string multimaps for headers and parameters
//!
//! Names are kept sorted so that two multimaps holding the same pairs encode to the
//! same JSON no matter in which order they were filled. Values under one name keep
//! their insertion order, since repeated parameters (`media_ids[]`) are positional.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{JournalError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringValues(BTreeMap<String, Vec<String>>);

impl StringValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `name`, keeping values already present
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// Append every pair of `other` after the values already present
    pub fn append_all(&mut self, other: &StringValues) {
        for (name, value) in other.iter() {
            self.append(name, value);
        }
    }

    /// First value stored under `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(name, value)` pairs, names in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(name, values)| {
            values
                .iter()
                .map(move |value| (name.as_str(), value.as_str()))
        })
    }

    /// Canonical JSON encoding, as stored in the journal and hashed into request IDs
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| JournalError::Encoding(format!("string values: {}", e)).into())
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        serde_json::from_str(encoded)
            .map_err(|e| JournalError::Encoding(format!("string values: {}", e)).into())
    }
}

impl<K, V> FromIterator<(K, V)> for StringValues
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut values = StringValues::new();
        for (name, value) in iter {
            values.append(name, value);
        }
        values
    }
}
