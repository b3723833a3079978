//! Cache keys and their canonical ids.
//!
//! Plain string keys are used verbatim. Any other serializable key is
//! converted to a `serde_json::Value`, object keys are sorted recursively,
//! and the compact JSON encoding becomes the id. Two keys that differ only
//! in object field order therefore share an entry:
//!
//! ```ignore
//! let a = CacheKey::structured(&json!({ "user": 7, "page": 2 }))?;
//! let b = CacheKey::structured(&json!({ "page": 2, "user": 7 }))?;
//! assert_eq!(a.canonical_id(), b.canonical_id()); // {"page":2,"user":7}
//! ```
//!
//! Array order is significant.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::FlightError;

/// A registry lookup key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    value: Value,
}

impl CacheKey {
    /// Canonicalize any serializable value into a key.
    pub fn structured<T: Serialize + ?Sized>(key: &T) -> Result<Self, FlightError> {
        let value = serde_json::to_value(key)?;
        Ok(Self {
            value: sorted(&value),
        })
    }

    /// The canonical JSON form of the key.
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// The id this key maps to in a registry.
    pub fn canonical_id(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self {
            value: Value::String(key.to_string()),
        }
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self {
            value: Value::String(key),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_id())
    }
}

// Rebuilt rather than relying on serde_json's map ordering, which changes
// when the `preserve_order` feature is enabled anywhere in the build.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                fields
                    .into_iter()
                    .map(|(name, field)| (name.clone(), sorted(field)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
