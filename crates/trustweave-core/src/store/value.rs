//! Values held by replicated stores

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Address, Fingerprint, StoreRef, StoreShape};

/// A value stored under a key or in a collection entry
///
/// References to other stores are a distinct variant rather than strings that
/// happen to look like addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Value {
    /// Explicit absence
    Null,
    /// Boolean flag
    Bool(bool),
    /// Numeric value
    Number(f64),
    /// Opaque text
    Text(String),
    /// Cross-reference to another store
    Ref(StoreRef),
    /// Ordered list of values
    List(Vec<Value>),
    /// Nested object
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Text content, if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric content, if this is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content, if this is a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Store reference, if this is a direct reference
    pub fn as_store_ref(&self) -> Option<&StoreRef> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Field of a nested object
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Every store reference contained in this value, in document order
    ///
    /// Descends into lists and nested objects.
    pub fn references(&self) -> Vec<StoreRef> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut Vec<StoreRef>) {
        match self {
            Value::Ref(r) => out.push(*r),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Value::Map(map) => map.values().for_each(|v| v.collect_references(out)),
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::Text(_) => {}
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<StoreRef> for Value {
    fn from(r: StoreRef) -> Self {
        Value::Ref(r)
    }
}

/// An entry of a collection store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry identifier assigned on append (sorts in append order)
    pub id: String,
    /// The appended value
    pub value: Value,
}

/// Materialized content of a store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreData {
    /// Key/value map content
    KeyValue(BTreeMap<String, Value>),
    /// Live (non-tombstoned) collection entries in append order
    Collection(Vec<Entry>),
}

impl StoreData {
    /// Empty content for a shape
    pub fn empty(shape: StoreShape) -> Self {
        match shape {
            StoreShape::KeyValue => StoreData::KeyValue(BTreeMap::new()),
            StoreShape::Collection => StoreData::Collection(Vec::new()),
        }
    }

    /// Value under a key (key/value stores only)
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            StoreData::KeyValue(map) => map.get(key),
            StoreData::Collection(_) => None,
        }
    }

    /// All values: map values in key order, or entry values in append order
    pub fn values(&self) -> Vec<&Value> {
        match self {
            StoreData::KeyValue(map) => map.values().collect(),
            StoreData::Collection(entries) => entries.iter().map(|e| &e.value).collect(),
        }
    }

    /// Every store reference found anywhere in the content
    pub fn references(&self) -> Vec<StoreRef> {
        self.values()
            .into_iter()
            .flat_map(|v| v.references())
            .collect()
    }

    /// Number of keys or live entries
    pub fn len(&self) -> usize {
        match self {
            StoreData::KeyValue(map) => map.len(),
            StoreData::Collection(entries) => entries.len(),
        }
    }

    /// Whether the store holds no keys or live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Point-in-time read of a store
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Address the snapshot was read from
    pub address: Address,
    /// Shape of the store
    pub shape: StoreShape,
    /// Materialized content
    pub data: StoreData,
    /// Fingerprint of the replica heads this content was read at
    pub heads: Fingerprint,
}

impl Snapshot {
    /// The typed reference to the store this snapshot came from
    pub fn store_ref(&self) -> StoreRef {
        StoreRef {
            address: self.address,
            shape: self.shape,
        }
    }
}

/// A mutation of a store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Set a key (key/value stores), last write wins
    Put {
        /// Key to set
        key: String,
        /// New value
        value: Value,
    },
    /// Remove a key (key/value stores)
    Delete {
        /// Key to remove
        key: String,
    },
    /// Append an entry (collections)
    Append {
        /// Value to append
        value: Value,
    },
    /// Tombstone an entry (collections)
    Remove {
        /// Entry id returned by the append
        id: String,
    },
}

impl StoreOp {
    /// Shape of store this operation applies to
    pub fn shape(&self) -> StoreShape {
        match self {
            StoreOp::Put { .. } | StoreOp::Delete { .. } => StoreShape::KeyValue,
            StoreOp::Append { .. } | StoreOp::Remove { .. } => StoreShape::Collection,
        }
    }

    /// Convenience constructor for [`StoreOp::Put`]
    pub fn put(key: impl Into<String>, value: impl Into<Value>) -> Self {
        StoreOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Convenience constructor for [`StoreOp::Append`]
    pub fn append(value: impl Into<Value>) -> Self {
        StoreOp::Append {
            value: value.into(),
        }
    }
}
