//! Tag table: the named, typed data points exposed by the field device.
//!
//! Tags are loaded once at startup from configuration and are immutable for
//! the process lifetime; only their current values (held in
//! [`crate::MachineSnapshot`]) change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Data type of a tag as declared in the tag table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagDataType {
    /// Boolean flag
    Boolean,
    /// Signed integer
    Integer,
    /// Floating point
    Float,
    /// UTF-8 string
    Text,
}

/// A named point of data on the field device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    /// Logical, stable identifier
    pub name: String,
    /// Protocol-specific locator, opaque to the bridge
    pub address: String,
    /// Declared data type
    pub data_type: TagDataType,
    /// Whether the tag is change-subscribed
    #[serde(default)]
    pub monitored: bool,
    /// Whether value changes are mirrored to the message bus
    #[serde(default)]
    pub published: bool,
    /// Engineering unit, if any
    #[serde(default)]
    pub unit: Option<String>,
}

/// A typed tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Boolean flag
    Boolean(bool),
    /// Signed integer
    Integer(i64),
    /// Floating point
    Float(f64),
    /// UTF-8 string
    Text(String),
}

impl TagValue {
    /// The data type this value carries.
    #[must_use]
    pub fn data_type(&self) -> TagDataType {
        match self {
            Self::Boolean(_) => TagDataType::Boolean,
            Self::Integer(_) => TagDataType::Integer,
            Self::Float(_) => TagDataType::Float,
            Self::Text(_) => TagDataType::Text,
        }
    }

    /// Whether this value is assignable to a tag of the given type.
    ///
    /// Integers are accepted for float tags; everything else must match
    /// exactly.
    #[must_use]
    pub fn assignable_to(&self, data_type: TagDataType) -> bool {
        self.data_type() == data_type
            || (data_type == TagDataType::Float && self.data_type() == TagDataType::Integer)
    }

    /// Boolean view of the value, if it is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of the value, if it is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// String view of the value, if it is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Errors raised while building a tag table.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TagTableError {
    /// Two tags share the same logical name
    #[error("duplicate tag name: {0}")]
    DuplicateName(String),
    /// Two tags share the same address
    #[error("duplicate tag address: {0} (tag {1})")]
    DuplicateAddress(String, String),
}

/// Immutable lookup table over the configured tags.
#[derive(Debug, Clone, Default)]
pub struct TagTable {
    by_name: HashMap<String, Tag>,
    name_by_address: HashMap<String, String>,
}

impl TagTable {
    /// Build a table from configured tags.
    ///
    /// # Errors
    ///
    /// Returns an error if two tags share a name or an address.
    pub fn new(tags: Vec<Tag>) -> Result<Self, TagTableError> {
        let mut by_name = HashMap::new();
        let mut name_by_address = HashMap::new();

        for tag in tags {
            if let Some(previous) = name_by_address.insert(tag.address.clone(), tag.name.clone()) {
                return Err(TagTableError::DuplicateAddress(tag.address, previous));
            }
            let name = tag.name.clone();
            if by_name.insert(name.clone(), tag).is_some() {
                return Err(TagTableError::DuplicateName(name));
            }
        }

        Ok(Self {
            by_name,
            name_by_address,
        })
    }

    /// Look up a tag by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tag> {
        self.by_name.get(name)
    }

    /// Resolve a protocol address back to the logical tag name.
    #[must_use]
    pub fn name_for_address(&self, address: &str) -> Option<&str> {
        self.name_by_address.get(address).map(String::as_str)
    }

    /// All tags with `monitored = true`.
    pub fn monitored(&self) -> impl Iterator<Item = &Tag> {
        self.by_name.values().filter(|t| t.monitored)
    }

    /// Number of configured tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the table holds no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Iterate over all tags.
    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.by_name.values()
    }
}
