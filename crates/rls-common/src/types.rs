//! Common types for the RLS engine

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

// ============================================================================
// Row Types
// ============================================================================

/// A table row: an ordered mapping of column name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Create an empty row
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build a row from a JSON object
    ///
    /// # Errors
    /// Returns `InvalidQuery` if the value is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidQuery(format!(
                "row must be a JSON object, got {other}"
            ))),
        }
    }

    /// Get a column value
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Set a column value, returning the previous one
    pub fn insert(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(column.into(), value)
    }

    /// Whether the row has a column with this name
    pub fn contains_column(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    /// Column names in row order
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Produce the post-image of this row after applying column changes
    #[must_use]
    pub fn merged(&self, changes: &Row) -> Row {
        let mut next = self.clone();
        for (column, value) in &changes.0 {
            next.0.insert(column.clone(), value.clone());
        }
        next
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// ============================================================================
// Operation Types
// ============================================================================

/// Concrete table operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// SQL keyword for this operation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Select => "SELECT",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Claims Types
// ============================================================================

/// Token claims as produced by the authentication layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Audience
    #[serde(default)]
    pub aud: Option<String>,
    /// Expiration time (as UTC timestamp)
    #[serde(default)]
    pub exp: Option<i64>,
    /// Subject (user ID)
    #[serde(default)]
    pub sub: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Phone
    #[serde(default)]
    pub phone: Option<String>,
    /// Role
    #[serde(default = "default_role")]
    pub role: String,
    /// App metadata
    #[serde(default)]
    pub app_metadata: Value,
    /// User metadata
    #[serde(default)]
    pub user_metadata: Value,
    /// Any additional custom claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_role() -> String {
    "anon".to_string()
}
