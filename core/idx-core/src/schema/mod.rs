//! Schema model — parsed table definitions and key-path projection.
//!
//! A table schema is a primary-key spec plus an ordered list of secondary
//! index specs. Schemas are parsed once from definition strings
//! ([`parse`]), diffed between versions for migrations ([`diff`]), and
//! immutable after the database opens.

pub mod diff;
pub mod parse;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::key::Key;

pub use diff::{SchemaChange, diff};
pub use parse::{parse_stores, parse_table};

/// Path from a record to an index key: one property, or an ordered
/// property sequence for compound indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    Single(String),
    Compound(SmallVec<[String; 4]>),
}

impl KeyPath {
    /// Project the index key out of a record.
    ///
    /// Returns `None` when any addressed property is missing or not a
    /// valid key — the record is simply absent from that index.
    pub fn project(&self, record: &Value) -> Option<Key> {
        match self {
            KeyPath::Single(prop) => project_path(record, prop),
            KeyPath::Compound(props) => {
                let mut components = Vec::with_capacity(props.len());
                for prop in props {
                    components.push(project_path(record, prop)?);
                }
                Some(Key::Array(components))
            }
        }
    }
}

/// Dotted-path property lookup: `"address.city"` walks nested objects.
pub fn project_path(record: &Value, path: &str) -> Option<Key> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Key::from_value(current).ok()
}

/// One index definition: the primary key or a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name; empty for an outbound primary key
    pub name: String,
    /// Absent for outbound primary keys
    pub key_path: Option<KeyPath>,
    pub is_primary_key: bool,
    pub auto_increment: bool,
    pub unique: bool,
    /// Primary key stored outside the record
    pub outbound: bool,
    pub compound: bool,
}

impl IndexSpec {
    /// Whether two primary-key specs are interchangeable across versions.
    pub fn same_primary_key(&self, other: &IndexSpec) -> bool {
        self.key_path == other.key_path
            && self.auto_increment == other.auto_increment
            && self.outbound == other.outbound
    }
}

/// One table: primary key plus ordered secondary indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: IndexSpec,
    pub indexes: Vec<IndexSpec>,
}

impl TableSchema {
    /// Find a secondary index by name. The primary key is addressed by the
    /// empty string or `":id"`, never through this lookup.
    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|idx| idx.name == name)
    }
}

/// Mapping table name → table schema. Ordered so migration diffs are
/// deterministic.
pub type DatabaseSchema = BTreeMap<String, TableSchema>;
