//! Store-facing data model: property values, embedded documents and the
//! vertex/edge records exchanged with a [`crate::store::StoreSession`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type VertexId = u64;
pub type EdgeId = u64;

/// A property value as held by the graph store. Containment sub-objects
/// are embedded as nested [`Document`]s, never as separate vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<PropValue>),
    Doc(Box<Document>),
}

impl PropValue {
    pub fn str(s: impl Into<String>) -> Self {
        PropValue::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// A typed property document: the schema class it instantiates plus its
/// field values. Top-level documents belong to vertices; nested ones are
/// embedded containment sub-objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub class: String,
    pub fields: BTreeMap<String, PropValue>,
}

impl Document {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, field: impl Into<String>, value: PropValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&PropValue> {
        self.fields.get(field)
    }
}

/// One stored vertex. The version counter starts at 1 and the store bumps
/// it by exactly one on each successful document update; reference-edge
/// churn does not touch it.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexRecord {
    pub id: VertexId,
    pub class: String,
    pub version: u64,
    pub doc: Document,
}

/// One stored edge with its properties.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub id: EdgeId,
    pub class: String,
    pub from: VertexId,
    pub to: VertexId,
    pub props: BTreeMap<String, PropValue>,
}
