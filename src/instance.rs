//! Runtime object model: dynamically typed instances of model classes.
//!
//! A [`RootEntry`] owns its resolved instances outright; cross-references
//! never own their target. A reference is either [`RefTarget::Local`]
//! (a containment fragment within the same root entry) or a typed
//! [`RefTarget::Proxy`] carrying only the target's address — proxies are
//! resolved lazily through [`crate::db::Session::resolve`], never eagerly.

use crate::address::{Address, Fragment, FragmentPath};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// A model-typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Timestamp(OffsetDateTime),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// Target of a cross-reference.
#[derive(Debug, Clone, PartialEq)]
pub enum RefTarget {
    /// An object inside the same root entry, located by its fragment.
    Local(Fragment),
    /// An object in another root: class plus address, no ownership.
    Proxy { class: String, address: Address },
}

impl RefTarget {
    pub fn proxy(class: impl Into<String>, address: Address) -> Self {
        RefTarget::Proxy {
            class: class.into(),
            address,
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, RefTarget::Proxy { .. })
    }
}

/// The value held by one feature slot. An absent slot means the feature
/// is unset.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(Value),
    Values(Vec<Value>),
    Child(Box<Instance>),
    Children(Vec<Instance>),
    Ref(RefTarget),
    Refs(Vec<RefTarget>),
}

/// A runtime value of a model class: a map from feature name to slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub class: String,
    pub slots: BTreeMap<String, Slot>,
}

impl Instance {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            slots: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, feature: impl Into<String>, slot: Slot) {
        self.slots.insert(feature.into(), slot);
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, feature: impl Into<String>, slot: Slot) -> Self {
        self.set(feature, slot);
        self
    }

    pub fn unset(&mut self, feature: &str) {
        self.slots.remove(feature);
    }

    pub fn slot(&self, feature: &str) -> Option<&Slot> {
        self.slots.get(feature)
    }

    pub fn value(&self, feature: &str) -> Option<&Value> {
        match self.slots.get(feature) {
            Some(Slot::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn values(&self, feature: &str) -> Option<&[Value]> {
        match self.slots.get(feature) {
            Some(Slot::Values(vs)) => Some(vs),
            _ => None,
        }
    }

    pub fn child(&self, feature: &str) -> Option<&Instance> {
        match self.slots.get(feature) {
            Some(Slot::Child(c)) => Some(c),
            _ => None,
        }
    }

    pub fn children(&self, feature: &str) -> Option<&[Instance]> {
        match self.slots.get(feature) {
            Some(Slot::Children(cs)) => Some(cs),
            _ => None,
        }
    }

    pub fn reference(&self, feature: &str) -> Option<&RefTarget> {
        match self.slots.get(feature) {
            Some(Slot::Ref(r)) => Some(r),
            _ => None,
        }
    }

    pub fn references(&self, feature: &str) -> Option<&[RefTarget]> {
        match self.slots.get(feature) {
            Some(Slot::Refs(rs)) => Some(rs),
            _ => None,
        }
    }

    /// Resolves a containment path against this object's tree.
    pub fn navigate(&self, path: &FragmentPath) -> Option<&Instance> {
        let mut current = self;
        for step in path.steps() {
            current = match (current.slots.get(&step.feature), step.index) {
                (Some(Slot::Child(child)), None) => child,
                (Some(Slot::Children(children)), Some(i)) => children.get(i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn navigate_mut(&mut self, path: &FragmentPath) -> Option<&mut Instance> {
        let mut current = self;
        for step in path.steps() {
            current = match (current.slots.get_mut(&step.feature), step.index) {
                (Some(Slot::Child(child)), None) => child,
                (Some(Slot::Children(children)), Some(i)) => children.get_mut(i)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// An ordered sequence of top-level instances forming one persisted unit.
/// The address is assigned on first successful save and refreshed on each
/// load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RootEntry {
    pub contents: Vec<Instance>,
    pub address: Option<Address>,
}

impl RootEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_instance(instance: Instance) -> Self {
        Self {
            contents: vec![instance],
            address: None,
        }
    }

    pub fn push(&mut self, instance: Instance) {
        self.contents.push(instance);
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Resolves a fragment against this entry's containment trees.
    pub fn resolve(&self, fragment: &Fragment) -> Option<&Instance> {
        self.contents.get(fragment.entry)?.navigate(&fragment.path)
    }
}
