//! Read-only reflective metamodel consumed by the persistence engine.
//!
//! A [`Metamodel`] holds the registered [`ModelClass`] definitions and
//! resolves each class once into a cached [`ClassShape`]: the flattened
//! feature list (inherited before declared), the transitive supertype set,
//! the storage class name and the effective abstract flag. The engine only
//! ever reads from this module; definitions are immutable after
//! registration.

use crate::error::{PersistError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Annotation key overriding the derived storage class name.
pub const ANN_STORAGE_CLASS: &str = "storageClass";
/// Annotation key requesting an index on an attribute (`plain`,
/// `fulltext` or `spatial`).
pub const ANN_INDEX_KIND: &str = "indexKind";
/// Annotation key forcing a class (and its subclasses) abstract.
pub const ANN_ABSTRACT: &str = "abstract";
/// Annotation key marking a class's qualified-name feature.
pub const ANN_QNAME: &str = "qname";

/// Value type of an attribute feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Timestamp,
}

/// The closed set of feature kinds the engine dispatches over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Attribute {
        value_type: ValueType,
        #[serde(default)]
        is_id: bool,
    },
    /// Reference whose target is owned and embedded by the referencing
    /// object.
    Containment { target: String },
    /// Inverse side of a containment; never persisted.
    Container { target: String },
    /// Non-containment reference; always represented as a graph edge.
    Reference { target: String },
}

/// An attribute or reference declared on a [`ModelClass`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub kind: FeatureKind,
    #[serde(default)]
    pub many: bool,
    #[serde(default)]
    pub derived: bool,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Feature {
    pub fn attribute(name: impl Into<String>, value_type: ValueType) -> Self {
        Self::new(
            name,
            FeatureKind::Attribute {
                value_type,
                is_id: false,
            },
        )
    }

    pub fn containment(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FeatureKind::Containment {
                target: target.into(),
            },
        )
    }

    pub fn container(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FeatureKind::Container {
                target: target.into(),
            },
        )
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FeatureKind::Reference {
                target: target.into(),
            },
        )
    }

    fn new(name: impl Into<String>, kind: FeatureKind) -> Self {
        Self {
            name: name.into(),
            kind,
            many: false,
            derived: false,
            transient: false,
            annotations: BTreeMap::new(),
        }
    }

    pub fn many(mut self) -> Self {
        self.many = true;
        self
    }

    pub fn derived(mut self) -> Self {
        self.derived = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Marks an attribute as the class identifier. No effect on references.
    pub fn id(mut self) -> Self {
        if let FeatureKind::Attribute { is_id, .. } = &mut self.kind {
            *is_id = true;
        }
        self
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Derived, transient and container features are never persisted.
    pub fn is_persisted(&self) -> bool {
        !self.derived && !self.transient && !matches!(self.kind, FeatureKind::Container { .. })
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self.kind, FeatureKind::Attribute { .. })
    }

    pub fn is_containment(&self) -> bool {
        matches!(self.kind, FeatureKind::Containment { .. })
    }

    pub fn is_cross_reference(&self) -> bool {
        matches!(self.kind, FeatureKind::Reference { .. })
    }

    pub fn is_id(&self) -> bool {
        matches!(self.kind, FeatureKind::Attribute { is_id: true, .. })
    }

    /// Referenced class name for containment/container/reference features.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            FeatureKind::Attribute { .. } => None,
            FeatureKind::Containment { target }
            | FeatureKind::Container { target }
            | FeatureKind::Reference { target } => Some(target),
        }
    }
}

/// A node in the metamodel hierarchy. Immutable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelClass {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub supertypes: Vec<String>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl ModelClass {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            is_abstract: false,
            supertypes: Vec::new(),
            features: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn extends(mut self, supertype: impl Into<String>) -> Self {
        self.supertypes.push(supertype.into());
        self
    }

    pub fn feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Fully resolved view of a class: storage name, transitive supertypes,
/// inherited-then-declared features and the effective abstract flag.
/// Resolved once per class and cached by the [`Metamodel`].
#[derive(Debug)]
pub struct ClassShape {
    pub name: String,
    pub namespace: String,
    pub storage_class: String,
    pub is_abstract: bool,
    /// Transitive supertype names in resolution order.
    pub supertypes: Vec<String>,
    features: Vec<Feature>,
    declared_start: usize,
    // force-abstract annotation, inherited by every subclass
    annotated_abstract: bool,
}

impl ClassShape {
    /// All features, inherited before declared.
    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Features declared on this class itself.
    pub fn declared_features(&self) -> &[Feature] {
        &self.features[self.declared_start..]
    }

    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn id_attribute(&self) -> Option<&Feature> {
        self.features.iter().find(|f| f.is_id())
    }

    /// The qualified-name feature, wherever in the hierarchy it was
    /// declared.
    pub fn qname_feature(&self) -> Option<&Feature> {
        self.features
            .iter()
            .find(|f| f.annotation(ANN_QNAME) == Some("true"))
    }
}

/// The registered set of model classes shared by all persisted instances.
pub struct Metamodel {
    classes: BTreeMap<String, ModelClass>,
    shapes: DashMap<String, Arc<ClassShape>>,
    // storage class name -> model class name, shared with every session
    storage_names: DashMap<String, String>,
}

impl Metamodel {
    pub fn new() -> Self {
        Self {
            classes: BTreeMap::new(),
            shapes: DashMap::new(),
            storage_names: DashMap::new(),
        }
    }

    /// Builds a metamodel from a JSON document of the form
    /// `{"classes": [...]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct MetamodelDoc {
            classes: Vec<ModelClass>,
        }
        let doc: MetamodelDoc = serde_json::from_str(json)
            .map_err(|e| PersistError::InvalidArgument(format!("invalid metamodel document: {e}")))?;
        let mut metamodel = Self::new();
        for class in doc.classes {
            metamodel.register(class)?;
        }
        Ok(metamodel)
    }

    pub fn register(&mut self, class: ModelClass) -> Result<()> {
        if self.classes.contains_key(&class.name) {
            return Err(PersistError::InvalidArgument(format!(
                "class {} is already registered",
                class.name
            )));
        }
        self.classes.insert(class.name.clone(), class);
        Ok(())
    }

    pub fn class(&self, name: &str) -> Option<&ModelClass> {
        self.classes.get(name)
    }

    /// Registered class names in deterministic order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    /// Resolves (and caches) the shape of a class. Unknown names are a
    /// schema error.
    pub fn shape(&self, name: &str) -> Result<Arc<ClassShape>> {
        if let Some(shape) = self.shapes.get(name) {
            return Ok(shape.value().clone());
        }
        let mut visiting = Vec::new();
        let shape = self.resolve(name, &mut visiting)?;
        Ok(shape)
    }

    /// Maps a storage class name back to its model class shape. Unknown
    /// storage classes are fatal: the store holds data this metamodel
    /// cannot describe.
    pub fn shape_by_storage_class(&self, storage_class: &str) -> Result<Arc<ClassShape>> {
        let hit = self
            .storage_names
            .get(storage_class)
            .map(|entry| entry.value().clone());
        if let Some(name) = hit {
            return self.shape(&name);
        }
        // The reverse map fills in as shapes resolve; force-resolve
        // everything once before giving up.
        for name in self.classes.keys() {
            self.shape(name)?;
        }
        let hit = self
            .storage_names
            .get(storage_class)
            .map(|entry| entry.value().clone());
        match hit {
            Some(name) => self.shape(&name),
            None => Err(PersistError::Schema(format!(
                "can't find model class for storage class {storage_class}"
            ))),
        }
    }

    fn resolve(&self, name: &str, visiting: &mut Vec<String>) -> Result<Arc<ClassShape>> {
        if let Some(shape) = self.shapes.get(name) {
            return Ok(shape.value().clone());
        }
        if visiting.iter().any(|n| n == name) {
            return Err(PersistError::Schema(format!(
                "supertype cycle through class {name}"
            )));
        }
        let class = self.classes.get(name).ok_or_else(|| {
            PersistError::Schema(format!("class {name} is not registered"))
        })?;
        visiting.push(name.to_string());

        let mut supertypes = Vec::new();
        let mut features: Vec<Feature> = Vec::new();
        let mut annotated_abstract = class.annotation(ANN_ABSTRACT) == Some("true");
        for super_name in &class.supertypes {
            let super_shape = self.resolve(super_name, visiting)?;
            if super_shape.annotated_abstract {
                annotated_abstract = true;
            }
            for ancestor in std::iter::once(super_name.as_str())
                .chain(super_shape.supertypes.iter().map(String::as_str))
            {
                if !supertypes.iter().any(|s| s == ancestor) {
                    supertypes.push(ancestor.to_string());
                }
            }
            for feature in super_shape.features() {
                if !features.iter().any(|f| f.name == feature.name) {
                    features.push(feature.clone());
                }
            }
        }
        visiting.pop();

        let declared_start = features.len();
        features.extend(class.features.iter().cloned());

        let storage_class = class
            .annotation(ANN_STORAGE_CLASS)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", class.namespace, class.name));

        let shape = Arc::new(ClassShape {
            name: class.name.clone(),
            namespace: class.namespace.clone(),
            storage_class: storage_class.clone(),
            is_abstract: class.is_abstract || annotated_abstract,
            annotated_abstract,
            supertypes,
            features,
            declared_start,
        });
        self.storage_names
            .insert(storage_class, class.name.clone());
        self.shapes.insert(class.name.clone(), shape.clone());
        Ok(shape)
    }
}

impl Default for Metamodel {
    fn default() -> Self {
        Self::new()
    }
}
