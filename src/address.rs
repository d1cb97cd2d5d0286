//! Stable addresses for persisted objects.
//!
//! An [`Address`] combines the identities of a root entry's vertices
//! (with the versions captured when they were read) and an optional
//! [`Fragment`] locating a sub-object inside the entry's containment
//! tree. Addresses are opaque strings produced only by this engine; they
//! are not stable across schema-incompatible store migrations.

use crate::error::{PersistError, Result};
use crate::model::VertexId;
use smallvec::SmallVec;
use std::fmt;
use std::str::FromStr;

/// One containment step: the feature name plus the position for
/// many-valued features.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Step {
    pub feature: String,
    pub index: Option<usize>,
}

impl Step {
    pub fn single(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            index: None,
        }
    }

    pub fn at(feature: impl Into<String>, index: usize) -> Self {
        Self {
            feature: feature.into(),
            index: Some(index),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}.{i}", self.feature),
            None => write!(f, "{}", self.feature),
        }
    }
}

/// Containment path of a sub-object relative to its top-level object.
/// Defined purely by containment structure, independent of storage order.
/// The empty path is the top-level object itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FragmentPath(pub SmallVec<[Step; 4]>);

impl FragmentPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    /// Extends this path with one more containment step.
    pub fn child(&self, feature: &str, index: Option<usize>) -> Self {
        let mut steps = self.0.clone();
        steps.push(Step {
            feature: feature.to_string(),
            index,
        });
        Self(steps)
    }
}

impl fmt::Display for FragmentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

impl FromStr for FragmentPath {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        let mut steps = SmallVec::new();
        if s.is_empty() {
            return Ok(Self(steps));
        }
        for segment in s.split('/') {
            if segment.is_empty() {
                return Err(bad_fragment(s));
            }
            let step = match segment.rsplit_once('.') {
                Some((feature, idx)) if !feature.is_empty() => match idx.parse::<usize>() {
                    Ok(index) => Step::at(feature, index),
                    Err(_) => Step::single(segment),
                },
                _ => Step::single(segment),
            };
            steps.push(step);
        }
        Ok(Self(steps))
    }
}

/// A [`FragmentPath`] qualified by the content index within a root entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fragment {
    pub entry: usize,
    pub path: FragmentPath,
}

impl Fragment {
    pub fn entry(entry: usize) -> Self {
        Self {
            entry,
            path: FragmentPath::root(),
        }
    }

    pub fn new(entry: usize, path: FragmentPath) -> Self {
        Self { entry, path }
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.entry)?;
        if !self.path.is_root() {
            write!(f, "/{}", self.path)?;
        }
        Ok(())
    }
}

impl FromStr for Fragment {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix('/').ok_or_else(|| bad_fragment(s))?;
        let (entry, path) = match rest.split_once('/') {
            Some((entry, path)) => (entry, path.parse()?),
            None => (rest, FragmentPath::root()),
        };
        let entry = entry.parse::<usize>().map_err(|_| bad_fragment(s))?;
        Ok(Self { entry, path })
    }
}

fn bad_fragment(s: &str) -> PersistError {
    PersistError::AddressResolution(format!("malformed fragment `{s}`"))
}

/// Globally resolvable object address: root vertex identities with their
/// captured optimistic versions, plus an optional fragment. A version of
/// zero means "not captured"; load and proxy resolution ignore versions,
/// save and delete enforce them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub roots: Vec<(VertexId, u64)>,
    pub fragment: Option<Fragment>,
}

impl Address {
    pub fn for_vertex(id: VertexId, version: u64) -> Self {
        Self {
            roots: vec![(id, version)],
            fragment: None,
        }
    }

    pub fn for_vertices(roots: Vec<(VertexId, u64)>) -> Self {
        Self {
            roots,
            fragment: None,
        }
    }

    pub fn with_fragment(mut self, fragment: Fragment) -> Self {
        self.fragment = Some(fragment);
        self
    }

    /// The same address with versions zeroed; proxy vertices are keyed by
    /// this form so a target's re-save does not duplicate its proxy.
    pub fn normalized(&self) -> Self {
        Self {
            roots: self.roots.iter().map(|&(id, _)| (id, 0)).collect(),
            fragment: self.fragment.clone(),
        }
    }

    /// The root vertex this address points at: the one selected by the
    /// fragment's entry index, or the first one.
    pub fn target_root(&self) -> Result<VertexId> {
        let entry = self.fragment.as_ref().map_or(0, |f| f.entry);
        self.roots
            .get(entry)
            .map(|&(id, _)| id)
            .ok_or_else(|| {
                PersistError::AddressResolution(format!(
                    "address {self} has no root entry {entry}"
                ))
            })
    }

    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mg:")?;
        for (i, (id, version)) in self.roots.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{id}@{version}")?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{fragment}")?;
        }
        Ok(())
    }
}

impl FromStr for Address {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || PersistError::AddressResolution(format!("malformed address `{s}`"));
        let rest = s.strip_prefix("mg:").ok_or_else(bad)?;
        let (roots_part, fragment) = match rest.split_once('#') {
            Some((roots, fragment)) => (roots, Some(fragment.parse()?)),
            None => (rest, None),
        };
        let mut roots = Vec::new();
        for part in roots_part.split(',') {
            let (id, version) = part.split_once('@').ok_or_else(bad)?;
            roots.push((
                id.parse::<VertexId>().map_err(|_| bad())?,
                version.parse::<u64>().map_err(|_| bad())?,
            ));
        }
        if roots.is_empty() {
            return Err(bad());
        }
        Ok(Self { roots, fragment })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_path_round_trips() {
        for text in ["", "shelves.0", "shelves.1/books.3", "featured"] {
            let path: FragmentPath = text.parse().unwrap();
            assert_eq!(path.to_string(), text);
        }
        let path: FragmentPath = "shelves.1/books.3".parse().unwrap();
        assert_eq!(path.steps().len(), 2);
        assert_eq!(path.steps()[1], Step::at("books", 3));
    }

    #[test]
    fn address_round_trips() {
        for text in ["mg:5@3", "mg:5@3,6@1", "mg:5@0#/0", "mg:5@3#/1/roles.0"] {
            let address = Address::parse(text).unwrap();
            assert_eq!(address.to_string(), text);
        }
    }

    #[test]
    fn malformed_addresses_are_resolution_errors() {
        for text in ["", "mg:", "mg:x@1", "5@3", "mg:5", "mg:5@3#roles"] {
            let err = Address::parse(text).unwrap_err();
            assert!(matches!(err, PersistError::AddressResolution(_)), "{text}");
        }
    }

    #[test]
    fn normalized_drops_versions() {
        let address = Address::parse("mg:5@3,6@1#/1").unwrap();
        assert_eq!(address.normalized().to_string(), "mg:5@0,6@0#/1");
        assert_eq!(address.target_root().unwrap(), 6);
    }
}
