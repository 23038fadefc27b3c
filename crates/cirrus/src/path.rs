// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Hierarchical paths and deterministic resource ids.
//!
//! A [`Path`] identifies a fiber (or a declared node) by the ordered
//! sequence of segments from the root. Paths are the identity used to match
//! fibers across renders and nodes across runs, so segment derivation must
//! be deterministic: `(type name, explicit key or sibling index among the
//! same type)`. A [`NodeId`] is a pure function of a path and nothing else.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Distinguishes same-named siblings: an explicit author-supplied key, or
/// the positional index among siblings of the same type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Discriminator {
    /// Author-supplied stable key.
    Key(String),
    /// Positional index among same-type siblings; `0` for the first.
    Index(u32),
}

/// One step of a [`Path`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment {
    /// Component display name or construct type name.
    pub name: String,
    /// Sibling disambiguation.
    pub discriminator: Discriminator,
}

impl Segment {
    /// Segment for the first (or only) unkeyed occurrence of `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            discriminator: Discriminator::Index(0),
        }
    }

    /// Segment with an explicit key.
    pub fn keyed(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            discriminator: Discriminator::Key(key.into()),
        }
    }

    /// Segment with a sibling index.
    pub fn indexed(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            discriminator: Discriminator::Index(index),
        }
    }

    /// Token used inside node ids: `name`, `name-2`, or `name-key`.
    fn id_token(&self) -> String {
        match &self.discriminator {
            Discriminator::Index(0) => sanitize(&self.name),
            Discriminator::Index(i) => format!("{}-{i}", sanitize(&self.name)),
            Discriminator::Key(key) => format!("{}-{}", sanitize(&self.name), sanitize(key)),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.discriminator {
            Discriminator::Index(0) => write!(f, "{}", self.name),
            Discriminator::Index(i) => write!(f, "{}@{i}", self.name),
            Discriminator::Key(key) => write!(f, "{}[{key}]", self.name),
        }
    }
}

/// Ordered sequence of segments from the root.
///
/// Ordering is lexicographic over segments, which places every path before
/// any path it is a prefix of; sorting a set of paths therefore yields
/// parents before children.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    /// The empty root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Extend this path by one segment.
    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }

    /// The segments of this path, root first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Parent path, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            None
        } else {
            Some(Self {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            })
        }
    }

    /// Whether `self` is a strict prefix of `other`.
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.segments.len() < other.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "<root>");
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// Deterministic resource identifier derived from a node's path.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Derive the id for a node at `path`. Pure: equal paths always yield
    /// equal ids, across renders and across runs.
    pub fn from_path(path: &Path) -> Self {
        let tokens: Vec<String> = path.segments().iter().map(Segment::id_token).collect();
        Self(tokens.join("."))
    }

    /// Construct an id from a raw string, e.g. when loading persisted state
    /// or applying a migration map.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Restrict id tokens to `[A-Za-z0-9_-]`; anything else becomes `-`.
fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn app_db_path() -> Path {
        Path::root()
            .child(Segment::named("App"))
            .child(Segment::keyed("Database", "primary"))
    }

    #[test]
    fn display_round_trips_structure() {
        let path = app_db_path().child(Segment::indexed("Bucket", 2));
        assert_eq!(path.to_string(), "App/Database[primary]/Bucket@2");
        assert_eq!(Path::root().to_string(), "<root>");
    }

    #[test]
    fn node_id_is_pure_function_of_path() {
        let a = NodeId::from_path(&app_db_path());
        let b = NodeId::from_path(&app_db_path());
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "App.Database-primary");
    }

    #[test]
    fn sibling_indexes_produce_distinct_ids() {
        let first = NodeId::from_path(&Path::root().child(Segment::indexed("Bucket", 0)));
        let second = NodeId::from_path(&Path::root().child(Segment::indexed("Bucket", 1)));
        assert_ne!(first, second);
        assert_eq!(first.as_str(), "Bucket");
        assert_eq!(second.as_str(), "Bucket-1");
    }

    #[test]
    fn prefix_and_parent() {
        let parent = app_db_path();
        let child = parent.child(Segment::named("Replica"));
        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
        assert!(!parent.is_prefix_of(&parent));
        assert_eq!(child.parent(), Some(parent));
        assert_eq!(Path::root().parent(), None);
    }

    #[test]
    fn sorting_paths_places_parents_first() {
        let parent = app_db_path();
        let child = parent.child(Segment::named("Replica"));
        let sibling = Path::root().child(Segment::named("Api"));
        let mut paths = vec![child.clone(), parent.clone(), sibling.clone()];
        paths.sort();
        assert_eq!(paths, vec![sibling, parent, child]);
    }

    proptest! {
        #[test]
        fn ids_contain_only_safe_characters(name in ".{0,24}", key in ".{0,24}") {
            let path = Path::root().child(Segment::keyed(name, key));
            let id = NodeId::from_path(&path);
            prop_assert!(id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'));
        }

        #[test]
        fn equal_paths_yield_equal_ids(name in "[A-Za-z]{1,12}", idx in 0u32..8) {
            let a = Path::root().child(Segment::indexed(name.clone(), idx));
            let b = Path::root().child(Segment::indexed(name, idx));
            prop_assert_eq!(NodeId::from_path(&a), NodeId::from_path(&b));
        }
    }
}
