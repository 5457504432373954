//! Tree-tagged paths: the vocabulary for targets and sources.
//!
//! A path names a file relative to the base of one of three trees:
//!   foo/bar    relative to the source tree
//!   #/foo/bar  relative to the build tree
//!   @/foo/bar  relative to the output tree
//!
//! Unlike canonicalization, which rewrites "foo/./bar" into "foo/bar", paths
//! here are validated: redundant or parent components are rejected outright.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Tree {
    Source,
    Build,
    Output,
}

impl Tree {
    fn prefix(self) -> &'static str {
        match self {
            Tree::Source => "",
            Tree::Build => "#/",
            Tree::Output => "@/",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("{0:?}: absolute paths are not allowed")]
    Absolute(String),
    #[error("{0:?}: \"..\" components are not allowed")]
    Parent(String),
    #[error("{0:?}: redundant \".\" or empty components are not allowed")]
    Redundant(String),
}

/// A relative path within one tree.  Two paths are equal iff their tree and
/// components are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    tree: Tree,
    rel: String,
}

impl Path {
    pub fn new(tree: Tree, rel: impl Into<String>) -> Result<Self, PathError> {
        let rel = rel.into();
        check_rel(&rel)?;
        Ok(Path { tree, rel })
    }

    pub fn source(rel: impl Into<String>) -> Result<Self, PathError> {
        Path::new(Tree::Source, rel)
    }

    pub fn build(rel: impl Into<String>) -> Result<Self, PathError> {
        Path::new(Tree::Build, rel)
    }

    pub fn output(rel: impl Into<String>) -> Result<Self, PathError> {
        Path::new(Tree::Output, rel)
    }

    pub fn tree(&self) -> Tree {
        self.tree
    }

    /// The path relative to its tree's base, "/"-separated.
    pub fn rel(&self) -> &str {
        &self.rel
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.rel.split('/')
    }
}

fn check_rel(rel: &str) -> Result<(), PathError> {
    if rel.is_empty() {
        return Err(PathError::Empty);
    }
    if rel.starts_with('/') {
        return Err(PathError::Absolute(rel.to_owned()));
    }
    for component in rel.split('/') {
        match component {
            ".." => return Err(PathError::Parent(rel.to_owned())),
            "." | "" => return Err(PathError::Redundant(rel.to_owned())),
            _ => {}
        }
    }
    Ok(())
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rel) = s.strip_prefix("#/") {
            Path::build(rel)
        } else if let Some(rel) = s.strip_prefix("@/") {
            Path::output(rel)
        } else {
            Path::source(s)
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.tree.prefix(), self.rel)
    }
}

impl serde::Serialize for Path {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Path {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where each tree lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub source: std::path::PathBuf,
    pub build: std::path::PathBuf,
    pub output: std::path::PathBuf,
}

impl Layout {
    /// The conventional layout: sources at `root`, build tree at `root/build`
    /// and output tree at `root/out`.
    pub fn rooted(root: impl Into<std::path::PathBuf>) -> Self {
        let root = root.into();
        Layout {
            build: root.join("build"),
            output: root.join("out"),
            source: root,
        }
    }

    pub fn dir(&self, tree: Tree) -> &std::path::Path {
        match tree {
            Tree::Source => &self.source,
            Tree::Build => &self.build,
            Tree::Output => &self.output,
        }
    }

    pub fn resolve(&self, path: &Path) -> std::path::PathBuf {
        let mut out = self.dir(path.tree).to_path_buf();
        out.extend(path.components());
        out
    }
}
