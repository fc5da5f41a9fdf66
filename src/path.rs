// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

/// A single step across a tree or DAG of Ipld: either a key in a map or an
/// index in a list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    /// Key in a map
    String(String),
    /// Index in a list
    Int(usize),
}

impl PathSegment {
    /// Returns the index, or the conversion from string to index. `None` if
    /// the segment is a string that does not parse as an index.
    pub fn to_index(&self) -> Option<usize> {
        match self {
            PathSegment::String(s) => s.parse().ok(),
            PathSegment::Int(i) => Some(*i),
        }
    }
}

impl From<usize> for PathSegment {
    fn from(i: usize) -> Self {
        Self::Int(i)
    }
}

impl From<String> for PathSegment {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for PathSegment {
    fn from(s: &str) -> Self {
        // Int and String segments are handled the same in traversals
        match s.parse::<usize>() {
            Ok(u) => PathSegment::Int(u),
            Err(_) => PathSegment::String(s.to_owned()),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathSegment::String(s) => write!(f, "{}", s),
            PathSegment::Int(i) => write!(f, "{}", i),
        }
    }
}

/// A series of steps across a tree or DAG of Ipld, used to describe the
/// position of a node relative to the traversal root.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Returns the segments of the path.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Pushes a segment to the end of the path.
    pub fn push(&mut self, seg: PathSegment) {
        self.segments.push(seg)
    }

    /// Returns a new path with the given segment appended.
    pub fn child(&self, seg: PathSegment) -> Path {
        let mut segments = self.segments.clone();
        segments.push(seg);
        Path { segments }
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        let segments = s
            .split('/')
            .filter(|s| !s.is_empty())
            .map(PathSegment::from)
            .collect();
        Self { segments }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.segments.is_empty() {
            return Ok(());
        }
        write!(f, "{}", self.segments[0])?;
        for seg in &self.segments[1..] {
            write!(f, "/{}", seg)?;
        }
        Ok(())
    }
}
