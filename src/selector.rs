// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::path::PathSegment;
use crate::Ipld;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use Selector::*;

/// Selectors are expressions that identify and select a subset of data from
/// an IPLD DAG. Selectors are themselves IPLD and are serialized with the
/// field names the selector specification assigns them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Selector {
    /// Matcher marks the current node to be included in the result set.
    /// It is a terminal selector: exploration stops here.
    #[serde(rename = ".", with = "empty_map")]
    Matcher,

    /// ExploreAll traverses every element of a list or every entry of a map
    /// and applies the next selector to the reached nodes.
    #[serde(rename = "a")]
    ExploreAll {
        #[serde(rename = ">")]
        next: Box<Selector>,
    },

    /// ExploreFields traverses named fields of a map and applies the
    /// corresponding selector to each reached node. Field insertion order is
    /// maintained and traversed in that order.
    #[serde(rename = "f")]
    ExploreFields {
        #[serde(rename = "f>")]
        fields: IndexMap<String, Selector>,
    },

    /// ExploreIndex traverses a single index of a list and applies the next
    /// selector to the reached node.
    #[serde(rename = "i")]
    ExploreIndex {
        #[serde(rename = "i")]
        index: usize,
        #[serde(rename = ">")]
        next: Box<Selector>,
    },

    /// ExploreRecursive traverses a structure recursively: the sequence
    /// selector is applied at each level, and wherever evaluation reaches an
    /// ExploreRecursiveEdge the whole ExploreRecursive restarts there with a
    /// decremented depth limit.
    #[serde(rename = "R")]
    ExploreRecursive {
        #[serde(rename = ":>")]
        sequence: Box<Selector>,
        #[serde(rename = "l")]
        limit: RecursionLimit,
        /// Selector produced by exploration of the sequence so far, used to
        /// track position between recursion restarts.
        #[serde(skip_deserializing)]
        current: Option<Box<Selector>>,
    },

    /// ExploreRecursiveEdge marks the point in a recursion sequence where
    /// evaluation returns to the enclosing ExploreRecursive. It is invalid
    /// outside one.
    #[serde(rename = "@", with = "empty_map")]
    ExploreRecursiveEdge,

    /// ExploreUnion continues exploration with several selectors at once
    /// over the same tree of data.
    #[serde(rename = "|")]
    ExploreUnion(Vec<Selector>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Copy)]
pub enum RecursionLimit {
    /// No depth bound; the shape of the data bounds the traversal.
    #[serde(rename = "none", with = "empty_map")]
    None,
    /// Bounded to the given number of levels.
    #[serde(rename = "depth")]
    Depth(u64),
}

impl Selector {
    /// Returns the path segments this selector may traverse from the current
    /// node. The `None` variant is synonymous with all segments.
    pub fn interests(&self) -> Option<Vec<PathSegment>> {
        match self {
            ExploreAll { .. } => None,
            ExploreFields { fields } => {
                Some(fields.keys().cloned().map(PathSegment::from).collect())
            }
            ExploreIndex { index, .. } => Some(vec![(*index).into()]),
            ExploreRecursive {
                current, sequence, ..
            } => match current {
                Some(selector) => selector.interests(),
                None => sequence.interests(),
            },
            ExploreUnion(selectors) => {
                let mut segments = Vec::new();
                for selector in selectors {
                    match selector.interests() {
                        Some(i) => segments.extend(i),
                        // one member explores everything, so the union does
                        None => return None,
                    }
                }
                Some(segments)
            }
            ExploreRecursiveEdge | Matcher => Some(vec![]),
        }
    }

    /// Explores the given segment of the node this selector sits on,
    /// returning the selector to apply to the reached child, or `None` if
    /// the child is not selected.
    pub fn explore(self, ipld: &Ipld, segment: &PathSegment) -> Option<Selector> {
        match self {
            ExploreAll { next } => Some(*next),
            ExploreFields { mut fields } => {
                lookup_segment(ipld, segment)?;
                match segment {
                    PathSegment::String(s) => fields.remove(s),
                    PathSegment::Int(i) => fields.remove(&i.to_string()),
                }
            }
            ExploreIndex { index, next } => match ipld {
                Ipld::List(l) => {
                    let i = segment.to_index()?;
                    if i == index && i < l.len() {
                        Some(*next)
                    } else {
                        None
                    }
                }
                _ => None,
            },
            ExploreRecursive {
                current,
                sequence,
                mut limit,
            } => {
                let next = current
                    .unwrap_or_else(|| sequence.clone())
                    .explore(ipld, segment)?;

                if !has_recursive_edge(&next) {
                    return Some(ExploreRecursive {
                        sequence,
                        current: Some(next.into()),
                        limit,
                    });
                }

                if let RecursionLimit::Depth(depth) = limit {
                    if depth < 2 {
                        // recursion bottoms out; drop the edge instead of
                        // restarting the sequence
                        return replace_recursive_edge(next, None);
                    }
                    limit = RecursionLimit::Depth(depth - 1);
                }

                Some(ExploreRecursive {
                    current: replace_recursive_edge(next, Some(*sequence.clone())).map(Box::new),
                    sequence,
                    limit,
                })
            }
            ExploreUnion(selectors) => {
                let explored: Vec<_> = selectors
                    .into_iter()
                    .filter_map(|s| s.explore(ipld, segment))
                    .collect();
                Selector::from_selectors(explored)
            }
            // edge outside a recursion, or a terminal matcher
            ExploreRecursiveEdge | Matcher => None,
        }
    }

    fn from_selectors(mut vec: Vec<Self>) -> Option<Self> {
        match vec.len() {
            0 | 1 => vec.pop(),
            _ => Some(ExploreUnion(vec)),
        }
    }
}

fn has_recursive_edge(selector: &Selector) -> bool {
    match selector {
        ExploreRecursiveEdge => true,
        ExploreUnion(selectors) => selectors.iter().any(has_recursive_edge),
        _ => false,
    }
}

fn replace_recursive_edge(selector: Selector, replace: Option<Selector>) -> Option<Selector> {
    match selector {
        ExploreRecursiveEdge => replace,
        ExploreUnion(selectors) => {
            let replaced: Vec<_> = selectors
                .into_iter()
                .filter_map(|s| replace_recursive_edge(s, replace.clone()))
                .collect();
            Selector::from_selectors(replaced)
        }
        _ => Some(selector),
    }
}

/// Looks up the child of a node under the given segment.
pub(crate) fn lookup_segment<'a>(ipld: &'a Ipld, segment: &PathSegment) -> Option<&'a Ipld> {
    match ipld {
        Ipld::Map(map) => match segment {
            PathSegment::String(s) => map.get(s),
            PathSegment::Int(i) => map.get(&i.to_string()),
        },
        Ipld::List(list) => list.get(segment.to_index()?),
        _ => None,
    }
}

/// Returns a selector that recursively explores all links to the given
/// depth, the common shape for whole-subgraph requests.
pub fn explore_all_recursively(limit: RecursionLimit) -> Selector {
    ExploreRecursive {
        sequence: Box::new(ExploreAll {
            next: Box::new(ExploreRecursiveEdge),
        }),
        limit,
        current: None,
    }
}

mod empty_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        BTreeMap::<(), ()>::new().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<(), D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::<String, String>::deserialize(deserializer)?;
        Ok(())
    }
}
