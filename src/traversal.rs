// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Selector-driven DAG traversal.
//!
//! A [`Traverser`] is a cursor over a DAG of content-addressed blocks. It
//! never loads blocks itself: whenever the walk reaches a link it stops and
//! reports the link through [`Traverser::current_link`], and the caller
//! feeds the block's bytes back with [`Traverser::advance`] (or declares the
//! block missing with [`Traverser::skip_current`], which prunes that
//! subtree). Between feedings the traverser is inert data, so a paused
//! traversal can be parked in a table and resumed arbitrarily later.

use crate::errors::Error;
use crate::path::{Path, PathSegment};
use crate::selector::{lookup_segment, Selector};
use crate::{Ipld, LastBlockInfo, ResponseProgress};
use cid::Cid;
use std::collections::VecDeque;
use std::sync::Arc;

/// Decodes a block's bytes into an IPLD node.
pub type NodeDecoder = Arc<dyn Fn(&[u8]) -> Result<Ipld, Error> + Send + Sync>;

/// The default decoder, for dag-cbor encoded blocks.
pub fn dag_cbor_decoder() -> NodeDecoder {
    Arc::new(|data| serde_ipld_dagcbor::from_slice(data).map_err(|e| Error::Encoding(e.to_string())))
}

/// A block load the walk is waiting on.
struct PendingLink {
    link: Cid,
    path: Path,
    selector: Selector,
}

/// A node currently being explored, with the segments left to visit.
struct Frame {
    node: Ipld,
    selector: Selector,
    path: Path,
    segments: VecDeque<PathSegment>,
}

/// An in-progress selector walk over a DAG.
pub struct Traverser {
    stack: Vec<Frame>,
    pending: Option<PendingLink>,
    last_block: Option<LastBlockInfo>,
    progress: VecDeque<ResponseProgress>,
    decoder: NodeDecoder,
}

impl Traverser {
    /// Starts a walk of the given selector from the given root link, using
    /// the default dag-cbor decoder.
    pub fn new(root: Cid, selector: Selector) -> Self {
        Self::with_decoder(root, selector, dag_cbor_decoder())
    }

    /// Starts a walk with a custom node decoder.
    pub fn with_decoder(root: Cid, selector: Selector, decoder: NodeDecoder) -> Self {
        Self {
            stack: Vec::new(),
            pending: Some(PendingLink {
                link: root,
                path: Path::default(),
                selector,
            }),
            last_block: None,
            progress: VecDeque::new(),
            decoder,
        }
    }

    /// Whether the walk has visited everything the selector selects.
    pub fn is_complete(&self) -> bool {
        self.stack.is_empty() && self.pending.is_none()
    }

    /// The link the walk is waiting on, if any.
    pub fn current_link(&self) -> Option<Cid> {
        self.pending.as_ref().map(|p| p.link)
    }

    /// Feeds the walk the block it is waiting on. Decodes the block, emits
    /// progress for every node visited, and walks on to the next link (or to
    /// completion).
    pub fn advance(&mut self, data: &[u8]) -> Result<(), Error> {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => return Err(Error::Protocol("advance without a pending link".to_owned())),
        };
        let node = (self.decoder)(data)?;
        self.last_block = Some(LastBlockInfo {
            path: pending.path.clone(),
            link: pending.link,
        });
        self.visit(node, pending.selector, pending.path);
        self.walk();
        Ok(())
    }

    /// Declares the block the walk is waiting on missing, pruning its
    /// subtree, and walks on.
    pub fn skip_current(&mut self) {
        self.pending = None;
        self.walk();
    }

    /// Pops the next progress event, in visit order.
    pub fn pop_progress(&mut self) -> Option<ResponseProgress> {
        self.progress.pop_front()
    }

    fn visit(&mut self, node: Ipld, selector: Selector, path: Path) {
        self.progress.push_back(ResponseProgress {
            node: node.clone(),
            path: path.clone(),
            last_block: self.last_block.clone(),
        });
        let segments = match selector.interests() {
            Some(segments) => segments.into(),
            None => all_segments(&node),
        };
        self.stack.push(Frame {
            node,
            selector,
            path,
            segments,
        });
    }

    /// Walks depth-first until a link needs loading or the stack empties.
    fn walk(&mut self) {
        while let Some(frame) = self.stack.last_mut() {
            let segment = match frame.segments.pop_front() {
                Some(segment) => segment,
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            let child = match lookup_segment(&frame.node, &segment) {
                Some(child) => child.clone(),
                None => continue,
            };
            let selector = match frame.selector.clone().explore(&frame.node, &segment) {
                Some(selector) => selector,
                None => continue,
            };
            let path = frame.path.child(segment);
            match child {
                Ipld::Link(link) => {
                    self.pending = Some(PendingLink {
                        link,
                        path,
                        selector,
                    });
                    return;
                }
                node => self.visit(node, selector, path),
            }
        }
    }
}

fn all_segments(node: &Ipld) -> VecDeque<PathSegment> {
    match node {
        Ipld::Map(map) => map.keys().cloned().map(PathSegment::String).collect(),
        Ipld::List(list) => (0..list.len()).map(PathSegment::Int).collect(),
        _ => VecDeque::new(),
    }
}
