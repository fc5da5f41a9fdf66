// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::RequestID;
use cid::Cid;
use fnv::{FnvHashMap, FnvHashSet};

/// Tracks links traversed for a peer across that peer's in-progress
/// requests: which blocks are already queued for sending (so they are not
/// sent twice) and which requests came up short of a block.
#[derive(Default)]
pub struct LinkTracker {
    /// Links whose blocks were missing, per request.
    missing_blocks: FnvHashMap<RequestID, FnvHashSet<Cid>>,

    /// Links traversed with a present block, per request, so their send
    /// counts can be released when the request finishes.
    links_with_blocks: FnvHashMap<RequestID, Vec<Cid>>,

    /// How many unfinished requests have traversed each link with a block.
    traversals_with_blocks: FnvHashMap<Cid, usize>,
}

impl LinkTracker {
    pub fn new() -> Self {
        Default::default()
    }

    /// How many unfinished requests have sent (or queued) the block for this
    /// link. A non-zero count means the block need not be sent again.
    pub fn block_ref_count(&self, link: &Cid) -> usize {
        self.traversals_with_blocks.get(link).copied().unwrap_or(0)
    }

    /// Records that a traversal for the given request visited the given
    /// link, and whether the block was present.
    pub fn record_link_traversal(&mut self, id: RequestID, link: Cid, block_is_present: bool) {
        if block_is_present {
            self.links_with_blocks.entry(id).or_default().push(link);
            *self.traversals_with_blocks.entry(link).or_insert(0) += 1;
        } else {
            self.missing_blocks.entry(id).or_default().insert(link);
        }
    }

    /// Marks a request finished, releasing its link bookkeeping. Returns
    /// true if every link it traversed had its block present.
    pub fn finish_request(&mut self, id: RequestID) -> bool {
        let had_all_blocks = self.missing_blocks.remove(&id).is_none();
        for link in self.links_with_blocks.remove(&id).unwrap_or_default() {
            if let Some(count) = self.traversals_with_blocks.get_mut(&link) {
                *count -= 1;
                if *count == 0 {
                    self.traversals_with_blocks.remove(&link);
                }
            }
        }
        had_all_blocks
    }
}
