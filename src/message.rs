// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! GraphSync message types. A message carries any mix of requests,
//! responses, and blocks; serialization to the wire format is the
//! transport's job.

use crate::selector::Selector;
use crate::{Block, Extensions, Priority, RequestID, ResponseStatusCode};
use cid::Cid;

/// A single GraphSync request. Cancellations and updates are requests with
/// the corresponding flag set and no root or selector.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSyncRequest {
    pub id: RequestID,
    pub root: Option<Cid>,
    pub selector: Option<Selector>,
    pub priority: Priority,
    pub extensions: Extensions,
    pub is_cancel: bool,
    pub is_update: bool,
}

impl GraphSyncRequest {
    /// Creates a request for the subgraph selected from the given root.
    pub fn new(
        id: RequestID,
        root: Cid,
        selector: Selector,
        priority: Priority,
        extensions: Extensions,
    ) -> Self {
        Self {
            id,
            root: Some(root),
            selector: Some(selector),
            priority,
            extensions,
            is_cancel: false,
            is_update: false,
        }
    }

    /// Creates a request that cancels the request with the given id.
    pub fn cancel(id: RequestID) -> Self {
        Self {
            id,
            root: None,
            selector: None,
            priority: 0,
            extensions: Extensions::default(),
            is_cancel: true,
            is_update: false,
        }
    }

    /// Creates a request that updates the in-progress request with the given
    /// id, carrying data for the responder's update hooks.
    pub fn update(id: RequestID, extensions: Extensions) -> Self {
        Self {
            id,
            root: None,
            selector: None,
            priority: 0,
            extensions,
            is_cancel: false,
            is_update: true,
        }
    }

    /// Returns the data of the named extension, if attached.
    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        self.extensions.get(name).map(Vec::as_slice)
    }
}

/// A single GraphSync response.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSyncResponse {
    pub id: RequestID,
    pub status: ResponseStatusCode,
    pub extensions: Extensions,
}

impl GraphSyncResponse {
    /// Returns the data of the named extension, if attached.
    pub fn extension(&self, name: &str) -> Option<&[u8]> {
        self.extensions.get(name).map(Vec::as_slice)
    }
}

/// A whole protocol message exchanged between two peers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSyncMessage {
    pub requests: Vec<GraphSyncRequest>,
    pub responses: Vec<GraphSyncResponse>,
    pub blocks: Vec<Block>,
}

impl GraphSyncMessage {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.responses.is_empty() && self.blocks.is_empty()
    }

    pub fn add_request(&mut self, request: GraphSyncRequest) {
        self.requests.push(request);
    }

    pub fn add_response(&mut self, response: GraphSyncResponse) {
        self.responses.push(response);
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }
}
