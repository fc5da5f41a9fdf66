// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! GraphSync protocol engine.
//!
//! GraphSync lets a peer request a subgraph of an IPLD DAG from another peer
//! by naming a root [`Cid`](cid::Cid) and a [`Selector`](selector::Selector)
//! describing which links to follow. The remote peer streams matching blocks
//! back while a local traversal runs against the arriving data.
//!
//! The engine is split into a requester half ([`request_manager`]), a
//! responder half ([`response_manager`]), and the per-peer outbound message
//! queues ([`peer_manager`]) both halves send through. Wire serialization and
//! the underlying stream transport are supplied by the caller through the
//! [`peer_manager::MessageSender`] seam.

mod cid_set;
mod config;
mod errors;
mod path;
mod store;

pub mod hooks;
pub mod message;
pub mod peer_manager;
pub mod request_manager;
pub mod response_manager;
pub mod selector;
pub mod traversal;

#[cfg(test)]
mod test_utils;

pub use self::cid_set::{decode_cid_set, encode_cid_set};
pub use self::config::GraphSyncConfig;
pub use self::errors::Error;
pub use self::path::{Path, PathSegment};
pub use self::store::{Loader, MemoryStore, Storer};

pub use ipld_core::ipld::Ipld;

use cid::Cid;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

/// Identifier for a GraphSync request, chosen by the requesting peer and
/// unique for its lifetime.
pub type RequestID = i32;

/// Priority of a request; higher values are served first.
pub type Priority = i32;

/// Extensions attached to a request or response, keyed by extension name.
pub type Extensions = FnvHashMap<String, Vec<u8>>;

/// Reserved extension carrying per-link present/absent bits in traversal
/// order, dag-cbor encoded as a list of [`MetadataItem`].
pub const EXTENSION_METADATA: &str = "graphsync/response-metadata";

/// Reserved extension carrying a dag-cbor encoded CID set the responder must
/// not send blocks for.
pub const EXTENSION_DO_NOT_SEND_CIDS: &str = "graphsync/do-not-send-cids";

/// The maximum combined size of blocks batched into a single outgoing
/// response message.
pub const MAX_BLOCK_SIZE: usize = 512 * 1024;

/// A named piece of opaque data attached to a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionData {
    pub name: String,
    pub data: Vec<u8>,
}

/// A single link visited by a responder traversal, and whether the
/// corresponding block is carried in the response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    pub link: Cid,
    pub block_is_present: bool,
}

/// Per-link response metadata, in traversal order.
pub type Metadata = Vec<MetadataItem>;

/// A content-addressed block. The data is trusted to hash to the cid;
/// verifying that is the store's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(cid: Cid, data: Vec<u8>) -> Self {
        Self { cid, data }
    }
}

/// Information about a block sent (or deliberately not sent) for a single
/// link during a responder traversal, handed to block hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub link: Cid,
    /// Size of the block's data, or 0 if the block was absent locally.
    pub block_size: usize,
    /// Whether the block's bytes were added to the outgoing message. False
    /// when the block was absent, already queued for this peer, or ignored.
    pub sent: bool,
}

/// Status of a response, sent to the requesting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatusCode {
    /// Part of the requested data, with more to follow.
    PartialResponse,
    /// The responder paused the traversal; it resumes on an unpause.
    RequestPaused,
    /// Traversal finished and every requested block was present.
    RequestCompletedFull,
    /// Traversal finished but one or more blocks were missing locally.
    RequestCompletedPartial,
    /// The request failed for an unspecified reason.
    RequestFailedUnknown,
    /// The root block was not present on the responder.
    RequestFailedContentNotFound,
    /// The request was cancelled.
    RequestCancelled,
}

impl ResponseStatusCode {
    pub fn to_code(self) -> u16 {
        match self {
            Self::PartialResponse => 14,
            Self::RequestPaused => 15,
            Self::RequestCompletedFull => 20,
            Self::RequestCompletedPartial => 21,
            Self::RequestFailedUnknown => 32,
            Self::RequestFailedContentNotFound => 34,
            Self::RequestCancelled => 35,
        }
    }

    /// Decodes a wire status code. Unknown values map to
    /// `RequestFailedUnknown`.
    pub fn from_code(code: u16) -> Self {
        match code {
            14 => Self::PartialResponse,
            15 => Self::RequestPaused,
            20 => Self::RequestCompletedFull,
            21 => Self::RequestCompletedPartial,
            34 => Self::RequestFailedContentNotFound,
            35 => Self::RequestCancelled,
            _ => Self::RequestFailedUnknown,
        }
    }

    /// Whether this status ends the request.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::PartialResponse | Self::RequestPaused)
    }

    /// Whether this status ends the request successfully.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::RequestCompletedFull | Self::RequestCompletedPartial
        )
    }

    /// Whether this status ends the request unsuccessfully.
    pub fn is_failure(self) -> bool {
        self.is_terminal() && !self.is_success()
    }
}

/// Position of the block most recently loaded by a traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastBlockInfo {
    pub path: Path,
    pub link: Cid,
}

/// One step of traversal progress, delivered to the requesting caller for
/// every node the selector visits.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseProgress {
    pub node: Ipld,
    pub path: Path,
    pub last_block: Option<LastBlockInfo>,
}
