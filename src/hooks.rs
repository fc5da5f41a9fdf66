// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Pluggable decision points invoked during the responder's request
//! lifecycle. The response manager consumes these through opaque trait
//! objects; registries, ordering, and unregistration are the caller's
//! business.

use crate::message::GraphSyncRequest;
use crate::store::Loader;
use crate::traversal::NodeDecoder;
use crate::{BlockData, ExtensionData, ResponseStatusCode};
use libp2p::core::PeerId;
use std::sync::Arc;
use thiserror::Error;

/// Control-flow outcome a block or update hook can return. `Paused` is a
/// sentinel that suspends the traversal at its next checkpoint; it never
/// reaches a caller as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("response paused by hook")]
    Paused,
    #[error("{0}")]
    Other(String),
}

/// Outcome of running request hooks on a new incoming request.
#[derive(Default)]
pub struct RequestHookResult {
    /// Whether the request may be served. An unvalidated request is finished
    /// with `RequestFailedUnknown` after any queued extensions are sent.
    pub is_validated: bool,
    /// Extensions to attach to the first response.
    pub extensions: Vec<ExtensionData>,
    /// Loader to serve this request from instead of the default one.
    pub custom_loader: Option<Arc<dyn Loader>>,
    /// Decoder for this request's blocks instead of the default dag-cbor.
    pub custom_decoder: Option<NodeDecoder>,
    /// A validation error; fails the request like `is_validated = false`.
    pub err: Option<String>,
}

/// Outcome of running block hooks on an outgoing block.
#[derive(Default)]
pub struct BlockHookResult {
    pub extensions: Vec<ExtensionData>,
    pub err: Option<HookError>,
}

/// Outcome of running update hooks on a request update.
#[derive(Default)]
pub struct UpdateHookResult {
    pub extensions: Vec<ExtensionData>,
    /// Resume the request if it is currently paused.
    pub unpause: bool,
    pub err: Option<HookError>,
}

/// Hooks run when a new request arrives, before any traversal starts.
pub trait RequestHooks: Send + Sync {
    fn process_request_hooks(&self, peer: &PeerId, request: &GraphSyncRequest)
        -> RequestHookResult;
}

/// Hooks run for every block a responder traversal sends.
pub trait BlockHooks: Send + Sync {
    fn process_block_hooks(
        &self,
        peer: &PeerId,
        request: &GraphSyncRequest,
        block: &BlockData,
    ) -> BlockHookResult;
}

/// Hooks run when an update arrives for an in-progress request.
pub trait UpdateHooks: Send + Sync {
    fn process_update_hooks(
        &self,
        peer: &PeerId,
        request: &GraphSyncRequest,
        update: &GraphSyncRequest,
    ) -> UpdateHookResult;
}

/// Listeners notified when a response reaches a terminal status.
pub trait CompletedListeners: Send + Sync {
    fn notify_completed_listeners(
        &self,
        peer: &PeerId,
        request: &GraphSyncRequest,
        status: ResponseStatusCode,
    );
}
