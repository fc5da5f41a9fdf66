// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{LinkTracker, ResponseBuilder};
use crate::errors::Error;
use crate::message::GraphSyncResponse;
use crate::{Block, BlockData, ExtensionData, RequestID, ResponseStatusCode, MAX_BLOCK_SIZE};
use async_std::sync::Mutex;
use async_trait::async_trait;
use cid::Cid;
use fnv::FnvHashMap;
use libp2p::core::PeerId;
use std::sync::Arc;

/// Handles batching, deduping, and sending responses for a given peer across
/// multiple requests.
pub struct PeerResponseSender {
    peer: PeerId,
    link_tracker: LinkTracker,
    response_builders: Vec<ResponseBuilder>,
}

impl PeerResponseSender {
    /// Creates a new peer response sender.
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            link_tracker: LinkTracker::new(),
            response_builders: Vec::new(),
        }
    }

    /// Sends a given link for a given request ID across the wire, as well as
    /// its corresponding block if the block is present and has not already
    /// been sent.
    pub fn send_response(&mut self, id: RequestID, link: Cid, data: Option<Vec<u8>>) -> BlockData {
        let block_is_present = data.is_some();
        let block_size = data.as_ref().map_or(0, |data| data.len());

        // if we've traversed this block before for this peer (not necessarily
        // for this particular request), there's no need to send it again
        let block = data.filter(|_| self.link_tracker.block_ref_count(&link) == 0);
        self.link_tracker
            .record_link_traversal(id, link, block_is_present);

        let sent = block.is_some();
        let builder = self.response_builder(block_size);
        builder.add_link(id, link, block_is_present);

        if let Some(data) = block {
            builder.add_block(Block::new(link, data));
        }

        BlockData {
            link,
            block_size,
            sent,
        }
    }

    /// Adds the given extension data to the response.
    pub fn send_extension_data(&mut self, id: RequestID, extension_data: ExtensionData) {
        // we pass 0 as the block size since we're not adding any blocks to the response
        self.response_builder(0)
            .add_extension_data(id, extension_data);
    }

    /// Marks the given request ID as having sent all responses.
    pub fn finish_request(&mut self, id: RequestID) -> ResponseStatusCode {
        let status = if self.link_tracker.finish_request(id) {
            ResponseStatusCode::RequestCompletedFull
        } else {
            ResponseStatusCode::RequestCompletedPartial
        };
        self.response_builder(0).complete(id, status);
        status
    }

    /// Marks the given request ID as having terminated with an error.
    pub fn finish_request_with_error(&mut self, id: RequestID, status: ResponseStatusCode) {
        self.link_tracker.finish_request(id);
        self.response_builder(0).complete(id, status);
    }

    /// Marks the given request ID as paused.
    pub fn pause_request(&mut self, id: RequestID) {
        self.response_builder(0)
            .complete(id, ResponseStatusCode::RequestPaused);
    }

    /// Records links whose blocks the requesting peer already has, so
    /// traversing them sends metadata but no block bytes.
    pub fn ignore_blocks(&mut self, id: RequestID, links: impl IntoIterator<Item = Cid>) {
        for link in links {
            self.link_tracker.record_link_traversal(id, link, true);
        }
    }

    /// Runs the given closure against a transaction that groups all its
    /// modifications for one request ID into a single atomic addition.
    pub fn transaction<F>(&mut self, id: RequestID, f: F)
    where
        F: FnOnce(&mut PeerResponseTransaction<'_>),
    {
        let mut transaction = PeerResponseTransaction { sender: self, id };
        f(&mut transaction);
    }

    /// Either returns the most recent response builder or creates a new one, depending
    /// on whether the most recent one has enough space left to store a block with the
    /// given size.
    fn response_builder(&mut self, block_size: usize) -> &mut ResponseBuilder {
        assert!(
            block_size <= MAX_BLOCK_SIZE,
            "the size of a single block may not exceed the max block size"
        );

        match self.response_builders.last_mut() {
            Some(builder) if builder.block_size() + block_size <= MAX_BLOCK_SIZE => {}
            _ => self.response_builders.push(ResponseBuilder::new()),
        }
        self.response_builders.last_mut().unwrap()
    }

    /// Builds all responses and passes them to the given handler.
    pub async fn flush<H>(&mut self, handler: &H) -> Result<(), Error>
    where
        H: PeerMessageHandler + ?Sized,
    {
        for builder in self.response_builders.drain(..) {
            if builder.is_empty() {
                continue;
            }
            let (responses, blocks) = builder.build()?;
            handler.send_response(&self.peer, responses, blocks).await?;
        }
        Ok(())
    }
}

/// All modifications for one request ID within one atomic addition to the
/// peer's outgoing responses.
pub struct PeerResponseTransaction<'a> {
    sender: &'a mut PeerResponseSender,
    id: RequestID,
}

impl PeerResponseTransaction<'_> {
    pub fn send_response(&mut self, link: Cid, data: Option<Vec<u8>>) -> BlockData {
        self.sender.send_response(self.id, link, data)
    }

    pub fn send_extension_data(&mut self, extension_data: ExtensionData) {
        self.sender.send_extension_data(self.id, extension_data);
    }

    pub fn finish_request(&mut self) -> ResponseStatusCode {
        self.sender.finish_request(self.id)
    }

    pub fn finish_with_error(&mut self, status: ResponseStatusCode) {
        self.sender.finish_request_with_error(self.id, status);
    }

    pub fn pause_request(&mut self) {
        self.sender.pause_request(self.id);
    }

    pub fn ignore_blocks(&mut self, links: impl IntoIterator<Item = Cid>) {
        self.sender.ignore_blocks(self.id, links);
    }
}

/// Delivers built response messages to a peer, usually by handing them to
/// that peer's outgoing message queue.
#[async_trait]
pub trait PeerMessageHandler: Send + Sync {
    async fn send_response(
        &self,
        peer: &PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) -> Result<(), Error>;
}

/// Hands out one shared [`PeerResponseSender`] per peer.
pub struct PeerResponseManager {
    handler: Arc<dyn PeerMessageHandler>,
    senders: Mutex<FnvHashMap<PeerId, Arc<Mutex<PeerResponseSender>>>>,
}

impl PeerResponseManager {
    pub fn new(handler: Arc<dyn PeerMessageHandler>) -> Self {
        Self {
            handler,
            senders: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Returns the sender for the given peer, creating it on first use.
    pub async fn sender_for_peer(&self, peer: &PeerId) -> Arc<Mutex<PeerResponseSender>> {
        self.senders
            .lock()
            .await
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(PeerResponseSender::new(*peer))))
            .clone()
    }

    /// Flushes everything batched for the given peer through the handler.
    pub async fn flush(&self, peer: &PeerId) -> Result<(), Error> {
        let sender = self.sender_for_peer(peer).await;
        let mut sender = sender.lock().await;
        sender.flush(&*self.handler).await
    }
}
