// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-peer outbound message queues. Each remote peer the engine talks to
//! gets one queue, created on first use, that batches requests, responses,
//! and blocks into whole protocol messages.

mod message_queue;

pub use message_queue::{MessageQueue, MessageSender};

use crate::errors::Error;
use crate::message::{GraphSyncRequest, GraphSyncResponse};
use crate::response_manager::PeerMessageHandler;
use crate::Block;
use async_std::sync::Mutex;
use async_trait::async_trait;
use fnv::FnvHashMap;
use futures::channel::oneshot;
use libp2p::core::PeerId;

/// A per-peer outbound queue. Additions never block on the wire.
pub trait PeerQueue: Send + 'static {
    /// Enqueues a request.
    fn add_request(&mut self, request: GraphSyncRequest);

    /// Enqueues responses and their blocks. The returned receiver resolves
    /// once the message carrying them has been delivered, which responders
    /// use for backpressure; it is dropped unresolved if delivery fails.
    fn add_responses(
        &mut self,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) -> oneshot::Receiver<()>;

    /// Stops the queue, dropping anything undelivered.
    fn shutdown(&mut self);
}

/// Manages the outgoing message queues of every connected peer.
pub struct PeerMessageManager<Q, F>
where
    Q: PeerQueue,
    F: Fn(PeerId) -> Q + Send + Sync,
{
    peer_queues: Mutex<FnvHashMap<PeerId, Q>>,
    queue_factory: F,
}

impl<Q, F> PeerMessageManager<Q, F>
where
    Q: PeerQueue,
    F: Fn(PeerId) -> Q + Send + Sync,
{
    /// Creates a manager that builds a queue with the given factory the
    /// first time a peer is sent to.
    pub fn new(queue_factory: F) -> Self {
        Self {
            peer_queues: Mutex::new(FnvHashMap::default()),
            queue_factory,
        }
    }

    /// Enqueues a request to the given peer.
    pub async fn send_request(&self, peer: PeerId, request: GraphSyncRequest) {
        let mut queues = self.peer_queues.lock().await;
        Self::queue_for(&mut queues, &self.queue_factory, peer).add_request(request);
    }

    /// Enqueues responses to the given peer, returning the delivery signal.
    pub async fn send_responses(
        &self,
        peer: PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) -> oneshot::Receiver<()> {
        let mut queues = self.peer_queues.lock().await;
        Self::queue_for(&mut queues, &self.queue_factory, peer).add_responses(responses, blocks)
    }

    /// The peers this manager holds queues for.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.peer_queues.lock().await.keys().cloned().collect()
    }

    /// Shuts down every peer queue.
    pub async fn shutdown(&self) {
        for queue in self.peer_queues.lock().await.values_mut() {
            queue.shutdown();
        }
    }

    fn queue_for<'a>(
        queues: &'a mut FnvHashMap<PeerId, Q>,
        factory: &F,
        peer: PeerId,
    ) -> &'a mut Q {
        queues.entry(peer).or_insert_with(|| factory(peer))
    }
}

#[async_trait]
impl<Q, F> PeerMessageHandler for PeerMessageManager<Q, F>
where
    Q: PeerQueue,
    F: Fn(PeerId) -> Q + Send + Sync,
{
    async fn send_response(
        &self,
        peer: &PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) -> Result<(), Error> {
        let ready = self.send_responses(*peer, responses, blocks).await;
        ready
            .await
            .map_err(|_| Error::Transport("message queue closed before delivery".to_owned()))
    }
}
