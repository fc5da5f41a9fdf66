// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::PeerQueue;
use crate::config::GraphSyncConfig;
use crate::errors::Error;
use crate::message::{GraphSyncMessage, GraphSyncRequest, GraphSyncResponse};
use crate::Block;
use async_std::channel::{unbounded, Receiver, Sender};
use async_std::task;
use futures::channel::oneshot;
use libp2p::core::PeerId;
use log::{debug, error};
use std::collections::VecDeque;

/// Sends whole protocol messages to one peer over the transport. Connection
/// loss is signaled by a send error.
#[async_trait::async_trait]
pub trait MessageSender: Send + Sync + 'static {
    async fn send_message(&self, message: GraphSyncMessage) -> Result<(), Error>;
}

enum QueueEvent {
    Request(GraphSyncRequest),
    Responses {
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
        ready: oneshot::Sender<()>,
    },
    Shutdown,
}

/// The outgoing message queue for a single peer. Additions accumulate while
/// a send is on the wire; when it completes, everything accumulated is built
/// into new messages, split on response groupings to honor the configured
/// maximum message size.
pub struct MessageQueue {
    events: Sender<QueueEvent>,
}

impl MessageQueue {
    /// Creates the queue and spawns its send loop.
    pub fn new<S: MessageSender>(peer: PeerId, sender: S, config: GraphSyncConfig) -> Self {
        let (events_tx, events_rx) = unbounded();
        task::spawn(run_queue(peer, sender, config, events_rx));
        Self { events: events_tx }
    }
}

impl PeerQueue for MessageQueue {
    fn add_request(&mut self, request: GraphSyncRequest) {
        let _ = self.events.try_send(QueueEvent::Request(request));
    }

    fn add_responses(
        &mut self,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) -> oneshot::Receiver<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let _ = self.events.try_send(QueueEvent::Responses {
            responses,
            blocks,
            ready: ready_tx,
        });
        ready_rx
    }

    fn shutdown(&mut self) {
        let _ = self.events.try_send(QueueEvent::Shutdown);
    }
}

/// A batch of responses added together. Groups are the split unit when
/// building size-bounded messages.
struct ResponseGroup {
    responses: Vec<GraphSyncResponse>,
    blocks: Vec<Block>,
    ready: oneshot::Sender<()>,
}

impl ResponseGroup {
    fn size(&self) -> usize {
        let block_bytes: usize = self.blocks.iter().map(|b| b.data.len()).sum();
        let extension_bytes: usize = self
            .responses
            .iter()
            .flat_map(|r| r.extensions.values())
            .map(Vec::len)
            .sum();
        block_bytes + extension_bytes
    }
}

#[derive(Default)]
struct PendingMessage {
    requests: Vec<GraphSyncRequest>,
    groups: VecDeque<ResponseGroup>,
}

impl PendingMessage {
    fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.groups.is_empty()
    }

    /// Builds the next outgoing message: all pending requests, plus response
    /// groups up to the size bound. A group larger than the bound is sent in
    /// a message of its own rather than split.
    fn next_message(&mut self, max_size: usize) -> (GraphSyncMessage, Vec<oneshot::Sender<()>>) {
        let mut message = GraphSyncMessage::new();
        let mut readies = Vec::new();

        message.requests = std::mem::take(&mut self.requests);

        let mut size = 0;
        while let Some(group) = self.groups.front() {
            let group_size = group.size();
            if size + group_size > max_size && !(message.responses.is_empty() && size == 0) {
                break;
            }
            let group = self.groups.pop_front().unwrap();
            size += group_size;
            message.responses.extend(group.responses);
            message.blocks.extend(group.blocks);
            readies.push(group.ready);
        }

        (message, readies)
    }
}

async fn run_queue<S: MessageSender>(
    peer: PeerId,
    sender: S,
    config: GraphSyncConfig,
    events: Receiver<QueueEvent>,
) {
    let mut pending = PendingMessage::default();
    loop {
        if pending.is_empty() {
            match events.recv().await {
                Ok(QueueEvent::Shutdown) | Err(_) => return,
                Ok(event) => ingest(&mut pending, event),
            }
        }
        // batch up everything that arrived while the last send was in flight
        loop {
            match events.try_recv() {
                Ok(QueueEvent::Shutdown) => return,
                Ok(event) => ingest(&mut pending, event),
                Err(_) => break,
            }
        }

        let (message, readies) = pending.next_message(config.max_message_size);
        if message.is_empty() {
            continue;
        }
        match sender.send_message(message).await {
            Ok(()) => {
                for ready in readies {
                    let _ = ready.send(());
                }
            }
            Err(e) => {
                // the batch is dropped; pending ready signals are dropped
                // with it, which surfaces the failure to waiting responders
                error!("message queue for peer {}: send failed: {}", peer, e);
                return;
            }
        }
    }
}

fn ingest(pending: &mut PendingMessage, event: QueueEvent) {
    match event {
        QueueEvent::Request(request) => pending.requests.push(request),
        QueueEvent::Responses {
            responses,
            blocks,
            ready,
        } => {
            debug!(
                "queueing {} responses with {} blocks",
                responses.len(),
                blocks.len()
            );
            pending.groups.push_back(ResponseGroup {
                responses,
                blocks,
                ready,
            });
        }
        QueueEvent::Shutdown => {}
    }
}
