// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Requester half of the engine: issues outgoing requests, drives a local
//! traversal against blocks served by the [`AsyncLoader`], and streams
//! progress and errors back to the caller.
//!
//! A single event loop owns the in-progress request table; each request gets
//! an executor task that walks the DAG and feeds the caller's streams
//! through the response collector.

mod async_loader;
mod response_collector;

pub use async_loader::{AsyncLoader, AsyncLoadResult};

use response_collector::collect_responses;

use crate::errors::Error;
use crate::message::{GraphSyncRequest, GraphSyncResponse};
use crate::selector::Selector;
use crate::traversal::Traverser;
use crate::{
    Block, ExtensionData, Extensions, Metadata, Priority, RequestID, ResponseProgress,
    EXTENSION_METADATA,
};
use async_std::channel::{bounded, unbounded, Receiver, Sender};
use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use fnv::FnvHashMap;
use futures::channel::oneshot;
use futures::future::{AbortHandle, Abortable};
use libp2p::core::PeerId;
use log::{info, warn};

/// Priority assigned to requests this manager issues.
const DEFAULT_PRIORITY: Priority = Priority::MAX;

/// Seam between the request manager and the per-peer message queues.
#[async_trait]
pub trait RequestSender: Send + Sync {
    async fn send_request(&self, peer: PeerId, request: GraphSyncRequest);
}

/// The streams a caller consumes one outgoing request through.
pub type RequestStreams = (Receiver<ResponseProgress>, Receiver<Error>);

enum RequestManagerMessage {
    NewRequest {
        peer: PeerId,
        root: Cid,
        selector: Selector,
        extensions: Vec<ExtensionData>,
        response: oneshot::Sender<RequestStreams>,
    },
    CancelRequest {
        request_id: RequestID,
    },
    ProcessResponses {
        peer: PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    },
    TerminateRequest {
        request_id: RequestID,
    },
    Synchronize {
        response: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Tracks outgoing requests and the traversals consuming their responses.
#[derive(Clone)]
pub struct RequestManager {
    messages: Sender<RequestManagerMessage>,
}

impl RequestManager {
    /// Creates a request manager and spawns its event loop.
    pub fn new(async_loader: AsyncLoader, peer_handler: std::sync::Arc<dyn RequestSender>) -> Self {
        let (messages_tx, messages_rx) = bounded(16);
        let event_loop = RequestManagerLoop {
            messages: messages_rx,
            messages_tx: messages_tx.clone(),
            async_loader,
            peer_handler,
            next_request_id: 0,
            in_progress: FnvHashMap::default(),
        };
        task::spawn(event_loop.run());
        Self {
            messages: messages_tx,
        }
    }

    /// Issues a request for the subgraph selected from the given root to the
    /// given peer. The returned streams close when the request terminates.
    pub async fn send_request(
        &self,
        peer: PeerId,
        root: Cid,
        selector: Selector,
        extensions: Vec<ExtensionData>,
    ) -> Result<RequestStreams, Error> {
        let (tx, rx) = oneshot::channel();
        self.messages
            .send(RequestManagerMessage::NewRequest {
                peer,
                root,
                selector,
                extensions,
                response: tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Cancels an outgoing request: tells the peer, fails its outstanding
    /// loads, and closes its streams.
    pub async fn cancel_request(&self, request_id: RequestID) {
        let _ = self
            .messages
            .send(RequestManagerMessage::CancelRequest { request_id })
            .await;
    }

    /// Ingests decoded responses and blocks received from a peer.
    pub async fn process_responses(
        &self,
        peer: PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) {
        let _ = self
            .messages
            .send(RequestManagerMessage::ProcessResponses {
                peer,
                responses,
                blocks,
            })
            .await;
    }

    /// Waits until every message sent before this one has been handled.
    pub async fn synchronize(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .messages
            .send(RequestManagerMessage::Synchronize { response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Stops the event loop, aborting every in-flight request.
    pub async fn shutdown(&self) {
        let _ = self.messages.send(RequestManagerMessage::Shutdown).await;
    }
}

struct InProgressRequestStatus {
    peer: PeerId,
    abort_handle: AbortHandle,
    error_sender: Sender<Error>,
    /// Whether a terminal status has arrived from the peer, so termination
    /// does not need to send a cancellation.
    saw_terminal: bool,
}

struct RequestManagerLoop {
    messages: Receiver<RequestManagerMessage>,
    messages_tx: Sender<RequestManagerMessage>,
    async_loader: AsyncLoader,
    peer_handler: std::sync::Arc<dyn RequestSender>,
    next_request_id: RequestID,
    in_progress: FnvHashMap<RequestID, InProgressRequestStatus>,
}

impl RequestManagerLoop {
    async fn run(mut self) {
        while let Ok(message) = self.messages.recv().await {
            match message {
                RequestManagerMessage::NewRequest {
                    peer,
                    root,
                    selector,
                    extensions,
                    response,
                } => {
                    let streams = self.new_request(peer, root, selector, extensions).await;
                    let _ = response.send(streams);
                }
                RequestManagerMessage::CancelRequest { request_id } => {
                    self.cancel_request(request_id).await
                }
                RequestManagerMessage::ProcessResponses {
                    peer,
                    responses,
                    blocks,
                } => self.process_responses(peer, responses, blocks).await,
                RequestManagerMessage::TerminateRequest { request_id } => {
                    self.terminate_request(request_id).await
                }
                RequestManagerMessage::Synchronize { response } => {
                    let _ = response.send(());
                }
                RequestManagerMessage::Shutdown => break,
            }
        }
        for status in self.in_progress.values() {
            status.abort_handle.abort();
        }
    }

    async fn new_request(
        &mut self,
        peer: PeerId,
        root: Cid,
        selector: Selector,
        extensions: Vec<ExtensionData>,
    ) -> RequestStreams {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        if let Err(e) = self.async_loader.start_request(request_id, "").await {
            warn!("failed to start request {}: {}", request_id, e);
        }

        let mut extension_map = Extensions::default();
        for ExtensionData { name, data } in extensions {
            extension_map.insert(name, data);
        }
        let request = GraphSyncRequest::new(
            request_id,
            root,
            selector.clone(),
            DEFAULT_PRIORITY,
            extension_map,
        );
        self.peer_handler.send_request(peer, request).await;

        let (progress_tx, progress_rx) = unbounded();
        let (errors_tx, errors_rx) = unbounded();
        let cancel_messages = self.messages_tx.clone();
        let streams = collect_responses(progress_rx, errors_rx, move || {
            task::spawn(async move {
                let _ = cancel_messages
                    .send(RequestManagerMessage::CancelRequest { request_id })
                    .await;
            });
        });

        let (abort_handle, abort_registration) = AbortHandle::new_pair();
        let executor = execute_traversal(
            request_id,
            root,
            selector,
            self.async_loader.clone(),
            progress_tx,
            errors_tx.clone(),
            self.messages_tx.clone(),
        );
        task::spawn(Abortable::new(executor, abort_registration));

        self.in_progress.insert(
            request_id,
            InProgressRequestStatus {
                peer,
                abort_handle,
                error_sender: errors_tx,
                saw_terminal: false,
            },
        );
        streams
    }

    async fn cancel_request(&mut self, request_id: RequestID) {
        if let Some(status) = self.in_progress.remove(&request_id) {
            status.abort_handle.abort();
            self.async_loader.cleanup_request(request_id).await;
            self.peer_handler
                .send_request(status.peer, GraphSyncRequest::cancel(request_id))
                .await;
        }
    }

    async fn process_responses(
        &mut self,
        peer: PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) {
        let mut metadata: FnvHashMap<RequestID, Metadata> = FnvHashMap::default();
        let mut successes = Vec::new();
        let mut failures = Vec::new();

        for response in responses {
            let status = match self.in_progress.get_mut(&response.id) {
                Some(status) if status.peer == peer => status,
                // responses for unknown requests (or from the wrong peer)
                // are dropped
                _ => continue,
            };
            if let Some(raw) = response.extension(EXTENSION_METADATA) {
                match serde_ipld_dagcbor::from_slice::<Metadata>(raw) {
                    Ok(items) => {
                        metadata.entry(response.id).or_default().extend(items);
                    }
                    Err(e) => {
                        failures.push((
                            response.id,
                            Error::Protocol(format!("malformed response metadata: {}", e)),
                        ));
                        continue;
                    }
                }
            }
            if response.status.is_terminal() {
                status.saw_terminal = true;
                if response.status.is_failure() {
                    failures.push((response.id, Error::RemoteRequestFailed(response.status)));
                } else {
                    successes.push(response.id);
                }
            }
        }

        self.async_loader.process_response(metadata, blocks).await;

        for request_id in successes {
            // outstanding loads drain (everything delivered is now local),
            // and the traversal finishes on its own
            self.async_loader.complete_responses_for(request_id).await;
        }
        for (request_id, error) in failures {
            self.fail_request(request_id, error).await;
        }
    }

    async fn fail_request(&mut self, request_id: RequestID, error: Error) {
        let status = match self.in_progress.remove(&request_id) {
            Some(status) => status,
            None => return,
        };
        info!("request {} failed: {}", request_id, error);
        let _ = status.error_sender.send(error).await;
        status.abort_handle.abort();
        self.async_loader.cleanup_request(request_id).await;
        if !status.saw_terminal {
            self.peer_handler
                .send_request(status.peer, GraphSyncRequest::cancel(request_id))
                .await;
        }
    }

    /// Handles an executor reporting that its traversal ended.
    async fn terminate_request(&mut self, request_id: RequestID) {
        if let Some(status) = self.in_progress.remove(&request_id) {
            self.async_loader.cleanup_request(request_id).await;
            if !status.saw_terminal {
                // the local traversal stopped before the peer finished;
                // tell it to stop streaming
                self.peer_handler
                    .send_request(status.peer, GraphSyncRequest::cancel(request_id))
                    .await;
            }
        }
    }
}

/// Walks the requested DAG, loading every block through the async loader and
/// streaming visited nodes to the caller.
async fn execute_traversal(
    request_id: RequestID,
    root: Cid,
    selector: Selector,
    async_loader: AsyncLoader,
    progress: Sender<ResponseProgress>,
    errors: Sender<Error>,
    messages: Sender<RequestManagerMessage>,
) {
    let mut traverser = Traverser::new(root, selector);
    'walk: while let Some(link) = traverser.current_link() {
        let load = async_loader.async_load(request_id, link).await;
        match load.await {
            Ok(Ok(data)) => {
                if let Err(e) = traverser.advance(&data) {
                    let _ = errors.send(e).await;
                    break;
                }
            }
            Ok(Err(e)) => {
                let _ = errors.send(e).await;
                break;
            }
            // the loader shut down
            Err(_) => break,
        }
        while let Some(item) = traverser.pop_progress() {
            if progress.send(item).await.is_err() {
                break 'walk;
            }
        }
    }
    drop(progress);
    drop(errors);
    let _ = messages
        .send(RequestManagerMessage::TerminateRequest { request_id })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{explore_all_recursively, RecursionLimit};
    use crate::test_utils::{self, assert_receive, CountingStore};
    use crate::{MetadataItem, ResponseStatusCode};
    use std::sync::Arc;

    struct CapturingSender {
        sent: async_std::channel::Sender<(PeerId, GraphSyncRequest)>,
    }

    #[async_trait]
    impl RequestSender for CapturingSender {
        async fn send_request(&self, peer: PeerId, request: GraphSyncRequest) {
            let _ = self.sent.try_send((peer, request));
        }
    }

    struct Fixture {
        manager: RequestManager,
        store: CountingStore,
        sent: async_std::channel::Receiver<(PeerId, GraphSyncRequest)>,
    }

    fn fixture() -> Fixture {
        let store = CountingStore::new();
        let loader = AsyncLoader::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let (sent_tx, sent_rx) = async_std::channel::unbounded();
        let manager = RequestManager::new(loader, Arc::new(CapturingSender { sent: sent_tx }));
        Fixture {
            manager,
            store,
            sent: sent_rx,
        }
    }

    fn selector() -> Selector {
        explore_all_recursively(RecursionLimit::None)
    }

    fn response_with_metadata(
        id: RequestID,
        status: ResponseStatusCode,
        metadata: Vec<MetadataItem>,
    ) -> GraphSyncResponse {
        let mut extensions = Extensions::default();
        extensions.insert(
            EXTENSION_METADATA.to_owned(),
            serde_ipld_dagcbor::to_vec(&metadata).unwrap(),
        );
        GraphSyncResponse {
            id,
            status,
            extensions,
        }
    }

    #[async_std::test]
    async fn request_completes_from_remote_blocks() {
        let f = fixture();
        let peer = PeerId::random();
        // the remote peer has the data; we only learn the shape on arrival
        let remote = crate::MemoryStore::new();
        let (root, cids) = test_utils::store_chain_dag(&remote, 3);
        let blocks: Vec<Block> = cids
            .iter()
            .map(|cid| Block::new(*cid, remote.get(cid).unwrap()))
            .collect();

        let (out_progress, out_errors) = f
            .manager
            .send_request(peer, root, selector(), Vec::new())
            .await
            .unwrap();

        let (to, request) = assert_receive(&f.sent, "request sent").await;
        assert_eq!(to, peer);
        assert_eq!(request.root, Some(root));
        assert!(!request.is_cancel);

        let metadata: Vec<MetadataItem> = cids
            .iter()
            .map(|cid| MetadataItem {
                link: *cid,
                block_is_present: true,
            })
            .collect();
        f.manager
            .process_responses(
                peer,
                vec![response_with_metadata(
                    request.id,
                    ResponseStatusCode::RequestCompletedFull,
                    metadata,
                )],
                blocks,
            )
            .await;

        let mut nodes = Vec::new();
        while let Ok(item) = out_progress.recv().await {
            nodes.push(item);
        }
        // two nodes per chain entry: the map and its value
        assert_eq!(nodes.len(), cids.len() * 2);
        assert_eq!(
            nodes[0].last_block.as_ref().unwrap().link,
            root,
            "first progress is the root block"
        );
        assert!(
            out_errors.recv().await.is_err(),
            "no errors on a full response"
        );
        // all delivered blocks were committed locally
        for cid in &cids {
            assert!(f.store.contains(cid));
        }
    }

    #[async_std::test]
    async fn partial_response_surfaces_a_not_found_error() {
        let f = fixture();
        let peer = PeerId::random();
        let remote = crate::MemoryStore::new();
        let (root, cids) = test_utils::store_chain_dag(&remote, 3);

        let (out_progress, out_errors) = f
            .manager
            .send_request(peer, root, selector(), Vec::new())
            .await
            .unwrap();
        let (_, request) = assert_receive(&f.sent, "request sent").await;

        // the remote is missing everything below the root
        let metadata = vec![
            MetadataItem {
                link: cids[0],
                block_is_present: true,
            },
            MetadataItem {
                link: cids[1],
                block_is_present: false,
            },
        ];
        let blocks = vec![Block::new(cids[0], remote.get(&cids[0]).unwrap())];
        f.manager
            .process_responses(
                peer,
                vec![response_with_metadata(
                    request.id,
                    ResponseStatusCode::RequestCompletedPartial,
                    metadata,
                )],
                blocks,
            )
            .await;

        let mut nodes = Vec::new();
        while let Ok(item) = out_progress.recv().await {
            nodes.push(item);
        }
        assert!(!nodes.is_empty(), "the root node is still delivered");

        let error = assert_receive(&out_errors, "should surface the missing block").await;
        assert_eq!(error, Error::NotFound);
    }

    #[async_std::test]
    async fn cancelling_a_request_notifies_the_peer_and_closes_streams() {
        let f = fixture();
        let peer = PeerId::random();
        let root = test_utils::random_cid();

        let (out_progress, out_errors) = f
            .manager
            .send_request(peer, root, selector(), Vec::new())
            .await
            .unwrap();
        let (_, request) = assert_receive(&f.sent, "request sent").await;

        f.manager.cancel_request(request.id).await;

        let (to, cancel) = assert_receive(&f.sent, "cancel sent").await;
        assert_eq!(to, peer);
        assert_eq!(cancel.id, request.id);
        assert!(cancel.is_cancel);

        assert!(out_progress.recv().await.is_err(), "progress stream closes");
        assert!(out_errors.recv().await.is_err(), "error stream closes");
    }

    #[async_std::test]
    async fn remote_failure_fails_the_request() {
        let f = fixture();
        let peer = PeerId::random();
        let root = test_utils::random_cid();

        let (out_progress, out_errors) = f
            .manager
            .send_request(peer, root, selector(), Vec::new())
            .await
            .unwrap();
        let (_, request) = assert_receive(&f.sent, "request sent").await;

        f.manager
            .process_responses(
                peer,
                vec![GraphSyncResponse {
                    id: request.id,
                    status: ResponseStatusCode::RequestFailedContentNotFound,
                    extensions: Extensions::default(),
                }],
                Vec::new(),
            )
            .await;

        let error = assert_receive(&out_errors, "should surface the remote failure").await;
        assert_eq!(
            error,
            Error::RemoteRequestFailed(ResponseStatusCode::RequestFailedContentNotFound)
        );
        assert!(out_progress.recv().await.is_err(), "progress stream closes");
    }

    #[async_std::test]
    async fn responses_from_the_wrong_peer_are_ignored() {
        let f = fixture();
        let peer = PeerId::random();
        let other_peer = PeerId::random();
        let root = test_utils::random_cid();

        let (_out_progress, out_errors) = f
            .manager
            .send_request(peer, root, selector(), Vec::new())
            .await
            .unwrap();
        let (_, request) = assert_receive(&f.sent, "request sent").await;

        f.manager
            .process_responses(
                other_peer,
                vec![GraphSyncResponse {
                    id: request.id,
                    status: ResponseStatusCode::RequestFailedUnknown,
                    extensions: Extensions::default(),
                }],
                Vec::new(),
            )
            .await;
        f.manager.synchronize().await;

        // the request is still alive: a real response settles it
        f.manager
            .process_responses(
                peer,
                vec![GraphSyncResponse {
                    id: request.id,
                    status: ResponseStatusCode::RequestFailedUnknown,
                    extensions: Extensions::default(),
                }],
                Vec::new(),
            )
            .await;
        let error = assert_receive(&out_errors, "real failure arrives").await;
        assert_eq!(
            error,
            Error::RemoteRequestFailed(ResponseStatusCode::RequestFailedUnknown)
        );
    }

    #[async_std::test]
    async fn request_ids_are_unique_per_manager() {
        let f = fixture();
        let peer = PeerId::random();
        let root = test_utils::random_cid();

        let _streams1 = f
            .manager
            .send_request(peer, root, selector(), Vec::new())
            .await
            .unwrap();
        let _streams2 = f
            .manager
            .send_request(peer, root, selector(), Vec::new())
            .await
            .unwrap();

        let (_, first) = assert_receive(&f.sent, "first request").await;
        let (_, second) = assert_receive(&f.sent, "second request").await;
        assert_ne!(first.id, second.id);
    }

    #[async_std::test]
    async fn local_blocks_are_served_without_the_network() {
        let f = fixture();
        let peer = PeerId::random();
        let (root, cids) = test_utils::store_chain_dag(&f.store, 2);

        let (out_progress, out_errors) = f
            .manager
            .send_request(peer, root, selector(), Vec::new())
            .await
            .unwrap();
        let (_, request) = assert_receive(&f.sent, "request sent").await;

        // everything is local, so the traversal completes without any
        // blocks arriving over the network
        let _ = request;
        let mut nodes = 0;
        while out_progress.recv().await.is_ok() {
            nodes += 1;
        }
        assert_eq!(nodes, cids.len() * 2);
        assert!(out_errors.recv().await.is_err());
    }
}
