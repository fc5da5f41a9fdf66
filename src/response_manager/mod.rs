// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Responder half of the engine: accepts incoming requests, runs selector
//! traversals against local storage under a fair per-peer work queue, and
//! transmits results back through the peer response senders.
//!
//! A single event loop owns the in-progress response table and processes
//! typed messages from a bounded inbox; a fixed pool of worker tasks pops
//! queued queries and executes one traversal per task, talking to the event
//! loop only through that inbox.

mod link_tracker;
mod peer_response_sender;
mod query_queue;
mod response_builder;

pub use peer_response_sender::{
    PeerMessageHandler, PeerResponseManager, PeerResponseSender, PeerResponseTransaction,
};
pub use query_queue::{QueryQueue, Task};

use link_tracker::LinkTracker;
use response_builder::ResponseBuilder;

use crate::cid_set::decode_cid_set;
use crate::errors::Error;
use crate::hooks::{
    BlockHooks, CompletedListeners, HookError, RequestHookResult, RequestHooks, UpdateHookResult,
    UpdateHooks,
};
use crate::message::GraphSyncRequest;
use crate::store::Loader;
use crate::traversal::{dag_cbor_decoder, NodeDecoder, Traverser};
use crate::{Priority, RequestID, ResponseStatusCode, EXTENSION_DO_NOT_SEND_CIDS};
use async_std::channel::{bounded, Receiver, Sender};
use async_std::future::timeout;
use async_std::sync::Mutex;
use async_std::task;
use fnv::FnvHashMap;
use futures::channel::oneshot;
use libp2p::core::PeerId;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Number of worker tasks executing traversals concurrently.
const MAX_IN_PROCESS_REQUESTS: usize = 6;

/// How often idle workers thaw frozen peers in the query queue.
const THAW_SPEED: Duration = Duration::from_millis(100);

/// Work each worker asks the queue for per pop.
const TARGET_WORK: usize = 1;

/// Identifies one response among all peers' in-progress requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseKey {
    pub peer: PeerId,
    pub request_id: RequestID,
}

struct InProgressResponse {
    request: GraphSyncRequest,
    pause_signal: (Sender<()>, Receiver<()>),
    update_signal: (Sender<()>, Receiver<()>),
    cancel_signal: (Sender<()>, Receiver<()>),
    updates: Vec<GraphSyncRequest>,
    is_paused: bool,
    // set while the response is paused, so the traversal can resume where
    // it stopped
    loader: Option<Arc<dyn Loader>>,
    decoder: Option<NodeDecoder>,
    traverser: Option<Traverser>,
}

impl InProgressResponse {
    fn new(request: GraphSyncRequest) -> Self {
        Self {
            request,
            pause_signal: bounded(1),
            update_signal: bounded(1),
            cancel_signal: bounded(1),
            updates: Vec::new(),
            is_paused: false,
            loader: None,
            decoder: None,
            traverser: None,
        }
    }
}

/// Everything a worker needs to run one traversal.
struct ResponseTaskData {
    request: GraphSyncRequest,
    loader: Option<Arc<dyn Loader>>,
    decoder: Option<NodeDecoder>,
    traverser: Option<Traverser>,
    pause_signal: Receiver<()>,
    update_signal: Receiver<()>,
    cancel_signal: Receiver<()>,
}

enum TaskOutcome {
    Completed {
        status: ResponseStatusCode,
    },
    Failed {
        status: ResponseStatusCode,
        error: Error,
    },
    Paused {
        traverser: Traverser,
        loader: Arc<dyn Loader>,
        decoder: NodeDecoder,
    },
    Cancelled,
}

enum ResponseManagerMessage {
    ProcessRequests {
        peer: PeerId,
        requests: Vec<GraphSyncRequest>,
    },
    Pause {
        peer: PeerId,
        request_id: RequestID,
        response: oneshot::Sender<Result<(), Error>>,
    },
    Unpause {
        peer: PeerId,
        request_id: RequestID,
        response: oneshot::Sender<Result<(), Error>>,
    },
    TaskData {
        key: ResponseKey,
        response: oneshot::Sender<Option<ResponseTaskData>>,
    },
    FinishTask {
        key: ResponseKey,
        outcome: TaskOutcome,
    },
    Updates {
        key: ResponseKey,
        response: oneshot::Sender<Vec<GraphSyncRequest>>,
    },
    Synchronize {
        response: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handles incoming requests from the network, initiates selector
/// traversals, and transmits responses.
#[derive(Clone)]
pub struct ResponseManager {
    messages: Sender<ResponseManagerMessage>,
}

impl ResponseManager {
    /// Creates a response manager and spawns its event loop and workers.
    pub fn new(
        loader: Arc<dyn Loader>,
        peer_responses: Arc<PeerResponseManager>,
        request_hooks: Arc<dyn RequestHooks>,
        block_hooks: Arc<dyn BlockHooks>,
        update_hooks: Arc<dyn UpdateHooks>,
        completed_listeners: Arc<dyn CompletedListeners>,
    ) -> Self {
        let (messages_tx, messages_rx) = bounded(16);
        let (work_tx, work_rx) = bounded(1);
        let queue = Arc::new(Mutex::new(QueryQueue::new()));

        let worker_ctx = WorkerContext {
            messages: messages_tx.clone(),
            work_signal: work_rx,
            queue: queue.clone(),
            loader,
            peer_responses: peer_responses.clone(),
            request_hooks,
            block_hooks,
            update_hooks: update_hooks.clone(),
        };
        let event_loop = ResponseManagerLoop {
            messages: messages_rx,
            work_signal: work_tx,
            queue,
            peer_responses,
            update_hooks,
            completed_listeners,
            in_progress: FnvHashMap::default(),
        };
        task::spawn(event_loop.run(worker_ctx));

        Self {
            messages: messages_tx,
        }
    }

    /// Processes incoming requests for the given peer.
    pub async fn process_requests(&self, peer: PeerId, requests: Vec<GraphSyncRequest>) {
        let _ = self
            .messages
            .send(ResponseManagerMessage::ProcessRequests { peer, requests })
            .await;
    }

    /// Signals an in-progress response to pause at its next checkpoint.
    pub async fn pause_response(&self, peer: PeerId, request_id: RequestID) -> Result<(), Error> {
        self.roundtrip(|response| ResponseManagerMessage::Pause {
            peer,
            request_id,
            response,
        })
        .await
    }

    /// Requeues a previously paused response at maximum priority.
    pub async fn unpause_response(&self, peer: PeerId, request_id: RequestID) -> Result<(), Error> {
        self.roundtrip(|response| ResponseManagerMessage::Unpause {
            peer,
            request_id,
            response,
        })
        .await
    }

    /// Waits until every message sent before this one has been handled.
    pub async fn synchronize(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .messages
            .send(ResponseManagerMessage::Synchronize { response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Stops the event loop and its workers.
    pub async fn shutdown(&self) {
        let _ = self.messages.send(ResponseManagerMessage::Shutdown).await;
    }

    async fn roundtrip(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<(), Error>>) -> ResponseManagerMessage,
    ) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.messages
            .send(message(tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }
}

struct ResponseManagerLoop {
    messages: Receiver<ResponseManagerMessage>,
    work_signal: Sender<()>,
    queue: Arc<Mutex<QueryQueue>>,
    peer_responses: Arc<PeerResponseManager>,
    update_hooks: Arc<dyn UpdateHooks>,
    completed_listeners: Arc<dyn CompletedListeners>,
    in_progress: FnvHashMap<ResponseKey, InProgressResponse>,
}

impl ResponseManagerLoop {
    async fn run(mut self, worker_ctx: WorkerContext) {
        for _ in 0..MAX_IN_PROCESS_REQUESTS {
            task::spawn(run_worker(worker_ctx.clone()));
        }

        while let Ok(message) = self.messages.recv().await {
            match message {
                ResponseManagerMessage::ProcessRequests { peer, requests } => {
                    self.process_requests(peer, requests).await
                }
                ResponseManagerMessage::Pause {
                    peer,
                    request_id,
                    response,
                } => {
                    let _ = response.send(self.pause(peer, request_id));
                }
                ResponseManagerMessage::Unpause {
                    peer,
                    request_id,
                    response,
                } => {
                    let result = self.unpause(peer, request_id).await;
                    let _ = response.send(result);
                }
                ResponseManagerMessage::TaskData { key, response } => {
                    let _ = response.send(self.task_data(&key));
                }
                ResponseManagerMessage::FinishTask { key, outcome } => {
                    self.finish_task(&key, outcome)
                }
                ResponseManagerMessage::Updates { key, response } => {
                    let _ = response.send(self.take_updates(&key));
                }
                ResponseManagerMessage::Synchronize { response } => {
                    let _ = response.send(());
                }
                ResponseManagerMessage::Shutdown => break,
            }
        }
        // dropping the work signal sender stops idle workers
    }

    async fn process_requests(&mut self, peer: PeerId, requests: Vec<GraphSyncRequest>) {
        for request in requests {
            let key = ResponseKey {
                peer,
                request_id: request.id,
            };
            if request.is_cancel {
                self.queue.lock().await.remove(&key, peer);
                if let Some(response) = self.in_progress.remove(&key) {
                    let _ = response.cancel_signal.0.try_send(());
                    // tell the peer the response ended; delivery runs
                    // detached so a stalled transport cannot block the loop
                    let peer_responses = self.peer_responses.clone();
                    let request_id = request.id;
                    task::spawn(async move {
                        let sender = peer_responses.sender_for_peer(&peer).await;
                        {
                            let mut sender = sender.lock().await;
                            sender.transaction(request_id, |t| {
                                t.finish_with_error(ResponseStatusCode::RequestCancelled)
                            });
                        }
                        if let Err(e) = peer_responses.flush(&peer).await {
                            warn!("failed to send cancellation to peer {}: {}", peer, e);
                        }
                    });
                }
                continue;
            }
            if request.is_update {
                self.process_update(key, request).await;
                continue;
            }
            let priority = request.priority;
            self.in_progress
                .insert(key.clone(), InProgressResponse::new(request));
            self.queue.lock().await.push_tasks(
                peer,
                vec![Task {
                    topic: key,
                    priority,
                    work: 1,
                }],
            );
            let _ = self.work_signal.try_send(());
        }
    }

    async fn process_update(&mut self, key: ResponseKey, update: GraphSyncRequest) {
        let response = match self.in_progress.get_mut(&key) {
            Some(response) => response,
            None => {
                warn!(
                    "received update for non existent request, peer {} request id {}",
                    key.peer, key.request_id
                );
                return;
            }
        };
        if !response.is_paused {
            response.updates.push(update);
            let _ = response.update_signal.0.try_send(());
            return;
        }

        // the response is paused, so no worker owns it; run the update hooks
        // here and emit their output directly
        let UpdateHookResult {
            extensions,
            unpause,
            err,
        } = self
            .update_hooks
            .process_update_hooks(&key.peer, &response.request, &update);
        let failed = err.is_some();

        let peer_responses = self.peer_responses.clone();
        let peer = key.peer;
        let request_id = key.request_id;
        task::spawn(async move {
            let sender = peer_responses.sender_for_peer(&peer).await;
            {
                let mut sender = sender.lock().await;
                sender.transaction(request_id, |t| {
                    for extension in extensions {
                        t.send_extension_data(extension);
                    }
                    if failed {
                        t.finish_with_error(ResponseStatusCode::RequestFailedUnknown);
                    }
                });
            }
            if let Err(e) = peer_responses.flush(&peer).await {
                warn!("failed to flush update for peer {}: {}", peer, e);
            }
        });

        if failed {
            self.in_progress.remove(&key);
            return;
        }
        if unpause {
            if let Err(e) = self.unpause(key.peer, key.request_id).await {
                warn!("error unpausing request: {}", e);
            }
        }
    }

    fn pause(&mut self, peer: PeerId, request_id: RequestID) -> Result<(), Error> {
        let key = ResponseKey { peer, request_id };
        match self.in_progress.get(&key) {
            None => Err(Error::RequestNotInProgress),
            Some(response) if response.is_paused => Err(Error::AlreadyPaused),
            Some(response) => {
                let _ = response.pause_signal.0.try_send(());
                Ok(())
            }
        }
    }

    async fn unpause(&mut self, peer: PeerId, request_id: RequestID) -> Result<(), Error> {
        let key = ResponseKey { peer, request_id };
        match self.in_progress.get_mut(&key) {
            None => Err(Error::RequestNotInProgress),
            Some(response) if !response.is_paused => Err(Error::NotPaused),
            Some(response) => {
                response.is_paused = false;
                self.queue.lock().await.push_tasks(
                    peer,
                    vec![Task {
                        topic: key,
                        priority: Priority::MAX,
                        work: 1,
                    }],
                );
                let _ = self.work_signal.try_send(());
                Ok(())
            }
        }
    }

    fn task_data(&mut self, key: &ResponseKey) -> Option<ResponseTaskData> {
        self.in_progress.get_mut(key).map(|response| ResponseTaskData {
            request: response.request.clone(),
            loader: response.loader.take(),
            decoder: response.decoder.take(),
            traverser: response.traverser.take(),
            pause_signal: response.pause_signal.1.clone(),
            update_signal: response.update_signal.1.clone(),
            cancel_signal: response.cancel_signal.1.clone(),
        })
    }

    fn finish_task(&mut self, key: &ResponseKey, outcome: TaskOutcome) {
        if !self.in_progress.contains_key(key) {
            return;
        }
        match outcome {
            TaskOutcome::Paused {
                traverser,
                loader,
                decoder,
            } => {
                if let Some(response) = self.in_progress.get_mut(key) {
                    response.is_paused = true;
                    response.traverser = Some(traverser);
                    response.loader = Some(loader);
                    response.decoder = Some(decoder);
                }
            }
            TaskOutcome::Completed { status } => {
                if let Some(response) = self.in_progress.remove(key) {
                    self.completed_listeners.notify_completed_listeners(
                        &key.peer,
                        &response.request,
                        status,
                    );
                }
            }
            TaskOutcome::Failed { status, error } => {
                info!("response failed: {}", error);
                if let Some(response) = self.in_progress.remove(key) {
                    self.completed_listeners.notify_completed_listeners(
                        &key.peer,
                        &response.request,
                        status,
                    );
                }
            }
            TaskOutcome::Cancelled => {
                self.in_progress.remove(key);
            }
        }
    }

    fn take_updates(&mut self, key: &ResponseKey) -> Vec<GraphSyncRequest> {
        match self.in_progress.get_mut(key) {
            Some(response) => std::mem::take(&mut response.updates),
            None => Vec::new(),
        }
    }
}

#[derive(Clone)]
struct WorkerContext {
    messages: Sender<ResponseManagerMessage>,
    work_signal: Receiver<()>,
    queue: Arc<Mutex<QueryQueue>>,
    loader: Arc<dyn Loader>,
    peer_responses: Arc<PeerResponseManager>,
    request_hooks: Arc<dyn RequestHooks>,
    block_hooks: Arc<dyn BlockHooks>,
    update_hooks: Arc<dyn UpdateHooks>,
}

async fn run_worker(ctx: WorkerContext) {
    loop {
        let popped = { ctx.queue.lock().await.pop_tasks(TARGET_WORK) };
        let (_, tasks) = match popped {
            Some(popped) => popped,
            None => {
                match timeout(THAW_SPEED, ctx.work_signal.recv()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return, // manager shut down
                    Err(_) => ctx.queue.lock().await.thaw_round(),
                }
                continue;
            }
        };
        for task in tasks {
            let key = task.topic;
            let (tx, rx) = oneshot::channel();
            let message = ResponseManagerMessage::TaskData {
                key: key.clone(),
                response: tx,
            };
            if ctx.messages.send(message).await.is_err() {
                return;
            }
            let data = match rx.await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    info!("empty task on peer request stack");
                    continue;
                }
                Err(_) => return,
            };
            let outcome = execute_task(&ctx, &key, data).await;
            let message = ResponseManagerMessage::FinishTask { key, outcome };
            if ctx.messages.send(message).await.is_err() {
                return;
            }
        }
    }
}

async fn execute_task(ctx: &WorkerContext, key: &ResponseKey, data: ResponseTaskData) -> TaskOutcome {
    let (loader, decoder, traverser) = match (data.loader, data.decoder, data.traverser) {
        (Some(loader), Some(decoder), Some(traverser)) => (loader, decoder, traverser),
        _ => match prepare_query(ctx, key, &data.request).await {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        },
    };
    execute_query(
        ctx,
        key,
        &data.request,
        loader,
        decoder,
        traverser,
        data.pause_signal,
        data.update_signal,
        data.cancel_signal,
    )
    .await
}

/// Runs request hooks and builds the traversal for a request's first
/// execution. On failure the terminal status has already been emitted.
async fn prepare_query(
    ctx: &WorkerContext,
    key: &ResponseKey,
    request: &GraphSyncRequest,
) -> Result<(Arc<dyn Loader>, NodeDecoder, Traverser), TaskOutcome> {
    let RequestHookResult {
        is_validated,
        extensions,
        custom_loader,
        custom_decoder,
        err,
    } = ctx.request_hooks.process_request_hooks(&key.peer, request);
    let validated = is_validated && err.is_none();

    let sender = ctx.peer_responses.sender_for_peer(&key.peer).await;
    {
        let mut sender = sender.lock().await;
        sender.transaction(request.id, |t| {
            for extension in extensions {
                t.send_extension_data(extension);
            }
            if !validated {
                t.finish_with_error(ResponseStatusCode::RequestFailedUnknown);
            }
        });
    }
    if !validated {
        flush_or_warn(ctx, &key.peer).await;
        return Err(TaskOutcome::Failed {
            status: ResponseStatusCode::RequestFailedUnknown,
            error: Error::RequestRejected,
        });
    }

    if let Some(raw) = request.extension(EXTENSION_DO_NOT_SEND_CIDS) {
        match decode_cid_set(raw) {
            Ok(cids) => {
                let mut sender = sender.lock().await;
                sender.ignore_blocks(request.id, cids);
            }
            Err(error) => {
                return Err(fail_query(ctx, key, request.id, &sender, error).await);
            }
        }
    }

    let root = match request.root {
        Some(root) => root,
        None => {
            let error = Error::Protocol("request has no root".to_owned());
            return Err(fail_query(ctx, key, request.id, &sender, error).await);
        }
    };
    let selector = match request.selector.clone() {
        Some(selector) => selector,
        None => {
            let error = Error::Protocol("request has no selector".to_owned());
            return Err(fail_query(ctx, key, request.id, &sender, error).await);
        }
    };

    let decoder = custom_decoder.unwrap_or_else(dag_cbor_decoder);
    let loader = custom_loader.unwrap_or_else(|| ctx.loader.clone());
    let traverser = Traverser::with_decoder(root, selector, decoder.clone());
    Ok((loader, decoder, traverser))
}

enum Checkpoint {
    Continue,
    Paused,
    Cancelled,
    Failed(Error),
}

#[allow(clippy::too_many_arguments)]
async fn execute_query(
    ctx: &WorkerContext,
    key: &ResponseKey,
    request: &GraphSyncRequest,
    loader: Arc<dyn Loader>,
    decoder: NodeDecoder,
    mut traverser: Traverser,
    pause_signal: Receiver<()>,
    update_signal: Receiver<()>,
    cancel_signal: Receiver<()>,
) -> TaskOutcome {
    let sender = ctx.peer_responses.sender_for_peer(&key.peer).await;
    let mut root_missing = false;

    loop {
        let link = match traverser.current_link() {
            Some(link) => link,
            None => break,
        };

        match check_signals(
            ctx,
            key,
            request,
            &pause_signal,
            &update_signal,
            &cancel_signal,
            &sender,
        )
        .await
        {
            Checkpoint::Continue => {}
            Checkpoint::Paused => {
                {
                    let mut sender = sender.lock().await;
                    sender.transaction(request.id, |t| t.pause_request());
                }
                if let Err(error) = ctx.peer_responses.flush(&key.peer).await {
                    return TaskOutcome::Failed {
                        status: ResponseStatusCode::RequestFailedUnknown,
                        error,
                    };
                }
                return TaskOutcome::Paused {
                    traverser,
                    loader,
                    decoder,
                };
            }
            Checkpoint::Cancelled => return TaskOutcome::Cancelled,
            Checkpoint::Failed(error) => {
                return fail_query(ctx, key, request.id, &sender, error).await
            }
        }

        let data = match loader.load(&link) {
            Ok(data) => data,
            Err(error) => return fail_query(ctx, key, request.id, &sender, error).await,
        };
        // the root link can only ever be requested as the traversal's first
        // block, so a miss on it means there is nothing to serve at all
        if data.is_none() && request.root == Some(link) {
            root_missing = true;
        }

        let mut hook_pause = false;
        let mut hook_failure = None;
        {
            let mut sender = sender.lock().await;
            sender.transaction(request.id, |t| {
                let block_data = t.send_response(link, data.clone());
                if block_data.block_size > 0 {
                    let result =
                        ctx.block_hooks
                            .process_block_hooks(&key.peer, request, &block_data);
                    for extension in result.extensions {
                        t.send_extension_data(extension);
                    }
                    match result.err {
                        Some(HookError::Paused) => {
                            t.pause_request();
                            hook_pause = true;
                        }
                        Some(HookError::Other(message)) => hook_failure = Some(message),
                        None => {}
                    }
                }
            });
        }
        if let Some(message) = hook_failure {
            return fail_query(ctx, key, request.id, &sender, Error::Hook(message)).await;
        }
        if hook_pause {
            if let Err(error) = ctx.peer_responses.flush(&key.peer).await {
                return TaskOutcome::Failed {
                    status: ResponseStatusCode::RequestFailedUnknown,
                    error,
                };
            }
            return TaskOutcome::Paused {
                traverser,
                loader,
                decoder,
            };
        }

        match data {
            Some(bytes) => {
                if let Err(error) = traverser.advance(&bytes) {
                    return fail_query(ctx, key, request.id, &sender, error).await;
                }
            }
            None => traverser.skip_current(),
        }
        // the responder derives everything it sends from the block loads;
        // per-node progress is only consumed on the requesting side
        while traverser.pop_progress().is_some() {}
    }

    let status = {
        let mut sender = sender.lock().await;
        if root_missing {
            let status = ResponseStatusCode::RequestFailedContentNotFound;
            sender.transaction(request.id, |t| t.finish_with_error(status));
            status
        } else {
            let mut status = ResponseStatusCode::RequestFailedUnknown;
            sender.transaction(request.id, |t| status = t.finish_request());
            status
        }
    };
    if let Err(error) = ctx.peer_responses.flush(&key.peer).await {
        return TaskOutcome::Failed {
            status: ResponseStatusCode::RequestFailedUnknown,
            error,
        };
    }
    TaskOutcome::Completed { status }
}

/// Checks the pause/update/cancel signals at a traversal checkpoint,
/// draining queued updates through the update hooks.
async fn check_signals(
    ctx: &WorkerContext,
    key: &ResponseKey,
    request: &GraphSyncRequest,
    pause_signal: &Receiver<()>,
    update_signal: &Receiver<()>,
    cancel_signal: &Receiver<()>,
    sender: &Arc<Mutex<PeerResponseSender>>,
) -> Checkpoint {
    loop {
        if cancel_signal.try_recv().is_ok() {
            return Checkpoint::Cancelled;
        }
        if pause_signal.try_recv().is_ok() {
            return Checkpoint::Paused;
        }
        if update_signal.try_recv().is_ok() {
            let (tx, rx) = oneshot::channel();
            let message = ResponseManagerMessage::Updates {
                key: key.clone(),
                response: tx,
            };
            if ctx.messages.send(message).await.is_err() {
                return Checkpoint::Cancelled;
            }
            let updates = match rx.await {
                Ok(updates) => updates,
                Err(_) => return Checkpoint::Cancelled,
            };
            for update in updates {
                let UpdateHookResult {
                    extensions,
                    unpause: _,
                    err,
                } = ctx
                    .update_hooks
                    .process_update_hooks(&key.peer, request, &update);
                if !extensions.is_empty() {
                    let mut sender = sender.lock().await;
                    sender.transaction(request.id, |t| {
                        for extension in extensions {
                            t.send_extension_data(extension);
                        }
                    });
                }
                match err {
                    Some(HookError::Paused) => return Checkpoint::Paused,
                    Some(HookError::Other(message)) => {
                        return Checkpoint::Failed(Error::Hook(message))
                    }
                    None => {}
                }
            }
            continue;
        }
        return Checkpoint::Continue;
    }
}

/// Finishes a request with `RequestFailedUnknown` and reports the error.
async fn fail_query(
    ctx: &WorkerContext,
    key: &ResponseKey,
    request_id: RequestID,
    sender: &Arc<Mutex<PeerResponseSender>>,
    error: Error,
) -> TaskOutcome {
    {
        let mut sender = sender.lock().await;
        sender.transaction(request_id, |t| {
            t.finish_with_error(ResponseStatusCode::RequestFailedUnknown)
        });
    }
    flush_or_warn(ctx, &key.peer).await;
    TaskOutcome::Failed {
        status: ResponseStatusCode::RequestFailedUnknown,
        error,
    }
}

async fn flush_or_warn(ctx: &WorkerContext, peer: &PeerId) {
    if let Err(e) = ctx.peer_responses.flush(peer).await {
        warn!("failed to flush responses for peer {}: {}", peer, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::BlockHookResult;
    use crate::message::GraphSyncMessage;
    use crate::selector::{explore_all_recursively, RecursionLimit};
    use crate::test_utils::{
        self, assert_receive, CaptureMessageHandler, RecordingListener, StubHooks,
    };
    use crate::{encode_cid_set, Extensions, MemoryStore, MetadataItem, EXTENSION_METADATA};
    use fnv::FnvHashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        manager: ResponseManager,
        handler: Arc<CaptureMessageHandler>,
        listener: Arc<RecordingListener>,
        hooks: Arc<StubHooks>,
        store: MemoryStore,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let handler = Arc::new(CaptureMessageHandler::new());
        let listener = Arc::new(RecordingListener::new());
        let hooks = Arc::new(StubHooks::new());
        let peer_responses = Arc::new(PeerResponseManager::new(handler.clone()));
        let manager = ResponseManager::new(
            Arc::new(store.clone()),
            peer_responses,
            hooks.clone(),
            hooks.clone(),
            hooks.clone(),
            listener.clone(),
        );
        Fixture {
            manager,
            handler,
            listener,
            hooks,
            store,
        }
    }

    fn new_request(id: RequestID, root: cid::Cid) -> GraphSyncRequest {
        GraphSyncRequest::new(
            id,
            root,
            explore_all_recursively(RecursionLimit::None),
            0,
            Extensions::default(),
        )
    }

    fn decode_metadata(message: &GraphSyncMessage, id: RequestID) -> Vec<MetadataItem> {
        let response = message
            .responses
            .iter()
            .find(|r| r.id == id)
            .expect("response for request");
        serde_ipld_dagcbor::from_slice(response.extension(EXTENSION_METADATA).unwrap()).unwrap()
    }

    /// Resumes a response, retrying while the pause is still being recorded
    /// by the event loop.
    async fn unpause_when_ready(manager: &ResponseManager, peer: PeerId, id: RequestID) {
        for _ in 0..100 {
            match manager.unpause_response(peer, id).await {
                Ok(()) => return,
                Err(Error::NotPaused) => task::sleep(Duration::from_millis(10)).await,
                Err(e) => panic!("unpause failed: {}", e),
            }
        }
        panic!("response never paused");
    }

    /// Waits out the worker's finish-task message so the event loop has
    /// recorded the latest task outcome.
    async fn settle(manager: &ResponseManager) {
        task::sleep(Duration::from_millis(50)).await;
        manager.synchronize().await;
    }

    #[async_std::test]
    async fn completes_a_request_in_full() {
        let f = fixture();
        let peer = PeerId::random();
        let (root, cids) = test_utils::store_chain_dag(&f.store, 3);

        f.manager
            .process_requests(peer, vec![new_request(1, root)])
            .await;

        let (to, message) = assert_receive(&f.handler.sent, "should send a response").await;
        assert_eq!(to, peer);
        assert_eq!(message.responses.len(), 1);
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestCompletedFull
        );
        let metadata = decode_metadata(&message, 1);
        let visited: Vec<_> = metadata.iter().map(|item| item.link).collect();
        assert_eq!(visited, cids);
        assert!(metadata.iter().all(|item| item.block_is_present));
        assert_eq!(message.blocks.len(), 3);

        let (_, id, status) = assert_receive(&f.listener.completed, "should notify").await;
        assert_eq!(id, 1);
        assert_eq!(status, ResponseStatusCode::RequestCompletedFull);
    }

    #[async_std::test]
    async fn missing_blocks_complete_partially() {
        let f = fixture();
        let peer = PeerId::random();
        let (root, cids) = test_utils::store_chain_dag(&f.store, 3);
        // drop the middle block so its subtree cannot be served
        test_utils::remove_block(&f.store, &cids[1]);

        f.manager
            .process_requests(peer, vec![new_request(1, root)])
            .await;

        let (_, message) = assert_receive(&f.handler.sent, "should send a response").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestCompletedPartial
        );
        assert_eq!(
            decode_metadata(&message, 1),
            vec![
                MetadataItem {
                    link: cids[0],
                    block_is_present: true
                },
                MetadataItem {
                    link: cids[1],
                    block_is_present: false
                },
            ]
        );
        assert_eq!(message.blocks.len(), 1);
    }

    #[async_std::test]
    async fn missing_root_fails_with_content_not_found() {
        let f = fixture();
        let peer = PeerId::random();
        let root = test_utils::random_cid();

        f.manager
            .process_requests(peer, vec![new_request(1, root)])
            .await;

        let (_, message) = assert_receive(&f.handler.sent, "should send a response").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestFailedContentNotFound
        );
        let (_, _, status) = assert_receive(&f.listener.completed, "should notify").await;
        assert_eq!(status, ResponseStatusCode::RequestFailedContentNotFound);
    }

    #[async_std::test]
    async fn unvalidated_requests_are_rejected() {
        let f = fixture();
        f.hooks.set_validated(false);
        let peer = PeerId::random();
        let (root, _) = test_utils::store_chain_dag(&f.store, 2);

        f.manager
            .process_requests(peer, vec![new_request(1, root)])
            .await;

        let (_, message) = assert_receive(&f.handler.sent, "should send a rejection").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestFailedUnknown
        );
        assert!(message.blocks.is_empty());

        let (_, _, status) = assert_receive(&f.listener.completed, "should notify").await;
        assert_eq!(status, ResponseStatusCode::RequestFailedUnknown);
    }

    #[async_std::test]
    async fn do_not_send_cids_suppresses_block_bytes() {
        let f = fixture();
        let peer = PeerId::random();
        let (root, cids) = test_utils::store_chain_dag(&f.store, 3);

        let mut dont_send = FnvHashSet::default();
        dont_send.insert(cids[1]);
        let mut request = new_request(1, root);
        request.extensions.insert(
            crate::EXTENSION_DO_NOT_SEND_CIDS.to_owned(),
            encode_cid_set(&dont_send).unwrap(),
        );

        f.manager.process_requests(peer, vec![request]).await;

        let (_, message) = assert_receive(&f.handler.sent, "should send a response").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestCompletedFull
        );
        // every link is present in the metadata, but the ignored block's
        // bytes are not transmitted
        assert!(decode_metadata(&message, 1)
            .iter()
            .all(|item| item.block_is_present));
        let sent: Vec<_> = message.blocks.iter().map(|b| b.cid).collect();
        assert_eq!(sent, vec![cids[0], cids[2]]);
    }

    #[async_std::test]
    async fn pause_and_resume_completes_with_the_same_results() {
        let f = fixture();
        let peer = PeerId::random();
        let (root, cids) = test_utils::store_chain_dag(&f.store, 3);

        // pause after the first block via the block hooks
        let sent_count = Arc::new(AtomicUsize::new(0));
        let counter = sent_count.clone();
        f.hooks.set_block_hook(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                BlockHookResult {
                    err: Some(HookError::Paused),
                    ..Default::default()
                }
            } else {
                BlockHookResult::default()
            }
        });

        f.manager
            .process_requests(peer, vec![new_request(1, root)])
            .await;

        let (_, message) = assert_receive(&f.handler.sent, "should send the paused head").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestPaused
        );
        let first_metadata = decode_metadata(&message, 1);
        assert_eq!(first_metadata.len(), 1);
        assert_eq!(first_metadata[0].link, cids[0]);

        // resuming picks the traversal up where it stopped
        unpause_when_ready(&f.manager, peer, 1).await;

        let (_, message) = assert_receive(&f.handler.sent, "should send the rest").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestCompletedFull
        );
        let rest_metadata = decode_metadata(&message, 1);
        let all_links: Vec<_> = first_metadata
            .iter()
            .chain(rest_metadata.iter())
            .map(|item| item.link)
            .collect();
        assert_eq!(all_links, cids);

        let (_, _, status) = assert_receive(&f.listener.completed, "should notify").await;
        assert_eq!(status, ResponseStatusCode::RequestCompletedFull);
    }

    #[async_std::test]
    async fn cancellation_ends_a_paused_response() {
        let f = fixture();
        let peer = PeerId::random();
        let (root, _) = test_utils::store_chain_dag(&f.store, 3);

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        f.hooks.set_block_hook(move |_, _, _| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                BlockHookResult {
                    err: Some(HookError::Paused),
                    ..Default::default()
                }
            } else {
                BlockHookResult::default()
            }
        });

        f.manager
            .process_requests(peer, vec![new_request(1, root)])
            .await;
        let (_, message) = assert_receive(&f.handler.sent, "should pause").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestPaused
        );

        settle(&f.manager).await;
        f.manager
            .process_requests(peer, vec![GraphSyncRequest::cancel(1)])
            .await;

        let (_, message) = assert_receive(&f.handler.sent, "should confirm cancellation").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestCancelled
        );

        // the request is gone, so it can no longer be resumed
        f.manager.synchronize().await;
        assert_eq!(
            f.manager.unpause_response(peer, 1).await,
            Err(Error::RequestNotInProgress)
        );
    }

    #[async_std::test]
    async fn update_hooks_can_unpause_a_response() {
        let f = fixture();
        let peer = PeerId::random();
        let (root, cids) = test_utils::store_chain_dag(&f.store, 2);

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        f.hooks.set_block_hook(move |_, _, _| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                BlockHookResult {
                    err: Some(HookError::Paused),
                    ..Default::default()
                }
            } else {
                BlockHookResult::default()
            }
        });
        f.hooks.set_update_unpause(true);

        f.manager
            .process_requests(peer, vec![new_request(1, root)])
            .await;
        let (_, message) = assert_receive(&f.handler.sent, "should pause").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestPaused
        );

        settle(&f.manager).await;
        f.manager
            .process_requests(peer, vec![GraphSyncRequest::update(1, Extensions::default())])
            .await;

        let (_, message) = assert_receive(&f.handler.sent, "should finish after update").await;
        assert_eq!(
            message.responses[0].status,
            ResponseStatusCode::RequestCompletedFull
        );
        let metadata = decode_metadata(&message, 1);
        assert_eq!(metadata.last().unwrap().link, *cids.last().unwrap());
    }

    #[async_std::test]
    async fn responses_share_blocks_within_a_peer() {
        let f = fixture();
        let peer = PeerId::random();
        let (root, cids) = test_utils::store_chain_dag(&f.store, 2);

        f.manager
            .process_requests(peer, vec![new_request(1, root)])
            .await;
        let (_, first) = assert_receive(&f.handler.sent, "first response").await;
        assert_eq!(first.blocks.len(), 2);

        // second request for the same root, while nothing else is in
        // progress for this peer, resends the blocks
        f.manager
            .process_requests(peer, vec![new_request(2, root)])
            .await;
        let (_, second) = assert_receive(&f.handler.sent, "second response").await;
        assert_eq!(
            decode_metadata(&second, 2).len(),
            cids.len(),
            "metadata covers the whole traversal"
        );
        assert_eq!(second.blocks.len(), 2);
    }
}
