// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Asynchronous block loading for in-flight requests. A traversal asks for a
//! block by link; the loader tries the request's store first and otherwise
//! parks the load until the block arrives over the network or the request
//! terminates.
//!
//! All state lives on a single coordination task that owns the parked-load
//! table; the public methods only pass messages to it, so they are safe to
//! call from anywhere.

use crate::errors::Error;
use crate::store::{Loader, Storer};
use crate::{Block, Metadata, RequestID};
use async_std::channel::{bounded, Receiver, Sender};
use async_std::task;
use cid::Cid;
use fnv::{FnvHashMap, FnvHashSet};
use futures::channel::oneshot;
use log::warn;
use std::sync::Arc;

/// The one-shot outcome of an asynchronous block load.
pub type AsyncLoadResult = Result<Vec<u8>, Error>;

enum AsyncLoaderMessage {
    RegisterPersistenceOption {
        name: String,
        loader: Arc<dyn Loader>,
        storer: Arc<dyn Storer>,
        response: oneshot::Sender<Result<(), Error>>,
    },
    StartRequest {
        request_id: RequestID,
        persistence_option: String,
        response: oneshot::Sender<Result<(), Error>>,
    },
    ProcessResponse {
        responses: FnvHashMap<RequestID, Metadata>,
        blocks: Vec<Block>,
    },
    AsyncLoad {
        request_id: RequestID,
        link: Cid,
        response: oneshot::Sender<AsyncLoadResult>,
    },
    CompleteResponsesFor {
        request_id: RequestID,
    },
    CleanupRequest {
        request_id: RequestID,
    },
    Synchronize {
        response: oneshot::Sender<()>,
    },
}

/// Handle to the block-load coordination task.
#[derive(Clone)]
pub struct AsyncLoader {
    messages: Sender<AsyncLoaderMessage>,
}

impl AsyncLoader {
    /// Creates an async loader over the given default store and spawns its
    /// coordination task.
    pub fn new(loader: Arc<dyn Loader>, storer: Arc<dyn Storer>) -> Self {
        let (messages_tx, messages_rx) = bounded(16);
        let state = AsyncLoaderState::new(loader, storer, messages_rx);
        task::spawn(state.run());
        Self {
            messages: messages_tx,
        }
    }

    /// Adds a named loader/storer pair requests can be started against.
    pub async fn register_persistence_option(
        &self,
        name: &str,
        loader: Arc<dyn Loader>,
        storer: Arc<dyn Storer>,
    ) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.messages
            .send(AsyncLoaderMessage::RegisterPersistenceOption {
                name: name.to_owned(),
                loader,
                storer,
                response: tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Declares a request active and selects which named store serves it.
    /// The empty name selects the default store.
    pub async fn start_request(
        &self,
        request_id: RequestID,
        persistence_option: &str,
    ) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.messages
            .send(AsyncLoaderMessage::StartRequest {
                request_id,
                persistence_option: persistence_option.to_owned(),
                response: tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Ingests decoded response metadata and blocks: commits each block
    /// through the storer of every request whose metadata references it,
    /// then settles the affected pending loads.
    pub async fn process_response(
        &self,
        responses: FnvHashMap<RequestID, Metadata>,
        blocks: Vec<Block>,
    ) {
        let _ = self
            .messages
            .send(AsyncLoaderMessage::ProcessResponse { responses, blocks })
            .await;
    }

    /// Requests a block load. The returned receiver yields exactly one
    /// result once the load settles.
    pub async fn async_load(
        &self,
        request_id: RequestID,
        link: Cid,
    ) -> oneshot::Receiver<AsyncLoadResult> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .messages
            .send(AsyncLoaderMessage::AsyncLoad {
                request_id,
                link,
                response: tx,
            })
            .await;
        rx
    }

    /// Fails any still-pending loads for the request and forbids parking
    /// new ones. Loads that hit the store keep being served, and received
    /// metadata keeps answering for links the peer reported missing, until
    /// [`AsyncLoader::cleanup_request`] retires the request entirely.
    pub async fn complete_responses_for(&self, request_id: RequestID) {
        let _ = self
            .messages
            .send(AsyncLoaderMessage::CompleteResponsesFor { request_id })
            .await;
    }

    /// Drops all remaining state for a request whose traversal has ended.
    pub async fn cleanup_request(&self, request_id: RequestID) {
        let _ = self
            .messages
            .send(AsyncLoaderMessage::CleanupRequest { request_id })
            .await;
    }

    /// Waits until every message sent before this one has been handled.
    pub async fn synchronize(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .messages
            .send(AsyncLoaderMessage::Synchronize { response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

struct PersistenceOption {
    loader: Arc<dyn Loader>,
    storer: Arc<dyn Storer>,
}

struct AsyncLoaderState {
    messages: Receiver<AsyncLoaderMessage>,
    options: FnvHashMap<String, PersistenceOption>,
    /// Persistence option chosen by each started request.
    active_requests: FnvHashMap<RequestID, String>,
    terminated: FnvHashSet<RequestID>,
    parked: FnvHashMap<(RequestID, Cid), Vec<oneshot::Sender<AsyncLoadResult>>>,
    /// Present/absent bits already received per request, so loads issued
    /// after the response arrives settle without parking forever.
    metadata: FnvHashMap<RequestID, FnvHashMap<Cid, bool>>,
}

impl AsyncLoaderState {
    fn new(
        loader: Arc<dyn Loader>,
        storer: Arc<dyn Storer>,
        messages: Receiver<AsyncLoaderMessage>,
    ) -> Self {
        let mut options = FnvHashMap::default();
        options.insert(String::new(), PersistenceOption { loader, storer });
        Self {
            messages,
            options,
            active_requests: FnvHashMap::default(),
            terminated: FnvHashSet::default(),
            parked: FnvHashMap::default(),
            metadata: FnvHashMap::default(),
        }
    }

    async fn run(mut self) {
        while let Ok(message) = self.messages.recv().await {
            match message {
                AsyncLoaderMessage::RegisterPersistenceOption {
                    name,
                    loader,
                    storer,
                    response,
                } => {
                    let _ = response.send(self.register_option(name, loader, storer));
                }
                AsyncLoaderMessage::StartRequest {
                    request_id,
                    persistence_option,
                    response,
                } => {
                    let _ = response.send(self.start_request(request_id, persistence_option));
                }
                AsyncLoaderMessage::ProcessResponse { responses, blocks } => {
                    self.process_response(responses, blocks)
                }
                AsyncLoaderMessage::AsyncLoad {
                    request_id,
                    link,
                    response,
                } => self.attempt_load(request_id, link, response),
                AsyncLoaderMessage::CompleteResponsesFor { request_id } => {
                    self.complete_responses_for(request_id)
                }
                AsyncLoaderMessage::CleanupRequest { request_id } => {
                    self.cleanup_request(request_id)
                }
                AsyncLoaderMessage::Synchronize { response } => {
                    let _ = response.send(());
                }
            }
        }
    }

    fn register_option(
        &mut self,
        name: String,
        loader: Arc<dyn Loader>,
        storer: Arc<dyn Storer>,
    ) -> Result<(), Error> {
        if name.is_empty() || self.options.contains_key(&name) {
            return Err(Error::DuplicatePersistenceOption(name));
        }
        self.options.insert(name, PersistenceOption { loader, storer });
        Ok(())
    }

    fn start_request(
        &mut self,
        request_id: RequestID,
        persistence_option: String,
    ) -> Result<(), Error> {
        if !self.options.contains_key(&persistence_option) {
            return Err(Error::UnknownPersistenceOption(persistence_option));
        }
        self.active_requests.insert(request_id, persistence_option);
        Ok(())
    }

    fn option_for(&self, request_id: RequestID) -> &PersistenceOption {
        let name = self
            .active_requests
            .get(&request_id)
            .map(String::as_str)
            .unwrap_or("");
        // the default option is always registered
        self.options.get(name).unwrap_or_else(|| &self.options[""])
    }

    fn attempt_load(
        &mut self,
        request_id: RequestID,
        link: Cid,
        response: oneshot::Sender<AsyncLoadResult>,
    ) {
        // a response already told us this link is missing remotely
        if let Some(false) = self
            .metadata
            .get(&request_id)
            .and_then(|links| links.get(&link))
        {
            let _ = response.send(Err(Error::NotFound));
            return;
        }

        match self.option_for(request_id).loader.load(&link) {
            Ok(Some(data)) => {
                let _ = response.send(Ok(data));
            }
            Ok(None) => {
                if self.terminated.contains(&request_id) {
                    let _ = response.send(Err(Error::RequestTerminated));
                } else if self.active_requests.contains_key(&request_id) {
                    self.parked
                        .entry((request_id, link))
                        .or_default()
                        .push(response);
                } else {
                    let _ = response.send(Err(Error::RequestNotInProgress));
                }
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    fn process_response(&mut self, responses: FnvHashMap<RequestID, Metadata>, blocks: Vec<Block>) {
        let block_index: FnvHashMap<Cid, &[u8]> = blocks
            .iter()
            .map(|block| (block.cid, block.data.as_slice()))
            .collect();

        for (request_id, metadata) in responses {
            for item in &metadata {
                if item.block_is_present {
                    let data = match block_index.get(&item.link) {
                        Some(data) => *data,
                        // the block may arrive in a later message; any
                        // parked load stays parked
                        None => continue,
                    };
                    // the block is committed before any waiter is released,
                    // and a failed commit fails only this request's load
                    let result = match self.option_for(request_id).storer.store(&item.link, data) {
                        Ok(()) => Ok(data.to_vec()),
                        Err(e) => {
                            warn!(
                                "failed to store block {} for request {}: {}",
                                item.link, request_id, e
                            );
                            Err(e)
                        }
                    };
                    self.settle(request_id, &item.link, result);
                } else {
                    self.settle(request_id, &item.link, Err(Error::NotFound));
                }
            }
            let entry = self.metadata.entry(request_id).or_default();
            for item in metadata {
                entry.insert(item.link, item.block_is_present);
            }
        }
    }

    fn settle(&mut self, request_id: RequestID, link: &Cid, result: AsyncLoadResult) {
        if let Some(waiters) = self.parked.remove(&(request_id, *link)) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn complete_responses_for(&mut self, request_id: RequestID) {
        self.terminated.insert(request_id);
        let stale: Vec<_> = self
            .parked
            .keys()
            .filter(|(id, _)| *id == request_id)
            .cloned()
            .collect();
        for key in stale {
            if let Some(waiters) = self.parked.remove(&key) {
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::RequestTerminated));
                }
            }
        }
    }

    fn cleanup_request(&mut self, request_id: RequestID) {
        self.complete_responses_for(request_id);
        self.metadata.remove(&request_id);
        self.active_requests.remove(&request_id);
        self.terminated.remove(&request_id);
    }
}
