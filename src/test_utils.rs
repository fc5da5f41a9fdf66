// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared helpers for the crate's tests.

use crate::errors::Error;
use crate::hooks::{
    BlockHookResult, BlockHooks, CompletedListeners, RequestHookResult, RequestHooks,
    UpdateHookResult, UpdateHooks,
};
use crate::message::{GraphSyncMessage, GraphSyncRequest, GraphSyncResponse};
use crate::response_manager::PeerMessageHandler;
use crate::store::{Loader, MemoryStore, Storer};
use crate::{Block, BlockData, Ipld, RequestID, ResponseStatusCode};
use async_std::channel::{unbounded, Receiver, Sender};
use async_std::future::timeout;
use async_trait::async_trait;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use libp2p::core::PeerId;
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DAG_CBOR: u64 = 0x71;

pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut data = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

pub fn cid_for(data: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(data))
}

pub fn random_cid() -> Cid {
    cid_for(&random_bytes(32))
}

pub fn random_blocks(n: usize, size: usize) -> Vec<Block> {
    (0..n)
        .map(|_| {
            let data = random_bytes(size);
            Block::new(cid_for(&data), data)
        })
        .collect()
}

pub fn random_peers(n: usize) -> Vec<PeerId> {
    (0..n).map(|_| PeerId::random()).collect()
}

/// Stores a linked list of dag-cbor blocks (each a map with a `value` entry
/// and a `next` link) and returns the root plus every cid in traversal
/// order.
pub fn store_chain_dag(store: &dyn Storer, length: usize) -> (Cid, Vec<Cid>) {
    assert!(length > 0);
    let mut next = None;
    let mut cids = Vec::new();
    for i in (0..length).rev() {
        let mut map = BTreeMap::new();
        map.insert("value".to_owned(), Ipld::Integer(i as i128));
        if let Some(link) = next {
            map.insert("next".to_owned(), Ipld::Link(link));
        }
        let data = serde_ipld_dagcbor::to_vec(&Ipld::Map(map)).unwrap();
        let cid = cid_for(&data);
        store.store(&cid, &data).unwrap();
        next = Some(cid);
        cids.push(cid);
    }
    cids.reverse();
    (cids[0], cids)
}

pub fn remove_block(store: &MemoryStore, link: &Cid) {
    store.remove(link);
}

/// An in-memory store that counts successful local loads and can be told to
/// fail commits.
#[derive(Clone, Default)]
pub struct CountingStore {
    inner: MemoryStore,
    loads: Arc<AtomicUsize>,
    fail_stores: Arc<AtomicBool>,
}

impl CountingStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn seed(&self, block: &Block) {
        self.inner.store(&block.cid, &block.data).unwrap();
    }

    pub fn local_loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn contains(&self, link: &Cid) -> bool {
        self.inner.contains(link)
    }

    pub fn fail_stores(&self) {
        self.fail_stores.store(true, Ordering::SeqCst);
    }
}

impl Loader for CountingStore {
    fn load(&self, link: &Cid) -> Result<Option<Vec<u8>>, Error> {
        let result = self.inner.load(link)?;
        if result.is_some() {
            self.loads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(result)
    }
}

impl Storer for CountingStore {
    fn store(&self, link: &Cid, data: &[u8]) -> Result<(), Error> {
        if self.fail_stores.load(Ordering::SeqCst) {
            return Err(Error::Store("store is failing commits".to_owned()));
        }
        self.inner.store(link, data)
    }
}

/// Captures everything a peer response sender flushes, as whole messages.
pub struct CaptureMessageHandler {
    sender: Sender<(PeerId, GraphSyncMessage)>,
    pub sent: Receiver<(PeerId, GraphSyncMessage)>,
}

impl CaptureMessageHandler {
    pub fn new() -> Self {
        let (sender, sent) = unbounded();
        Self { sender, sent }
    }
}

#[async_trait]
impl PeerMessageHandler for CaptureMessageHandler {
    async fn send_response(
        &self,
        peer: &PeerId,
        responses: Vec<GraphSyncResponse>,
        blocks: Vec<Block>,
    ) -> Result<(), Error> {
        let mut message = GraphSyncMessage::new();
        message.responses = responses;
        message.blocks = blocks;
        let _ = self.sender.try_send((*peer, message));
        Ok(())
    }
}

/// Records completed-response notifications.
pub struct RecordingListener {
    sender: Sender<(PeerId, RequestID, ResponseStatusCode)>,
    pub completed: Receiver<(PeerId, RequestID, ResponseStatusCode)>,
}

impl RecordingListener {
    pub fn new() -> Self {
        let (sender, completed) = unbounded();
        Self { sender, completed }
    }
}

impl CompletedListeners for RecordingListener {
    fn notify_completed_listeners(
        &self,
        peer: &PeerId,
        request: &GraphSyncRequest,
        status: ResponseStatusCode,
    ) {
        let _ = self.sender.try_send((*peer, request.id, status));
    }
}

type BlockHookFn = Box<dyn Fn(&PeerId, &GraphSyncRequest, &BlockData) -> BlockHookResult + Send + Sync>;

/// Configurable hook registry standing in for an application's hooks.
pub struct StubHooks {
    validated: AtomicBool,
    block_hook: Mutex<Option<BlockHookFn>>,
    update_unpause: AtomicBool,
}

impl StubHooks {
    pub fn new() -> Self {
        Self {
            validated: AtomicBool::new(true),
            block_hook: Mutex::new(None),
            update_unpause: AtomicBool::new(false),
        }
    }

    pub fn set_validated(&self, validated: bool) {
        self.validated.store(validated, Ordering::SeqCst);
    }

    pub fn set_block_hook(
        &self,
        hook: impl Fn(&PeerId, &GraphSyncRequest, &BlockData) -> BlockHookResult
            + Send
            + Sync
            + 'static,
    ) {
        *self.block_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_update_unpause(&self, unpause: bool) {
        self.update_unpause.store(unpause, Ordering::SeqCst);
    }
}

impl RequestHooks for StubHooks {
    fn process_request_hooks(
        &self,
        _peer: &PeerId,
        _request: &GraphSyncRequest,
    ) -> RequestHookResult {
        RequestHookResult {
            is_validated: self.validated.load(Ordering::SeqCst),
            ..Default::default()
        }
    }
}

impl BlockHooks for StubHooks {
    fn process_block_hooks(
        &self,
        peer: &PeerId,
        request: &GraphSyncRequest,
        block: &BlockData,
    ) -> BlockHookResult {
        match &*self.block_hook.lock().unwrap() {
            Some(hook) => hook(peer, request, block),
            None => BlockHookResult::default(),
        }
    }
}

impl UpdateHooks for StubHooks {
    fn process_update_hooks(
        &self,
        _peer: &PeerId,
        _request: &GraphSyncRequest,
        _update: &GraphSyncRequest,
    ) -> UpdateHookResult {
        UpdateHookResult {
            unpause: self.update_unpause.load(Ordering::SeqCst),
            ..Default::default()
        }
    }
}

/// Receives from the channel, panicking with the given message if nothing
/// arrives in time.
pub async fn assert_receive<T>(receiver: &Receiver<T>, message: &str) -> T {
    timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out: {}", message))
        .unwrap_or_else(|_| panic!("channel closed: {}", message))
}
