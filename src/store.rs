// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::errors::Error;
use cid::Cid;
use fnv::FnvHashMap;
use std::sync::{Arc, RwLock};

/// Read access to a content-addressed block store.
pub trait Loader: Send + Sync {
    /// Reads the block stored under the given link, or `None` if absent.
    fn load(&self, link: &Cid) -> Result<Option<Vec<u8>>, Error>;
}

/// Write access to a content-addressed block store. Commits are idempotent
/// by link: concurrent commits of the same link must leave the store
/// byte-identical.
pub trait Storer: Send + Sync {
    /// Commits the given bytes under the given link.
    fn store(&self, link: &Cid, data: &[u8]) -> Result<(), Error>;
}

impl<T: Loader + ?Sized> Loader for Arc<T> {
    fn load(&self, link: &Cid) -> Result<Option<Vec<u8>>, Error> {
        (**self).load(link)
    }
}

impl<T: Storer + ?Sized> Storer for Arc<T> {
    fn store(&self, link: &Cid, data: &[u8]) -> Result<(), Error> {
        (**self).store(link, data)
    }
}

/// An in-memory block store, chiefly useful for tests and examples.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    blocks: Arc<RwLock<FnvHashMap<Cid, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns true if a block is stored under the given link.
    pub fn contains(&self, link: &Cid) -> bool {
        self.blocks.read().unwrap().contains_key(link)
    }

    /// Returns a copy of the block stored under the given link.
    pub fn get(&self, link: &Cid) -> Option<Vec<u8>> {
        self.blocks.read().unwrap().get(link).cloned()
    }

    /// Deletes the block stored under the given link, if any.
    pub fn remove(&self, link: &Cid) {
        self.blocks.write().unwrap().remove(link);
    }
}

impl Loader for MemoryStore {
    fn load(&self, link: &Cid) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.blocks.read().unwrap().get(link).cloned())
    }
}

impl Storer for MemoryStore {
    fn store(&self, link: &Cid, data: &[u8]) -> Result<(), Error> {
        self.blocks
            .write()
            .unwrap()
            .insert(*link, data.to_vec());
        Ok(())
    }
}
