// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::errors::Error;
use cid::Cid;
use fnv::FnvHashSet;

/// Encodes a set of CIDs as the dag-cbor list carried by the
/// `graphsync/do-not-send-cids` extension.
pub fn encode_cid_set(cids: &FnvHashSet<Cid>) -> Result<Vec<u8>, Error> {
    let list: Vec<&Cid> = cids.iter().collect();
    serde_ipld_dagcbor::to_vec(&list).map_err(|e| Error::Encoding(e.to_string()))
}

/// Decodes a dag-cbor encoded CID set.
pub fn decode_cid_set(data: &[u8]) -> Result<FnvHashSet<Cid>, Error> {
    let list: Vec<Cid> =
        serde_ipld_dagcbor::from_slice(data).map_err(|e| Error::Protocol(e.to_string()))?;
    Ok(list.into_iter().collect())
}
