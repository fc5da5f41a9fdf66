// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::ResponseStatusCode;
use thiserror::Error;

/// GraphSync error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Block was absent from the selected store.
    #[error("block not found")]
    NotFound,
    /// A pending load outlived its request.
    #[error("request terminated before load completed")]
    RequestTerminated,
    /// A load was attempted for a request that was never started.
    #[error("request is not in progress")]
    RequestNotInProgress,
    /// Request hook validation failed.
    #[error("request not valid")]
    RequestRejected,
    #[error("request is not paused")]
    NotPaused,
    #[error("request is already paused")]
    AlreadyPaused,
    /// A block or update hook aborted the response.
    #[error("hook error: {0}")]
    Hook(String),
    /// Malformed extension payload or message field.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Peer queue send failure.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
    /// The remote peer terminated the request with a failure status.
    #[error("remote request failed: {0:?}")]
    RemoteRequestFailed(ResponseStatusCode),
    #[error("unknown persistence option: {0}")]
    UnknownPersistenceOption(String),
    #[error("persistence option already registered: {0}")]
    DuplicatePersistenceOption(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("encoding error: {0}")]
    Encoding(String),
}
