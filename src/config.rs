// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::MAX_BLOCK_SIZE;

/// Configuration parameters for the GraphSync engine.
#[derive(Debug, Clone)]
pub struct GraphSyncConfig {
    /// The maximum byte size for messages sent over the network, measured by
    /// the payload bytes (blocks and extensions) a message carries. Batches
    /// of responses are split across messages to honor it; a request or a
    /// single response is never split.
    pub max_message_size: usize,
}

impl Default for GraphSyncConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_BLOCK_SIZE,
        }
    }
}
