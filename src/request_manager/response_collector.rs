// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Reorder buffering between a traversal task that must never block and a
//! consumer whose read pace is unknown. The incoming channels are unbounded,
//! so producers always make progress; the pump tasks forward at whatever
//! pace the consumer sustains, and errors are flushed only after the
//! progress side has fully drained.

use crate::errors::Error;
use crate::ResponseProgress;
use async_std::channel::{bounded, Receiver, Sender};
use async_std::task;
use futures::channel::oneshot;

/// Buffers progress and errors between a request's traversal and the caller.
/// Returns the output streams handed to the caller. `cancel_fn` runs once if
/// the caller stops listening before the request finishes.
pub(crate) fn collect_responses(
    incoming_progress: Receiver<ResponseProgress>,
    incoming_errors: Receiver<Error>,
    cancel_fn: impl FnOnce() + Send + 'static,
) -> (Receiver<ResponseProgress>, Receiver<Error>) {
    let (out_progress_tx, out_progress_rx) = bounded(16);
    let (out_errors_tx, out_errors_rx) = bounded(16);
    let (progress_done_tx, progress_done_rx) = oneshot::channel();

    task::spawn(pump_progress(
        incoming_progress,
        out_progress_tx,
        progress_done_tx,
        cancel_fn,
    ));
    task::spawn(pump_errors(incoming_errors, out_errors_tx, progress_done_rx));

    (out_progress_rx, out_errors_rx)
}

async fn pump_progress(
    incoming: Receiver<ResponseProgress>,
    outgoing: Sender<ResponseProgress>,
    done: oneshot::Sender<()>,
    cancel_fn: impl FnOnce(),
) {
    while let Ok(progress) = incoming.recv().await {
        if outgoing.send(progress).await.is_err() {
            // the caller dropped its stream mid-request
            cancel_fn();
            break;
        }
    }
    let _ = done.send(());
}

async fn pump_errors(
    incoming: Receiver<Error>,
    outgoing: Sender<Error>,
    progress_done: oneshot::Receiver<()>,
) {
    let mut buffered = Vec::new();
    while let Ok(error) = incoming.recv().await {
        buffered.push(error);
    }
    // hold errors until the progress stream has drained
    let _ = progress_done.await;
    for error in buffered {
        if outgoing.send(error).await.is_err() {
            break;
        }
    }
}
