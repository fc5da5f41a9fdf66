// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::ResponseKey;
use crate::Priority;
use fnv::FnvHashMap;
use libp2p::core::PeerId;

/// A unit of selector-query work for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub topic: ResponseKey,
    pub priority: Priority,
    pub work: usize,
}

/// How many thaw rounds a peer sits out after being frozen.
const FREEZE_COOLDOWN: i32 = 1;

struct PeerTracker {
    /// Queued tasks, ordered by descending priority, FIFO within a priority.
    tasks: Vec<Task>,
    /// Rounds left until this peer may be served again.
    freeze_val: i32,
    /// Serial of the last pop that served this peer.
    last_served: u64,
}

/// A multi-peer task queue. Tasks are queued per peer and popped from the
/// least recently served peer that is not frozen, highest priority first.
/// Removing a peer's task freezes that peer for a cooldown of thaw rounds.
#[derive(Default)]
pub struct QueryQueue {
    peer_trackers: FnvHashMap<PeerId, PeerTracker>,
    serial: u64,
}

impl QueryQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queues tasks for the given peer.
    pub fn push_tasks(&mut self, peer: PeerId, tasks: impl IntoIterator<Item = Task>) {
        let tracker = self.peer_trackers.entry(peer).or_insert_with(|| PeerTracker {
            tasks: Vec::new(),
            freeze_val: 0,
            last_served: 0,
        });
        for task in tasks {
            let pos = tracker
                .tasks
                .iter()
                .position(|t| t.priority < task.priority)
                .unwrap_or(tracker.tasks.len());
            tracker.tasks.insert(pos, task);
        }
    }

    /// Pops tasks from the least recently served unfrozen peer until at
    /// least the target amount of work is reached. Returns `None` when no
    /// unfrozen peer has queued tasks.
    pub fn pop_tasks(&mut self, target_min_work: usize) -> Option<(PeerId, Vec<Task>)> {
        let peer = self
            .peer_trackers
            .iter()
            .filter(|(_, tracker)| tracker.freeze_val == 0 && !tracker.tasks.is_empty())
            .min_by(|(p1, t1), (p2, t2)| {
                t1.last_served
                    .cmp(&t2.last_served)
                    .then_with(|| p1.to_bytes().cmp(&p2.to_bytes()))
            })
            .map(|(peer, _)| *peer)?;

        let tracker = self.peer_trackers.get_mut(&peer)?;
        self.serial += 1;
        tracker.last_served = self.serial;

        let mut tasks = Vec::new();
        let mut work = 0;
        while work < target_min_work && !tracker.tasks.is_empty() {
            let task = tracker.tasks.remove(0);
            work += task.work;
            tasks.push(task);
        }
        Some((peer, tasks))
    }

    /// Removes a queued task and freezes its peer for a cooldown.
    pub fn remove(&mut self, topic: &ResponseKey, peer: PeerId) {
        if let Some(tracker) = self.peer_trackers.get_mut(&peer) {
            tracker.tasks.retain(|task| task.topic != *topic);
            tracker.freeze_val = FREEZE_COOLDOWN;
        }
    }

    /// Reduces every frozen peer's cooldown by one round.
    pub fn thaw_round(&mut self) {
        for tracker in self.peer_trackers.values_mut() {
            if tracker.freeze_val > 0 {
                tracker.freeze_val -= 1;
            }
        }
    }
}
