//! Per-execution node bookkeeping
//!
//! The tracker counts how often each node has been traversed, remembers which
//! traversals were skips, and owns one exclusive lock per node. Everything is
//! indexed by [`NodeId`], so the state is a pair of fixed-size vectors
//! allocated when the execution starts.

use crate::NodeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    #[default]
    Pending,
    Done,
    Skipped,
    Failed,
}

impl Outcome {
    /// Done or skipped: the node will not run again in this execution
    pub fn is_settled(self) -> bool {
        matches!(self, Outcome::Done | Outcome::Skipped)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub calls: u32,
    pub skips: u32,
    pub outcome: Outcome,
}

/// Whether a node may start, derived from the outcomes of its dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one dependency has not settled yet
    Waiting,
    /// Every dependency is done
    Ready,
    /// Every dependency settled and at least one was skipped
    Skip,
    /// A dependency failed, the node must never start
    Blocked,
}

impl Readiness {
    pub fn of(outcomes: impl IntoIterator<Item = Outcome>) -> Readiness {
        let mut pending = false;
        let mut skipped = false;

        for outcome in outcomes {
            match outcome {
                Outcome::Failed => return Readiness::Blocked,
                Outcome::Pending => pending = true,
                Outcome::Skipped => skipped = true,
                Outcome::Done => {}
            }
        }

        if pending {
            Readiness::Waiting
        } else if skipped {
            Readiness::Skip
        } else {
            Readiness::Ready
        }
    }
}

pub struct Tracker {
    flow: String,
    states: Mutex<Vec<NodeState>>,
    locks: Vec<Arc<AsyncMutex<()>>>,
}

impl Tracker {
    pub fn new(flow: impl Into<String>, nodes: usize) -> Self {
        Self {
            flow: flow.into(),
            states: Mutex::new(vec![NodeState::default(); nodes]),
            locks: (0..nodes).map(|_| Arc::new(AsyncMutex::new(()))).collect(),
        }
    }

    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Records a completed call of the given node
    pub fn mark(&self, node: NodeId) {
        let mut states = self.states.lock();
        let state = &mut states[node.index()];
        state.calls += 1;
        state.outcome = Outcome::Done;
    }

    /// Records a traversal of the given node that did not call it
    pub fn skip(&self, node: NodeId) {
        let mut states = self.states.lock();
        let state = &mut states[node.index()];
        state.calls += 1;
        state.skips += 1;
        state.outcome = Outcome::Skipped;
    }

    /// Skips the node only if it has not been traversed yet. Returns false
    /// when another traversal got there first.
    pub fn skip_pending(&self, node: NodeId) -> bool {
        let mut states = self.states.lock();
        let state = &mut states[node.index()];
        if state.outcome != Outcome::Pending {
            return false;
        }

        state.calls += 1;
        state.skips += 1;
        state.outcome = Outcome::Skipped;
        true
    }

    /// Records a failed call. Counters are left untouched.
    pub fn fail(&self, node: NodeId) {
        let mut states = self.states.lock();
        states[node.index()].outcome = Outcome::Failed;
    }

    /// True if the node has been traversed exactly `calls` times
    pub fn reached(&self, node: NodeId, calls: u32) -> bool {
        self.states.lock()[node.index()].calls == calls
    }

    /// True if every node has been called and none of them was skipped
    pub fn met(&self, nodes: &[NodeId]) -> bool {
        let states = self.states.lock();
        nodes.iter().all(|node| {
            let state = &states[node.index()];
            state.calls > 0 && state.skips == 0
        })
    }

    pub fn readiness(&self, nodes: &[NodeId]) -> Readiness {
        let states = self.states.lock();
        Readiness::of(nodes.iter().map(|node| states[node.index()].outcome))
    }

    pub fn outcome(&self, node: NodeId) -> Outcome {
        self.states.lock()[node.index()].outcome
    }

    pub fn state(&self, node: NodeId) -> NodeState {
        self.states.lock()[node.index()]
    }

    pub fn snapshot(&self) -> Vec<NodeState> {
        self.states.lock().clone()
    }

    /// Acquires the exclusive lock of the node. The lock is released when
    /// the returned guard is dropped.
    pub async fn lock(&self, node: NodeId) -> NodeGuard {
        let guard = self.locks[node.index()].clone().lock_owned().await;
        NodeGuard {
            node,
            _guard: guard,
        }
    }

    pub fn is_locked(&self, node: NodeId) -> bool {
        self.locks[node.index()].try_lock().is_err()
    }
}

/// Exclusive access to a node for the lifetime of the guard
pub struct NodeGuard {
    node: NodeId,
    _guard: OwnedMutexGuard<()>,
}

impl NodeGuard {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn unlock(self) {}
}
