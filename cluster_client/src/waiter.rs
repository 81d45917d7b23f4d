//! Channel-backed one-shot waiter registry.
//!
//! `mpsc::channel`-backed one-shot notifications keyed by an integer
//! waiter id, standing in for continuation-based park/unpark. The
//! state machine only ever stores the `Sender` half and a bare id; it
//! never blocks on the `Receiver` itself — no suspension happens inside
//! the state-machine mutex.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ClientError;

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

pub type WaiterId = u64;

pub fn next_waiter_id() -> WaiterId {
    NEXT_WAITER_ID.fetch_add(1, Ordering::SeqCst)
}

/// The runtime-facing half of a parked `wait_for_healthy` call.
pub struct Waiter {
    pub id: WaiterId,
    receiver: Receiver<Result<(), ClientError>>,
}

impl Waiter {
    /// Blocks the caller's thread until resumed or cancelled. This is
    /// the suspension point; it happens outside the state-machine
    /// mutex.
    pub fn block(self) -> Result<(), ClientError> {
        self.receiver
            .recv()
            .unwrap_or(Err(ClientError::ClientRequestCancelled))
    }
}

/// Registry of parked waiters, owned by the cluster state machine.
#[derive(Default)]
pub struct WaiterRegistry {
    notifiers: HashMap<WaiterId, Sender<Result<(), ClientError>>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self {
            notifiers: HashMap::new(),
        }
    }

    /// Parks a new waiter, returning the blocking half to hand back to
    /// the caller.
    pub fn park(&mut self) -> Waiter {
        let (tx, rx) = mpsc::channel();
        let id = next_waiter_id();
        self.notifiers.insert(id, tx);
        Waiter { id, receiver: rx }
    }

    /// Resumes every parked waiter with the given result, draining the
    /// registry.
    pub fn resume_all(&mut self, result: Result<(), ClientError>) {
        for (_, tx) in self.notifiers.drain() {
            let _ = tx.send(result.clone());
        }
    }

    /// Removes and returns the notifier for `id`, if still parked,
    /// without sending anything — used by `cancel_wait`.
    pub fn cancel(&mut self, id: WaiterId) -> Option<Sender<Result<(), ClientError>>> {
        self.notifiers.remove(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }
}
