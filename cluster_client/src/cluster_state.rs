//! The cluster state machine: a single-threaded mutator whose
//! transitions are pure functions from `(state, event)` to `(new
//! state, actions)`. The caller (the `ClusterClient` façade) owns the
//! `Mutex` guarding an instance of `ClusterStateMachine`; no method here
//! blocks or sleeps — no suspension ever happens inside the
//! state-machine mutex.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::backoff::JitterSource;
use crate::error::ClientError;
use crate::hash_slot::HashSlot;
use crate::node_id::NodeId;
use crate::topology::{apply_moved, ClusterDescription, MovedOutcome, SlotMap};
use crate::waiter::{Waiter, WaiterId, WaiterRegistry};

pub type TimerId = u64;

fn next_timer_id() -> TimerId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires `default_refresh_interval` after entering Healthy.
    NextDiscovery,
    /// Fires `circuit_breaker_duration` after entering Degraded/Unavailable.
    CircuitBreaker,
    /// Fires after a failed discovery attempt, per the backoff formula.
    DiscoveryRetry,
}

/// A scheduled timer: the runtime (outside the mutex) is responsible
/// for sleeping `after` and then calling `timer_fired(id)`.
#[derive(Debug, Clone, Copy)]
pub struct TimerHandle {
    pub id: TimerId,
    pub after: Duration,
    pub kind: TimerKind,
}

/// Pure data describing what the runtime must do after a transition,
/// executed after the mutex is released.
pub enum Action {
    SpawnNodeClient(NodeId),
    ShutdownNodeClient(NodeId),
    ScheduleTimer(TimerHandle),
    CancelTimer(TimerId),
    /// Kick off a CLUSTER SHARDS fan-out against these voters.
    RunDiscovery(Vec<NodeId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    NotRefreshing,
    Refreshing { consec_failures: u32 },
    WaitingForRefresh { timer: TimerId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClusterState {
    Unavailable {
        circuit_timer: TimerId,
        last_error: Option<ClientError>,
    },
    Degraded {
        circuit_timer: TimerId,
        slot_map: SlotMap,
        description: ClusterDescription,
        last_error: Option<ClientError>,
    },
    Healthy {
        description: ClusterDescription,
        slot_map: SlotMap,
        consensus_instant: Instant,
    },
    Shutdown,
}

pub struct ClusterStateMachine {
    state: ClusterState,
    refresh: RefreshState,
    waiters: WaiterRegistry,
    running_clients: HashSet<NodeId>,
    jitter: JitterSource,
    circuit_breaker_duration: Duration,
    default_refresh_interval: Duration,
}

/// Outcome of `wait_for_healthy`.
pub enum WaitOutcome {
    Ready,
    Parked(Waiter),
    Failed(ClientError),
}

/// Outcome of `pool_for_redirect`.
pub enum RedirectOutcome {
    Ready(NodeId),
    Parked(Waiter),
}

impl ClusterStateMachine {
    /// `start()`: begins in Unavailable with a fresh circuit
    /// timer.
    pub fn start(circuit_breaker_duration: Duration, default_refresh_interval: Duration) -> (Self, Vec<Action>) {
        let timer_id = next_timer_id();
        let machine = ClusterStateMachine {
            state: ClusterState::Unavailable {
                circuit_timer: timer_id,
                last_error: None,
            },
            refresh: RefreshState::NotRefreshing,
            waiters: WaiterRegistry::new(),
            running_clients: HashSet::new(),
            jitter: JitterSource::new(),
            circuit_breaker_duration,
            default_refresh_interval,
        };
        let actions = vec![Action::ScheduleTimer(TimerHandle {
            id: timer_id,
            after: circuit_breaker_duration,
            kind: TimerKind::CircuitBreaker,
        })];
        (machine, actions)
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self.state, ClusterState::Shutdown)
    }

    /// Reconciles the running node-client table against a freshly
    /// discovered/updated set of descriptions.
    pub fn update_nodes(
        &mut self,
        discovered: &[NodeId],
        remove_unmentioned: bool,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let discovered_set: HashSet<NodeId> = discovered.iter().cloned().collect();

        for id in discovered {
            if !self.running_clients.contains(id) {
                actions.push(Action::SpawnNodeClient(id.clone()));
                self.running_clients.insert(id.clone());
            }
        }

        if remove_unmentioned {
            let to_remove: Vec<NodeId> = self
                .running_clients
                .iter()
                .filter(|id| !discovered_set.contains(id))
                .cloned()
                .collect();
            for id in &to_remove {
                actions.push(Action::ShutdownNodeClient(id.clone()));
                self.running_clients.remove(id);
            }
        }

        actions
    }

    /// `discovery_succeeded(description)`: rebuilds the slot map,
    /// transitions to Healthy, cancels any circuit timer, schedules the
    /// next discovery, and resumes all waiters.
    pub fn discovery_succeeded(&mut self, description: ClusterDescription) -> Vec<Action> {
        let mut actions = Vec::new();
        if let ClusterState::Degraded { circuit_timer, .. } | ClusterState::Unavailable { circuit_timer, .. } = &self.state {
            actions.push(Action::CancelTimer(*circuit_timer));
        }
        let slot_map = description.build_slot_map();
        self.state = ClusterState::Healthy {
            description,
            slot_map,
            consensus_instant: Instant::now(),
        };
        self.refresh = RefreshState::NotRefreshing;

        let timer_id = next_timer_id();
        actions.push(Action::ScheduleTimer(TimerHandle {
            id: timer_id,
            after: self.default_refresh_interval,
            kind: TimerKind::NextDiscovery,
        }));

        self.waiters.resume_all(Ok(()));
        actions
    }

    /// `discovery_failed(error)`: Healthy -> Degraded with a fresh
    /// circuit timer; Degraded/Unavailable keep state but update
    /// `last_error`. Always schedules a retry with exponential backoff.
    pub fn discovery_failed(&mut self, error: ClientError) -> Vec<Action> {
        let mut actions = Vec::new();

        let healthy_snapshot = match &self.state {
            ClusterState::Healthy { description, slot_map, .. } => {
                Some((description.clone(), slot_map.clone()))
            }
            ClusterState::Shutdown => return actions,
            _ => None,
        };

        if let Some((description, slot_map)) = healthy_snapshot {
            let circuit_timer = next_timer_id();
            self.state = ClusterState::Degraded {
                circuit_timer,
                slot_map,
                description,
                last_error: Some(error.clone()),
            };
            actions.push(Action::ScheduleTimer(TimerHandle {
                id: circuit_timer,
                after: self.circuit_breaker_duration,
                kind: TimerKind::CircuitBreaker,
            }));
        } else {
            self.set_last_error(error.clone());
        }

        let consec_failures = match self.refresh {
            RefreshState::Refreshing { consec_failures } => consec_failures + 1,
            _ => 1,
        };
        let retry_timer = next_timer_id();
        let backoff = self.jitter.backoff_for_attempt(consec_failures);
        self.refresh = RefreshState::WaitingForRefresh { timer: retry_timer };
        actions.push(Action::ScheduleTimer(TimerHandle {
            id: retry_timer,
            after: backoff,
            kind: TimerKind::DiscoveryRetry,
        }));

        actions
    }

    fn set_last_error(&mut self, error: ClientError) {
        match &mut self.state {
            ClusterState::Degraded { last_error, .. } | ClusterState::Unavailable { last_error, .. } => {
                *last_error = Some(error);
            }
            _ => {}
        }
    }

    /// `timer_fired(timer)`: stale firings (timer id doesn't match the
    /// current state's timer) are ignored.
    pub fn timer_fired(&mut self, timer: TimerId, voters: Vec<NodeId>) -> Vec<Action> {
        match &self.state {
            ClusterState::Degraded { circuit_timer, .. } if *circuit_timer == timer => {
                self.waiters.resume_all(Err(ClientError::NoConsensusReachedCircuitBreakerOpen));
                let new_timer = next_timer_id();
                self.state = ClusterState::Unavailable {
                    circuit_timer: new_timer,
                    last_error: Some(ClientError::NoConsensusReachedCircuitBreakerOpen),
                };
                vec![]
            }
            ClusterState::Unavailable { circuit_timer, .. } if *circuit_timer == timer => {
                self.waiters.resume_all(Err(ClientError::NoConsensusReachedCircuitBreakerOpen));
                vec![]
            }
            _ => {
                // Either this is the retry/next-discovery timer (kick
                // a fresh discovery fan-out) or it's stale and ignored.
                if matches!(self.refresh, RefreshState::WaitingForRefresh { timer: t } if t == timer)
                    || self.is_healthy()
                {
                    self.refresh = RefreshState::Refreshing { consec_failures: 0 };
                    vec![Action::RunDiscovery(voters)]
                } else {
                    vec![]
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self.state, ClusterState::Healthy { .. })
    }

    /// `pool_fast_path(slots)`: resolves the node client to route to for
    /// the given set of slots. All supplied slots must map to the same
    /// shard in Healthy/Degraded, or `keys_require_multiple_nodes` is
    /// raised. Zero slots pick a random shard's primary.
    pub fn pool_fast_path(&mut self, slots: &[HashSlot]) -> Result<NodeId, ClientError> {
        let (slot_map, description) = match &self.state {
            ClusterState::Healthy { slot_map, description, .. } => (slot_map, description),
            ClusterState::Degraded { slot_map, description, .. } => (slot_map, description),
            ClusterState::Unavailable { .. } => return Err(ClientError::ClusterIsUnavailable),
            ClusterState::Shutdown => return Err(ClientError::ClusterClientIsShutDown),
        };

        if slots.is_empty() {
            return description
                .shards
                .first()
                .and_then(|s| s.primary_id().cloned())
                .ok_or(ClientError::ClusterIsMissingSlotAssignment);
        }

        let mut shard_idx = None;
        for slot in slots {
            let idx = slot_map
                .shard_index_for(*slot)
                .ok_or(ClientError::ClusterIsMissingSlotAssignment)?;
            match shard_idx {
                None => shard_idx = Some(idx),
                Some(existing) if existing == idx => {}
                Some(_) => return Err(ClientError::KeysRequireMultipleNodes),
            }
        }
        let idx = shard_idx.expect("checked non-empty above");
        description.shards[idx]
            .primary_id()
            .cloned()
            .ok_or(ClientError::ClusterIsMissingSlotAssignment)
    }

    /// `pool_for_redirect(redirect)`: applies a MOVED/ASK mutation and
    /// resolves (or parks for) the destination node.
    pub fn pool_for_redirect(&mut self, slot: HashSlot, node_id: &NodeId) -> RedirectOutcome {
        match &mut self.state {
            ClusterState::Healthy { description, slot_map, .. } => {
                let outcome = apply_moved(description, slot_map, slot, node_id);
                if self.running_clients.contains(node_id) {
                    return RedirectOutcome::Ready(node_id.clone());
                }
                if outcome == MovedOutcome::UpdatedToUnknown {
                    let waiter = self.waiters.park();
                    return RedirectOutcome::Parked(waiter);
                }
                RedirectOutcome::Ready(node_id.clone())
            }
            ClusterState::Degraded { description, slot_map, .. } => {
                apply_moved(description, slot_map, slot, node_id);
                let waiter = self.waiters.park();
                RedirectOutcome::Parked(waiter)
            }
            _ => {
                let waiter = self.waiters.park();
                RedirectOutcome::Parked(waiter)
            }
        }
    }

    /// `wait_for_healthy`: resumes immediately if Healthy, parks in
    /// Degraded/Unavailable, fails immediately in Shutdown.
    pub fn wait_for_healthy(&mut self) -> WaitOutcome {
        match &self.state {
            ClusterState::Healthy { .. } => WaitOutcome::Ready,
            ClusterState::Shutdown => WaitOutcome::Failed(ClientError::ClusterClientIsShutDown),
            _ => WaitOutcome::Parked(self.waiters.park()),
        }
    }

    pub fn cancel_wait(&mut self, waiter_id: WaiterId) {
        if let Some(tx) = self.waiters.cancel(waiter_id) {
            let _ = tx.send(Err(ClientError::ClientRequestCancelled));
        }
    }

    /// `shutdown()`: terminal transition; returns all running node ids
    /// for the caller to tear down.
    pub fn shutdown(&mut self) -> Vec<NodeId> {
        self.waiters.resume_all(Err(ClientError::ClusterClientIsShutDown));
        self.state = ClusterState::Shutdown;
        self.running_clients.drain().collect()
    }

    pub fn current_state(&self) -> &ClusterState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::{NodeDescription, NodeHealth, NodeRole};
    use crate::topology::Shard;

    fn node(endpoint: &str, port: u16, role: NodeRole) -> NodeDescription {
        NodeDescription {
            id: NodeId::new(endpoint, port),
            ip: None,
            hostname: None,
            tls_port: None,
            use_tls: false,
            role,
            health: NodeHealth::Online,
            replication_offset: 0,
        }
    }

    fn two_shard_desc() -> ClusterDescription {
        ClusterDescription {
            shards: vec![
                Shard {
                    slot_ranges: vec![0..=8191],
                    nodes: vec![node("10.0.0.1", 7000, NodeRole::Primary)],
                },
                Shard {
                    slot_ranges: vec![8192..=16383],
                    nodes: vec![node("10.0.0.2", 7001, NodeRole::Primary)],
                },
            ],
        }
    }

    #[test]
    fn test01_starts_unavailable_with_circuit_timer() {
        let (machine, actions) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        assert!(matches!(machine.current_state(), ClusterState::Unavailable { .. }));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn test02_discovery_succeeded_transitions_to_healthy() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        let actions = machine.discovery_succeeded(two_shard_desc());
        assert!(matches!(machine.current_state(), ClusterState::Healthy { .. }));
        assert!(actions.iter().any(|a| matches!(a, Action::ScheduleTimer(_))));
    }

    #[test]
    fn test03_pool_fast_path_single_slot() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        machine.discovery_succeeded(two_shard_desc());
        let node = machine
            .pool_fast_path(&[HashSlot::try_from(0).unwrap()])
            .unwrap();
        assert_eq!(node, NodeId::new("10.0.0.1", 7000));
    }

    #[test]
    fn test04_pool_fast_path_cross_shard_errors() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        machine.discovery_succeeded(two_shard_desc());
        let result = machine.pool_fast_path(&[
            HashSlot::try_from(0).unwrap(),
            HashSlot::try_from(8192).unwrap(),
        ]);
        assert_eq!(result, Err(ClientError::KeysRequireMultipleNodes));
    }

    #[test]
    fn test05_discovery_failed_from_healthy_goes_degraded() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        machine.discovery_succeeded(two_shard_desc());
        machine.discovery_failed(ClientError::ClusterIsUnavailable);
        assert!(matches!(machine.current_state(), ClusterState::Degraded { .. }));
    }

    #[test]
    fn test06_circuit_breaker_timer_fires_to_unavailable() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        machine.discovery_succeeded(two_shard_desc());
        machine.discovery_failed(ClientError::ClusterIsUnavailable);
        let circuit_timer = match machine.current_state() {
            ClusterState::Degraded { circuit_timer, .. } => *circuit_timer,
            _ => panic!("expected degraded"),
        };
        machine.timer_fired(circuit_timer, vec![]);
        assert!(matches!(machine.current_state(), ClusterState::Unavailable { .. }));
    }

    #[test]
    fn test07_stale_timer_is_ignored() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        machine.discovery_succeeded(two_shard_desc());
        // An old, already-cancelled timer id should not affect Healthy state.
        machine.timer_fired(999_999, vec![]);
        assert!(matches!(machine.current_state(), ClusterState::Healthy { .. }));
    }

    #[test]
    fn test08_shutdown_is_terminal_and_fails_fast_path() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        machine.discovery_succeeded(two_shard_desc());
        machine.shutdown();
        assert!(machine.is_shutdown());
        assert_eq!(
            machine.pool_fast_path(&[]),
            Err(ClientError::ClusterClientIsShutDown)
        );
    }

    #[test]
    fn test09_moved_redirect_to_unknown_node_parks_waiter() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        machine.discovery_succeeded(two_shard_desc());
        let outcome = machine.pool_for_redirect(HashSlot::try_from(100).unwrap(), &NodeId::new("10.0.0.9", 9999));
        assert!(matches!(outcome, RedirectOutcome::Parked(_)));
    }

    #[test]
    fn test10_update_nodes_spawns_and_tears_down() {
        let (mut machine, _) = ClusterStateMachine::start(Duration::from_secs(30), Duration::from_secs(30));
        let a = NodeId::new("a", 1);
        let b = NodeId::new("b", 2);
        let actions = machine.update_nodes(&[a.clone(), b.clone()], true);
        assert_eq!(actions.len(), 2);
        let actions = machine.update_nodes(&[a.clone()], true);
        assert!(actions.iter().any(|action| matches!(action, Action::ShutdownNodeClient(id) if id == &b)));
    }
}
