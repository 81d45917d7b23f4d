//! The `ClusterClient` façade: the single entry point callers use. Owns
//! the state machine mutex, the live `NodeClient` table, and the worker
//! pool used to fan discovery and cross-shard pipelines out
//! concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;

use common::thread_pool::ThreadPool;
use logger::logger::Logger;

use crate::backoff::JitterSource;
use crate::channel::{ChannelFactory, TcpChannelFactory};
use crate::cluster_shards::parse_cluster_shards;
use crate::cluster_state::{Action, ClusterStateMachine, RedirectOutcome, TimerId, TimerKind, WaitOutcome};
use crate::command::{Command, Encodable};
use crate::config::ClientConfig;
use crate::election::{Election, TopologyCandidate};
use crate::error::{ClientError, ClientResult};
use crate::hash_slot::{slot_for_key, HashSlot};
use crate::node_client::NodeClient;
use crate::node_id::NodeId;
use crate::redirect::{classify_error, Redirect};
use crate::resp::Token;
use crate::topology::ClusterDescription;

pub struct ClusterClient {
    weak_self: Weak<ClusterClient>,
    machine: Mutex<ClusterStateMachine>,
    clients: RwLock<HashMap<NodeId, Arc<NodeClient>>>,
    cancelled_timers: Mutex<HashSet<TimerId>>,
    factory: Arc<dyn ChannelFactory>,
    config: ClientConfig,
    logger: Logger,
    pool: ThreadPool,
    seed_nodes: Vec<NodeId>,
    jitter: Mutex<JitterSource>,
}

impl ClusterClient {
    /// Connects over plain TCP.
    pub fn connect(seed_nodes: Vec<NodeId>, config: ClientConfig, logger: Logger) -> ClientResult<Arc<Self>> {
        Self::connect_with_factory(seed_nodes, config, logger, Arc::new(TcpChannelFactory))
    }

    /// Connects using a caller-supplied transport, via the
    /// `ChannelFactory` indirection — the seam tests use to
    /// substitute an in-process mock listener.
    pub fn connect_with_factory(
        seed_nodes: Vec<NodeId>,
        config: ClientConfig,
        logger: Logger,
        factory: Arc<dyn ChannelFactory>,
    ) -> ClientResult<Arc<Self>> {
        if seed_nodes.is_empty() {
            return Err(ClientError::ClusterIsUnavailable);
        }
        let (machine, start_actions) =
            ClusterStateMachine::start(config.circuit_breaker_duration, config.default_refresh_interval);
        let pool = ThreadPool::new(config.worker_pool_size);

        let client = Arc::new_cyclic(|weak| ClusterClient {
            weak_self: weak.clone(),
            machine: Mutex::new(machine),
            clients: RwLock::new(HashMap::new()),
            cancelled_timers: Mutex::new(HashSet::new()),
            factory,
            config,
            logger,
            pool,
            seed_nodes,
            jitter: Mutex::new(JitterSource::new()),
        });

        client.run_actions(start_actions);
        client.run_discovery(client.seed_nodes.clone());
        Ok(client)
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("ClusterClient method invoked after its own Arc was dropped")
    }

    fn run_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SpawnNodeClient(id) => self.spawn_node_client(id),
                Action::ShutdownNodeClient(id) => self.shutdown_node_client(&id),
                Action::ScheduleTimer(handle) => self.schedule_timer(handle),
                Action::CancelTimer(id) => {
                    self.cancelled_timers.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
                }
                Action::RunDiscovery(voters) => self.run_discovery(voters),
            }
        }
    }

    fn spawn_node_client(&self, id: NodeId) {
        match NodeClient::new(id.clone(), self.factory.clone(), self.logger.clone(), self.config.resp_version) {
            Ok(node_client) => {
                self.clients
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, Arc::new(node_client));
            }
            Err(e) => {
                self.logger
                    .error(&format!("failed to connect to {id}: {e}"), "cluster_client");
            }
        }
    }

    fn shutdown_node_client(&self, id: &NodeId) {
        if let Some(client) = self.clients.write().unwrap_or_else(|e| e.into_inner()).remove(id) {
            client.trigger_graceful_shutdown();
        }
    }

    fn schedule_timer(&self, handle: crate::cluster_state::TimerHandle) {
        let client = self.arc();
        thread::spawn(move || {
            thread::sleep(handle.after);
            client.on_timer(handle.id, handle.kind);
        });
    }

    fn on_timer(&self, id: TimerId, _kind: TimerKind) {
        if self.cancelled_timers.lock().unwrap_or_else(|e| e.into_inner()).remove(&id) {
            return;
        }
        let voters = self.known_voters();
        let actions = {
            let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
            machine.timer_fired(id, voters)
        };
        self.run_actions(actions);
    }

    /// The set of addresses to query during a fresh discovery round:
    /// the currently known primaries if any, falling back to the
    /// original seed list.
    fn known_voters(&self) -> Vec<NodeId> {
        let known: Vec<NodeId> = self
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        if known.is_empty() {
            self.seed_nodes.clone()
        } else {
            known
        }
    }

    fn query_voter(&self, voter: &NodeId) -> ClientResult<ClusterDescription> {
        let probe = NodeClient::new(voter.clone(), self.factory.clone(), self.logger.clone(), self.config.resp_version)?;
        let token = probe.execute(&[b"CLUSTER".to_vec(), b"SHARDS".to_vec()])?;
        probe.trigger_graceful_shutdown();
        parse_cluster_shards(&token).map_err(|e| ClientError::ParseError(e.to_string()))
    }

    /// Runs one discovery round: fans `CLUSTER SHARDS` out to
    /// every voter concurrently via the worker pool, feeds replies into
    /// an `Election`, and drives the resulting `discovery_succeeded` /
    /// `discovery_failed` transition once a winner emerges or every
    /// voter has reported.
    fn run_discovery(&self, voters: Vec<NodeId>) {
        if voters.is_empty() {
            let actions = self
                .machine
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .discovery_failed(ClientError::ClusterIsUnavailable);
            self.run_actions(actions);
            return;
        }

        let (tx, rx) = mpsc::channel();
        for voter in &voters {
            let voter = voter.clone();
            let client = self.arc();
            let tx = tx.clone();
            if client.pool.execute(move || {
                let result = client.query_voter(&voter);
                let _ = tx.send((voter, result));
            }).is_err() {
                let _ = tx.send((voter.clone(), Err(ClientError::ClusterIsUnavailable)));
            }
        }
        drop(tx);

        let mut election = Election::new();
        let mut last_error = None;
        for _ in 0..voters.len() {
            let (voter, result) = match rx.recv() {
                Ok(v) => v,
                Err(_) => break,
            };
            match result {
                Ok(description) => {
                    let candidate = TopologyCandidate { description };
                    if let Some(winner) = election.vote(voter, candidate) {
                        let node_ids: Vec<NodeId> = winner
                            .shards
                            .iter()
                            .flat_map(|s| s.nodes.iter().map(|n| n.id.clone()))
                            .collect();
                        let actions = {
                            let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
                            let mut actions = machine.discovery_succeeded(winner);
                            actions.extend(machine.update_nodes(&node_ids, true));
                            actions
                        };
                        self.run_actions(actions);
                        return;
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        let error = last_error.unwrap_or(ClientError::ClusterIsUnavailable);
        let actions = self.machine.lock().unwrap_or_else(|e| e.into_inner()).discovery_failed(error);
        self.run_actions(actions);
    }

    fn resolve_node(&self, slots: &[HashSlot]) -> ClientResult<NodeId> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner()).pool_fast_path(slots)
    }

    fn apply_redirect(&self, slot: HashSlot, target: &NodeId) -> ClientResult<NodeId> {
        let outcome = self
            .machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pool_for_redirect(slot, target);
        match outcome {
            RedirectOutcome::Ready(id) => Ok(id),
            RedirectOutcome::Parked(waiter) => {
                self.run_discovery(self.known_voters());
                waiter.block()?;
                Ok(target.clone())
            }
        }
    }

    fn get_or_create_client(&self, id: &NodeId) -> ClientResult<Arc<NodeClient>> {
        if let Some(client) = self.clients.read().unwrap_or_else(|e| e.into_inner()).get(id) {
            return Ok(client.clone());
        }
        let mut guard = self.clients.write().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = guard.get(id) {
            return Ok(client.clone());
        }
        let node_client = Arc::new(NodeClient::new(id.clone(), self.factory.clone(), self.logger.clone(), self.config.resp_version)?);
        guard.insert(id.clone(), node_client.clone());
        Ok(node_client)
    }

    fn invalidate_client(&self, id: &NodeId) {
        self.clients.write().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    /// Blocks until the cluster reaches Healthy, or fails immediately
    /// once shut down.
    pub fn wait_for_healthy(&self) -> ClientResult<()> {
        let outcome = self.machine.lock().unwrap_or_else(|e| e.into_inner()).wait_for_healthy();
        match outcome {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::Failed(e) => Err(e),
            WaitOutcome::Parked(waiter) => waiter.block(),
        }
    }

    /// Executes a single typed command, following MOVED/ASK redirects
    /// up to `config.max_redirects` times.
    pub fn execute<C: Command>(&self, cmd: &C) -> ClientResult<C::Response> {
        let slot = cmd.routing_slot()?;
        let slots: Vec<HashSlot> = slot.into_iter().collect();
        let args = cmd.command_args();

        let mut current_node = self.resolve_node(&slots)?;
        let mut ask_next = false;
        let mut redirects = 0u32;

        loop {
            let client = self.get_or_create_client(&current_node)?;
            let send_result = if ask_next {
                client.execute_with_ask(&[args.clone()]).map(|mut v| v.remove(0))
            } else {
                client.execute(&args)
            };

            let token = match send_result {
                Ok(token) => token,
                Err(ClientError::ConnectionClosed) => {
                    self.invalidate_client(&current_node);
                    redirects += 1;
                    if redirects > self.config.max_redirects {
                        return Err(ClientError::ConnectionClosed);
                    }
                    current_node = self.resolve_node(&slots)?;
                    ask_next = false;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(msg) = token.error_message() {
                if let Some(redirect) = classify_error(msg) {
                    redirects += 1;
                    if redirects > self.config.max_redirects {
                        return Err(ClientError::WaitedForDiscoveryAfterMovedTooManyTimes);
                    }
                    match redirect {
                        Redirect::Moved { slot, target } => {
                            current_node = self.apply_redirect(slot, &target)?;
                            ask_next = false;
                            continue;
                        }
                        Redirect::Ask { target, .. } => {
                            current_node = target;
                            ask_next = true;
                            continue;
                        }
                        Redirect::TryAgain | Redirect::ClusterDown | Redirect::MasterDown | Redirect::Loading => {
                            let delay = self
                                .jitter
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .backoff_for_attempt(redirects);
                            thread::sleep(delay);
                            current_node = self.resolve_node(&slots)?;
                            ask_next = false;
                            continue;
                        }
                        Redirect::Other(_) => {}
                    }
                }
            }

            return cmd.decode(token);
        }
    }

    /// Executes a heterogeneous batch of commands as one or more
    /// per-node pipelines, splitting by this rule: a keyed command
    /// anchors a group; keyless commands before the first anchor join
    /// it, and keyless commands after any anchor join that anchor's
    /// group. Replies come back in the caller's original order. This
    /// does not itself retry on MOVED/ASK — a caller wanting redirect
    /// handling for pipelines re-issues the affected items with
    /// `execute`.
    pub fn execute_pipeline(&self, items: &[&dyn Encodable]) -> ClientResult<Vec<Token>> {
        if items.is_empty() {
            return Ok(vec![]);
        }

        let mut slots: Vec<Option<HashSlot>> = Vec::with_capacity(items.len());
        for item in items {
            slots.push(item.routing_slot()?);
        }

        let mut groups: Vec<usize> = vec![usize::MAX; items.len()];
        let mut group_slots: Vec<Option<HashSlot>> = Vec::new();
        let mut current_group: Option<usize> = None;
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Some(s) => {
                    group_slots.push(Some(*s));
                    let g = group_slots.len() - 1;
                    current_group = Some(g);
                    groups[i] = g;
                }
                None => {
                    if let Some(g) = current_group {
                        groups[i] = g;
                    }
                }
            }
        }

        if let Some(first_anchor) = slots.iter().position(|s| s.is_some()) {
            let anchor_group = groups[first_anchor];
            for g in groups.iter_mut().take(first_anchor) {
                *g = anchor_group;
            }
        } else {
            for g in groups.iter_mut() {
                *g = 0;
            }
            group_slots.push(None);
        }

        let mut node_for_group: HashMap<usize, NodeId> = HashMap::new();
        for (g, slot) in group_slots.iter().enumerate() {
            let slots_vec: Vec<HashSlot> = slot.iter().cloned().collect();
            let node = self.resolve_node(&slots_vec)?;
            node_for_group.insert(g, node);
        }

        let mut per_node: Vec<(NodeId, Vec<usize>)> = Vec::new();
        let mut bucket_of: HashMap<NodeId, usize> = HashMap::new();
        for (i, g) in groups.iter().enumerate() {
            let node = node_for_group[g].clone();
            let bucket = *bucket_of.entry(node.clone()).or_insert_with(|| {
                per_node.push((node.clone(), Vec::new()));
                per_node.len() - 1
            });
            per_node[bucket].1.push(i);
        }

        let mut results: Vec<Option<Token>> = vec![None; items.len()];
        for (node, indices) in &per_node {
            let commands: Vec<Vec<Vec<u8>>> = indices.iter().map(|&i| items[i].command_args()).collect();
            let client = self.get_or_create_client(node)?;
            let tokens = client.execute_many(&commands)?;
            for (pos, &i) in indices.iter().enumerate() {
                results[i] = Some(tokens[pos].clone());
            }
        }

        results
            .into_iter()
            .map(|t| t.ok_or(ClientError::PipelinedResultNotReturned))
            .collect()
    }

    /// Escape hatch for callers who need direct access to the connection
    /// owning `keys` (e.g. `SUBSCRIBE`, out of scope for routed
    /// commands). Resolves the slot `keys` share exactly as `execute`
    /// does, then hands the caller that node's connection.
    pub fn with_connection<F, R>(&self, keys: &[Vec<u8>], f: F) -> ClientResult<R>
    where
        F: FnOnce(&NodeClient) -> ClientResult<R>,
    {
        let mut slot = None;
        for key in keys {
            let candidate = slot_for_key(key);
            match slot {
                None => slot = Some(candidate),
                Some(existing) if existing == candidate => {}
                Some(_) => return Err(ClientError::KeysRequireMultipleHashSlots),
            }
        }
        let slots: Vec<HashSlot> = slot.into_iter().collect();
        let node = self.resolve_node(&slots)?;
        let client = self.get_or_create_client(&node)?;
        f(&client)
    }

    /// Terminal shutdown: stops discovery, resumes every
    /// parked waiter with an error, and tears down every node client
    /// gracefully. Equivalent to `shutdown_within(None)`.
    ///
    /// `self.clients` (populated lazily by `get_or_create_client`), not
    /// the state machine's own `running_clients` bookkeeping, is the
    /// authoritative live-connection set — every client ever handed out
    /// is torn down here regardless of which nodes the machine thinks
    /// it spawned.
    pub fn shutdown(&self) {
        self.shutdown_within(None);
    }

    /// Terminal shutdown: every node client is asked to drain in-flight requests
    /// first, and, if `forceful_after` is given, is then torn down
    /// forcefully once that grace period elapses, regardless of whether
    /// it finished draining on its own.
    pub fn shutdown_within(&self, forceful_after: Option<std::time::Duration>) {
        self.machine.lock().unwrap_or_else(|e| e.into_inner()).shutdown();
        let drained: Vec<Arc<NodeClient>> = self
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in &drained {
            client.trigger_graceful_shutdown();
        }
        if let Some(grace) = forceful_after {
            thread::sleep(grace);
            for client in &drained {
                client.trigger_forceful_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::command::Get;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::Mutex as StdMutex;

    /// Serves one scripted reply sequence per *connection* made to a
    /// given address (not per address) — a discovery probe and the
    /// long-lived node client it later spawns are separate connections,
    /// each with their own handshake and command replies, so each gets
    /// its own entry popped in connection order.
    struct ScriptedFactory {
        replies: StdMutex<HashMap<(String, u16), VecDeque<Vec<Vec<u8>>>>>,
    }

    struct ScriptedChannel {
        to_read: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl Read for ScriptedChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut q = self.to_read.lock().unwrap();
            if q.is_empty() {
                return Ok(0);
            }
            let chunk = q.remove(0);
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }
    impl Write for ScriptedChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Channel for ScriptedChannel {
        fn try_clone_channel(&self) -> io::Result<Box<dyn Channel>> {
            Ok(Box::new(ScriptedChannel {
                to_read: self.to_read.clone(),
            }))
        }
    }

    impl ChannelFactory for ScriptedFactory {
        fn connect(&self, endpoint: &str, port: u16) -> ClientResult<Box<dyn Channel>> {
            let mut replies = self.replies.lock().unwrap();
            let script = replies
                .get_mut(&(endpoint.to_string(), port))
                .and_then(|q| q.pop_front())
                .unwrap_or_default();
            Ok(Box::new(ScriptedChannel {
                to_read: Arc::new(StdMutex::new(script)),
            }))
        }
    }

    const HELLO_ACK: &[u8] = b"%1\r\n+proto\r\n:3\r\n";

    fn single_shard_shards_reply() -> Vec<u8> {
        b"*1\r\n*4\r\n$5\r\nslots\r\n*2\r\n:0\r\n:16383\r\n$5\r\nnodes\r\n*1\r\n*6\r\n$2\r\nip\r\n$9\r\n127.0.0.1\r\n$4\r\nport\r\n:7000\r\n$4\r\nrole\r\n$6\r\nmaster\r\n".to_vec()
    }

    #[test]
    fn test01_connect_reaches_healthy_with_single_shard() {
        let mut replies = HashMap::new();
        // First connection: the discovery probe, handshake + CLUSTER SHARDS.
        // Second connection: the real node client, handshake + GET.
        replies.insert(
            ("127.0.0.1".to_string(), 7000u16),
            VecDeque::from(vec![
                vec![HELLO_ACK.to_vec(), single_shard_shards_reply()],
                vec![HELLO_ACK.to_vec(), b"$3\r\nbar\r\n".to_vec()],
            ]),
        );
        let factory = Arc::new(ScriptedFactory {
            replies: StdMutex::new(replies),
        });
        let client = ClusterClient::connect_with_factory(
            vec![NodeId::new("127.0.0.1", 7000)],
            ClientConfig::default(),
            Logger::null(),
            factory,
        )
        .unwrap();
        client.wait_for_healthy().unwrap();
        let value = client.execute(&Get(b"foo".to_vec())).unwrap();
        assert_eq!(value, Some("bar".to_string()));
        client.shutdown();
    }

    #[test]
    fn test02_shutdown_rejects_further_waits() {
        let mut replies = HashMap::new();
        replies.insert(
            ("127.0.0.1".to_string(), 7000u16),
            VecDeque::from(vec![vec![HELLO_ACK.to_vec(), single_shard_shards_reply()]]),
        );
        let factory = Arc::new(ScriptedFactory {
            replies: StdMutex::new(replies),
        });
        let client = ClusterClient::connect_with_factory(
            vec![NodeId::new("127.0.0.1", 7000)],
            ClientConfig::default(),
            Logger::null(),
            factory,
        )
        .unwrap();
        client.wait_for_healthy().unwrap();
        client.shutdown();
        assert_eq!(client.wait_for_healthy(), Err(ClientError::ClusterClientIsShutDown));
    }
}
