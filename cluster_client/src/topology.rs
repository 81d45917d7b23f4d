//! Topology model: shard descriptions, the slot→shard map,
//! and MOVED-driven mutations.

use std::ops::RangeInclusive;

use crate::hash_slot::{HashSlot, SLOT_COUNT};
use crate::node_id::{NodeDescription, NodeHealth, NodeId, NodeRole};

#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub slot_ranges: Vec<RangeInclusive<u16>>,
    pub nodes: Vec<NodeDescription>,
}

impl Shard {
    pub fn primary(&self) -> Option<&NodeDescription> {
        self.nodes.iter().find(|n| n.role == NodeRole::Primary)
    }

    pub fn primary_id(&self) -> Option<&NodeId> {
        self.primary().map(|n| &n.id)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &NodeDescription> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Replica)
    }

    pub fn contains_slot(&self, slot: u16) -> bool {
        self.slot_ranges.iter().any(|r| r.contains(&slot))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// An ordered list of shards.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClusterDescription {
    pub shards: Vec<Shard>,
}

impl ClusterDescription {
    pub fn total_nodes(&self) -> usize {
        self.shards.iter().map(Shard::node_count).sum()
    }

    pub fn find_shard_with_primary(&self, id: &NodeId) -> Option<usize> {
        self.shards.iter().position(|s| s.primary_id() == Some(id))
    }

    pub fn find_shard_with_replica(&self, id: &NodeId) -> Option<(usize, usize)> {
        for (si, shard) in self.shards.iter().enumerate() {
            if let Some(ni) = shard.nodes.iter().position(|n| &n.id == id && n.role == NodeRole::Replica) {
                return Some((si, ni));
            }
        }
        None
    }

    pub fn build_slot_map(&self) -> SlotMap {
        let mut map = SlotMap::empty();
        for (idx, shard) in self.shards.iter().enumerate() {
            for range in &shard.slot_ranges {
                for slot in range.clone() {
                    map.entries[slot as usize] = Some(idx);
                }
            }
        }
        map
    }
}

/// A dense array of 16,384 entries, each holding either a shard index
/// or `None` (the "missing" sentinel).
#[derive(Debug, Clone, PartialEq)]
pub struct SlotMap {
    entries: Vec<Option<usize>>,
}

impl SlotMap {
    pub fn empty() -> Self {
        SlotMap {
            entries: vec![None; SLOT_COUNT as usize],
        }
    }

    pub fn shard_index_for(&self, slot: HashSlot) -> Option<usize> {
        if slot.is_unknown() {
            return None;
        }
        self.entries[slot.get() as usize]
    }

    pub fn set(&mut self, slot: u16, shard_index: Option<usize>) {
        self.entries[slot as usize] = shard_index;
    }
}

/// Outcome of applying a MOVED reply to the topology.
#[derive(Debug, PartialEq)]
pub enum MovedOutcome {
    /// The slot now resolves to a shard we already have a client for.
    UpdatedToExisting,
    /// The slot resolves to a brand-new node we have no description
    /// for — triggers Degraded + immediate discovery.
    UpdatedToUnknown,
}

/// Applies a `MOVED slot -> node_id` reply to `description`/`slot_map`
/// in place, implementing the five MOVED-handling rules.
pub fn apply_moved(
    description: &mut ClusterDescription,
    slot_map: &mut SlotMap,
    slot: HashSlot,
    node_id: &NodeId,
) -> MovedOutcome {
    let current_shard_idx = slot_map.shard_index_for(slot);

    // Rule 1: already the primary of the slot's current shard.
    if let Some(idx) = current_shard_idx {
        if description.shards[idx].primary_id() == Some(node_id) {
            return MovedOutcome::UpdatedToExisting;
        }
        // Rule 2: node_id is a replica of that same shard -> promote.
        if let Some(pos) = description.shards[idx]
            .nodes
            .iter()
            .position(|n| &n.id == node_id && n.role == NodeRole::Replica)
        {
            for node in description.shards[idx].nodes.iter_mut() {
                if node.role == NodeRole::Primary {
                    node.role = NodeRole::Replica;
                }
            }
            description.shards[idx].nodes[pos].role = NodeRole::Primary;
            return MovedOutcome::UpdatedToExisting;
        }
    }

    // Rule 3: node_id is the primary of some other shard -> redirect.
    if let Some(idx) = description.find_shard_with_primary(node_id) {
        slot_map.set(slot.get(), Some(idx));
        return MovedOutcome::UpdatedToExisting;
    }

    // Rule 4: node_id is a replica of some other shard -> detach, new shard.
    if let Some((si, ni)) = description.find_shard_with_replica(node_id) {
        let node = description.shards[si].nodes.remove(ni);
        let new_idx = description.shards.len();
        description.shards.push(Shard {
            slot_ranges: vec![],
            nodes: vec![NodeDescription {
                role: NodeRole::Primary,
                ..node
            }],
        });
        slot_map.set(slot.get(), Some(new_idx));
        return MovedOutcome::UpdatedToExisting;
    }

    // Rule 5: entirely unknown node -> new shard, Degraded + discovery.
    let new_idx = description.shards.len();
    description.shards.push(Shard {
        slot_ranges: vec![],
        nodes: vec![NodeDescription {
            id: node_id.clone(),
            ip: None,
            hostname: None,
            tls_port: None,
            use_tls: false,
            role: NodeRole::Primary,
            health: NodeHealth::Online,
            replication_offset: 0,
        }],
    });
    slot_map.set(slot.get(), Some(new_idx));
    MovedOutcome::UpdatedToUnknown
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn two_shard_description() -> ClusterDescription {
        ClusterDescription {
            shards: vec![
                Shard {
                    slot_ranges: vec![0..=8191],
                    nodes: vec![node("10.0.0.1", 7000, NodeRole::Primary)],
                },
                Shard {
                    slot_ranges: vec![8192..=16383],
                    nodes: vec![
                        node("10.0.0.2", 7001, NodeRole::Primary),
                        node("10.0.0.3", 7002, NodeRole::Replica),
                    ],
                },
            ],
        }
    }

    #[test]
    fn test01_slot_map_respects_invariant_i1() {
        let desc = two_shard_description();
        let map = desc.build_slot_map();
        assert_eq!(map.shard_index_for(HashSlot::try_from(0).unwrap()), Some(0));
        assert_eq!(map.shard_index_for(HashSlot::try_from(8192).unwrap()), Some(1));
    }

    #[test]
    fn test02_moved_to_existing_primary_is_noop() {
        let mut desc = two_shard_description();
        let mut map = desc.build_slot_map();
        let outcome = apply_moved(
            &mut desc,
            &mut map,
            HashSlot::try_from(0).unwrap(),
            &NodeId::new("10.0.0.1", 7000),
        );
        assert_eq!(outcome, MovedOutcome::UpdatedToExisting);
    }

    #[test]
    fn test03_moved_to_replica_promotes() {
        let mut desc = two_shard_description();
        let mut map = desc.build_slot_map();
        let slot = HashSlot::try_from(8192).unwrap();
        let outcome = apply_moved(&mut desc, &mut map, slot, &NodeId::new("10.0.0.3", 7002));
        assert_eq!(outcome, MovedOutcome::UpdatedToExisting);
        assert_eq!(
            desc.shards[1].primary_id(),
            Some(&NodeId::new("10.0.0.3", 7002))
        );
        assert_eq!(desc.shards[1].replicas().count(), 0);
    }

    #[test]
    fn test04_moved_to_unknown_node_creates_shard() {
        let mut desc = two_shard_description();
        let mut map = desc.build_slot_map();
        let slot = HashSlot::try_from(100).unwrap();
        let outcome = apply_moved(&mut desc, &mut map, slot, &NodeId::new("10.0.0.9", 9999));
        assert_eq!(outcome, MovedOutcome::UpdatedToUnknown);
        assert_eq!(map.shard_index_for(slot), Some(2));
        assert_eq!(
            desc.shards[2].primary_id(),
            Some(&NodeId::new("10.0.0.9", 9999))
        );
    }

    #[test]
    fn test05_moved_to_primary_of_other_shard_redirects_slot() {
        let mut desc = two_shard_description();
        let mut map = desc.build_slot_map();
        let slot = HashSlot::try_from(0).unwrap();
        let outcome = apply_moved(&mut desc, &mut map, slot, &NodeId::new("10.0.0.2", 7001));
        assert_eq!(outcome, MovedOutcome::UpdatedToExisting);
        assert_eq!(map.shard_index_for(slot), Some(1));
    }
}
