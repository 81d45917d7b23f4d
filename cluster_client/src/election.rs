//! Topology election: quorum voting over candidate
//! topologies reported by nodes during discovery.

use std::collections::HashMap;

use crate::node_id::NodeId;
use crate::topology::ClusterDescription;

/// A normalised topology reply, keyed so two voters reporting the same
/// shard layout (in any node order) hash to the same candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyCandidate {
    pub description: ClusterDescription,
}

impl TopologyCandidate {
    /// A stable key for this candidate: sorted `(slot_start, slot_end,
    /// primary)` triples joined together. Two replies describing the
    /// same shards, regardless of array order, produce the same key.
    pub fn key(&self) -> String {
        let mut parts: Vec<String> = self
            .description
            .shards
            .iter()
            .map(|shard| {
                let mut ranges: Vec<String> = shard
                    .slot_ranges
                    .iter()
                    .map(|r| format!("{}-{}", r.start(), r.end()))
                    .collect();
                ranges.sort();
                let primary = shard
                    .primary_id()
                    .map(|id| id.to_string())
                    .unwrap_or_default();
                format!("{}:[{}]", primary, ranges.join(","))
            })
            .collect();
        parts.sort();
        parts.join("|")
    }

    pub fn total_nodes(&self) -> usize {
        self.description.total_nodes()
    }
}

struct Candidacy {
    candidate: TopologyCandidate,
    votes_received: usize,
    votes_needed: usize,
}

/// Tracks an in-progress discovery round: one ballot per voter, and vote
/// counts per distinct candidate key.
pub struct Election {
    ballots: HashMap<NodeId, String>,
    candidacies: HashMap<String, Candidacy>,
}

impl Election {
    pub fn new() -> Self {
        Election {
            ballots: HashMap::new(),
            candidacies: HashMap::new(),
        }
    }

    /// Records (or replaces) `voter`'s vote for `candidate`. Returns the
    /// winning candidate's description once its vote count reaches
    /// `ceil(total_nodes/2)+1`.
    pub fn vote(&mut self, voter: NodeId, candidate: TopologyCandidate) -> Option<ClusterDescription> {
        let key = candidate.key();

        if let Some(prev_key) = self.ballots.get(&voter).cloned() {
            if prev_key == key {
                return self.check_winner(&key);
            }
            if let Some(prev) = self.candidacies.get_mut(&prev_key) {
                prev.votes_received = prev.votes_received.saturating_sub(1);
            }
        }

        self.ballots.insert(voter, key.clone());
        let total_nodes = candidate.total_nodes().max(1);
        let votes_needed = total_nodes / 2 + 1;
        let entry = self.candidacies.entry(key.clone()).or_insert(Candidacy {
            candidate,
            votes_received: 0,
            votes_needed,
        });
        entry.votes_received += 1;

        self.check_winner(&key)
    }

    fn check_winner(&self, key: &str) -> Option<ClusterDescription> {
        let entry = self.candidacies.get(key)?;
        if entry.votes_received >= entry.votes_needed {
            Some(entry.candidate.description.clone())
        } else {
            None
        }
    }

    pub fn voter_count(&self) -> usize {
        self.ballots.len()
    }
}

impl Default for Election {
    fn default() -> Self {
        Self::new()
    }
}
