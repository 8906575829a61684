use std::collections::{BTreeMap, BTreeSet};

use super::types::MigrationKind;
use crate::shard::types::{NodeId, ShardId};

/// Everything the planner needs, as plain data.
#[derive(Debug, Default, Clone)]
pub struct PlanInput {
    /// Effective owner of every shard: the committed owner, or the destination
    /// of a migration already in flight.
    pub owners: BTreeMap<ShardId, NodeId>,
    /// Shards locked by a task (in flight or awaiting rollback).
    pub busy: BTreeSet<ShardId>,
    /// `Alive`, non-draining nodes. The only possible destinations.
    pub eligible: BTreeSet<NodeId>,
    /// Every node Discovery still lists (`Alive` or `Suspect`).
    pub live: BTreeSet<NodeId>,
    /// Live nodes being emptied by a decommission.
    pub draining: BTreeSet<NodeId>,
    /// Shards whose owner restarted and came back without their data.
    pub lost: BTreeSet<ShardId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub shard: ShardId,
    pub from: NodeId,
    pub to: NodeId,
    pub kind: MigrationKind,
}

/// Computes the moves that bring the map to its target assignment.
///
/// Shards of departed nodes go first, each to the least-loaded eligible node
/// (ties to the lowest id). Then the minimum number of shards move from the
/// most-loaded to the least-loaded eligible nodes until every eligible node is
/// within one shard of every other. Busy shards are never touched; `Suspect`
/// nodes keep what they have but receive nothing.
pub fn plan(input: &PlanInput) -> Vec<PlannedMove> {
    if input.eligible.is_empty() {
        return Vec::new();
    }

    let mut load: BTreeMap<NodeId, usize> = input.eligible.iter().map(|n| (*n, 0)).collect();
    for owner in input.owners.values() {
        if let Some(count) = load.get_mut(owner) {
            *count += 1;
        }
    }

    let mut moves = Vec::new();
    let mut owners = input.owners.clone();

    for (shard, owner) in &input.owners {
        if input.busy.contains(shard) {
            continue;
        }
        let kind = if !input.live.contains(owner) || input.lost.contains(shard) {
            MigrationKind::Recovery
        } else if input.draining.contains(owner) {
            MigrationKind::Drain
        } else {
            continue;
        };

        let Some(to) = least_loaded(&load, *owner) else {
            continue;
        };
        if let Some(count) = load.get_mut(&to) {
            *count += 1;
        }
        if let Some(count) = load.get_mut(owner) {
            *count = count.saturating_sub(1);
        }
        owners.insert(*shard, to);
        moves.push(PlannedMove {
            shard: *shard,
            from: *owner,
            to,
            kind,
        });
    }

    let mut moved: BTreeSet<ShardId> = moves.iter().map(|m| m.shard).collect();
    loop {
        let Some((&heaviest, &max)) = load.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        else {
            break;
        };
        let Some((&lightest, &min)) = load.iter().min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
        else {
            break;
        };
        if max <= min + 1 {
            break;
        }

        let candidate = owners
            .iter()
            .find(|(shard, owner)| {
                **owner == heaviest && !input.busy.contains(shard) && !moved.contains(shard)
            })
            .map(|(shard, _)| *shard);
        let Some(shard) = candidate else {
            break;
        };

        owners.insert(shard, lightest);
        moved.insert(shard);
        if let Some(count) = load.get_mut(&heaviest) {
            *count -= 1;
        }
        if let Some(count) = load.get_mut(&lightest) {
            *count += 1;
        }
        moves.push(PlannedMove {
            shard,
            from: heaviest,
            to: lightest,
            kind: MigrationKind::Rebalance,
        });
    }

    moves
}

fn least_loaded(load: &BTreeMap<NodeId, usize>, exclude: NodeId) -> Option<NodeId> {
    load.iter()
        .filter(|(node, _)| **node != exclude)
        .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
        .map(|(node, _)| *node)
}
