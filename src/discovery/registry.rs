use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use super::types::{MembershipEvent, NodeRecord, NodeState, RegisterOutcome};
use crate::config::DiscoveryConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::shard::types::NodeId;

/// Source of truth for which nodes currently exist.
///
/// Liveness is driven by two independent clocks: nodes push heartbeats at
/// their own interval, and `sweep` checks every record against the server-side
/// deadline. Both take an explicit `now` so the state machine can be tested
/// without real timing.
pub struct DiscoveryRegistry {
    config: DiscoveryConfig,
    members: DashMap<NodeId, NodeRecord>,
}

impl DiscoveryRegistry {
    pub fn new(config: DiscoveryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            members: DashMap::new(),
        })
    }

    pub fn register(
        &self,
        node_id: NodeId,
        address: &str,
        boot_id: &str,
    ) -> ClusterResult<RegisterOutcome> {
        self.register_at(node_id, address, boot_id, Instant::now())
    }

    pub fn register_at(
        &self,
        node_id: NodeId,
        address: &str,
        boot_id: &str,
        now: Instant,
    ) -> ClusterResult<RegisterOutcome> {
        let (outcome, event) = match self.members.entry(node_id) {
            Entry::Vacant(vacant) => {
                vacant.insert(NodeRecord {
                    node_id,
                    address: address.to_string(),
                    state: NodeState::Alive,
                    incarnation: 1,
                    boot_id: boot_id.to_string(),
                    missed_deadlines: 0,
                    last_heartbeat: Some(now),
                    suspect_since: None,
                });
                (
                    RegisterOutcome {
                        incarnation: 1,
                        rejoined_after_dead: false,
                    },
                    Some(MembershipEvent::Joined {
                        node_id,
                        incarnation: 1,
                    }),
                )
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();

                let event = if record.state == NodeState::Dead {
                    record.incarnation += 1;
                    Some(MembershipEvent::Joined {
                        node_id,
                        incarnation: record.incarnation,
                    })
                } else if record.address != address {
                    tracing::warn!(
                        node_id = node_id.0,
                        registered = %record.address,
                        requested = %address,
                        "Rejected registration: node is live at another address"
                    );
                    return Err(ClusterError::AlreadyRegistered {
                        node_id,
                        address: record.address.clone(),
                    });
                } else if record.boot_id != boot_id {
                    record.incarnation += 1;
                    Some(MembershipEvent::Restarted {
                        node_id,
                        incarnation: record.incarnation,
                    })
                } else {
                    None
                };

                let rejoined_after_dead = record.state == NodeState::Dead;
                record.address = address.to_string();
                record.boot_id = boot_id.to_string();
                record.state = NodeState::Alive;
                record.missed_deadlines = 0;
                record.last_heartbeat = Some(now);
                record.suspect_since = None;

                (
                    RegisterOutcome {
                        incarnation: record.incarnation,
                        rejoined_after_dead,
                    },
                    event,
                )
            }
        };

        if let Some(event) = event {
            log_event(&event);
        }
        Ok(outcome)
    }

    pub fn heartbeat(&self, node_id: NodeId) -> ClusterResult<u64> {
        self.heartbeat_at(node_id, Instant::now())
    }

    /// Returns the node's current incarnation.
    pub fn heartbeat_at(&self, node_id: NodeId, now: Instant) -> ClusterResult<u64> {
        let mut record = self
            .members
            .get_mut(&node_id)
            .ok_or(ClusterError::UnknownNode(node_id))?;

        match record.state {
            NodeState::Dead => return Err(ClusterError::NodeDead(node_id)),
            NodeState::Suspect => {
                record.state = NodeState::Alive;
                record.suspect_since = None;
                log_event(&MembershipEvent::Recovered(node_id));
            }
            NodeState::Alive => {}
        }

        record.last_heartbeat = Some(now);
        record.missed_deadlines = 0;
        Ok(record.incarnation)
    }

    /// Every node not declared `Dead`, sorted by id. `Suspect` nodes are included.
    pub fn list_alive(&self) -> Vec<NodeRecord> {
        let mut alive: Vec<NodeRecord> = self
            .members
            .iter()
            .filter(|entry| entry.value().state.is_live())
            .map(|entry| entry.value().clone())
            .collect();
        alive.sort_by_key(|r| r.node_id);
        alive
    }

    pub fn get(&self, node_id: NodeId) -> Option<NodeRecord> {
        self.members.get(&node_id).map(|r| r.value().clone())
    }

    pub fn deregister(&self, node_id: NodeId) -> ClusterResult<()> {
        self.members
            .remove(&node_id)
            .ok_or(ClusterError::UnknownNode(node_id))?;
        log_event(&MembershipEvent::Left(node_id));
        Ok(())
    }

    /// Checks every record against the heartbeat deadline.
    ///
    /// One missed deadline moves `Alive → Suspect`. A suspect is declared `Dead`
    /// after `dead_after_missed` consecutive deadlines or once the suspect grace
    /// window has elapsed, whichever comes first.
    pub fn sweep(&self, now: Instant) -> Vec<MembershipEvent> {
        let deadline = self.config.heartbeat_deadline();
        let grace = self.config.suspect_grace();
        let mut events = Vec::new();

        for mut entry in self.members.iter_mut() {
            let record = entry.value_mut();
            if record.state == NodeState::Dead {
                continue;
            }

            let Some(last) = record.last_heartbeat else {
                record.last_heartbeat = Some(now);
                continue;
            };

            let silent = now.saturating_duration_since(last);
            let missed = if deadline.is_zero() {
                0
            } else {
                (silent.as_millis() / deadline.as_millis()) as u32
            };
            record.missed_deadlines = missed;

            if record.state == NodeState::Alive && missed >= 1 {
                record.state = NodeState::Suspect;
                record.suspect_since = Some(now);
                events.push(MembershipEvent::Suspected(record.node_id));
            }

            if record.state == NodeState::Suspect {
                let suspect_for = record
                    .suspect_since
                    .map(|since| now.saturating_duration_since(since))
                    .unwrap_or_default();
                if missed >= self.config.dead_after_missed || suspect_for >= grace {
                    record.state = NodeState::Dead;
                    events.push(MembershipEvent::Died(record.node_id));
                }
            }
        }

        for event in &events {
            log_event(event);
        }
        events
    }

    /// Runs `sweep` on the configured interval until the runtime shuts down.
    pub fn spawn_failure_detector(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.sweep_interval());
            loop {
                interval.tick().await;
                let events = registry.sweep(Instant::now());
                if !events.is_empty() {
                    tracing::info!(
                        "Cluster membership now: {} live nodes",
                        registry.list_alive().len()
                    );
                }
            }
        })
    }
}

fn log_event(event: &MembershipEvent) {
    match event {
        MembershipEvent::Joined {
            node_id,
            incarnation,
        } => tracing::info!(node_id = node_id.0, incarnation, "Node joined"),
        MembershipEvent::Restarted {
            node_id,
            incarnation,
        } => tracing::info!(node_id = node_id.0, incarnation, "Node restarted"),
        MembershipEvent::Suspected(node_id) => {
            tracing::warn!(node_id = node_id.0, "Node suspected (missed heartbeat deadline)")
        }
        MembershipEvent::Recovered(node_id) => {
            tracing::info!(node_id = node_id.0, "Suspected node recovered")
        }
        MembershipEvent::Died(node_id) => tracing::warn!(node_id = node_id.0, "Node declared DEAD"),
        MembershipEvent::Left(node_id) => tracing::info!(node_id = node_id.0, "Node deregistered"),
    }
}
