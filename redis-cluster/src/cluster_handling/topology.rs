//! This module discovers the cluster topology and installs it into a [`NodeRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use arcstr::ArcStr;
use log::{debug, trace, warn};

use super::client::ClusterParams;
use super::slot_map::{Node, NodeRegistry, NodeRole, Slot, SlotAddrs, SlotTable, SLOT_SIZE};
use super::{config_get_full_coverage_cmd, slot_cmd};
use crate::connection::{Connect, ConnectionLike};
use crate::{ErrorKind, RedisError, RedisResult, Value};

// Parse slot data from raw redis value.
pub(crate) fn parse_slots(
    raw_slot_resp: Value,
    // The host of the node from which `raw_slot_resp` was received.
    host_of_answering_node: &str,
) -> RedisResult<Vec<Slot>> {
    let mut slots = Vec::with_capacity(2);

    let items = match raw_slot_resp {
        Value::Array(items) => items,
        other => {
            return Err(RedisError::from((
                ErrorKind::UnexpectedReturnType,
                "CLUSTER SLOTS returned a non-array reply",
                format!("{other:?}"),
            )));
        }
    };

    for item in items {
        let Value::Array(item) = item else {
            continue;
        };
        if item.len() < 3 {
            continue;
        }

        let (Value::Int(start), Value::Int(end)) = (&item[0], &item[1]) else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u16::try_from(*start), u16::try_from(*end)) else {
            continue;
        };

        let try_to_node = |node: Value, role: NodeRole| {
            let Value::Array(node) = node else {
                return None;
            };
            if node.len() < 2 {
                return None;
            }
            // An empty or NULL host means the answering node, "?" an unknown one.
            let host = match &node[0] {
                Value::BulkString(host) => {
                    let host = String::from_utf8_lossy(host);
                    if host.is_empty() {
                        host_of_answering_node.to_string()
                    } else if host == "?" {
                        return None;
                    } else {
                        host.into_owned()
                    }
                }
                Value::Nil => host_of_answering_node.to_string(),
                _ => return None,
            };
            let port = match &node[1] {
                Value::Int(port) => u16::try_from(*port).ok()?,
                _ => return None,
            };
            let node_value = Node::new(&host, port, role);
            Some(match node.get(2) {
                Some(Value::BulkString(id)) => node_value.with_id(&String::from_utf8_lossy(id)),
                _ => node_value,
            })
        };

        let mut iterator = item.into_iter().skip(2);
        let mut primary = None;
        while primary.is_none() {
            let Some(node) = iterator.next() else {
                break;
            };
            primary = try_to_node(node, NodeRole::Master);
        }
        let Some(primary) = primary else {
            continue;
        };
        let replicas: Vec<Node> = iterator
            .filter_map(|node| try_to_node(node, NodeRole::Slave))
            .collect();

        slots.push(Slot::new(start, end, primary, replicas)?);
    }

    Ok(slots)
}

/// A topology being assembled from one or more `CLUSTER SLOTS` replies.
struct CandidateTopology {
    table: SlotTable,
    nodes: HashMap<ArcStr, Node>,
}

impl CandidateTopology {
    fn new() -> Self {
        CandidateTopology {
            table: SlotTable::empty(),
            nodes: HashMap::new(),
        }
    }

    fn add_node(&mut self, node: &Node) {
        // A node seen as a master anywhere stays a master.
        match self.nodes.get(node.name()) {
            Some(existing) if existing.role() == NodeRole::Master => {}
            _ => {
                self.nodes.insert(node.name().clone(), node.clone());
            }
        }
    }

    fn merge(&mut self, slots: Vec<Slot>) -> RedisResult<()> {
        for slot in slots {
            self.add_node(&slot.primary);
            for replica in &slot.replicas {
                self.add_node(replica);
            }
            let addrs = Arc::new(SlotAddrs::new(slot.primary, slot.replicas));
            for index in slot.start..=slot.end {
                if let Some(existing) = self.table.get(index) {
                    if existing.primary.name() != addrs.primary.name() {
                        return Err(RedisError::from((
                            ErrorKind::SlotCollision,
                            "Nodes disagree on the owner of a slot",
                            format!(
                                "slot {index}: {} vs {}",
                                existing.primary, addrs.primary
                            ),
                        )));
                    }
                    continue;
                }
                self.table.set(index, addrs.clone());
            }
        }
        Ok(())
    }

    fn single_node(node: &Node) -> Self {
        let mut topology = CandidateTopology::new();
        let owner = Node::new(node.host(), node.port(), NodeRole::Master).with_id(node.id());
        topology.add_node(&owner);
        let addrs = Arc::new(SlotAddrs::new(owner, Vec::new()));
        for slot in 0..SLOT_SIZE {
            topology.table.set(slot, addrs.clone());
        }
        topology
    }

    fn masters(&self) -> Vec<Node> {
        let mut masters: Vec<Node> = self
            .nodes
            .values()
            .filter(|node| node.role() == NodeRole::Master)
            .cloned()
            .collect();
        masters.sort_by(|a, b| a.name().cmp(b.name()));
        masters
    }
}

async fn query_node<C: Connect>(
    node: &Node,
    packed_cmd: &[u8],
    params: &ClusterParams,
) -> RedisResult<Value> {
    let mut conn = C::connect(
        node.name(),
        params.connection_timeout,
        params.response_timeout,
    )
    .await?;
    let result = conn.req_packed_command(packed_cmd).await;
    conn.disconnect();
    result
}

fn is_cluster_disabled(reply: &Value) -> bool {
    reply
        .server_error()
        .and_then(|err| err.details())
        .is_some_and(|details| details.contains("cluster support disabled"))
}

/// Asks every master whether the cluster stops serving when slots are unassigned.
///
/// Only a unanimous `no` lifts the requirement; a failed query counts as `yes`.
pub(crate) async fn cluster_require_full_coverage<C: Connect>(
    masters: &[Node],
    params: &ClusterParams,
) -> bool {
    let packed = config_get_full_coverage_cmd().get_packed_command();
    for master in masters {
        let answer = query_node::<C>(master, &packed, params).await;
        let says_no = match &answer {
            Ok(Value::Array(items)) => items
                .get(1)
                .and_then(Value::as_bytes)
                .is_some_and(|value| value.eq_ignore_ascii_case(b"no")),
            _ => false,
        };
        trace!("{master} cluster-require-full-coverage: {answer:?}");
        if !says_no {
            return true;
        }
    }
    false
}

/// Discovers the topology and installs it into `registry`.
pub(crate) async fn initialize<C: Connect>(
    registry: &NodeRegistry,
    params: &ClusterParams,
) -> RedisResult<()> {
    let startup_nodes = registry.startup_nodes();
    let candidates = if params.nodemanager_follow_cluster {
        let known = registry.all_nodes();
        if known.is_empty() {
            startup_nodes.clone()
        } else {
            known
        }
    } else {
        startup_nodes.clone()
    };

    let packed_slot_cmd = slot_cmd().get_packed_command();
    let mut topology = CandidateTopology::new();
    let mut failures = Vec::new();
    let mut answered = false;
    let mut coverage_required = None;

    for candidate in &candidates {
        let reply = match query_node::<C>(candidate, &packed_slot_cmd, params).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("topology discovery through {candidate} failed: {err}");
                failures.push(format!("{candidate}: {err}"));
                continue;
            }
        };
        answered = true;

        if is_cluster_disabled(&reply) && startup_nodes.len() == 1 {
            debug!("{candidate} has cluster support disabled, it serves every slot");
            topology = CandidateTopology::single_node(candidate);
            break;
        }
        let reply = reply.extract_error()?;
        let slots = parse_slots(reply, candidate.host())?;
        if slots.is_empty() {
            debug!("{candidate} reported no slot ranges, it serves every slot");
            topology = CandidateTopology::single_node(candidate);
            break;
        }
        topology.merge(slots)?;

        if topology.table.is_fully_covered() {
            break;
        }
        let required = match coverage_required {
            Some(required) => required,
            None => {
                let required = !params.skip_full_coverage_check
                    && cluster_require_full_coverage::<C>(&topology.masters(), params).await;
                coverage_required = Some(required);
                required
            }
        };
        if !required {
            break;
        }
    }

    if !answered {
        return Err(RedisError::from((
            ErrorKind::ClusterUnreachable,
            "Failed to reach any cluster node",
            failures.join("; "),
        )));
    }

    let fully_covered = topology.table.is_fully_covered();
    let coverage_required = if fully_covered {
        !params.skip_full_coverage_check
    } else {
        coverage_required.unwrap_or(!params.skip_full_coverage_check)
    };
    if !fully_covered && coverage_required {
        return Err(RedisError::from((
            ErrorKind::IncompleteCoverage,
            "Not all slots are covered",
            format!("{} of {SLOT_SIZE} covered", topology.table.covered()),
        )));
    }

    registry.replace(topology.table, topology.nodes);
    registry.set_full_coverage_required(coverage_required);
    registry.reset_reinitialize_counter();
    registry.clear_refresh_pending();
    registry.populate_startup_nodes();
    debug!("topology initialized from {} candidates", candidates.len());
    Ok(())
}
