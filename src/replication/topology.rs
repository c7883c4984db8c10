//! Replication topology and its latency-optimal spanning tree.

use crate::membership::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyShape {
    Star,
    Ring,
    Mesh,
    Hierarchical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkProfile {
    pub bandwidth_mbps: u64,
    pub latency_ms: f64,
    pub reliability: f64,
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self {
            bandwidth_mbps: 1_000,
            latency_ms: 1.0,
            reliability: 0.99,
        }
    }
}

/// Undirected weighted link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub bandwidth_mbps: u64,
    pub latency_ms: f64,
    pub reliability: f64,
}

impl TopologyEdge {
    pub fn new(from: NodeId, to: NodeId, link: LinkProfile) -> Self {
        Self {
            from,
            to,
            bandwidth_mbps: link.bandwidth_mbps,
            latency_ms: link.latency_ms,
            reliability: link.reliability,
        }
    }

    /// Latency inflated by expected retransmits over an unreliable link.
    pub fn cost(&self) -> f64 {
        self.latency_ms.max(0.0) / self.reliability
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTopology {
    pub nodes: Vec<NodeId>,
    pub edges: Vec<TopologyEdge>,
    pub replication_factor: usize,
    pub shape: TopologyShape,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("topology has no nodes")]
    Empty,
    #[error("edge references unknown node {0}")]
    UnknownNode(NodeId),
}

impl ReplicationTopology {
    /// Lay `nodes` out in `shape` with uniform links. Star hubs on the first node;
    /// hierarchical is a binary tree in node order.
    pub fn build(
        nodes: Vec<NodeId>,
        shape: TopologyShape,
        replication_factor: usize,
        link: LinkProfile,
    ) -> Self {
        let mut edges = Vec::new();
        let n = nodes.len();
        let mut link_between = |a: usize, b: usize| {
            edges.push(TopologyEdge::new(nodes[a].clone(), nodes[b].clone(), link));
        };
        match shape {
            TopologyShape::Star => (1..n).for_each(|i| link_between(0, i)),
            TopologyShape::Ring if n == 2 => link_between(0, 1),
            TopologyShape::Ring if n > 2 => (0..n).for_each(|i| link_between(i, (i + 1) % n)),
            TopologyShape::Ring => {}
            TopologyShape::Mesh => {
                for i in 0..n {
                    for j in i + 1..n {
                        link_between(i, j);
                    }
                }
            }
            TopologyShape::Hierarchical => (1..n).for_each(|i| link_between((i - 1) / 2, i)),
        }
        Self {
            nodes,
            edges,
            replication_factor,
            shape,
        }
    }

    pub fn set_link(&mut self, a: &NodeId, b: &NodeId, link: LinkProfile) {
        let existing = self
            .edges
            .iter_mut()
            .find(|e| (&e.from == a && &e.to == b) || (&e.from == b && &e.to == a));
        match existing {
            Some(edge) => {
                edge.bandwidth_mbps = link.bandwidth_mbps;
                edge.latency_ms = link.latency_ms;
                edge.reliability = link.reliability;
            }
            None => self.edges.push(TopologyEdge::new(a.clone(), b.clone(), link)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedTopology {
    /// Fan-out origin with the smallest worst-case path cost.
    pub root: NodeId,
    /// Shortest-path tree from `root`, shape `Hierarchical`.
    pub topology: ReplicationTopology,
    /// Largest reliability-weighted path cost from the root.
    pub worst_case_cost: f64,
    /// Largest raw latency along a tree path from the root.
    pub worst_case_latency_ms: f64,
    pub dropped_edges: usize,
    /// Nodes the root cannot reach over sufficiently reliable links.
    pub unreachable: Vec<NodeId>,
}

#[derive(Copy, Clone, PartialEq)]
struct Frontier {
    cost: f64,
    node: usize,
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .partial_cmp(&self.cost)
            .unwrap_or(Ordering::Equal) // min-heap
            .then_with(|| other.node.cmp(&self.node))
    }
}

struct ShortestPaths {
    cost: Vec<f64>,
    parent: Vec<Option<(usize, usize)>>,
}

fn dijkstra(adjacency: &[Vec<(usize, usize)>], edges: &[TopologyEdge], source: usize) -> ShortestPaths {
    let n = adjacency.len();
    let mut cost = vec![f64::INFINITY; n];
    let mut parent = vec![None; n];
    let mut heap = BinaryHeap::new();
    cost[source] = 0.0;
    heap.push(Frontier { cost: 0.0, node: source });
    while let Some(Frontier { cost: at, node }) = heap.pop() {
        if at > cost[node] {
            continue;
        }
        for &(next, edge_idx) in &adjacency[node] {
            let candidate = at + edges[edge_idx].cost();
            if candidate < cost[next] {
                cost[next] = candidate;
                parent[next] = Some((node, edge_idx));
                heap.push(Frontier { cost: candidate, node: next });
            }
        }
    }
    ShortestPaths { cost, parent }
}

/// Pick the root minimizing worst-case reliability-weighted latency and return its
/// shortest-path tree. Edges below `min_reliability` are not used.
pub fn optimize_topology(
    topology: &ReplicationTopology,
    min_reliability: f64,
) -> Result<OptimizedTopology, TopologyError> {
    if topology.nodes.is_empty() {
        return Err(TopologyError::Empty);
    }
    let index: HashMap<&NodeId, usize> = topology
        .nodes
        .iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();
    let mut usable = Vec::new();
    let mut dropped_edges = 0;
    for edge in &topology.edges {
        for end in [&edge.from, &edge.to] {
            if !index.contains_key(end) {
                return Err(TopologyError::UnknownNode(end.clone()));
            }
        }
        if edge.reliability > 0.0 && edge.reliability >= min_reliability && edge.from != edge.to {
            usable.push(edge.clone());
        } else {
            dropped_edges += 1;
        }
    }
    let n = topology.nodes.len();
    let mut adjacency = vec![Vec::new(); n];
    for (i, edge) in usable.iter().enumerate() {
        let (a, b) = (index[&edge.from], index[&edge.to]);
        adjacency[a].push((b, i));
        adjacency[b].push((a, i));
    }

    // Rank roots by (reached count desc, eccentricity asc, id asc).
    let mut best: Option<(usize, usize, f64, ShortestPaths)> = None;
    for source in 0..n {
        let paths = dijkstra(&adjacency, &usable, source);
        let reached = paths.cost.iter().filter(|c| c.is_finite()).count();
        let eccentricity = paths
            .cost
            .iter()
            .copied()
            .filter(|c| c.is_finite())
            .fold(0.0, f64::max);
        let better = match &best {
            None => true,
            Some((_, best_reached, best_ecc, _)) => {
                reached > *best_reached || (reached == *best_reached && eccentricity < *best_ecc)
            }
        };
        if better {
            best = Some((source, reached, eccentricity, paths));
        }
    }
    let Some((root, _, worst_case_cost, paths)) = best else {
        return Err(TopologyError::Empty);
    };

    let mut tree_edges = Vec::new();
    let mut unreachable = Vec::new();
    let mut raw_latency = vec![0.0f64; n];
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| {
        paths.cost[*a]
            .partial_cmp(&paths.cost[*b])
            .unwrap_or(Ordering::Equal)
    });
    for node in order {
        if node == root {
            continue;
        }
        match paths.parent[node] {
            Some((parent, edge_idx)) => {
                let edge = &usable[edge_idx];
                raw_latency[node] = raw_latency[parent] + edge.latency_ms;
                tree_edges.push(TopologyEdge {
                    from: topology.nodes[parent].clone(),
                    to: topology.nodes[node].clone(),
                    bandwidth_mbps: edge.bandwidth_mbps,
                    latency_ms: edge.latency_ms,
                    reliability: edge.reliability,
                });
            }
            None => unreachable.push(topology.nodes[node].clone()),
        }
    }
    unreachable.sort();
    let worst_case_latency_ms = raw_latency.iter().copied().fold(0.0, f64::max);

    Ok(OptimizedTopology {
        root: topology.nodes[root].clone(),
        topology: ReplicationTopology {
            nodes: topology.nodes.clone(),
            edges: tree_edges,
            replication_factor: topology.replication_factor,
            shape: TopologyShape::Hierarchical,
        },
        worst_case_cost,
        worst_case_latency_ms,
        dropped_edges,
        unreachable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<NodeId> {
        (0..n).map(|i| NodeId::new(format!("n{i}"))).collect()
    }

    #[test]
    fn shapes_have_expected_edge_counts() {
        let link = LinkProfile::default();
        assert_eq!(ReplicationTopology::build(ids(5), TopologyShape::Star, 3, link).edges.len(), 4);
        assert_eq!(ReplicationTopology::build(ids(5), TopologyShape::Ring, 3, link).edges.len(), 5);
        assert_eq!(ReplicationTopology::build(ids(5), TopologyShape::Mesh, 3, link).edges.len(), 10);
        assert_eq!(
            ReplicationTopology::build(ids(5), TopologyShape::Hierarchical, 3, link).edges.len(),
            4
        );
    }

    #[test]
    fn ring_root_is_central_and_tree_spans() {
        let topo = ReplicationTopology::build(ids(5), TopologyShape::Ring, 3, LinkProfile::default());
        let out = optimize_topology(&topo, 0.5).unwrap();
        assert_eq!(out.topology.edges.len(), 4);
        assert!(out.unreachable.is_empty());
        // ring of 5: every node is two hops from its farthest peer
        let hop = LinkProfile::default().latency_ms / LinkProfile::default().reliability;
        assert!((out.worst_case_cost - 2.0 * hop).abs() < 1e-9);
    }

    #[test]
    fn unreliable_edges_are_dropped_and_routed_around() {
        let nodes = ids(3);
        let mut topo = ReplicationTopology::build(nodes.clone(), TopologyShape::Mesh, 3, LinkProfile::default());
        topo.set_link(
            &nodes[0],
            &nodes[1],
            LinkProfile {
                reliability: 0.1,
                ..LinkProfile::default()
            },
        );
        let out = optimize_topology(&topo, 0.5).unwrap();
        assert_eq!(out.dropped_edges, 1);
        assert_eq!(out.root, nodes[2]);
        assert!(out
            .topology
            .edges
            .iter()
            .all(|e| !(e.from == nodes[0] && e.to == nodes[1]) && !(e.from == nodes[1] && e.to == nodes[0])));
    }

    #[test]
    fn disconnected_nodes_reported() {
        let nodes = ids(3);
        let mut topo = ReplicationTopology::build(nodes.clone(), TopologyShape::Star, 3, LinkProfile::default());
        topo.set_link(
            &nodes[0],
            &nodes[2],
            LinkProfile {
                reliability: 0.0,
                ..LinkProfile::default()
            },
        );
        let out = optimize_topology(&topo, 0.5).unwrap();
        assert_eq!(out.unreachable.len(), 1);
    }
}
