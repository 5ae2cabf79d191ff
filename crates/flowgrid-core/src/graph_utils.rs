use crate::{BusId, Edge, Network, Node};
use anyhow::Result;
use petgraph::visit::EdgeRef;
use std::collections::{HashSet, VecDeque};

/// One electrically connected group of buses.
#[derive(Debug)]
pub struct IslandSummary {
    pub island_id: usize,
    pub buses: Vec<BusId>,
}

/// Aggregated island analysis result.
#[derive(Debug)]
pub struct IslandAnalysis {
    pub islands: Vec<IslandSummary>,
}

impl IslandAnalysis {
    /// Island containing the given bus
    pub fn island_of(&self, bus: BusId) -> Option<&IslandSummary> {
        self.islands.iter().find(|island| island.buses.contains(&bus))
    }
}

/// Labels AC islands (breadth-first search over in-service branches).
///
/// HVDC links do not merge islands: each side keeps its own angle reference.
pub fn find_islands(network: &Network) -> Result<IslandAnalysis> {
    let mut visited = HashSet::new();
    let mut islands = Vec::new();
    for start in network.graph.node_indices() {
        if !matches!(network.graph[start], Node::Bus(_)) || visited.contains(&start) {
            continue;
        }
        let mut queue = VecDeque::new();
        queue.push_back(start);
        let mut members = Vec::new();
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            if let Node::Bus(bus) = &network.graph[node] {
                members.push(bus.id);
            }
            for edge in network.graph.edges(node) {
                if !edge.weight().is_ac_connection() {
                    continue;
                }
                let neighbor = if edge.source() == node {
                    edge.target()
                } else {
                    edge.source()
                };
                if !visited.contains(&neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        members.sort();
        islands.push(IslandSummary {
            island_id: islands.len(),
            buses: members,
        });
    }
    Ok(IslandAnalysis { islands })
}

/// Whether any in-service branch or link touches the bus.
pub fn is_bus_connected(network: &Network, bus: BusId) -> bool {
    network
        .bus_node(bus)
        .map(|idx| {
            network.graph.edges(idx).any(|e| match e.weight() {
                Edge::Branch(b) => b.status,
                Edge::Hvdc(h) => h.status,
            })
        })
        .unwrap_or(false)
}
