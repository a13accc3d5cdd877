//! Level-synchronous breadth-first search.
//!
//! Each iteration runs `bfs_expand` over the current frontier and
//! `bfs_update` to promote the newly reached nodes. The update kernel raises
//! the one-element `over` flag whenever it promoted anything; the
//! post-iteration hook reads and clears it and stops the loop once a pass
//! reached nothing new.

use std::collections::VecDeque;

use offload::{
    BufferSet, Error, Hooks, HostLaunch, IterationState, KernelDescriptor, KernelRegistry, ScalarSet, ScalarValue,
    WorkShape,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DESCRIPTOR_BINARY: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/bfs.bin"));

const WORKGROUP: usize = 64;
const DEFAULT_SEED: u64 = 0xbf5;
const NODE_BUFFERS: [&str; 6] = ["node_start", "node_degree", "mask", "updating", "visited", "cost"];

pub fn descriptor() -> offload::Result<KernelDescriptor> {
    bincode::deserialize(DESCRIPTOR_BINARY)
        .map_err(|e| Error::InvalidConfig(format!("embedded bfs descriptor: {e}")))
}

/// The same program sized for `graph`.
pub fn descriptor_for(graph: &Graph) -> offload::Result<KernelDescriptor> {
    let mut desc = descriptor()?;
    for buffer in &mut desc.buffers {
        if NODE_BUFFERS.contains(&buffer.name.as_str()) {
            buffer.len = graph.nodes();
        } else if buffer.name == "edges" {
            buffer.len = graph.edges.len().max(1);
        }
    }
    for scalar in &mut desc.scalars {
        if scalar.name == "node_count" {
            scalar.value = ScalarValue::U32(graph.nodes() as u32);
        }
    }
    let global = graph.nodes().div_ceil(WORKGROUP) * WORKGROUP;
    for kernel in &mut desc.kernels {
        kernel.work = WorkShape::linear(global, Some(WORKGROUP));
    }
    Ok(desc)
}

/// Directed graph in compressed sparse row form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Graph {
    pub node_start: Vec<u32>,
    pub node_degree: Vec<u32>,
    pub edges: Vec<u32>,
}

impl Graph {
    pub fn from_adjacency(adjacency: &[Vec<u32>]) -> Self {
        let mut graph = Graph {
            node_start: Vec::with_capacity(adjacency.len()),
            node_degree: Vec::with_capacity(adjacency.len()),
            edges: Vec::new(),
        };
        for neighbours in adjacency {
            graph.node_start.push(graph.edges.len() as u32);
            graph.node_degree.push(neighbours.len() as u32);
            graph.edges.extend_from_slice(neighbours);
        }
        graph
    }

    /// `nodes` nodes with exactly `degree` random out-edges each.
    pub fn generate(nodes: usize, degree: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let adjacency: Vec<Vec<u32>> = (0..nodes)
            .map(|_| (0..degree).map(|_| rng.gen_range(0..nodes as u32)).collect())
            .collect();
        Self::from_adjacency(&adjacency)
    }

    pub fn nodes(&self) -> usize {
        self.node_start.len()
    }

    pub fn neighbours(&self, node: usize) -> &[u32] {
        let start = self.node_start[node] as usize;
        &self.edges[start..start + self.node_degree[node] as usize]
    }

    /// Hop count from `source` to every node, -1 where unreachable.
    pub fn costs_from(&self, source: usize) -> Vec<i32> {
        let mut cost = vec![-1i32; self.nodes()];
        let mut queue = VecDeque::new();
        cost[source] = 0;
        queue.push_back(source);
        while let Some(node) = queue.pop_front() {
            for &next in self.neighbours(node) {
                let next = next as usize;
                if cost[next] < 0 {
                    cost[next] = cost[node] + 1;
                    queue.push_back(next);
                }
            }
        }
        cost
    }
}

fn kernel_error(kernel: &str, reason: String) -> Error {
    Error::Dispatch {
        kernel: kernel.to_string(),
        reason,
    }
}

fn expand_kernel(launch: &HostLaunch<'_>) -> offload::Result<()> {
    let node_start = launch.buffer::<u32>(0)?;
    let node_degree = launch.buffer::<u32>(1)?;
    let edges = launch.buffer::<u32>(2)?;
    let mut mask = launch.buffer::<u32>(3)?;
    let mut updating = launch.buffer::<u32>(4)?;
    let visited = launch.buffer::<u32>(5)?;
    let mut cost = launch.buffer::<i32>(6)?;
    let n = (launch.u32(7)? as usize).min(launch.invocations());

    for tid in 0..n {
        if mask[tid] == 0 {
            continue;
        }
        mask[tid] = 0;
        let begin = node_start[tid] as usize;
        let end = begin + node_degree[tid] as usize;
        let neighbours = edges
            .get(begin..end)
            .ok_or_else(|| kernel_error("bfs_expand", format!("node {tid} has edges {begin}..{end} out of range")))?;
        for &next in neighbours {
            let next = next as usize;
            if visited[next] == 0 {
                cost[next] = cost[tid] + 1;
                updating[next] = 1;
            }
        }
    }
    Ok(())
}

fn update_kernel(launch: &HostLaunch<'_>) -> offload::Result<()> {
    let mut mask = launch.buffer::<u32>(3)?;
    let mut updating = launch.buffer::<u32>(4)?;
    let mut visited = launch.buffer::<u32>(5)?;
    let mut over = launch.buffer::<u32>(8)?;
    let n = (launch.u32(7)? as usize).min(launch.invocations());

    for tid in 0..n {
        if updating[tid] != 0 {
            mask[tid] = 1;
            visited[tid] = 1;
            over[0] = 1;
            updating[tid] = 0;
        }
    }
    Ok(())
}

pub fn host_kernels() -> KernelRegistry {
    KernelRegistry::new()
        .with("bfs_expand", expand_kernel)
        .with("bfs_update", update_kernel)
}

/// Loads the graph, seeds the frontier with `source` and loops until the
/// `over` flag stays clear.
pub struct BfsHooks {
    graph: Option<Graph>,
    seed: u64,
    source: usize,
}

impl BfsHooks {
    /// A random graph sized by the descriptor.
    pub fn seeded(seed: u64) -> Self {
        Self {
            graph: None,
            seed,
            source: 0,
        }
    }

    pub fn with_graph(graph: Graph) -> Self {
        Self {
            graph: Some(graph),
            seed: DEFAULT_SEED,
            source: 0,
        }
    }

    pub fn from_source(mut self, source: usize) -> Self {
        self.source = source;
        self
    }
}

impl Default for BfsHooks {
    fn default() -> Self {
        Self::seeded(DEFAULT_SEED)
    }
}

fn setup_error(reason: String) -> Error {
    Error::Hook { stage: "setup", reason }
}

impl Hooks for BfsHooks {
    fn setup(&mut self, buffers: &mut BufferSet, scalars: &mut ScalarSet) -> offload::Result<()> {
        let nodes = scalars.u32("node_count")? as usize;
        let edge_slots = buffers.get("edges")?.spec().len;
        let graph = match &self.graph {
            Some(g) => g.clone(),
            None => Graph::generate(nodes, edge_slots / nodes.max(1), self.seed),
        };
        if graph.nodes() != nodes || graph.edges.len() > edge_slots || self.source >= nodes {
            return Err(setup_error(format!(
                "graph of {} nodes and {} edges from node {} does not fit {nodes} nodes and {edge_slots} edge slots",
                graph.nodes(),
                graph.edges.len(),
                self.source
            )));
        }

        buffers.u32_mut("node_start")?.copy_from_slice(&graph.node_start);
        buffers.u32_mut("node_degree")?.copy_from_slice(&graph.node_degree);
        buffers.u32_mut("edges")?[..graph.edges.len()].copy_from_slice(&graph.edges);
        buffers.u32_mut("mask")?[self.source] = 1;
        buffers.u32_mut("visited")?[self.source] = 1;
        let cost = buffers.i32_mut("cost")?;
        cost.fill(-1);
        cost[self.source] = 0;

        let expected = graph.costs_from(self.source);
        buffers.reference_mut::<i32>("cost")?.copy_from_slice(&expected);
        Ok(())
    }

    fn post_iteration(
        &mut self,
        _state: &IterationState,
        buffers: &mut BufferSet,
        _scalars: &mut ScalarSet,
    ) -> offload::Result<bool> {
        let over = buffers.u32_mut("over")?;
        let more = over[0] != 0;
        over[0] = 0;
        Ok(more)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_costs_on_a_chain_with_a_stray_node() {
        let graph = Graph::from_adjacency(&[vec![1], vec![2], vec![], vec![0]]);
        assert_eq!(graph.edges, vec![1, 2, 0]);
        assert_eq!(graph.node_start, vec![0, 1, 2, 2]);
        assert_eq!(graph.costs_from(0), vec![0, 1, 2, -1]);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let a = Graph::generate(32, 3, 7);
        assert_eq!(a, Graph::generate(32, 3, 7));
        assert_eq!(a.edges.len(), 96);
        assert!(a.edges.iter().all(|&e| e < 32));
    }
}
