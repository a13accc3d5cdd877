use bfs::{BfsHooks, Graph};
use offload::{Harness, HostBackend};
use proptest::prelude::*;

/// Frontier-by-frontier traversal, independent of the CSR helpers.
fn cpu_bfs(adjacency: &[Vec<u32>], source: usize) -> Vec<i32> {
    let mut cost = vec![-1i32; adjacency.len()];
    cost[source] = 0;
    let mut frontier = vec![source];
    let mut level = 0;
    while !frontier.is_empty() {
        level += 1;
        let mut next = Vec::new();
        for &node in &frontier {
            for &n in &adjacency[node] {
                if cost[n as usize] < 0 {
                    cost[n as usize] = level;
                    next.push(n as usize);
                }
            }
        }
        frontier = next;
    }
    cost
}

fn adjacency_of(graph: &Graph) -> Vec<Vec<u32>> {
    (0..graph.nodes()).map(|n| graph.neighbours(n).to_vec()).collect()
}

#[test]
fn test_bfs_matches_cpu() {
    let desc = bfs::descriptor().unwrap();
    let report = Harness::new(HostBackend::new(bfs::host_kernels()), desc)
        .run(&mut BfsHooks::default())
        .unwrap();

    assert!(report.validation.passed(), "{}", report.validation);
    assert_eq!(report.validation.compared, vec!["cost"]);

    let graph = Graph {
        node_start: report.buffers.u32("node_start").unwrap().to_vec(),
        node_degree: report.buffers.u32("node_degree").unwrap().to_vec(),
        edges: report.buffers.u32("edges").unwrap().to_vec(),
    };
    let expected = cpu_bfs(&adjacency_of(&graph), 0);
    let cost = report.buffers.i32("cost").unwrap();
    assert_eq!(cost, expected.as_slice());

    // one pass per level plus the pass that finds nothing new
    let depth = *expected.iter().max().unwrap() as u64;
    assert_eq!(report.iterations(), depth + 1);
    assert_eq!(report.buffers.u32("over").unwrap(), &[0]);
}

#[test]
fn test_unreachable_nodes_keep_negative_cost() {
    let adjacency = vec![vec![1, 2], vec![3], vec![3], vec![], vec![5], vec![4]];
    let graph = Graph::from_adjacency(&adjacency);
    let desc = bfs::descriptor_for(&graph).unwrap();
    let report = Harness::new(HostBackend::new(bfs::host_kernels()), desc)
        .run(&mut BfsHooks::with_graph(graph))
        .unwrap();

    assert!(report.validation.passed(), "{}", report.validation);
    assert_eq!(report.buffers.i32("cost").unwrap(), &[0, 1, 1, 2, -1, -1]);
    assert_eq!(report.iterations(), 3);
}

#[test]
fn test_isolated_source_stops_after_one_pass() {
    let graph = Graph::from_adjacency(&[vec![], vec![0]]);
    let desc = bfs::descriptor_for(&graph).unwrap();
    let report = Harness::new(HostBackend::new(bfs::host_kernels()), desc)
        .run(&mut BfsHooks::with_graph(graph))
        .unwrap();
    assert_eq!(report.iterations(), 1);
    assert_eq!(report.buffers.i32("cost").unwrap(), &[0, -1]);
}

#[test]
fn test_source_outside_graph_fails_setup() {
    let graph = Graph::from_adjacency(&[vec![1], vec![0]]);
    let desc = bfs::descriptor_for(&graph).unwrap();
    let result = Harness::new(HostBackend::new(bfs::host_kernels()), desc)
        .run(&mut BfsHooks::with_graph(graph).from_source(5));
    assert!(matches!(result, Err(offload::Error::Hook { stage: "setup", .. })));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn bfs_random_graphs(
        adjacency in (1usize..40).prop_flat_map(|n| {
            prop::collection::vec(prop::collection::vec(0..n as u32, 0..4), n)
        }),
        source_pick in any::<prop::sample::Index>(),
    ) {
        let source = source_pick.index(adjacency.len());
        let graph = Graph::from_adjacency(&adjacency);
        let desc = bfs::descriptor_for(&graph).unwrap();
        let report = Harness::new(HostBackend::new(bfs::host_kernels()), desc)
            .run(&mut BfsHooks::with_graph(graph).from_source(source))
            .unwrap();
        prop_assert!(report.validation.passed());
        let expected = cpu_bfs(&adjacency, source);
        prop_assert_eq!(report.buffers.i32("cost").unwrap(), expected.as_slice());
    }
}
