//! Scenario tests for `TransientGraph`.
//!
//! Covers the ring scenario, the bidirectional-index invariant under
//! concurrent edge churn, and full incident-edge cleanup on vertex
//! removal.

#![allow(clippy::unwrap_used)]

mod common;

use std::thread;

use permafrost::{GraphConfig, TransientGraph};

/// Every out-neighbor entry has a matching incoming entry and vice
/// versa: `(u,v) ∈ adjacency[u] ⇔ (u,v) ∈ incoming[v]`.
fn assert_symmetric(graph: &TransientGraph) {
    for v in 0..graph.num_vertices() {
        if let Some(out) = graph.neighbors(v) {
            for u in out {
                assert!(
                    graph.incoming(u).unwrap_or_default().contains(&v),
                    "adjacency ({v},{u}) has no incoming entry"
                );
            }
        }
        if let Some(inc) = graph.incoming(v) {
            for u in inc {
                assert!(
                    graph.has_edge(u, v),
                    "incoming ({u},{v}) has no adjacency entry"
                );
            }
        }
    }
}

/// A 16-vertex ring: every vertex has out- and in-degree one; removing
/// vertex 0 clears its incident edges from both sides.
#[test]
fn ring_wires_and_unwires() {
    common::init_tracing();

    const N: usize = 16;
    let graph = TransientGraph::empty(N);

    for v in 0..N {
        assert!(graph.add_vertex(v));
    }
    for i in 0..N {
        assert!(graph.add_edge(i, (i + 1) % N, i as i64));
    }

    for v in 0..N {
        assert_eq!(graph.out_degree(v), Some(1));
        assert_eq!(graph.in_degree(v), Some(1));
    }
    assert_eq!(graph.edge_weight(3, 4), Some(3));
    assert_symmetric(&graph);

    assert!(graph.remove_vertex(0));

    // 15 -> 0 and 0 -> 1 are gone; nothing references vertex 0.
    assert!(!graph.has_vertex(0));
    assert_eq!(graph.out_degree(15), Some(0));
    assert_eq!(graph.in_degree(1), Some(0));
    for v in 1..N {
        assert!(!graph.neighbors(v).unwrap().contains(&0));
        assert!(!graph.incoming(v).unwrap().contains(&0));
    }
    assert_symmetric(&graph);
}

/// Concurrent edge churn: whatever interleaving happens, each pair ends
/// up either in both indexes or in neither.
#[test]
fn concurrent_edge_churn_keeps_indexes_symmetric() {
    common::init_tracing();

    const N: usize = 64;
    const THREADS: usize = 8;
    const OPS: usize = 4000;

    let graph = TransientGraph::empty(N);
    for v in 0..N {
        assert!(graph.add_vertex(v));
    }

    thread::scope(|s| {
        for t in 0..THREADS {
            let graph = &graph;
            s.spawn(move || {
                // Cheap per-thread deterministic sequence.
                let mut state = (t as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
                let mut next = || {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state
                };

                for _ in 0..OPS {
                    let src = (next() % N as u64) as usize;
                    let dest = (next() % N as u64) as usize;
                    if next() % 2 == 0 {
                        let _ = graph.add_edge(src, dest, t as i64);
                    } else {
                        let _ = graph.remove_edge(src, dest);
                    }
                }
            });
        }
    });

    assert_symmetric(&graph);

    // Degree bookkeeping matches: each edge counts once out, once in.
    let stats = graph.stats();
    assert_eq!(stats.degrees.iter().sum::<usize>(), 2 * stats.edges);
}

/// Concurrent vertex and edge churn: removals must leave no dangling
/// references to vanished vertices.
#[test]
fn concurrent_vertex_churn_leaves_no_dangling_edges() {
    const N: usize = 32;
    const THREADS: usize = 6;
    const OPS: usize = 1500;

    let graph = TransientGraph::empty(N);
    for v in 0..N {
        assert!(graph.add_vertex(v));
    }

    thread::scope(|s| {
        for t in 0..THREADS {
            let graph = &graph;
            s.spawn(move || {
                let mut state = (t as u64).wrapping_add(1).wrapping_mul(0xA076_1D64_78BD_642F);
                let mut next = || {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state
                };

                for _ in 0..OPS {
                    let a = (next() % N as u64) as usize;
                    let b = (next() % N as u64) as usize;
                    match next() % 5 {
                        0 => {
                            let _ = graph.add_vertex(a);
                        }
                        1 => {
                            let _ = graph.remove_vertex(a);
                        }
                        2 | 3 => {
                            let _ = graph.add_edge(a, b, 1);
                        }
                        _ => {
                            let _ = graph.remove_edge(a, b);
                        }
                    }
                }
            });
        }
    });

    assert_symmetric(&graph);

    // No edge references an empty slot.
    for v in 0..N {
        if graph.has_vertex(v) {
            for u in graph.neighbors(v).unwrap() {
                assert!(graph.has_vertex(u), "edge ({v},{u}) points at empty slot");
            }
            for u in graph.incoming(v).unwrap() {
                assert!(graph.has_vertex(u), "edge ({u},{v}) points at empty slot");
            }
        }
    }
}

#[test]
fn removed_vertex_can_be_reinstalled() {
    let graph = TransientGraph::empty(4);
    assert!(graph.add_vertex(1));
    assert!(graph.add_vertex(2));
    assert!(graph.add_edge(1, 2, 9));

    assert!(graph.remove_vertex(2));
    assert!(graph.add_vertex(2));
    assert_eq!(graph.in_degree(2), Some(0));
    assert!(!graph.has_edge(1, 2));

    // The old edge is gone for good; a fresh one works.
    assert!(graph.add_edge(1, 2, 10));
    assert_eq!(graph.edge_weight(1, 2), Some(10));
}

#[test]
fn populated_graph_respects_config() {
    common::init_tracing();

    let config = GraphConfig {
        num_vertices: 256,
        mean_edges_per_vertex: 4,
        vertex_load: 50,
        seed: Some(11),
    };
    let graph = TransientGraph::new(&config);
    let stats = graph.stats();

    // Roughly half the slots are occupied (binomial, generous bounds).
    assert!(
        stats.vertices > 64 && stats.vertices < 224,
        "vertex load badly off: {}",
        stats.vertices
    );
    assert!(stats.edges > 0);
    assert_eq!(stats.degrees.len(), 256);
    assert_symmetric(&graph);

    // Same seed, same graph.
    assert_eq!(TransientGraph::new(&config).stats(), stats);
}

#[test]
fn clear_then_rebuild() {
    let graph = TransientGraph::new(&GraphConfig {
        num_vertices: 32,
        mean_edges_per_vertex: 3,
        vertex_load: 70,
        seed: Some(5),
    });

    graph.clear();
    let stats = graph.stats();
    assert_eq!((stats.vertices, stats.edges), (0, 0));

    assert!(graph.add_vertex(0));
    assert!(graph.add_vertex(1));
    assert!(graph.add_edge(0, 1, 1));
    assert!(graph.has_edge(0, 1));
}
