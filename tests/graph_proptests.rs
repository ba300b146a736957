//! Property-based tests for `TransientGraph`.
//!
//! Differential testing against a naive vertex-set/edge-set model; after
//! any single-threaded sequence the graph and the model agree on every
//! membership query, and the bidirectional index is symmetric.

#![allow(clippy::unwrap_used)]

use std::collections::HashSet;

use proptest::prelude::*;

use permafrost::TransientGraph;

const N: usize = 12;

#[derive(Debug, Clone)]
enum Op {
    AddVertex(usize),
    RemoveVertex(usize),
    AddEdge(usize, usize),
    RemoveEdge(usize, usize),
}

fn vid() -> impl Strategy<Value = usize> {
    0..N
}

fn operations(max_ops: usize) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            2 => vid().prop_map(Op::AddVertex),
            1 => vid().prop_map(Op::RemoveVertex),
            4 => (vid(), vid()).prop_map(|(s, d)| Op::AddEdge(s, d)),
            2 => (vid(), vid()).prop_map(|(s, d)| Op::RemoveEdge(s, d)),
        ],
        0..=max_ops,
    )
}

/// The reference model: plain sets with the graph's documented
/// semantics.
#[derive(Default)]
struct Model {
    vertices: HashSet<usize>,
    edges: HashSet<(usize, usize)>,
}

impl Model {
    fn add_vertex(&mut self, v: usize) -> bool {
        self.vertices.insert(v)
    }

    fn remove_vertex(&mut self, v: usize) -> bool {
        if !self.vertices.remove(&v) {
            return false;
        }
        self.edges.retain(|&(s, d)| s != v && d != v);
        true
    }

    fn add_edge(&mut self, s: usize, d: usize) -> bool {
        if s == d || !self.vertices.contains(&s) || !self.vertices.contains(&d) {
            return false;
        }
        self.edges.insert((s, d))
    }

    fn remove_edge(&mut self, s: usize, d: usize) -> bool {
        if s == d || !self.vertices.contains(&s) || !self.vertices.contains(&d) {
            return false;
        }
        self.edges.remove(&(s, d))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Return values and final state agree with the model.
    #[test]
    fn agrees_with_set_model(ops in operations(150)) {
        let graph = TransientGraph::empty(N);
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::AddVertex(v) => {
                    prop_assert_eq!(graph.add_vertex(v), model.add_vertex(v));
                }
                Op::RemoveVertex(v) => {
                    prop_assert_eq!(graph.remove_vertex(v), model.remove_vertex(v));
                }
                Op::AddEdge(s, d) => {
                    prop_assert_eq!(graph.add_edge(s, d, 1), model.add_edge(s, d));
                }
                Op::RemoveEdge(s, d) => {
                    prop_assert_eq!(graph.remove_edge(s, d), model.remove_edge(s, d));
                }
            }
        }

        // Membership agrees everywhere.
        for v in 0..N {
            prop_assert_eq!(graph.has_vertex(v), model.vertices.contains(&v));
            for u in 0..N {
                prop_assert_eq!(graph.has_edge(v, u), model.edges.contains(&(v, u)));
            }
        }

        // Degrees match the model's edge set.
        for v in 0..N {
            if model.vertices.contains(&v) {
                let out = model.edges.iter().filter(|&&(s, _)| s == v).count();
                let inc = model.edges.iter().filter(|&&(_, d)| d == v).count();
                prop_assert_eq!(graph.out_degree(v), Some(out));
                prop_assert_eq!(graph.in_degree(v), Some(inc));
            } else {
                prop_assert_eq!(graph.out_degree(v), None);
            }
        }
    }

    /// The adjacency/incoming indexes stay mirror images.
    #[test]
    fn indexes_stay_symmetric(ops in operations(150)) {
        let graph = TransientGraph::empty(N);
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::AddVertex(v) => {
                    let _ = graph.add_vertex(v);
                    let _ = model.add_vertex(v);
                }
                Op::RemoveVertex(v) => {
                    let _ = graph.remove_vertex(v);
                    let _ = model.remove_vertex(v);
                }
                Op::AddEdge(s, d) => {
                    let _ = graph.add_edge(s, d, 1);
                    let _ = model.add_edge(s, d);
                }
                Op::RemoveEdge(s, d) => {
                    let _ = graph.remove_edge(s, d);
                    let _ = model.remove_edge(s, d);
                }
            }

            // Symmetry holds after every single operation.
            for v in 0..N {
                let Some(out) = graph.neighbors(v) else { continue };
                for u in out {
                    prop_assert!(graph.incoming(u).unwrap().contains(&v));
                }
            }
        }
    }
}
