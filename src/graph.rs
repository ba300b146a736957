//! `TransientGraph` - a concurrent, lock-based directed graph.
//!
//! A fixed-size vertex table; each slot is cache-padded and holds a mutex
//! over `{vertex-or-empty, sequence number}`. Edges are bidirectionally
//! indexed: the source vertex *owns* the relation in its adjacency map,
//! the destination holds the `(src, dest)` key in its incoming set. A
//! relation is dropped only after it has been erased from both sides.
//!
//! # Locking protocol
//!
//! Whenever an operation needs several vertex locks it acquires them in
//! ascending vertex-id order and releases in descending order; every code
//! path in this module follows that rule. Operations whose working set is
//! sampled outside the lock ([`remove_vertex`](TransientGraph::remove_vertex))
//! validate the vertex's sequence number after reacquisition and restart
//! if it moved.
//!
//! Sequence numbers increase monotonically and are bumped exactly when
//! the slot's vertex or a relation incident to it changes.

use std::fmt as StdFmt;

use crossbeam_utils::CachePadded;
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::{Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tracing_helpers::debug_log;

/// Edge identity: `(source id, destination id)`.
type EdgeKey = (usize, usize);

/// A directed edge. Owned by the source vertex's adjacency map.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Relation {
    src: usize,
    dest: usize,
    weight: i64,
}

/// Weight given to edges wired during population and `add_vertex`.
const DEFAULT_WEIGHT: i64 = -1;

/// A vertex: label plus both edge indexes.
struct Vertex {
    id: usize,
    label: i64,
    /// Owns the relations whose `src` is this vertex.
    adjacency: FxHashMap<EdgeKey, Relation>,
    /// Keys of relations whose `dest` is this vertex (owned at `src`).
    incoming: FxHashSet<EdgeKey>,
}

impl Vertex {
    fn new(id: usize) -> Self {
        Self {
            id,
            label: id as i64,
            adjacency: FxHashMap::default(),
            incoming: FxHashSet::default(),
        }
    }
}

/// Lock-protected slot state: the vertex (if any) and its sequence
/// number. The sequence number is only read or written under the lock,
/// so it needs no atomicity of its own.
#[derive(Default)]
struct VertexCell {
    vertex: Option<Vertex>,
    seq: u64,
}

/// Construction parameters.
///
/// `mean_edges_per_vertex` and `vertex_load` (a percentage) drive initial
/// population density only; `seed` pins the population RNG for
/// reproducible runs and defaults to entropy.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub num_vertices: usize,
    pub mean_edges_per_vertex: usize,
    pub vertex_load: usize,
    pub seed: Option<u64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            num_vertices: 1024,
            mean_edges_per_vertex: 20,
            vertex_load: 50,
            seed: None,
        }
    }
}

/// Aggregate graph statistics; see [`TransientGraph::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct GraphStats {
    /// Number of occupied vertex slots.
    pub vertices: usize,
    /// Number of relations (directed edges).
    pub edges: usize,
    /// `edges / vertices`, 0.0 for an empty graph.
    pub mean_out_degree: f64,
    /// Per-slot degree (out + in); 0 for empty slots.
    pub degrees: Vec<usize>,
}

/// Concurrent transient directed graph. See the module docs.
pub struct TransientGraph {
    slots: Box<[CachePadded<Mutex<VertexCell>>]>,
    mean_edges: usize,
    vertex_load: usize,
    rng: Mutex<StdRng>,
}

impl TransientGraph {
    /// Build and populate a graph per `config`: each slot gets a vertex
    /// with probability `vertex_load`%, then every vertex draws
    /// `mean_edges_per_vertex * 100 / vertex_load` random neighbor
    /// candidates and wires an edge to each one that exists.
    ///
    /// # Panics
    ///
    /// Panics if `num_vertices == 0` or `vertex_load > 100`.
    #[must_use]
    pub fn new(config: &GraphConfig) -> Self {
        assert!(config.num_vertices > 0, "graph needs at least one slot");
        assert!(config.vertex_load <= 100, "vertex_load is a percentage");

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let graph = Self {
            slots: (0..config.num_vertices)
                .map(|_| CachePadded::new(Mutex::new(VertexCell::default())))
                .collect(),
            mean_edges: config.mean_edges_per_vertex,
            vertex_load: config.vertex_load,
            rng: Mutex::new(rng),
        };
        debug_log!(vertices = config.num_vertices, "vertex table allocated");

        if graph.vertex_load == 0 {
            return graph;
        }

        // Fill to vertex_load.
        {
            let mut rng = graph.rng.lock();
            for (i, slot) in graph.slots.iter().enumerate() {
                if rng.gen_range(0..=100usize) <= graph.vertex_load {
                    slot.lock().vertex = Some(Vertex::new(i));
                }
            }
        }
        debug_log!("filled vertex load");

        // Fill to mean edges per vertex.
        let candidates = graph.sample_count();
        for i in 0..config.num_vertices {
            if !graph.has_vertex(i) {
                continue;
            }
            for _ in 0..candidates {
                let k = graph.rng.lock().gen_range(0..config.num_vertices);
                if k == i {
                    continue;
                }
                if graph.has_vertex(k) {
                    let _ = graph.add_edge(i, k, DEFAULT_WEIGHT);
                }
            }
        }
        debug_log!("filled mean edges per vertex");

        graph
    }

    /// An unpopulated graph with `num_vertices` empty slots.
    ///
    /// # Panics
    ///
    /// Panics if `num_vertices == 0`.
    #[must_use]
    pub fn empty(num_vertices: usize) -> Self {
        Self::new(&GraphConfig {
            num_vertices,
            mean_edges_per_vertex: 0,
            vertex_load: 0,
            seed: Some(0),
        })
    }

    /// Number of vertex slots (valid ids are `0..num_vertices`).
    #[inline]
    #[must_use]
    pub fn num_vertices(&self) -> usize {
        self.slots.len()
    }

    // ========================================================================
    //  Edge operations
    // ========================================================================

    /// Add the edge `(src, dest)` with `weight`.
    ///
    /// Fails (returns false) on a self-loop, a missing endpoint, or an
    /// existing edge.
    pub fn add_edge(&self, src: usize, dest: usize, weight: i64) -> bool {
        if src == dest {
            return false;
        }

        let (lo, hi) = if src < dest { (src, dest) } else { (dest, src) };
        let mut lo_guard = self.slots[lo].lock();
        let mut hi_guard = self.slots[hi].lock();
        let (src_cell, dest_cell) = if src < dest {
            (&mut *lo_guard, &mut *hi_guard)
        } else {
            (&mut *hi_guard, &mut *lo_guard)
        };

        let key = (src, dest);
        {
            let (Some(sv), Some(dv)) = (src_cell.vertex.as_mut(), dest_cell.vertex.as_mut())
            else {
                return false;
            };
            if sv.adjacency.contains_key(&key) {
                debug_assert!(dv.incoming.contains(&key));
                return false;
            }

            sv.adjacency.insert(key, Relation { src, dest, weight });
            let fresh = dv.incoming.insert(key);
            debug_assert!(fresh);
        }
        src_cell.seq += 1;
        dest_cell.seq += 1;
        true
        // Guards drop in reverse declaration order: hi, then lo.
    }

    /// Remove the edge `(src, dest)`.
    ///
    /// Fails if either endpoint or the edge is absent.
    pub fn remove_edge(&self, src: usize, dest: usize) -> bool {
        if src == dest {
            return false;
        }

        let (lo, hi) = if src < dest { (src, dest) } else { (dest, src) };
        let mut lo_guard = self.slots[lo].lock();
        let mut hi_guard = self.slots[hi].lock();
        let (src_cell, dest_cell) = if src < dest {
            (&mut *lo_guard, &mut *hi_guard)
        } else {
            (&mut *hi_guard, &mut *lo_guard)
        };

        let key = (src, dest);
        let removed = {
            let (Some(sv), Some(dv)) = (src_cell.vertex.as_mut(), dest_cell.vertex.as_mut())
            else {
                return false;
            };

            // Erase the non-owning reference first; the owned relation
            // drops at the end of this block, after both erasures.
            let had_reference = dv.incoming.remove(&key);
            let relation = sv.adjacency.remove(&key);
            debug_assert_eq!(had_reference, relation.is_some());
            debug_assert!(relation
                .as_ref()
                .map_or(true, |r| r.src == src && r.dest == dest));
            relation.is_some()
        };

        if removed {
            src_cell.seq += 1;
            dest_cell.seq += 1;
        }
        removed
    }

    /// Whether the edge `(src, dest)` exists, snapshot under `src`'s lock.
    #[must_use]
    pub fn has_edge(&self, src: usize, dest: usize) -> bool {
        let guard = self.slots[src].lock();
        match guard.vertex.as_ref() {
            Some(v) => v.adjacency.contains_key(&(src, dest)),
            None => false,
        }
    }

    /// The weight of edge `(src, dest)`, if present.
    #[must_use]
    pub fn edge_weight(&self, src: usize, dest: usize) -> Option<i64> {
        let guard = self.slots[src].lock();
        guard
            .vertex
            .as_ref()
            .and_then(|v| v.adjacency.get(&(src, dest)))
            .map(|r| r.weight)
    }

    // ========================================================================
    //  Vertex operations
    // ========================================================================

    /// Install vertex `vid` and wire edges to a random sample of existing
    /// neighbors (sample size follows the population density formula).
    ///
    /// Fails if `vid` already exists.
    pub fn add_vertex(&self, vid: usize) -> bool {
        // Sample candidates outside any lock; the deduplicated sorted set
        // (plus vid itself) is the lock acquisition order.
        let mut ids = self.sample_neighbors();
        ids.push(vid);
        ids.sort_unstable();
        ids.dedup();

        let mut guards = self.lock_ascending(&ids);

        if Self::cell_of(&mut guards, vid).vertex.is_some() {
            Self::release_descending(guards);
            return false;
        }

        Self::cell_of(&mut guards, vid).vertex = Some(Vertex::new(vid));

        for &u in &ids {
            if u == vid {
                continue;
            }

            let key = (vid, u);
            {
                let ucell = Self::cell_of(&mut guards, u);
                let Some(uv) = ucell.vertex.as_mut() else {
                    continue;
                };
                uv.incoming.insert(key);
                ucell.seq += 1;
            }
            {
                let vcell = Self::cell_of(&mut guards, vid);
                let Some(vv) = vcell.vertex.as_mut() else {
                    unreachable!("vertex {vid} installed above");
                };
                vv.adjacency.insert(
                    key,
                    Relation {
                        src: vid,
                        dest: u,
                        weight: DEFAULT_WEIGHT,
                    },
                );
            }
        }

        Self::cell_of(&mut guards, vid).seq += 1;
        Self::release_descending(guards);

        debug_log!(vid, "vertex added");
        true
    }

    /// Remove vertex `vid` and every incident edge.
    ///
    /// Two-phase: the neighbor set is collected under `vid`'s lock alone,
    /// then the whole set is locked in ascending order and `vid`'s
    /// sequence number validated; any intervening change restarts the
    /// scan. Fails if `vid` is absent.
    pub fn remove_vertex(&self, vid: usize) -> bool {
        loop {
            // Phase A: scan.
            let (snapshot_seq, mut ids) = {
                let guard = self.slots[vid].lock();
                let Some(v) = guard.vertex.as_ref() else {
                    return false;
                };

                let mut ids: Vec<usize> = v
                    .adjacency
                    .keys()
                    .map(|&(_, dest)| dest)
                    .chain(v.incoming.iter().map(|&(src, _)| src))
                    .collect();
                ids.push(vid);
                (guard.seq, ids)
            };
            ids.sort_unstable();
            ids.dedup();

            // Phase B: commit under the full lock set.
            let mut guards = self.lock_ascending(&ids);

            if Self::cell_of(&mut guards, vid).seq != snapshot_seq {
                Self::release_descending(guards);
                continue;
            }

            // The sequence number is bumped on every incident-edge change,
            // so an unchanged value means the scanned neighbor set is
            // exactly the current one (and every neighbor still exists).
            let (out_edges, in_edges) = {
                let Some(v) = Self::cell_of(&mut guards, vid).vertex.as_ref() else {
                    unreachable!("vertex {vid} vanished with unchanged sequence");
                };
                debug_assert_eq!(v.id, vid);
                (
                    v.adjacency.keys().copied().collect::<Vec<_>>(),
                    v.incoming.iter().copied().collect::<Vec<_>>(),
                )
            };

            // Outgoing relations are owned here: erase the neighbors'
            // incoming references first; the owned side drops with the
            // vertex below.
            for &(src, dest) in &out_edges {
                debug_assert_eq!(src, vid);
                let Some(u) = Self::cell_of(&mut guards, dest).vertex.as_mut() else {
                    unreachable!("neighbor {dest} vanished with unchanged sequence");
                };
                let removed = u.incoming.remove(&(src, dest));
                debug_assert!(removed);
            }

            // Incoming relations are owned by the neighbor: erase our
            // reference, then remove (and drop) the owned relation.
            for &(src, dest) in &in_edges {
                debug_assert_eq!(dest, vid);
                {
                    let Some(v) = Self::cell_of(&mut guards, vid).vertex.as_mut() else {
                        unreachable!("vertex {vid} vanished with unchanged sequence");
                    };
                    v.incoming.remove(&(src, dest));
                }
                let Some(u) = Self::cell_of(&mut guards, src).vertex.as_mut() else {
                    unreachable!("neighbor {src} vanished with unchanged sequence");
                };
                let relation = u.adjacency.remove(&(src, dest));
                debug_assert!(relation.is_some());
            }

            // Drop the vertex object (and with it the owned relations).
            Self::cell_of(&mut guards, vid).vertex = None;

            // Every locked vertex lost at least one relation (or the
            // vertex itself).
            for (_, guard) in guards.iter_mut() {
                guard.seq += 1;
            }

            Self::release_descending(guards);
            debug_log!(
                vid,
                removed_edges = out_edges.len() + in_edges.len(),
                "vertex removed"
            );
            return true;
        }
    }

    /// Whether slot `vid` holds a vertex.
    #[must_use]
    pub fn has_vertex(&self, vid: usize) -> bool {
        self.slots[vid].lock().vertex.is_some()
    }

    /// The vertex label, if present.
    #[must_use]
    pub fn label(&self, vid: usize) -> Option<i64> {
        self.slots[vid].lock().vertex.as_ref().map(|v| v.label)
    }

    /// Set the vertex label. Returns false if the vertex is absent.
    pub fn set_label(&self, vid: usize, label: i64) -> bool {
        match self.slots[vid].lock().vertex.as_mut() {
            Some(v) => {
                v.label = label;
                true
            }
            None => false,
        }
    }

    /// Out-degree of `vid`, if present.
    #[must_use]
    pub fn out_degree(&self, vid: usize) -> Option<usize> {
        self.slots[vid]
            .lock()
            .vertex
            .as_ref()
            .map(|v| v.adjacency.len())
    }

    /// In-degree of `vid`, if present.
    #[must_use]
    pub fn in_degree(&self, vid: usize) -> Option<usize> {
        self.slots[vid]
            .lock()
            .vertex
            .as_ref()
            .map(|v| v.incoming.len())
    }

    /// Snapshot of `vid`'s out-neighbors.
    #[must_use]
    pub fn neighbors(&self, vid: usize) -> Option<Vec<usize>> {
        self.slots[vid]
            .lock()
            .vertex
            .as_ref()
            .map(|v| v.adjacency.keys().map(|&(_, dest)| dest).collect())
    }

    /// Snapshot of `vid`'s in-neighbors.
    #[must_use]
    pub fn incoming(&self, vid: usize) -> Option<Vec<usize>> {
        self.slots[vid]
            .lock()
            .vertex
            .as_ref()
            .map(|v| v.incoming.iter().map(|&(src, _)| src).collect())
    }

    // ========================================================================
    //  Whole-graph operations
    // ========================================================================

    /// Drop every vertex and edge.
    ///
    /// Takes all vertex locks in ascending order (the only operation that
    /// does), so it serializes with everything.
    pub fn clear(&self) {
        let ids: Vec<usize> = (0..self.slots.len()).collect();
        let mut guards = self.lock_ascending(&ids);

        for (_, guard) in guards.iter_mut() {
            if guard.vertex.take().is_some() {
                guard.seq += 1;
            }
        }

        Self::release_descending(guards);
    }

    /// Aggregate statistics, each slot sampled under its own lock in
    /// ascending order. Not a linearizable whole-graph snapshot.
    #[must_use]
    pub fn stats(&self) -> GraphStats {
        let mut vertices = 0usize;
        let mut edges = 0usize;
        let mut degrees = vec![0usize; self.slots.len()];

        for (i, slot) in self.slots.iter().enumerate() {
            let guard = slot.lock();
            if let Some(v) = guard.vertex.as_ref() {
                vertices += 1;
                edges += v.adjacency.len();
                degrees[i] = v.adjacency.len() + v.incoming.len();
            }
        }

        GraphStats {
            vertices,
            edges,
            mean_out_degree: if vertices == 0 {
                0.0
            } else {
                edges as f64 / vertices as f64
            },
            degrees,
        }
    }

    // ========================================================================
    //  Locking helpers
    // ========================================================================

    /// Lock `ids` (sorted, deduplicated) in ascending order.
    fn lock_ascending<'a>(&'a self, ids: &[usize]) -> Vec<(usize, MutexGuard<'a, VertexCell>)> {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must ascend");

        ids.iter().map(|&id| (id, self.slots[id].lock())).collect()
    }

    /// Release a lock set in descending id order.
    fn release_descending(mut guards: Vec<(usize, MutexGuard<'_, VertexCell>)>) {
        while let Some((_, guard)) = guards.pop() {
            drop(guard);
        }
    }

    /// Borrow the locked cell for `id` out of a held lock set.
    fn cell_of<'a, 'g>(
        guards: &'a mut [(usize, MutexGuard<'g, VertexCell>)],
        id: usize,
    ) -> &'a mut VertexCell {
        match guards.binary_search_by_key(&id, |(locked_id, _)| *locked_id) {
            Ok(i) => &mut *guards[i].1,
            Err(_) => unreachable!("vertex {id} is not in the locked set"),
        }
    }

    /// Number of neighbor candidates drawn by population and
    /// [`add_vertex`](Self::add_vertex).
    fn sample_count(&self) -> usize {
        if self.vertex_load == 0 {
            0
        } else {
            self.mean_edges * 100 / self.vertex_load
        }
    }

    fn sample_neighbors(&self) -> Vec<usize> {
        let count = self.sample_count();
        let mut rng = self.rng.lock();
        (0..count)
            .map(|_| rng.gen_range(0..self.slots.len()))
            .collect()
    }
}

impl StdFmt::Debug for TransientGraph {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("TransientGraph")
            .field("num_vertices", &self.slots.len())
            .field("mean_edges", &self.mean_edges)
            .field("vertex_load", &self.vertex_load)
            .finish_non_exhaustive()
    }
}
