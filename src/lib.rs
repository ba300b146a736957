//! # Permafrost
//!
//! Concurrent data structures for persistent-memory benchmarking:
//!
//! - [`PersistMap`]: a lock-free chained hash table whose nodes live in
//!   persistent memory. Operations are *durably linearizable* — once an
//!   operation returns, its effect is recoverable after a crash, with no
//!   separate logging layer.
//! - [`TransientGraph`]: a lock-based directed graph with per-vertex
//!   mutexes and monotonic sequence numbers; multi-vertex operations
//!   acquire locks in ascending vertex-id order and validate their
//!   working set via the sequence numbers.
//! - [`Reclaimer`]: the epoch-based safe-memory-reclamation scheme under
//!   the lock-free table.
//!
//! ## Design
//!
//! The hash table's chains are ordered singly-linked lists with the
//! logical-deletion mark in the low bit of each `next` pointer
//! ([`marked`]). Every store to a persistent location is followed by a
//! cacheline writeback, and a store fence orders writebacks before the
//! CAS that publishes them ([`persist`]). Memory comes from a
//! persistent-heap shim with root registration ([`pmem`]); the harness
//! substitutes a DAX-backed allocator in deployment.
//!
//! The surrounding benchmark harness supplies a fixed thread count and a
//! dense thread id per worker; the table binds ids to threads through
//! [`map::MapHandle`].

pub mod graph;
pub mod map;
pub mod marked;
pub mod ordering;
pub mod persist;
pub mod pmem;
pub mod reclaim;

mod tracing_helpers;

pub use graph::{GraphConfig, GraphStats, TransientGraph};
pub use map::{MapHandle, PersistMap};
pub use pmem::AllocError;
pub use reclaim::Reclaimer;
