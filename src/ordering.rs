//! Standard memory orderings for concurrent structure access.
//!
//! These constants keep ordering usage consistent across the codebase and
//! make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for pointer loads during chain traversal.
/// Pairs with a publisher's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for stores visible to concurrent readers.
/// Pairs with traversal Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for a successful publishing CAS (install, mark, splice).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only needs to observe the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for publishing an epoch reservation.
/// Must not reorder with the pointer loads the reservation protects.
pub const RESERVE_ORD: Ordering = Ordering::SeqCst;

/// Ordering for accesses that need no synchronization
/// (unpublished nodes, owner-only counters).
pub const RELAXED: Ordering = Ordering::Relaxed;
