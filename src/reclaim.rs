//! Epoch-based safe memory reclamation.
//!
//! [`Reclaimer`] withholds retired pointers until no concurrent operation
//! can still hold a reference. Each participating thread is identified by
//! a dense id `tid` in `[0, threads)` assigned by the harness:
//!
//! - [`start_op`](Reclaimer::start_op) publishes a *reservation* of the
//!   current global epoch; every pointer read afterwards is protected
//!   until [`end_op`](Reclaimer::end_op).
//! - [`retire`](Reclaimer::retire) enqueues a pointer that has been made
//!   unreachable from the structure; it is handed to the drop function
//!   only once every reservation has moved past the epoch recorded at
//!   retirement.
//!
//! The global epoch advances every `epoch_freq` retirements and a
//! thread's retire list is drained once it reaches `empty_freq` entries.
//! Reclamation is best-effort in *when* memory returns to the allocator;
//! the safety property is absolute.

use std::cell::UnsafeCell;
use std::sync::atomic::AtomicU64;

use crossbeam_utils::CachePadded;

use crate::ordering::{READ_ORD, RESERVE_ORD, WRITE_ORD};
use crate::tracing_helpers::trace_log;


/// Reservation value of a thread that is not inside an operation.
const INACTIVE: u64 = u64::MAX;

/// Default number of retirements between epoch advances.
pub const DEFAULT_EPOCH_FREQ: u64 = 100;

/// Default retire-list length that triggers a drain.
pub const DEFAULT_EMPTY_FREQ: usize = 1000;

/// A retired pointer awaiting reclamation.
struct Retired<T> {
    ptr: *mut T,
    epoch: u64,
}

/// Per-thread retire list. Only the owning thread touches it.
struct RetireList<T> {
    entries: Vec<Retired<T>>,
    /// Total retirements by this thread, drives epoch advancement.
    retire_count: u64,
}

impl<T> RetireList<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            retire_count: 0,
        }
    }
}

/// Epoch-based reclaimer for `T` objects.
///
/// `drop_fn` is invoked exactly once per retired pointer, once the pointer
/// is provably unreachable by every thread. The structures in this crate
/// pass a function that drops the pointee in place and returns the memory
/// to the persistent heap.
pub struct Reclaimer<T> {
    global_epoch: CachePadded<AtomicU64>,
    /// Per-thread reservations; `INACTIVE` outside operations.
    reservations: Box<[CachePadded<AtomicU64>]>,
    /// Per-thread retire lists, owner-only (see `retire`'s contract).
    retired: Box<[CachePadded<UnsafeCell<RetireList<T>>>]>,
    epoch_freq: u64,
    empty_freq: usize,
    drop_fn: unsafe fn(*mut T),
}

// SAFETY: retired pointers are reclaimed (and thus dropped) from whichever
// thread drains the owning list, so T must be Send. The UnsafeCell lists
// are serialized by the per-tid ownership contract on retire/drain.
unsafe impl<T: Send> Send for Reclaimer<T> {}
unsafe impl<T: Send> Sync for Reclaimer<T> {}

impl<T> Reclaimer<T> {
    /// Create a reclaimer for `threads` participants with default
    /// frequencies.
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0`.
    #[must_use]
    pub fn new(threads: usize, drop_fn: unsafe fn(*mut T)) -> Self {
        Self::with_frequencies(threads, DEFAULT_EPOCH_FREQ, DEFAULT_EMPTY_FREQ, drop_fn)
    }

    /// Create a reclaimer with explicit epoch/drain frequencies.
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0` or `epoch_freq == 0` or `empty_freq == 0`.
    #[must_use]
    pub fn with_frequencies(
        threads: usize,
        epoch_freq: u64,
        empty_freq: usize,
        drop_fn: unsafe fn(*mut T),
    ) -> Self {
        assert!(threads > 0, "reclaimer needs at least one thread slot");
        assert!(epoch_freq > 0 && empty_freq > 0, "frequencies must be non-zero");

        Self {
            global_epoch: CachePadded::new(AtomicU64::new(0)),
            reservations: (0..threads)
                .map(|_| CachePadded::new(AtomicU64::new(INACTIVE)))
                .collect(),
            retired: (0..threads)
                .map(|_| CachePadded::new(UnsafeCell::new(RetireList::new())))
                .collect(),
            epoch_freq,
            empty_freq,
            drop_fn,
        }
    }

    /// Number of thread slots.
    #[inline]
    #[must_use]
    pub fn threads(&self) -> usize {
        self.reservations.len()
    }

    /// Enter an operation: pointers read from the structure after this
    /// call remain valid until [`end_op`](Self::end_op).
    ///
    /// Operations do not nest.
    #[inline]
    pub fn start_op(&self, tid: usize) {
        debug_assert!(tid < self.threads());

        let epoch = self.global_epoch.load(READ_ORD);
        // SeqCst store: the reservation must be visible before any of the
        // protected pointer loads that follow it.
        self.reservations[tid].store(epoch, RESERVE_ORD);
    }

    /// Leave the current operation, releasing the reservation.
    #[inline]
    pub fn end_op(&self, tid: usize) {
        debug_assert!(tid < self.threads());

        self.reservations[tid].store(INACTIVE, WRITE_ORD);
    }

    /// Enqueue `ptr` for reclamation.
    ///
    /// # Safety
    ///
    /// - `ptr` is no longer reachable from the structure (physically
    ///   unlinked), is valid for `drop_fn`, and is retired exactly once.
    /// - `tid` is the calling thread's own id; no other thread calls
    ///   `retire` or `drain` with the same `tid` concurrently.
    pub unsafe fn retire(&self, ptr: *mut T, tid: usize) {
        debug_assert!(tid < self.threads());
        debug_assert!(!ptr.is_null());

        let epoch = self.global_epoch.load(READ_ORD);

        // SAFETY: tid ownership (caller contract) serializes list access.
        let list = unsafe { &mut *self.retired[tid].get() };
        list.entries.push(Retired { ptr, epoch });
        list.retire_count += 1;

        if list.retire_count % self.epoch_freq == 0 {
            self.global_epoch.fetch_add(1, RESERVE_ORD);
        }

        if list.entries.len() >= self.empty_freq {
            // SAFETY: same contract as this call.
            unsafe { self.drain(tid) };
        }
    }

    /// Reclaim every entry of `tid`'s retire list that no reservation can
    /// still reach. Best-effort; called automatically from `retire`.
    ///
    /// # Safety
    ///
    /// `tid` ownership as for [`retire`](Self::retire).
    pub unsafe fn drain(&self, tid: usize) {
        debug_assert!(tid < self.threads());

        let min_reservation = self
            .reservations
            .iter()
            .map(|slot| slot.load(RESERVE_ORD))
            .min()
            .unwrap_or(INACTIVE);

        // SAFETY: tid ownership (caller contract) serializes list access.
        let list = unsafe { &mut *self.retired[tid].get() };
        let before = list.entries.len();

        let drop_fn = self.drop_fn;
        list.entries.retain(|retired| {
            // A reservation equal to the retirement epoch may predate the
            // unlink; only strictly older retirements are reclaimable.
            if retired.epoch < min_reservation {
                // SAFETY: no thread holds a reservation that could still
                // reach this pointer; retire's contract makes it
                // unreachable from the structure.
                unsafe { drop_fn(retired.ptr) };
                false
            } else {
                true
            }
        });

        let _freed = before - list.entries.len();
        trace_log!(tid, freed = _freed, kept = list.entries.len(), "drain");
    }
}

impl<T> Drop for Reclaimer<T> {
    fn drop(&mut self) {
        // Exclusive access: every outstanding entry is reclaimable.
        for slot in self.retired.iter_mut() {
            let list = slot.get_mut();
            for retired in list.entries.drain(..) {
                // SAFETY: no threads remain; retire's contract holds.
                unsafe { (self.drop_fn)(retired.ptr) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serializes tests sharing the drop counter.
    static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn drop_box(ptr: *mut u64) {
        // SAFETY: test pointers come from Box::into_raw.
        drop(unsafe { Box::from_raw(ptr) });
        DROPS.fetch_add(1, Ordering::SeqCst);
    }

    fn drops() -> usize {
        DROPS.load(Ordering::SeqCst)
    }

    #[test]
    fn retire_after_end_op_is_reclaimed() {
        let _guard = TEST_LOCK.lock();
        let base = drops();
        let reclaimer: Reclaimer<u64> = Reclaimer::with_frequencies(2, 1, 1000, drop_box);

        reclaimer.start_op(0);
        let ptr = Box::into_raw(Box::new(1u64));
        // SAFETY: ptr is unreachable (never published); tids are distinct.
        unsafe { reclaimer.retire(ptr, 0) };
        reclaimer.end_op(0);

        // SAFETY: single-threaded test owns every tid.
        unsafe { reclaimer.drain(0) };
        assert_eq!(drops(), base + 1);
    }

    #[test]
    fn active_reservation_withholds_reclaim() {
        let _guard = TEST_LOCK.lock();
        let base = drops();
        let reclaimer: Reclaimer<u64> = Reclaimer::with_frequencies(2, 1, 1000, drop_box);

        // tid 0 is mid-operation when tid 1 retires.
        reclaimer.start_op(0);
        let ptr = Box::into_raw(Box::new(2u64));
        // SAFETY: unreachable pointer; single-threaded test owns tids.
        unsafe {
            reclaimer.retire(ptr, 1);
            reclaimer.drain(1);
        }
        assert_eq!(drops(), base, "freed under an active reservation");

        reclaimer.end_op(0);
        // SAFETY: as above.
        unsafe { reclaimer.drain(1) };
        assert_eq!(drops(), base + 1);
    }

    #[test]
    fn drop_reclaims_outstanding_entries() {
        let _guard = TEST_LOCK.lock();
        let base = drops();
        {
            let reclaimer: Reclaimer<u64> = Reclaimer::new(1, drop_box);
            for i in 0..10u64 {
                let ptr = Box::into_raw(Box::new(i));
                // SAFETY: unreachable pointers, owner tid.
                unsafe { reclaimer.retire(ptr, 0) };
            }
        }
        assert_eq!(drops(), base + 10);
    }

    #[test]
    fn drain_threshold_triggers_inline() {
        let _guard = TEST_LOCK.lock();
        let base = drops();
        let reclaimer: Reclaimer<u64> = Reclaimer::with_frequencies(1, 1, 4, drop_box);

        for i in 0..8u64 {
            let ptr = Box::into_raw(Box::new(i));
            // SAFETY: unreachable pointers, owner tid.
            unsafe { reclaimer.retire(ptr, 0) };
        }
        // With no reservations and an advancing epoch, threshold drains
        // must have freed most of the list without an explicit drain call.
        assert!(drops() > base, "threshold drain never fired");
    }
}
