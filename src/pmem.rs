//! Persistent-heap shim: lifecycle, allocation, and root registration.
//!
//! The structures in this crate assume a persistent-memory allocator with
//! the usual shape: process/thread lifecycle hooks, `alloc`/`dealloc`, and
//! a small table of *root* slots so that top-level objects can be
//! rediscovered after a restart. This module carries that contract. The
//! backing store here is the system allocator — the harness substitutes a
//! DAX-mapped heap in deployment — but every call site in the crate is
//! written against the persistent contract: allocations are written back
//! before their address is published, and frees go back through this
//! module.
//!
//! Lifecycle is refcounted: each structure that opens the heap calls
//! [`init_process`] and pairs it with [`finalize_process`] on drop, so
//! several structures can share one heap instance.

use std::alloc::{self, Layout};
use std::fmt as StdFmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::persist;
use crate::tracing_helpers::debug_log;

/// Number of registered root slots.
///
/// Matches the small fixed root table of Ralloc-style persistent heaps.
pub const ROOT_SLOTS: usize = 16;

static PROCESS_REFS: AtomicUsize = AtomicUsize::new(0);

static ROOTS: [AtomicPtr<u8>; ROOT_SLOTS] =
    [const { AtomicPtr::new(std::ptr::null_mut()) }; ROOT_SLOTS];

/// Persistent allocation failed: the heap is exhausted.
///
/// Exhaustion is the only failure an operation can report; everything else
/// retries internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl StdFmt::Display for AllocError {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "persistent allocation failed")
    }
}

impl std::error::Error for AllocError {}

/// Open (or re-open) the persistent heap for this process.
///
/// Refcounted; pair every call with [`finalize_process`].
pub fn init_process() {
    let prev = PROCESS_REFS.fetch_add(1, Ordering::AcqRel);
    if prev == 0 {
        debug_log!("pmem: heap opened");
    }
}

/// Per-thread initialization hook.
///
/// The shim needs no per-thread state; the hook exists so call sites keep
/// the shape a real persistent allocator requires (per-thread arenas,
/// flush queues).
pub fn init_thread(tid: usize) {
    let _ = tid;
}

/// Release one reference to the heap.
pub fn finalize_process() {
    let prev = PROCESS_REFS.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "finalize_process without matching init_process");
    if prev == 1 {
        debug_log!("pmem: heap closed");
    }
}

/// Allocate `layout` bytes from the persistent heap.
///
/// Returns null on exhaustion; callers map that to [`AllocError`].
pub fn alloc(layout: Layout) -> *mut u8 {
    if layout.size() == 0 {
        return NonNull::<u8>::dangling().as_ptr();
    }

    // SAFETY: layout has non-zero size.
    unsafe { alloc::alloc(layout) }
}

/// Return `ptr` to the persistent heap.
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc`] with the same `layout` and
/// not freed since.
pub unsafe fn dealloc(ptr: *mut u8, layout: Layout) {
    if layout.size() == 0 {
        return;
    }

    // SAFETY: caller contract.
    unsafe { alloc::dealloc(ptr, layout) }
}

/// Allocate one `T` from the persistent heap, uninitialized.
pub(crate) fn alloc_one<T>() -> Result<NonNull<T>, AllocError> {
    NonNull::new(alloc(Layout::new::<T>()).cast::<T>()).ok_or(AllocError)
}

/// Free one `T` previously obtained from [`alloc_one`].
///
/// # Safety
///
/// `ptr` must come from [`alloc_one::<T>`] and must not be freed twice.
/// The pointee is not dropped.
pub(crate) unsafe fn dealloc_one<T>(ptr: NonNull<T>) {
    // SAFETY: caller contract; layout matches the allocation.
    unsafe { dealloc(ptr.as_ptr().cast::<u8>(), Layout::new::<T>()) }
}

/// Register `ptr` in root slot `slot` so recovery can rediscover it.
///
/// # Panics
///
/// Panics if `slot >= ROOT_SLOTS`.
pub fn set_root(slot: usize, ptr: *mut u8) {
    ROOTS[slot].store(ptr, Ordering::Release);
}

/// Read root slot `slot`.
///
/// # Panics
///
/// Panics if `slot >= ROOT_SLOTS`.
pub fn root(slot: usize) -> *mut u8 {
    ROOTS[slot].load(Ordering::Acquire)
}

// ============================================================================
//  PBytes - owned byte buffer in persistent memory
// ============================================================================

/// An owned, immutable byte buffer allocated from the persistent heap.
///
/// The bytes are written back (unfenced) at construction, mirroring how
/// node payloads are persisted before the node that references them is
/// published. The buffer is freed on drop.
pub struct PBytes {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: PBytes is an owned immutable buffer; moving or sharing it across
// threads touches no thread-local state.
unsafe impl Send for PBytes {}
unsafe impl Sync for PBytes {}

impl PBytes {
    /// Copy `bytes` into a fresh persistent allocation and write it back.
    pub fn copy_from(bytes: &[u8]) -> Result<Self, AllocError> {
        let len = bytes.len();
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }

        let layout = Layout::array::<u8>(len).map_err(|_| AllocError)?;
        let ptr = NonNull::new(alloc(layout)).ok_or(AllocError)?;

        // SAFETY: ptr is a fresh allocation of len bytes; bytes is a
        // disjoint borrowed slice.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), len);
        }
        persist::writeback_range(ptr.as_ptr(), len);

        Ok(Self { ptr, len })
    }

    /// The buffer contents.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe this object's own live allocation
        // (dangling only when len == 0, which yields an empty slice).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Buffer length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PBytes {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }

        // Layout::array succeeded at construction for this len.
        let layout = Layout::array::<u8>(self.len).expect("layout validated at construction");

        // SAFETY: ptr came from alloc() with this layout and is freed once.
        unsafe { dealloc(self.ptr.as_ptr(), layout) }
    }
}

impl std::ops::Deref for PBytes {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl StdFmt::Debug for PBytes {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_tuple("PBytes").field(&self.as_slice()).finish()
    }
}

impl PartialEq for PBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for PBytes {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_refcounts() {
        init_process();
        init_process();
        finalize_process();
        finalize_process();
    }

    #[test]
    fn roots_round_trip() {
        let mut value = 7u8;
        set_root(ROOT_SLOTS - 1, &mut value);
        assert_eq!(root(ROOT_SLOTS - 1), (&mut value) as *mut u8);
        set_root(ROOT_SLOTS - 1, std::ptr::null_mut());
    }

    #[test]
    fn pbytes_copies_and_compares() {
        let a = PBytes::copy_from(b"hello").unwrap();
        let b = PBytes::copy_from(b"hello").unwrap();
        let c = PBytes::copy_from(b"world").unwrap();

        assert_eq!(a.as_slice(), b"hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 5);
        assert!(!a.is_empty());
    }

    #[test]
    fn pbytes_empty() {
        let e = PBytes::copy_from(b"").unwrap();
        assert!(e.is_empty());
        assert_eq!(e.as_slice(), b"");
    }

    #[test]
    fn typed_alloc_round_trip() {
        let ptr = alloc_one::<u64>().unwrap();
        // SAFETY: fresh allocation, write then free once.
        unsafe {
            ptr.as_ptr().write(42);
            assert_eq!(ptr.as_ptr().read(), 42);
            dealloc_one(ptr);
        }
    }
}
