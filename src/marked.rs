//! Tagged pointers with a low-bit logical-deletion mark.
//!
//! Chain nodes are unlinked in two steps: a CAS sets the mark bit in the
//! *incoming* pointer's target word (`next` of the predecessor-to-be-dead
//! node), logically deleting it; a second CAS physically splices it out.
//! The mark lives in the least significant pointer bit, which requires the
//! pointee alignment to be at least 2.
//!
//! [`MarkedPtr`] is the plain value (a `usize` newtype); [`AtomicMarkedPtr`]
//! is its atomic cell. Both strip or preserve the mark explicitly — there
//! is no implicit dereference of a marked value.

use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

const MARK_BIT: usize = 1;
const PTR_MASK: usize = !MARK_BIT;

/// A raw pointer carrying the logical-deletion mark in its low bit.
pub struct MarkedPtr<T> {
    raw: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> MarkedPtr<T> {
    /// The null pointer, unmarked.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self {
            raw: 0,
            _marker: PhantomData,
        }
    }

    /// Wrap an unmarked pointer.
    #[inline]
    #[must_use]
    pub fn new(ptr: *mut T) -> Self {
        let raw = ptr as usize;
        debug_assert_eq!(raw & MARK_BIT, 0, "pointer must be 2-aligned");

        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Rebuild from a raw word (pointer bits + mark bit).
    #[inline]
    #[must_use]
    pub const fn from_usize(raw: usize) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// The raw word, mark included.
    #[inline]
    #[must_use]
    pub const fn into_usize(self) -> usize {
        self.raw
    }

    /// This pointer with the mark set.
    #[inline]
    #[must_use]
    pub const fn with_mark(self) -> Self {
        Self::from_usize(self.raw | MARK_BIT)
    }

    /// This pointer with the mark cleared.
    #[inline]
    #[must_use]
    pub const fn without_mark(self) -> Self {
        Self::from_usize(self.raw & PTR_MASK)
    }

    /// Whether the mark bit is set.
    #[inline]
    #[must_use]
    pub const fn is_marked(self) -> bool {
        self.raw & MARK_BIT != 0
    }

    /// The pointer with the mark stripped.
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *mut T {
        (self.raw & PTR_MASK) as *mut T
    }

    /// Whether the pointer (mark stripped) is null.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.raw & PTR_MASK == 0
    }
}

// Manual impls: derive would bound on T.
impl<T> Copy for MarkedPtr<T> {}

impl<T> Clone for MarkedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for MarkedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for MarkedPtr<T> {}

impl<T> StdFmt::Debug for MarkedPtr<T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("MarkedPtr")
            .field("ptr", &self.as_ptr())
            .field("marked", &self.is_marked())
            .finish()
    }
}

/// An atomic [`MarkedPtr`] cell: a bucket head or a node's `next` link.
pub struct AtomicMarkedPtr<T> {
    raw: AtomicUsize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: the cell hands out raw pointers, never references; the owning
// structure's protocol (reclamation + CAS discipline) governs access.
// Bounds follow crossbeam's Atomic<T>.
unsafe impl<T: Send + Sync> Send for AtomicMarkedPtr<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicMarkedPtr<T> {}

impl<T> AtomicMarkedPtr<T> {
    /// A cell holding null, unmarked.
    #[inline]
    #[must_use]
    pub const fn null() -> Self {
        Self {
            raw: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// A cell holding `ptr`.
    #[inline]
    #[must_use]
    pub fn new(ptr: MarkedPtr<T>) -> Self {
        Self {
            raw: AtomicUsize::new(ptr.into_usize()),
            _marker: PhantomData,
        }
    }

    /// Load the current value.
    #[inline]
    pub fn load(&self, order: Ordering) -> MarkedPtr<T> {
        MarkedPtr::from_usize(self.raw.load(order))
    }

    /// Store a value.
    #[inline]
    pub fn store(&self, ptr: MarkedPtr<T>, order: Ordering) {
        self.raw.store(ptr.into_usize(), order);
    }

    /// Compare-and-swap: succeeds only on an exact match of pointer bits
    /// *and* mark bit.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: MarkedPtr<T>,
        new: MarkedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<MarkedPtr<T>, MarkedPtr<T>> {
        self.raw
            .compare_exchange(current.into_usize(), new.into_usize(), success, failure)
            .map(MarkedPtr::from_usize)
            .map_err(MarkedPtr::from_usize)
    }
}

impl<T> StdFmt::Debug for AtomicMarkedPtr<T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_tuple("AtomicMarkedPtr")
            .field(&self.load(Ordering::Relaxed))
            .finish()
    }
}
