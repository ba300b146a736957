//! `PersistMap` - a durably linearizable lock-free hash table.
//!
//! Fixed-bucket chaining table whose nodes live in persistent memory.
//! Buckets are cache-padded atomic head pointers; each chain is an
//! ordered singly-linked list (ascending byte-lex key order) with the
//! logical-deletion mark in the low bit of `next`. Every mutation of a
//! persistent location is followed by a cacheline writeback, and a store
//! fence precedes publishing any pointer whose target must be durable —
//! once an operation returns, its effect is recoverable after a crash
//! without a separate log.
//!
//! # Concurrency
//!
//! Lock-free. Operations are linearized at their successful publishing
//! CAS (install for insert/put/replace, the mark CAS for remove);
//! durability linearization coincides with the fence that follows.
//! Traversals physically unlink any marked node they pass, so deletion
//! completes cooperatively.
//!
//! # Thread registration
//!
//! Callers obtain a [`MapHandle`] per thread via
//! [`handle`](PersistMap::handle), passing the dense thread id assigned
//! by the harness. The handle binds the id to one thread at a time
//! (claiming it at creation, releasing on drop), which is what makes the
//! per-thread retire lists sound; using an id twice concurrently is a
//! protocol violation and panics.

use std::cmp::Ordering as CmpOrdering;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;

use crossbeam_utils::CachePadded;

use crate::marked::{AtomicMarkedPtr, MarkedPtr};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED};
use crate::persist;
use crate::pmem::{self, AllocError, PBytes};
use crate::reclaim::Reclaimer;
use crate::tracing_helpers::debug_log;

/// Default number of buckets, matching the deployment sizing of the
/// benchmark configuration this table is built for.
pub const DEFAULT_BUCKETS: usize = 1_000_000;

/// Root-table slot where the bucket array is registered.
const BUCKET_ROOT_SLOT: usize = 0;

/// A chain node in persistent memory.
///
/// `key` and `val` payloads are persistent buffers written back at
/// construction; the node itself is written back before any pointer to
/// it is published. The low bit of `next` is the logical-deletion mark.
struct Node {
    key: PBytes,
    val: PBytes,
    next: AtomicMarkedPtr<Node>,
}

impl Node {
    /// Allocate a node from the persistent heap and write it back
    /// (unfenced; the publishing op fences).
    fn alloc(key: &[u8], val: &[u8], next: MarkedPtr<Node>) -> Result<NonNull<Node>, AllocError> {
        let key = PBytes::copy_from(key)?;
        let val = PBytes::copy_from(val)?;

        let ptr = pmem::alloc_one::<Node>()?;
        // SAFETY: fresh allocation of a Node.
        unsafe {
            ptr.as_ptr().write(Node {
                key,
                val,
                next: AtomicMarkedPtr::new(next),
            });
        }
        persist::writeback(ptr.as_ptr());

        Ok(ptr)
    }

    /// Drop the payloads and return the node to the persistent heap.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Node::alloc`], be unreachable from the
    /// table, and be freed exactly once.
    unsafe fn dealloc(ptr: *mut Node) {
        // SAFETY: caller contract.
        unsafe {
            std::ptr::drop_in_place(ptr);
            pmem::dealloc_one(NonNull::new_unchecked(ptr));
        }
    }
}

/// Reclaimer callback for retired nodes.
unsafe fn reclaim_node(ptr: *mut Node) {
    // SAFETY: the reclaimer invokes this once per retired pointer, after
    // every reservation has moved past the retirement epoch.
    unsafe { Node::dealloc(ptr) }
}

/// Cursor returned by the chain search.
///
/// `prev` is the atomic slot referring to `curr`; `curr` is the first
/// live node whose key is `>=` the target (null at chain end); `next` is
/// `curr`'s successor with the mark stripped.
struct Search {
    found: bool,
    prev: *const AtomicMarkedPtr<Node>,
    curr: *mut Node,
    next: *mut Node,
}

/// Durably linearizable lock-free hash table. See the module docs.
pub struct PersistMap {
    buckets: Box<[CachePadded<AtomicMarkedPtr<Node>>]>,
    tracker: Reclaimer<Node>,
    /// One claim flag per thread id, backing [`MapHandle`] exclusivity.
    claims: Box<[AtomicBool]>,
}

impl PersistMap {
    /// Create a table for `threads` participants with
    /// [`DEFAULT_BUCKETS`] buckets.
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0`.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self::with_buckets(threads, DEFAULT_BUCKETS)
    }

    /// Create a table with an explicit bucket count.
    ///
    /// The bucket count is fixed for the lifetime of the table; there is
    /// no resizing or rehashing. Load factor is a deployment decision.
    ///
    /// # Panics
    ///
    /// Panics if `threads == 0` or `nbuckets == 0`.
    #[must_use]
    pub fn with_buckets(threads: usize, nbuckets: usize) -> Self {
        assert!(threads > 0, "need at least one thread slot");
        assert!(nbuckets > 0, "need at least one bucket");

        pmem::init_process();

        let buckets: Box<[CachePadded<AtomicMarkedPtr<Node>>]> = (0..nbuckets)
            .map(|_| CachePadded::new(AtomicMarkedPtr::null()))
            .collect();

        // Register the head array so a recovery pass can find the chains.
        pmem::set_root(BUCKET_ROOT_SLOT, buckets.as_ptr() as *mut u8);

        debug_log!(nbuckets, threads, "persist map created");

        Self {
            buckets,
            tracker: Reclaimer::new(threads, reclaim_node),
            claims: (0..threads).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Number of buckets.
    #[inline]
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of thread slots.
    #[inline]
    #[must_use]
    pub fn threads(&self) -> usize {
        self.claims.len()
    }

    /// Bucket index a key hashes to.
    #[inline]
    #[must_use]
    pub fn bucket_of(&self, key: &[u8]) -> usize {
        fxhash::hash64(key) as usize % self.buckets.len()
    }

    /// Claim thread id `tid` and return the operation handle for it.
    ///
    /// # Panics
    ///
    /// Panics if `tid` is out of range or already claimed by a live
    /// handle — both are protocol violations on the harness side.
    pub fn handle(&self, tid: usize) -> MapHandle<'_> {
        assert!(tid < self.threads(), "thread id {tid} out of range");
        assert!(
            self.claims[tid]
                .compare_exchange(false, true, CAS_SUCCESS, CAS_FAILURE)
                .is_ok(),
            "thread id {tid} already claimed"
        );

        pmem::init_thread(tid);

        MapHandle { map: self, tid }
    }

    // ========================================================================
    //  Chain search
    // ========================================================================

    /// Find the insertion point for `key` in its bucket chain.
    ///
    /// Marked nodes encountered on the way are physically unlinked (and
    /// retired); if an unlink CAS fails the traversal restarts from the
    /// bucket head. Callers hold an epoch reservation for `tid`.
    fn find_node(&self, key: &[u8], tid: usize) -> Search {
        'restart: loop {
            let idx = self.bucket_of(key);
            let mut prev: *const AtomicMarkedPtr<Node> = &*self.buckets[idx];
            // SAFETY: prev points at a live bucket head.
            let mut curr: *mut Node = unsafe { (*prev).load(READ_ORD) }.as_ptr();
            persist::writeback(prev);

            loop {
                if curr.is_null() {
                    return Search {
                        found: false,
                        prev,
                        curr,
                        next: std::ptr::null_mut(),
                    };
                }

                // SAFETY: curr was read from a reachable slot under the
                // caller's reservation, so it cannot have been reclaimed.
                let next_link = unsafe { (*curr).next.load(READ_ORD) };
                persist::writeback(curr);

                let cmark = next_link.is_marked();
                let next = next_link.as_ptr();
                // SAFETY: as above; the key payload is immutable.
                let cmp = unsafe { (*curr).key.as_slice() }.cmp(key);

                // The slot moved on: restart from the head.
                // SAFETY: prev is a bucket head or the next field of an
                // epoch-protected node.
                if unsafe { (*prev).load(READ_ORD) } != MarkedPtr::new(curr) {
                    continue 'restart;
                }
                persist::writeback(prev);

                if !cmark {
                    match cmp {
                        CmpOrdering::Equal => {
                            persist::fence();
                            return Search {
                                found: true,
                                prev,
                                curr,
                                next,
                            };
                        }
                        CmpOrdering::Greater => {
                            return Search {
                                found: false,
                                prev,
                                curr,
                                next,
                            };
                        }
                        CmpOrdering::Less => {
                            // SAFETY: curr is epoch-protected; its next
                            // field outlives this traversal.
                            prev = unsafe { &(*curr).next };
                        }
                    }
                } else {
                    // curr is logically deleted: unlink it here.
                    persist::fence();
                    // SAFETY: prev as above.
                    match unsafe { &*prev }.compare_exchange(
                        MarkedPtr::new(curr),
                        MarkedPtr::new(next),
                        CAS_SUCCESS,
                        CAS_FAILURE,
                    ) {
                        Ok(_) => {
                            persist::writeback(prev);
                            persist::fence();
                            // SAFETY: the CAS above made curr unreachable;
                            // tid is exclusively ours via MapHandle.
                            unsafe { self.tracker.retire(curr, tid) };
                        }
                        Err(_) => continue 'restart,
                    }
                }

                curr = next;
            }
        }
    }

    // ========================================================================
    //  Publish helpers
    // ========================================================================

    /// Try to link `node` in front of `s.curr` (fresh key). Returns
    /// whether the install CAS succeeded.
    fn try_install_fresh(&self, node: NonNull<Node>, s: &Search) -> bool {
        // SAFETY: node is ours and unpublished.
        unsafe {
            (*node.as_ptr())
                .next
                .store(MarkedPtr::new(s.curr), RELAXED);
        }
        persist::writeback(node.as_ptr());
        persist::fence();

        // SAFETY: s.prev is a bucket head or an epoch-protected next field.
        let installed = unsafe { &*s.prev }
            .compare_exchange(
                MarkedPtr::new(s.curr),
                MarkedPtr::new(node.as_ptr()),
                CAS_SUCCESS,
                CAS_FAILURE,
            )
            .is_ok();

        if installed {
            persist::writeback(s.prev);
            persist::fence();
        }
        installed
    }

    /// Try to install `node` ahead of the equal-keyed `s.curr`, then mark
    /// and splice the old node out. Returns whether the install CAS
    /// succeeded (the marking/splicing that follows always completes,
    /// cooperatively if need be).
    fn try_install_over(&self, node: NonNull<Node>, s: &Search, key: &[u8], tid: usize) -> bool {
        // SAFETY: node is ours and unpublished.
        unsafe {
            (*node.as_ptr())
                .next
                .store(MarkedPtr::new(s.curr), RELAXED);
        }
        persist::writeback(node.as_ptr());
        persist::fence();

        // SAFETY: s.prev as in try_install_fresh.
        if unsafe { &*s.prev }
            .compare_exchange(
                MarkedPtr::new(s.curr),
                MarkedPtr::new(node.as_ptr()),
                CAS_SUCCESS,
                CAS_FAILURE,
            )
            .is_err()
        {
            return false;
        }
        persist::writeback(s.prev);
        persist::fence();

        // Mark the superseded node. Duplicate keys exist transiently from
        // here until the splice; traversals stop at the first key >= the
        // target, which is the fresh node ahead of this one.
        let mut expected = MarkedPtr::new(s.next);
        loop {
            // SAFETY: s.curr is epoch-protected.
            match unsafe { &(*s.curr).next }.compare_exchange(
                expected,
                expected.with_mark(),
                CAS_SUCCESS,
                CAS_FAILURE,
            ) {
                Ok(_) => break,
                Err(observed) => expected = observed,
            }
        }
        persist::writeback(s.curr);
        persist::fence();

        // Splice the old node out of our own next link. The successor is
        // stored unmarked: the mark we just set belongs to s.curr's
        // deletion, not to the fresh node.
        // SAFETY: node is published and epoch-protected.
        if unsafe { &(*node.as_ptr()).next }
            .compare_exchange(
                MarkedPtr::new(s.curr),
                expected.without_mark(),
                CAS_SUCCESS,
                CAS_FAILURE,
            )
            .is_ok()
        {
            persist::writeback(node.as_ptr());
            persist::fence();
            // SAFETY: the splice made s.curr unreachable; tid is ours.
            unsafe { self.tracker.retire(s.curr, tid) };
        } else {
            // A concurrent traversal is completing the unlink; help once.
            let _ = self.find_node(key, tid);
        }
        true
    }

    // ========================================================================
    //  Operations (via MapHandle)
    // ========================================================================

    fn get_impl(&self, key: &[u8], tid: usize) -> Option<Vec<u8>> {
        self.tracker.start_op(tid);

        let s = self.find_node(key, tid);
        let res = if s.found {
            // SAFETY: s.curr is epoch-protected; val is immutable.
            Some(unsafe { (*s.curr).val.as_slice() }.to_vec())
        } else {
            None
        };

        self.tracker.end_op(tid);
        res
    }

    fn insert_impl(&self, key: &[u8], val: &[u8], tid: usize) -> Result<bool, AllocError> {
        let node = Node::alloc(key, val, MarkedPtr::null())?;

        self.tracker.start_op(tid);
        let res = loop {
            let s = self.find_node(key, tid);
            if s.found {
                // SAFETY: node was never published.
                unsafe { Node::dealloc(node.as_ptr()) };
                break false;
            }
            if self.try_install_fresh(node, &s) {
                break true;
            }
        };
        self.tracker.end_op(tid);

        Ok(res)
    }

    fn put_impl(&self, key: &[u8], val: &[u8], tid: usize) -> Result<Option<Vec<u8>>, AllocError> {
        let node = Node::alloc(key, val, MarkedPtr::null())?;

        self.tracker.start_op(tid);
        let res = loop {
            let s = self.find_node(key, tid);
            if s.found {
                // Snapshot the prior value before the install CAS; once
                // the CAS lands another thread may unlink the old node.
                // SAFETY: s.curr is epoch-protected.
                let prior = unsafe { (*s.curr).val.as_slice() }.to_vec();
                if self.try_install_over(node, &s, key, tid) {
                    break Some(prior);
                }
            } else if self.try_install_fresh(node, &s) {
                break None;
            }
        };
        self.tracker.end_op(tid);

        Ok(res)
    }

    fn replace_impl(
        &self,
        key: &[u8],
        val: &[u8],
        tid: usize,
    ) -> Result<Option<Vec<u8>>, AllocError> {
        let node = Node::alloc(key, val, MarkedPtr::null())?;

        self.tracker.start_op(tid);
        let res = loop {
            let s = self.find_node(key, tid);
            if !s.found {
                // SAFETY: node was never published.
                unsafe { Node::dealloc(node.as_ptr()) };
                break None;
            }
            // SAFETY: s.curr is epoch-protected.
            let prior = unsafe { (*s.curr).val.as_slice() }.to_vec();
            if self.try_install_over(node, &s, key, tid) {
                break Some(prior);
            }
        };
        self.tracker.end_op(tid);

        Ok(res)
    }

    fn remove_impl(&self, key: &[u8], tid: usize) -> Option<Vec<u8>> {
        self.tracker.start_op(tid);

        let mut res = None;
        loop {
            let s = self.find_node(key, tid);
            if !s.found {
                break;
            }

            // SAFETY: s.curr is epoch-protected.
            let prior = unsafe { (*s.curr).val.as_slice() }.to_vec();

            persist::fence();
            // Logical deletion: the linearization point on success.
            // SAFETY: s.curr as above.
            if unsafe { &(*s.curr).next }
                .compare_exchange(
                    MarkedPtr::new(s.next),
                    MarkedPtr::new(s.next).with_mark(),
                    CAS_SUCCESS,
                    CAS_FAILURE,
                )
                .is_err()
            {
                continue;
            }
            persist::writeback(s.curr);
            persist::fence();
            res = Some(prior);

            // Physical unlink; on failure a concurrent traversal finishes
            // the job (the node is already logically deleted).
            // SAFETY: s.prev as in find_node.
            if unsafe { &*s.prev }
                .compare_exchange(
                    MarkedPtr::new(s.curr),
                    MarkedPtr::new(s.next),
                    CAS_SUCCESS,
                    CAS_FAILURE,
                )
                .is_ok()
            {
                persist::writeback(s.prev);
                persist::fence();
                // SAFETY: the unlink made s.curr unreachable; tid is ours.
                unsafe { self.tracker.retire(s.curr, tid) };
            } else {
                let _ = self.find_node(key, tid);
            }
            break;
        }

        self.tracker.end_op(tid);
        res
    }

    // ========================================================================
    //  Quiescent inspection
    // ========================================================================

    /// Snapshot every live `(key, value)` pair.
    ///
    /// Takes `&mut self`: exclusive access is the quiescence requirement,
    /// enforced by the borrow checker rather than by convention.
    #[must_use]
    pub fn quiescent_entries(&mut self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries = Vec::new();
        for idx in 0..self.buckets.len() {
            for (key, val, marked) in self.chain_nodes(idx) {
                if !marked {
                    entries.push((key, val));
                }
            }
        }
        entries
    }

    /// Snapshot one bucket chain in order as `(key, logically_deleted)`.
    #[must_use]
    pub fn bucket_chain(&mut self, idx: usize) -> Vec<(Vec<u8>, bool)> {
        self.chain_nodes(idx)
            .into_iter()
            .map(|(key, _, marked)| (key, marked))
            .collect()
    }

    fn chain_nodes(&mut self, idx: usize) -> Vec<(Vec<u8>, Vec<u8>, bool)> {
        let mut out = Vec::new();
        let mut curr = self.buckets[idx].load(READ_ORD).as_ptr();
        while !curr.is_null() {
            // SAFETY: &mut self means no concurrent mutation or
            // reclamation; every chain node is live.
            let node = unsafe { &*curr };
            let link = node.next.load(READ_ORD);
            out.push((
                node.key.as_slice().to_vec(),
                node.val.as_slice().to_vec(),
                link.is_marked(),
            ));
            curr = link.as_ptr();
        }
        out
    }
}

impl Drop for PersistMap {
    fn drop(&mut self) {
        // Free everything still linked; retired nodes are disjoint from
        // the chains and are reclaimed when the tracker drops.
        for bucket in self.buckets.iter() {
            let mut curr = bucket.load(READ_ORD).as_ptr();
            while !curr.is_null() {
                // SAFETY: exclusive access; each chain node freed once.
                let next = unsafe { (*curr).next.load(READ_ORD) }.as_ptr();
                unsafe { Node::dealloc(curr) };
                curr = next;
            }
        }

        pmem::set_root(BUCKET_ROOT_SLOT, std::ptr::null_mut());
        pmem::finalize_process();
    }
}

// ============================================================================
//  MapHandle
// ============================================================================

/// Per-thread operation handle for a [`PersistMap`].
///
/// Holds the claim on one thread id; operations take `&mut self`, so a
/// handle cannot issue two operations concurrently and the id's retire
/// list stays single-owner.
pub struct MapHandle<'a> {
    map: &'a PersistMap,
    tid: usize,
}

impl MapHandle<'_> {
    /// The thread id this handle is bound to.
    #[inline]
    #[must_use]
    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Look up `key`, returning a snapshot of its value.
    #[must_use]
    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get_impl(key, self.tid)
    }

    /// Insert `(key, val)` if `key` is absent.
    ///
    /// Returns `Ok(true)` on insertion, `Ok(false)` if the key was
    /// already present (the table is unchanged).
    pub fn insert(&mut self, key: &[u8], val: &[u8]) -> Result<bool, AllocError> {
        self.map.insert_impl(key, val, self.tid)
    }

    /// Install `(key, val)` unconditionally.
    ///
    /// Returns the previous value if the key was present.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<Option<Vec<u8>>, AllocError> {
        self.map.put_impl(key, val, self.tid)
    }

    /// Install `(key, val)` only if `key` is present.
    ///
    /// Returns the previous value, or `None` (table unchanged) if the
    /// key was absent.
    pub fn replace(&mut self, key: &[u8], val: &[u8]) -> Result<Option<Vec<u8>>, AllocError> {
        self.map.replace_impl(key, val, self.tid)
    }

    /// Remove `key`, returning its value if it was present.
    #[must_use = "remove reports whether the key was present"]
    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.remove_impl(key, self.tid)
    }
}

impl Drop for MapHandle<'_> {
    fn drop(&mut self) {
        self.map.claims[self.tid].store(false, crate::ordering::WRITE_ORD);
    }
}
