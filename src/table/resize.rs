//! Structural changes: the resize lock, the invisible-epoch optimization,
//! and incremental in-place grow (unzip) and shrink (zip).
//!
//! # Protocol
//!
//! ```text
//! grow:   prolog (resize lock, doubled sibling table)
//!         per bucket: lock -> copy head to both siblings (locked) ->
//!                     redirect -> unzip one pointer per barrier -> unlock
//!         epilog (publish sibling, global barrier, free old table)
//! shrink: mirror image, merging sibling pairs instead of splitting
//! ```
//!
//! The one-pointer-per-barrier rule is the heart of unzip: a reader that
//! snapshotted a link mid-chain may be sitting on a node whose successor
//! is about to move to the other sibling. Rewiring two successive links
//! between barriers could carry that reader onto the wrong chain, where
//! its key does not live. After every single rewire,
//! [`write_synchronize_on_visible_epoch`] waits out all pre-existing
//! readers before the next link moves.
//!
//! The invisible epoch lets those per-link barriers collapse: the bulk
//! writer flags the version as not-yet-observed, and only readers clear
//! the flag. While the flag holds the writer's identity, no reader has
//! entered since the last barrier and the next barrier is skipped.

use std::ptr;
use std::sync::atomic::fence;

use parking_lot::lock_api::RawMutex as _;

use crate::bucket::Node;
#[cfg(debug_assertions)]
use crate::bucket::POISON_PTR;
use crate::config::TableConfig;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::smr::{self, ThreadId};
use crate::tracing_helpers::debug_log;

use super::{ConcurrentHashTable, InternalTable};

impl<C: TableConfig> ConcurrentHashTable<C> {
    // ========================================================================
    //  Resize lock
    // ========================================================================

    /// Take the resize lock without blocking. Clears the invisible epoch:
    /// a fresh bulk writer starts with a version readers may hold.
    pub(crate) fn try_resize_lock(&self, locker: ThreadId) -> bool {
        if !self.resize_lock.try_lock() {
            debug_assert_ne!(
                self.resize_lock_owner.load(RELAXED),
                locker.as_raw(),
                "resize lock re-entered by its owner"
            );
            return false;
        }
        debug_assert_eq!(self.resize_lock_owner.load(RELAXED), 0);
        self.invisible_epoch.store(0, RELAXED);
        self.resize_lock_owner.store(locker.as_raw(), RELAXED);
        true
    }

    /// Take the resize lock, blocking behind any in-flight structural
    /// change.
    pub(crate) fn lock_resize_lock(&self, locker: ThreadId) {
        debug_assert_ne!(
            self.resize_lock_owner.load(RELAXED),
            locker.as_raw(),
            "resize lock re-entered by its owner"
        );
        self.resize_lock.lock();
        debug_assert_eq!(self.resize_lock_owner.load(RELAXED), 0);
        self.resize_lock_owner.store(locker.as_raw(), RELAXED);
        self.invisible_epoch.store(0, RELAXED);
    }

    /// Release the resize lock.
    pub(crate) fn unlock_resize_lock(&self, locker: ThreadId) {
        self.invisible_epoch.store(0, RELAXED);
        assert_eq!(
            self.resize_lock_owner.load(RELAXED),
            locker.as_raw(),
            "resize lock released by a non-owner"
        );
        self.resize_lock_owner.store(0, RELAXED);
        // SAFETY: owner check above proves this thread holds the lock.
        unsafe { self.resize_lock.unlock() };
    }

    #[cfg(test)]
    pub(crate) fn resize_lock_held_by(&self, thread: ThreadId) -> bool {
        self.resize_lock_owner.load(RELAXED) == thread.as_raw()
    }

    // ========================================================================
    //  Invisible epoch
    // ========================================================================

    /// Quiescence barrier that may be skipped when no reader has observed
    /// the current version. Resize-lock holder only.
    pub(crate) fn write_synchronize_on_visible_epoch(&self, thread: ThreadId) {
        debug_assert_eq!(
            self.resize_lock_owner.load(RELAXED),
            thread.as_raw(),
            "invisible epoch touched without the resize lock"
        );
        // Prevent the load below from floating above earlier link stores.
        fence(std::sync::atomic::Ordering::SeqCst);

        // Still flagged by us: no reader entered since the last barrier,
        // so nothing can be mid-chain and the barrier is free.
        if self.invisible_epoch.load(READ_ORD) == thread.as_raw() {
            return;
        }
        debug_assert_eq!(
            self.invisible_epoch.load(RELAXED),
            0,
            "two threads doing bulk operations"
        );
        // Flag this/next version as unobserved; a reader entering a
        // critical section zeroes the flag and re-arms the next barrier.
        self.invisible_epoch.store(thread.as_raw(), WRITE_ORD);
        smr::write_synchronize();
    }

    // ========================================================================
    //  Table publication
    // ========================================================================

    /// Publish the sibling table and return the retired one, drained of
    /// readers and safe to free.
    fn set_table_from_new(&self) -> *mut InternalTable<C::Value> {
        let old_table = self.table.load(RELAXED);
        // Publish the new table.
        self.table.store(self.new_table.load(RELAXED), WRITE_ORD);
        // All must see this before the sibling pointer disappears.
        smr::write_synchronize();
        // The sibling pointer is not read any more.
        self.new_table.store(ptr::null_mut(), RELAXED);
        old_table
    }

    #[inline]
    fn is_max_size_reached(&self) -> bool {
        self.size_limit_reached.load(RELAXED)
    }

    // ========================================================================
    //  Grow (unzip)
    // ========================================================================

    /// Double the table once, toward 2^`log2_size` buckets (`0` means the
    /// configured limit). Fails fast: returns `false` when the limit is
    /// reached, a structural change is in flight, or the table already has
    /// the requested size. Concurrent reads and single-key writes proceed
    /// throughout.
    pub fn grow(&self, log2_size: usize) -> bool {
        let target = if log2_size == 0 {
            self.log2_size_limit
        } else {
            log2_size
        };
        self.internal_grow(ThreadId::current(), target)
    }

    fn internal_grow(&self, thread: ThreadId, log2_size: usize) -> bool {
        if !self.internal_grow_prolog(thread, log2_size) {
            return false;
        }
        debug_assert!(self.resize_lock_owner.load(RELAXED) == thread.as_raw());
        debug_log!(from_log2 = self.get_table().log2_size(), "growing table");
        self.internal_grow_range(thread, 0, self.get_table().size());
        debug_log!(to_log2 = self.get_new_table().log2_size(), "grow unzipped, publishing");
        self.internal_grow_epilog(thread);
        true
    }

    fn internal_grow_prolog(&self, thread: ThreadId, log2_size: usize) -> bool {
        // Double-check the limit around the lock: grow means high load, so
        // losers should get out cheaply.
        if self.is_max_size_reached() {
            return false;
        }
        if !self.try_resize_lock(thread) {
            // Either an ongoing resize or an operation that does not want
            // us to resize now.
            return false;
        }
        let table = self.get_table();
        if self.is_max_size_reached() || table.log2_size() >= log2_size {
            self.unlock_resize_lock(thread);
            return false;
        }

        let new_table = InternalTable::<C::Value>::new(table.log2_size() + 1);
        if new_table.log2_size() == self.log2_size_limit {
            self.size_limit_reached.store(true, RELAXED);
        }
        // Release: a reader that observes a redirect flag (itself a release
        // store) must find an initialized sibling behind this pointer.
        self.new_table.store(Box::into_raw(new_table), WRITE_ORD);
        true
    }

    /// Split every old bucket in `[start, stop)` across its two siblings.
    /// Sibling indices: `even` keeps the old index, `odd` is `even` plus
    /// the old table size (the newly significant hash bit).
    fn internal_grow_range(&self, thread: ThreadId, start: usize, stop: usize) {
        let old_table = self.get_table();
        let new_table = self.get_new_table();
        debug_assert!(stop <= old_table.size());

        for even_index in start..stop {
            let bucket = old_table.get_bucket(even_index);
            bucket.lock();

            let odd_index = even_index + old_table.size();
            // The head word is copied with its lock bit, so both siblings
            // start locked.
            new_table.get_bucket(even_index).store_raw(bucket.first_raw());
            new_table.get_bucket(odd_index).store_raw(bucket.first_raw());

            // Movers now land in the new table, where they wait on the
            // sibling locks until the unlocks below.
            bucket.redirect();

            if !self.unzip_bucket(thread, old_table, new_table, even_index, odd_index) {
                // Empty bucket, nothing was rewired. Readers may still be
                // looking at the head we are about to poison.
                #[cfg(debug_assertions)]
                smr::write_synchronize();
            }

            new_table.get_bucket(even_index).unlock();
            new_table.get_bucket(odd_index).unlock();

            #[cfg(debug_assertions)]
            bucket.release_assign_node_ptr(bucket.first_slot(), POISON_PTR as *mut Node<C::Value>);
        }
    }

    /// Partition one old chain across the two sibling buckets, one link
    /// rewire per quiescence barrier. Returns `false` for an empty bucket.
    ///
    /// Both sibling heads start as aliases of the whole old chain; each
    /// step detaches the current node from the sibling it does not belong
    /// to. Dead nodes are detached from both and freed after the barrier.
    fn unzip_bucket(
        &self,
        thread: ThreadId,
        old_table: &InternalTable<C::Value>,
        new_table: &InternalTable<C::Value>,
        even_index: usize,
        odd_index: usize,
    ) -> bool {
        let mut aux = old_table.get_bucket(even_index).first();
        if aux.is_null() {
            // Empty bucket; the caller owes the readers a barrier before
            // poisoning the head.
            return false;
        }

        let even_bucket = new_table.get_bucket(even_index);
        let odd_bucket = new_table.get_bucket(odd_index);
        let mut even_slot = even_bucket.first_slot();
        let mut odd_slot = odd_bucket.first_slot();
        let mut delete_me: *mut Node<C::Value> = ptr::null_mut();

        while !aux.is_null() {
            // SAFETY: chain nodes are freed only behind a barrier and this
            // thread is the only one rewiring the locked siblings.
            let node = unsafe { &*aux };
            let mut dead_hash = false;
            let hash = C::hash(node.value(), &mut dead_hash);
            if dead_hash {
                // Dead entry: drop it from both sibling chains.
                odd_bucket.release_assign_node_ptr(odd_slot, node.next());
                even_bucket.release_assign_node_ptr(even_slot, node.next());
                delete_me = aux;
            } else {
                let aux_index = new_table.bucket_index(hash);
                if aux_index == even_index {
                    // Detach from the odd chain, keep in the even chain.
                    odd_bucket.release_assign_node_ptr(odd_slot, node.next());
                    even_slot = node.next_slot();
                } else if aux_index == odd_index {
                    // Detach from the even chain, keep in the odd chain.
                    even_bucket.release_assign_node_ptr(even_slot, node.next());
                    odd_slot = node.next_slot();
                } else {
                    unreachable!("node hash maps outside both sibling buckets");
                }
            }
            aux = node.next();

            // Only one link may move per barrier: a reader parked on this
            // node must reach a quiescent point before its successor can
            // switch chains, or the reader ends up walking the wrong
            // sibling.
            self.write_synchronize_on_visible_epoch(thread);
            if !delete_me.is_null() {
                // SAFETY: detached from both chains before the barrier.
                unsafe { C::free_node(delete_me) };
                delete_me = ptr::null_mut();
            }
        }
        true
    }

    fn internal_grow_epilog(&self, thread: ThreadId) {
        debug_assert_eq!(self.resize_lock_owner.load(RELAXED), thread.as_raw());

        let old_table = self.set_table_from_new();
        self.unlock_resize_lock(thread);

        #[cfg(debug_assertions)]
        {
            // SAFETY: retired table, no longer visible to any thread.
            let old = unsafe { &*old_table };
            for index in 0..old.size() {
                assert_eq!(
                    old.get_bucket(index).first() as usize,
                    POISON_PTR,
                    "retired bucket escaped poisoning"
                );
            }
        }

        // ABA safe: the retired table is not visible to any other thread.
        // SAFETY: allocated via Box::into_raw, drained by the barrier in
        // set_table_from_new.
        unsafe { drop(Box::from_raw(old_table)) };
    }

    // ========================================================================
    //  Shrink (zip)
    // ========================================================================

    /// Halve the table once, toward 2^`log2_size` buckets (`0` means the
    /// configured start size). Refuses to shrink below the start size.
    /// Fails fast under contention, like [`grow`](Self::grow).
    pub fn shrink(&self, log2_size: usize) -> bool {
        let target = if log2_size == 0 {
            self.log2_start_size
        } else {
            log2_size
        };
        self.internal_shrink(ThreadId::current(), target)
    }

    fn internal_shrink(&self, thread: ThreadId, log2_size: usize) -> bool {
        if !self.internal_shrink_prolog(thread, log2_size) {
            return false;
        }
        debug_assert!(self.resize_lock_owner.load(RELAXED) == thread.as_raw());
        debug_log!(from_log2 = self.get_table().log2_size(), "shrinking table");
        self.internal_shrink_range(thread, 0, self.get_new_table().size());
        debug_log!(to_log2 = self.get_new_table().log2_size(), "shrink zipped, publishing");
        self.internal_shrink_epilog(thread);
        true
    }

    fn internal_shrink_prolog(&self, thread: ThreadId, log2_size: usize) -> bool {
        if !self.try_resize_lock(thread) {
            return false;
        }
        let table = self.get_table();
        if table.log2_size() == self.log2_start_size || table.log2_size() <= log2_size {
            self.unlock_resize_lock(thread);
            return false;
        }
        let new_table = InternalTable::<C::Value>::new(table.log2_size() - 1);
        // Same publication contract as in grow.
        self.new_table.store(Box::into_raw(new_table), WRITE_ORD);
        true
    }

    /// Merge every sibling pair `(index, index + new_size)` of the old
    /// table into bucket `index` of the halved table.
    fn internal_shrink_range(&self, thread: ThreadId, start: usize, stop: usize) {
        let old_table = self.get_table();
        let new_table = self.get_new_table();
        debug_assert!(stop <= new_table.size());

        for bucket_index in start..stop {
            let even_index = bucket_index; // high hash bit 0
            let odd_index = bucket_index + new_table.size(); // high hash bit 1

            let old_even = old_table.get_bucket(even_index);
            let old_odd = old_table.get_bucket(odd_index);

            old_even.lock();
            old_odd.lock();

            let merged = new_table.get_bucket(bucket_index);
            // Carries the lock bit, so the merged bucket starts locked.
            merged.store_raw(old_even.first_raw());
            // Put the chains together.
            merged.release_assign_last_node_next(old_odd.first());

            old_even.redirect();
            old_odd.redirect();

            // Readers snapshotted into either old bucket must finish
            // before the merged bucket opens for writes.
            self.write_synchronize_on_visible_epoch(thread);

            merged.unlock();

            #[cfg(debug_assertions)]
            {
                old_even
                    .release_assign_node_ptr(old_even.first_slot(), POISON_PTR as *mut Node<C::Value>);
                old_odd
                    .release_assign_node_ptr(old_odd.first_slot(), POISON_PTR as *mut Node<C::Value>);
            }
        }
    }

    fn internal_shrink_epilog(&self, thread: ThreadId) {
        debug_assert_eq!(self.resize_lock_owner.load(RELAXED), thread.as_raw());

        let old_table = self.set_table_from_new();
        self.size_limit_reached.store(false, RELAXED);
        self.unlock_resize_lock(thread);

        #[cfg(debug_assertions)]
        {
            // SAFETY: retired table, no longer visible to any thread.
            let old = unsafe { &*old_table };
            for index in 0..old.size() {
                assert_eq!(
                    old.get_bucket(index).first() as usize,
                    POISON_PTR,
                    "retired bucket escaped poisoning"
                );
            }
        }

        // SAFETY: as in the grow epilog.
        unsafe { drop(Box::from_raw(old_table)) };
    }
}

// ============================================================================
//  Tests
// ============================================================================
