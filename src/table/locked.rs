//! Single-key writers: insert-or-find, remove, and the bucket-locked
//! cleanup helpers.
//!
//! # Protocol
//!
//! ```text
//! insert: CS { find bucket, scan chain, CAS node at head } -> retry on CAS miss
//! remove: trylock bucket (CS only until the lock lands), splice out,
//!         unlock, write_synchronize, destroy
//! ```
//!
//! The critical section is only needed until a bucket lock is taken: a
//! locked bucket cannot be redirected, so the bucket (and its table) stay
//! valid for the lock holder without any reader registration.

use std::ptr;

use crate::bucket::{Bucket, Node, SPINPAUSES_PER_YIELD};
use crate::config::{Lookup, TableConfig};
use crate::smr::{self, ThreadId};
use crate::tracing_helpers::trace_log;

use super::{BULK_DELETE_LIMIT, ConcurrentHashTable, ScopedCs};

impl<C: TableConfig> ConcurrentHashTable<C> {
    // ========================================================================
    //  Insert
    // ========================================================================

    /// Insert the value produced by `value_f` unless `lookup` already
    /// matches a live entry.
    ///
    /// `callback` receives `(inserted, &value)` exactly once: the freshly
    /// published value on success, the surviving duplicate otherwise.
    /// Returns whether a new node was published. Spins (never parks) under
    /// head-CAS contention and bucket locks.
    pub fn insert<L, V, F>(
        &self,
        lookup: &L,
        value_f: V,
        callback: F,
        grow_hint: Option<&mut bool>,
    ) -> bool
    where
        L: Lookup<C::Value>,
        V: FnOnce() -> C::Value,
        F: FnOnce(bool, &C::Value),
    {
        let thread = ThreadId::current();
        let hash = lookup.hash();

        let mut ret = false;
        let mut have_dead = false;
        let mut loops: usize = 0;
        let mut i: usize = 0;
        let mut new_node: *mut Node<C::Value> = ptr::null_mut();
        let mut value_f = Some(value_f);
        let mut callback = Some(callback);

        loop {
            let locked;
            {
                let _cs = ScopedCs::new(thread, self);
                let bucket = self.get_bucket(hash);

                let first_at_start = bucket.first();
                let old = self.get_node(bucket, lookup, &mut have_dead, Some(&mut loops));
                if let Some(old) = old {
                    // Duplicate: report the survivor.
                    (callback.take().expect("callback consumed"))(false, old.value());
                    break;
                }

                if new_node.is_null() {
                    let value = (value_f.take().expect("value_f consumed"))();
                    new_node = C::allocate_node(Node::new(value, first_at_start));
                } else {
                    // Re-aim the node kept from the failed attempt.
                    // SAFETY: we own new_node until a CAS publishes it.
                    unsafe { (*new_node).set_next(first_at_start) };
                }

                if bucket.cas_first(new_node, first_at_start) {
                    // SAFETY: just published; freed only behind a
                    // quiescence barrier, and we are inside the CS.
                    (callback.take().expect("callback consumed"))(true, unsafe {
                        (*new_node).value()
                    });
                    new_node = ptr::null_mut();
                    ret = true;
                    break;
                }
                // CAS missed: leave the critical section before backing off.
                locked = bucket.is_locked();
            }
            i += 1;
            if locked {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }

        if !new_node.is_null() {
            // A racing insert of the same key won; the spare node was never
            // published and nobody else can reference it.
            // SAFETY: exclusively ours, allocated above.
            unsafe { C::free_node(new_node) };
        } else if i == 0 && have_dead {
            // Fast-path insert that walked past dead entries: purge them
            // while the bucket is likely still cached.
            let bucket = self.get_bucket_locked(thread, hash);
            self.delete_in_bucket(bucket, lookup);
        }

        if let Some(grow_hint) = grow_hint {
            *grow_hint = loops > self.grow_hint;
        }

        ret
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    /// Remove the first entry matching `lookup`.
    ///
    /// On a match the node is spliced out under the bucket lock, a
    /// quiescence barrier drains readers, `delete_f` observes the value,
    /// and the node is destroyed. Returns whether a match was removed.
    pub fn remove<L, D>(&self, lookup: &L, delete_f: D) -> bool
    where
        L: Lookup<C::Value>,
        D: FnOnce(&C::Value),
    {
        let thread = ThreadId::current();
        let bucket = self.get_bucket_locked(thread, lookup.hash());
        debug_assert!(bucket.is_locked());

        let mut rem_slot = bucket.first_slot();
        let mut rem_n = bucket.first();
        let mut have_dead = false;
        while !rem_n.is_null() {
            // SAFETY: chain nodes stay valid under the bucket lock.
            let node = unsafe { &*rem_n };
            if lookup.equals(node.value(), &mut have_dead) {
                bucket.release_assign_node_ptr(rem_slot, node.next());
                break;
            }
            rem_slot = node.next_slot();
            rem_n = node.next();
        }

        bucket.unlock();

        if rem_n.is_null() {
            return false;
        }

        // Publish the unlink before anyone touches the carcass.
        smr::write_synchronize();
        // SAFETY: unlinked above and drained by the barrier; ours to free.
        unsafe {
            delete_f((*rem_n).value());
            C::free_node(rem_n);
        }
        true
    }

    // ========================================================================
    //  Bucket-locked helpers
    // ========================================================================

    /// Take the bucket lock for `hash`, spinning fairly.
    ///
    /// Each attempt opens a critical section just long enough to resolve
    /// the bucket and trylock it; on failure the section is left before
    /// backing off, or a concurrent resize could never drain this thread.
    /// Once the lock lands the section is unnecessary: a locked bucket
    /// cannot be redirected out from under its holder.
    pub(crate) fn get_bucket_locked(&self, thread: ThreadId, hash: usize) -> &Bucket<C::Value> {
        let mut i: usize = 0;
        loop {
            {
                let _cs = ScopedCs::new(thread, self);
                let bucket = self.get_bucket(hash);
                if bucket.trylock() {
                    return bucket;
                }
            }
            i += 1;
            if i == SPINPAUSES_PER_YIELD {
                std::thread::yield_now();
                i = 0;
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Purge dead entries from a bucket the caller has locked via
    /// [`get_bucket_locked`](Self::get_bucket_locked). Unlocks the bucket,
    /// then destroys the victims behind a quiescence barrier.
    pub(crate) fn delete_in_bucket<L: Lookup<C::Value>>(
        &self,
        bucket: &Bucket<C::Value>,
        lookup: &L,
    ) {
        let ndel = Self::delete_check_nodes(bucket, BULK_DELETE_LIMIT, |value| {
            let mut is_dead = false;
            lookup.equals(value, &mut is_dead);
            is_dead
        });
        bucket.unlock();

        if ndel.is_empty() {
            return;
        }
        trace_log!(victims = ndel.len(), "purging dead entries from bucket");

        smr::write_synchronize();
        for node in ndel {
            // SAFETY: unlinked under the lock, drained by the barrier.
            unsafe { C::free_node(node) };
        }
    }

    /// Unlink up to `limit` nodes matching `eval_f` from a locked bucket.
    /// Returns the victims; the caller destroys them after a quiescence
    /// barrier.
    pub(crate) fn delete_check_nodes<E>(
        bucket: &Bucket<C::Value>,
        limit: usize,
        mut eval_f: E,
    ) -> Vec<*mut Node<C::Value>>
    where
        E: FnMut(&C::Value) -> bool,
    {
        debug_assert!(bucket.is_locked());
        let mut ndel: Vec<*mut Node<C::Value>> = Vec::new();

        let mut rem_slot = bucket.first_slot();
        let mut rem_n = bucket.first();
        while !rem_n.is_null() {
            // SAFETY: chain nodes stay valid under the bucket lock.
            let node = unsafe { &*rem_n };
            if eval_f(node.value()) {
                ndel.push(rem_n);
                bucket.release_assign_node_ptr(rem_slot, node.next());
                rem_n = node.next();
                if ndel.len() == limit {
                    break;
                }
            } else {
                rem_slot = node.next_slot();
                rem_n = node.next();
            }
        }
        ndel
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use crate::table::tests::{DEAD_MARK, KeyLookup, new_table};

    #[test]
    fn test_insert_then_get() {
        let cht = new_table();

        let mut inserted_seen = None;
        let ok = cht.insert(
            &KeyLookup(11),
            || 11,
            |inserted, v| inserted_seen = Some((inserted, *v)),
            None,
        );
        assert!(ok);
        assert_eq!(inserted_seen, Some((true, 11)));

        let mut got = None;
        assert!(cht.get(&KeyLookup(11), |v| got = Some(*v), None));
        assert_eq!(got, Some(11));
    }

    #[test]
    fn test_insert_duplicate_reports_survivor() {
        let cht = new_table();
        assert!(cht.insert(&KeyLookup(5), || 5, |_, _| {}, None));

        let mut cb = None;
        let ok = cht.insert(&KeyLookup(5), || 5, |inserted, v| cb = Some((inserted, *v)), None);
        assert!(!ok);
        assert_eq!(cb, Some((false, 5)));
    }

    #[test]
    fn test_remove_present_and_absent() {
        let cht = new_table();
        assert!(cht.insert(&KeyLookup(9), || 9, |_, _| {}, None));

        let mut deleted = None;
        assert!(cht.remove(&KeyLookup(9), |v| deleted = Some(*v)));
        assert_eq!(deleted, Some(9));

        // Gone now.
        assert!(!cht.get(&KeyLookup(9), |_| {}, None));
        assert!(!cht.remove(&KeyLookup(9), |_| {}));
    }

    #[test]
    fn test_remove_then_reinsert_finds_new_value() {
        let cht = new_table();
        assert!(cht.insert(&KeyLookup(3), || 3, |_, _| {}, None));
        assert!(cht.remove(&KeyLookup(3), |_| {}));
        assert!(cht.insert(&KeyLookup(3), || 3, |_, _| {}, None));

        let mut got = None;
        assert!(cht.get(&KeyLookup(3), |v| got = Some(*v), None));
        assert_eq!(got, Some(3));
    }

    #[test]
    fn test_insert_cleans_dead_entries_on_same_chain() {
        let cht = new_table();

        // A dead value and a live value that land in the same bucket
        // (identity hash, dead mark stripped for hashing). The dead one
        // must use the normal insert path; unsafe_insert refuses it.
        assert!(cht.insert(&KeyLookup(32 | DEAD_MARK), || 32 | DEAD_MARK, |_, _| {}, None));
        assert!(cht.unsafe_insert(64));

        // Inserting key 0 walks the chain (0, 32, 64 share bucket 0 in a
        // 32-bucket table), sees the dead entry, and purges it.
        assert!(cht.insert(&KeyLookup(0), || 0, |_, _| {}, None));

        // The dead entry no longer matches anything; the live ones stay.
        let mut got = None;
        assert!(cht.get(&KeyLookup(64), |v| got = Some(*v), None));
        assert_eq!(got, Some(64));
        assert!(cht.get(&KeyLookup(0), |_| {}, None));
        assert!(!cht.get(&KeyLookup(32), |_| {}, None));
    }

    #[test]
    fn test_remove_middle_of_chain() {
        let cht = new_table();
        // All map to bucket 0 of the 32-bucket table.
        for v in [0u64, 32, 64, 96] {
            assert!(cht.unsafe_insert(v));
        }

        assert!(cht.remove(&KeyLookup(64), |_| {}));

        for v in [0u64, 32, 96] {
            assert!(cht.get(&KeyLookup(v), |_| {}, None), "lost {v}");
        }
        assert!(!cht.get(&KeyLookup(64), |_| {}, None));
    }
}
