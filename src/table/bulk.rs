//! Whole-table operations: scans, bulk deletes, node moves, and the
//! chain-length statistics report.
//!
//! Every operation here owns the resize lock for its duration: the table
//! shape is stable, no sibling table exists, and per-bucket work can use
//! short read-side critical sections (one per bucket, not one for the
//! whole table) so single-bucket writers keep making progress and the
//! quiescence service is never starved by a long-lived reader.

use std::fmt;
use std::ptr;

use crate::bucket::{Bucket, Node};
use crate::config::TableConfig;
use crate::ordering::RELAXED;
use crate::prefetch::prefetch_read;
use crate::smr::{self, ThreadId};
use crate::tracing_helpers::{debug_log, warn_log};

use super::{BULK_DELETE_LIMIT, ConcurrentHashTable, ScopedCs};

// ============================================================================
//  Chain-length summary
// ============================================================================

/// Running summary of per-bucket chain lengths for the statistics report.
#[derive(Debug, Default)]
struct ChainLengthSummary {
    num: f64,
    sum: f64,
    sum_of_squares: f64,
    maximum: f64,
}

impl ChainLengthSummary {
    fn add(&mut self, value: f64) {
        self.num += 1.0;
        self.sum += value;
        self.sum_of_squares += value * value;
        if value > self.maximum {
            self.maximum = value;
        }
    }

    fn avg(&self) -> f64 {
        if self.num > 0.0 { self.sum / self.num } else { 0.0 }
    }

    fn variance(&self) -> f64 {
        if self.num > 0.0 {
            let avg = self.avg();
            self.sum_of_squares / self.num - avg * avg
        } else {
            0.0
        }
    }

    fn sd(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl<C: TableConfig> ConcurrentHashTable<C> {
    // ========================================================================
    //  Scan
    // ========================================================================

    /// Visit every value in `bucket`'s chain; `false` from the visitor
    /// stops the walk. Caller must hold a critical section.
    fn visit_nodes<F>(bucket: &Bucket<C::Value>, visitor_f: &mut F) -> bool
    where
        F: FnMut(&C::Value) -> bool,
    {
        let mut current = bucket.first();
        while !current.is_null() {
            // SAFETY: the caller's critical section keeps chain nodes
            // alive across the walk.
            let node = unsafe { &*current };
            if !visitor_f(node.value()) {
                return false;
            }
            current = node.next();
        }
        true
    }

    /// Walk the whole table under the already-held resize lock.
    fn do_scan_locked<F>(&self, thread: ThreadId, scan_f: &mut F)
    where
        F: FnMut(&C::Value) -> bool,
    {
        debug_assert_eq!(
            self.resize_lock_owner.load(RELAXED),
            thread.as_raw(),
            "scan without the resize lock"
        );
        // One critical section over the entire loop would block node
        // reclamation for a long time; one per bucket lets concurrent
        // removers finish.
        let table = self.get_table();
        for bucket_index in 0..table.size() {
            let _cs = ScopedCs::new(thread, self);
            if !Self::visit_nodes(table.get_bucket(bucket_index), scan_f) {
                break;
            }
        }
    }

    /// Visit every value in the table, stopping early when `scan_f`
    /// returns `false`. Fails fast (returns `false`) when a structural
    /// change is in flight.
    #[must_use]
    pub fn try_scan<F>(&self, mut scan_f: F) -> bool
    where
        F: FnMut(&C::Value) -> bool,
    {
        let thread = ThreadId::current();
        if !self.try_resize_lock(thread) {
            return false;
        }
        self.do_scan_locked(thread, &mut scan_f);
        self.unlock_resize_lock(thread);
        true
    }

    /// Visit every value in the table, blocking behind any in-flight
    /// structural change.
    pub fn scan<F>(&self, mut scan_f: F)
    where
        F: FnMut(&C::Value) -> bool,
    {
        let thread = ThreadId::current();
        self.lock_resize_lock(thread);
        self.do_scan_locked(thread, &mut scan_f);
        self.unlock_resize_lock(thread);
    }

    // ========================================================================
    //  Bulk delete
    // ========================================================================

    /// Whether `bucket` chains any value matching `eval_f`, without taking
    /// the bucket lock.
    ///
    /// When the configuration sets [`TableConfig::PREFETCH_VALUES`], the
    /// walk reads ahead through `prefetch_bucket`'s chain and the current
    /// chain's successors to hide payload latency while the predicate
    /// runs; otherwise it is a plain walk.
    fn have_deletable<E>(
        bucket: &Bucket<C::Value>,
        eval_f: &mut E,
        prefetch_bucket: Option<&Bucket<C::Value>>,
    ) -> bool
    where
        E: FnMut(&C::Value) -> bool,
    {
        let mut pref = if C::PREFETCH_VALUES {
            prefetch_bucket.map_or(ptr::null_mut(), Bucket::first)
        } else {
            ptr::null_mut()
        };
        let mut next = bucket.first();
        while !next.is_null() {
            // SAFETY: caller holds a critical section; chain nodes stay
            // alive across the walk.
            let node = unsafe { &*next };
            if C::PREFETCH_VALUES && !pref.is_null() {
                let pref_node = unsafe { &*pref };
                C::prefetch_payload(pref_node.value());
                pref = pref_node.next();
            }
            let following = node.next();
            if C::PREFETCH_VALUES && !following.is_null() {
                prefetch_read(following);
                // SAFETY: as above.
                C::prefetch_payload(unsafe { (*following).value() });
            }
            if eval_f(node.value()) {
                return true;
            }
            next = following;
        }
        false
    }

    /// Delete every value matching `eval_f` in buckets `[start, stop)`,
    /// invoking `del_f` on each before its node is destroyed. Requires the
    /// resize lock: held by this thread (`is_mt == false`) or by a
    /// coordinator fanning ranges out to workers (`is_mt == true`).
    pub(crate) fn do_bulk_delete_locked_for<E, D>(
        &self,
        thread: ThreadId,
        start_idx: usize,
        stop_idx: usize,
        mut eval_f: E,
        mut del_f: D,
        is_mt: bool,
    ) where
        E: FnMut(&C::Value) -> bool,
        D: FnMut(&C::Value),
    {
        debug_assert!(
            (is_mt && self.resize_lock_owner.load(RELAXED) != 0)
                || (!is_mt && self.resize_lock_owner.load(RELAXED) == thread.as_raw()),
            "bulk delete without the resize lock"
        );
        let table = self.get_table();
        assert!(start_idx < stop_idx);
        assert!(stop_idx <= table.size());

        // Manual critical section, not a ScopedCs: the scope would clear
        // the invisible epoch, which only the resize-lock owner may use,
        // and we are that owner. Left before every bucket lock so the
        // buckets' earlier readers can drain.
        smr::critical_section_begin(thread);
        for bucket_index in start_idx..stop_idx {
            let bucket = table.get_bucket(bucket_index);
            let prefetch_bucket = if bucket_index + 1 < stop_idx {
                Some(table.get_bucket(bucket_index + 1))
            } else {
                None
            };

            if !Self::have_deletable(bucket, &mut eval_f, prefetch_bucket) {
                // Nothing to remove in this bucket.
                continue;
            }

            smr::critical_section_end(thread);
            // The bucket cannot be retired while we hold the resize lock,
            // so it is safe to touch without a critical section.
            bucket.lock();
            let ndel = Self::delete_check_nodes(bucket, BULK_DELETE_LIMIT, &mut eval_f);
            bucket.unlock();

            if is_mt {
                smr::write_synchronize();
            } else {
                self.write_synchronize_on_visible_epoch(thread);
            }
            debug_log!(bucket_index, victims = ndel.len(), "bulk delete round");
            for node in ndel {
                // SAFETY: unlinked under the bucket lock and drained by
                // the barrier above.
                unsafe {
                    del_f((*node).value());
                    C::free_node(node);
                }
            }
            smr::critical_section_begin(thread);
        }
        smr::critical_section_end(thread);
    }

    fn do_bulk_delete_locked<E, D>(&self, thread: ThreadId, eval_f: E, del_f: D)
    where
        E: FnMut(&C::Value) -> bool,
        D: FnMut(&C::Value),
    {
        // Table shape is stable under the resize lock.
        let size = self.get_table().size();
        self.do_bulk_delete_locked_for(thread, 0, size, eval_f, del_f, false);
    }

    /// Delete every value matching `eval_f`, invoking `del_f` on each
    /// before destruction. Fails fast when a structural change is in
    /// flight.
    #[must_use]
    pub fn try_bulk_delete<E, D>(&self, eval_f: E, del_f: D) -> bool
    where
        E: FnMut(&C::Value) -> bool,
        D: FnMut(&C::Value),
    {
        let thread = ThreadId::current();
        if !self.try_resize_lock(thread) {
            return false;
        }
        self.do_bulk_delete_locked(thread, eval_f, del_f);
        self.unlock_resize_lock(thread);
        true
    }

    /// Delete every value matching `eval_f`, blocking behind any in-flight
    /// structural change.
    pub fn bulk_delete<E, D>(&self, eval_f: E, del_f: D)
    where
        E: FnMut(&C::Value) -> bool,
        D: FnMut(&C::Value),
    {
        let thread = ThreadId::current();
        self.lock_resize_lock(thread);
        self.do_bulk_delete_locked(thread, eval_f, del_f);
        self.unlock_resize_lock(thread);
    }

    // ========================================================================
    //  Table move
    // ========================================================================

    /// Drain every node into `to_cht`, dropping dead-hash nodes.
    ///
    /// Both tables must be uncontended for the duration: the source is
    /// pinned by its resize lock and asserted unlocked/unredirected per
    /// bucket, the destination belongs to the caller. Fails fast when the
    /// source resize lock is taken.
    #[must_use]
    pub fn try_move_nodes_to(&self, to_cht: &Self) -> bool {
        let thread = ThreadId::current();
        if !self.try_resize_lock(thread) {
            return false;
        }
        debug_assert!(self.new_table.load(RELAXED).is_null());

        let mut dead: Vec<*mut Node<C::Value>> = Vec::new();
        let table = self.get_table();
        for bucket_index in 0..table.size() {
            let bucket = table.get_bucket(bucket_index);
            debug_assert!(
                !bucket.have_redirect() && !bucket.is_locked(),
                "table move on a contended source"
            );
            loop {
                let move_node = bucket.first();
                if move_node.is_null() {
                    break;
                }
                // SAFETY: source is uncontended by contract; the node
                // stays ours from the successful CAS below onward.
                let node = unsafe { &*move_node };
                let detached = bucket.cas_first(node.next(), move_node);
                assert!(detached, "uncontended source CAS must succeed");

                let mut dead_hash = false;
                let hash = C::hash(node.value(), &mut dead_hash);
                if dead_hash {
                    dead.push(move_node);
                    continue;
                }

                let insert_bucket = to_cht.get_bucket(hash);
                debug_assert!(
                    !insert_bucket.have_redirect() && !insert_bucket.is_locked(),
                    "table move into a contended destination"
                );
                let first = insert_bucket.first();
                node.set_next(first);
                let published = insert_bucket.cas_first(move_node, first);
                assert!(published, "uncontended destination CAS must succeed");
            }
        }

        if !dead.is_empty() {
            // Readers may still be walking the drained chains.
            smr::write_synchronize();
            for node in dead {
                // SAFETY: detached above and drained by the barrier.
                unsafe { C::free_node(node) };
            }
        }

        self.unlock_resize_lock(thread);
        true
    }

    // ========================================================================
    //  Statistics
    // ========================================================================

    /// Write a chain-length and footprint report to `out`.
    ///
    /// `value_size_f` reports the out-of-line bytes owned by a value.
    /// Buckets observed locked or redirected are skipped. Prints an
    /// unavailability note instead when a structural change is in flight.
    pub fn statistics_to<VS, W>(
        &self,
        value_size_f: VS,
        out: &mut W,
        table_name: &str,
    ) -> fmt::Result
    where
        VS: Fn(&C::Value) -> usize,
        W: fmt::Write,
    {
        let thread = ThreadId::current();
        let mut summary = ChainLengthSummary::default();
        let mut literal_bytes: usize = 0;

        if !self.try_resize_lock(thread) {
            warn_log!(table_name, "statistics skipped, structural change in flight");
            return writeln!(out, "statistics unavailable at this moment");
        }

        let table = self.get_table();
        for bucket_index in 0..table.size() {
            let _cs = ScopedCs::new(thread, self);
            let bucket = table.get_bucket(bucket_index);
            if bucket.have_redirect() || bucket.is_locked() {
                continue;
            }
            let mut count: usize = 0;
            let mut current = bucket.first();
            while !current.is_null() {
                // SAFETY: per-bucket critical section keeps the chain
                // alive.
                let node = unsafe { &*current };
                count += 1;
                literal_bytes += value_size_f(node.value());
                current = node.next();
            }
            summary.add(count as f64);
        }

        // Everything below writes to a caller-supplied sink whose errors
        // propagate; release the lock first so a failing sink cannot leave
        // it held forever.
        self.unlock_resize_lock(thread);

        let num_buckets = summary.num as usize;
        let num_entries = summary.sum as usize;

        let bucket_bytes = num_buckets * size_of::<Bucket<C::Value>>();
        let entry_bytes = num_entries * size_of::<Node<C::Value>>();
        let total_bytes = literal_bytes + bucket_bytes + entry_bytes;

        let bucket_size = if num_buckets == 0 { 0 } else { bucket_bytes / num_buckets };
        let entry_size = if num_entries == 0 { 0 } else { entry_bytes / num_entries };

        writeln!(out, "{table_name} statistics:")?;
        writeln!(
            out,
            "Number of buckets       : {num_buckets:9} = {bucket_bytes:9} bytes, each {bucket_size}"
        )?;
        writeln!(
            out,
            "Number of entries       : {num_entries:9} = {entry_bytes:9} bytes, each {entry_size}"
        )?;
        if literal_bytes != 0 {
            let literal_avg = if num_entries == 0 {
                0.0
            } else {
                literal_bytes as f64 / num_entries as f64
            };
            writeln!(
                out,
                "Number of literals      : {num_entries:9} = {literal_bytes:9} bytes, avg {literal_avg:7.3}"
            )?;
        }
        writeln!(out, "Total footprint         : {:9} = {total_bytes:9} bytes", "")?;
        writeln!(out, "Average bucket size     : {:9.3}", summary.avg())?;
        writeln!(out, "Variance of bucket size : {:9.3}", summary.variance())?;
        writeln!(out, "Std. dev. of bucket size: {:9.3}", summary.sd())?;
        writeln!(out, "Maximum bucket size     : {:9}", summary.maximum as usize)
    }
}

// ============================================================================
//  Tests
// ============================================================================
