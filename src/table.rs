//! A concurrent, resizable, open-chaining hash table.
//!
//! Readers traverse bucket chains without any per-bucket lock, protected by
//! the global-counter quiescence service in [`crate::smr`]. Writers take a
//! per-bucket spin lock packed into the bucket head word. Structural
//! changes (grow, shrink, bulk operations, table moves) serialize on a
//! global resize lock and rewire chains one pointer per quiescence barrier,
//! so a reader mid-chain can never be carried onto the wrong sibling.
//!
//! This module holds the table type, the backing array, the SMR scope, and
//! the read path. Writers live in `locked`, structural changes in
//! `resize`, whole-table operations in `bulk`.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, fence};

use parking_lot::RawMutex;
use parking_lot::lock_api::RawMutex as _;

use crate::bucket::{Bucket, Node};
use crate::config::{Lookup, TableConfig};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::smr::{self, ThreadId};

mod bulk;
mod locked;
mod resize;

// ============================================================================
//  Size constants
// ============================================================================

/// Largest supported table: 2^30 = 1G buckets.
pub const SIZE_BIG_LOG2: usize = 30;

/// Smallest supported table: 2^5 = 32 buckets.
pub const SIZE_SMALL_LOG2: usize = 5;

/// Nodes unlinked per bucket lock acquisition in bulk and lazy deletes.
pub(crate) const BULK_DELETE_LIMIT: usize = 256;

/// Default starting size: 2^10 = 1024 buckets.
pub const DEFAULT_START_SIZE_LOG2: usize = 10;

/// Default chain-length threshold above which lookups report a grow hint.
pub const DEFAULT_GROW_HINT: usize = 4;

// ============================================================================
//  InternalTable
// ============================================================================

/// Power-of-two bucket array with a precomputed index mask.
///
/// Immutable in shape after construction; only the buckets mutate. The
/// owning [`ConcurrentHashTable`] retires a whole table only after the
/// replacement is published and a global quiescence barrier has drained
/// every reader that could still hold it.
pub(crate) struct InternalTable<V> {
    log2_size: usize,
    size: usize,
    hash_mask: usize,
    buckets: Box<[Bucket<V>]>,
}

impl<V> InternalTable<V> {
    fn new(log2_size: usize) -> Box<Self> {
        assert!(
            (SIZE_SMALL_LOG2..=SIZE_BIG_LOG2).contains(&log2_size),
            "table size 2^{log2_size} out of bounds"
        );
        let size = 1usize << log2_size;
        let buckets = (0..size).map(|_| Bucket::new()).collect();
        Box::new(Self {
            log2_size,
            size,
            hash_mask: size - 1,
            buckets,
        })
    }

    #[inline]
    pub(crate) fn log2_size(&self) -> usize {
        self.log2_size
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Bucket index for `hash` in this table.
    #[inline]
    pub(crate) fn bucket_index(&self, hash: usize) -> usize {
        hash & self.hash_mask
    }

    #[inline]
    pub(crate) fn get_bucket(&self, index: usize) -> &Bucket<V> {
        &self.buckets[index]
    }

    /// Bucket for `hash`.
    #[inline]
    pub(crate) fn bucket_for(&self, hash: usize) -> &Bucket<V> {
        self.get_bucket(self.bucket_index(hash))
    }
}

// ============================================================================
//  ScopedCs
// ============================================================================

/// RAII read-side critical section over the quiescence service.
///
/// Every chain pointer loaded inside the scope stays dereferenceable until
/// the scope drops: unlinking writers cannot pass `write_synchronize`
/// while the scope is open.
///
/// Entering a scope also publishes the table version: if a bulk writer
/// flagged the current version as not-yet-observed, the flag is cleared so
/// the writer's next quiescence barrier is a real one.
pub(crate) struct ScopedCs<'a, C: TableConfig> {
    thread: ThreadId,
    cht: &'a ConcurrentHashTable<C>,
}

impl<'a, C: TableConfig> ScopedCs<'a, C> {
    pub(crate) fn new(thread: ThreadId, cht: &'a ConcurrentHashTable<C>) -> Self {
        smr::critical_section_begin(thread);
        // This version is observed now.
        if cht.invisible_epoch.load(READ_ORD) != 0 {
            cht.invisible_epoch.store(0, WRITE_ORD);
            fence(std::sync::atomic::Ordering::SeqCst);
        }
        Self { thread, cht }
    }
}

impl<C: TableConfig> Drop for ScopedCs<'_, C> {
    fn drop(&mut self) {
        smr::critical_section_end(self.thread);
    }
}

// ============================================================================
//  ConcurrentHashTable
// ============================================================================

/// Concurrent chained hash table with lock-free reads and incremental,
/// in-place resizing by powers of two.
///
/// # Concurrency
///
/// - Reads never block on table data and never touch a lock.
/// - Single-key writes spin on the owning bucket's lock or head CAS.
/// - Grow, shrink, scans, bulk deletes, and table moves serialize on an
///   internal resize lock; they do not stop single-key traffic on buckets
///   they have not yet reached.
///
/// # Callbacks
///
/// User callbacks run while an internal lock or read-side critical section
/// is held. They must not re-enter the table and must not block
/// indefinitely.
pub struct ConcurrentHashTable<C: TableConfig> {
    /// Currently published table.
    table: AtomicPtr<InternalTable<C::Value>>,

    /// Non-null only while a resize is rewiring buckets.
    new_table: AtomicPtr<InternalTable<C::Value>>,

    log2_start_size: usize,
    log2_size_limit: usize,

    /// Chain-walk length above which lookups report a grow hint.
    grow_hint: usize,

    size_limit_reached: AtomicBool,

    /// Serializes structural changes. Held across whole grows/shrinks, so
    /// ownership is tracked in a separate word the bulk helpers can assert.
    resize_lock: RawMutex,

    /// [`ThreadId`] of the resize-lock holder, 0 when free.
    resize_lock_owner: AtomicUsize,

    /// Non-zero while the current version has not been observed by any
    /// reader since the last quiescence barrier; holds the bulk writer's
    /// [`ThreadId`]. Lets back-to-back barriers collapse into one.
    invisible_epoch: AtomicUsize,

    _config: PhantomData<C>,
}

// The table hands out `&V` across threads and moves `V` between them.
unsafe impl<C: TableConfig> Send for ConcurrentHashTable<C> where C::Value: Send {}
unsafe impl<C: TableConfig> Sync for ConcurrentHashTable<C> where C::Value: Send + Sync {}

impl<C: TableConfig> ConcurrentHashTable<C> {
    /// Create a table with 2^`log2_size` buckets, growable to
    /// 2^`log2_size_limit`, reporting grow hints for chains longer than
    /// `grow_hint`.
    ///
    /// # Panics
    ///
    /// Panics if the sizes are outside
    /// [`SIZE_SMALL_LOG2`]..=[`SIZE_BIG_LOG2`] or the limit is below the
    /// start size.
    #[must_use]
    pub fn new(log2_size: usize, log2_size_limit: usize, grow_hint: usize) -> Self {
        assert!(log2_size_limit >= log2_size, "size limit below start size");
        assert!(
            log2_size_limit <= SIZE_BIG_LOG2,
            "size limit above 2^{SIZE_BIG_LOG2}"
        );
        let table = Box::into_raw(InternalTable::<C::Value>::new(log2_size));
        Self {
            table: AtomicPtr::new(table),
            new_table: AtomicPtr::new(ptr::null_mut()),
            log2_start_size: log2_size,
            log2_size_limit,
            grow_hint,
            size_limit_reached: AtomicBool::new(log2_size == log2_size_limit),
            resize_lock: RawMutex::INIT,
            resize_lock_owner: AtomicUsize::new(0),
            invisible_epoch: AtomicUsize::new(0),
            _config: PhantomData,
        }
    }

    /// A table with the default sizing
    /// ([`DEFAULT_START_SIZE_LOG2`], [`SIZE_BIG_LOG2`],
    /// [`DEFAULT_GROW_HINT`]).
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_START_SIZE_LOG2, SIZE_BIG_LOG2, DEFAULT_GROW_HINT)
    }

    // ========================================================================
    //  Table access
    // ========================================================================

    /// The published table.
    ///
    /// Dereferencing the result requires being inside a [`ScopedCs`], or
    /// holding the resize lock, or otherwise excluding concurrent resizes;
    /// the pointed-to table is only retired behind a quiescence barrier.
    #[inline]
    fn get_table(&self) -> &InternalTable<C::Value> {
        // SAFETY: the published table is never freed before a replacement
        // is published plus a global write_synchronize; all callers hold a
        // critical section or the resize lock across the use.
        unsafe { &*self.table.load(READ_ORD) }
    }

    /// The in-progress sibling table. Only meaningful after observing a
    /// redirect flag (which happens-before the sibling's publication).
    #[inline]
    fn get_new_table(&self) -> &InternalTable<C::Value> {
        let raw = self.new_table.load(READ_ORD);
        debug_assert!(!raw.is_null(), "redirect seen without a sibling table");
        // SAFETY: non-null while any bucket still carries a redirect flag;
        // same reclamation discipline as `get_table`.
        unsafe { &*raw }
    }

    // ========================================================================
    //  Read path
    // ========================================================================

    /// Bucket for `hash`, following at most one redirect into the sibling
    /// table. Caller must be inside a [`ScopedCs`] (or hold the bucket
    /// locked once found).
    pub(crate) fn get_bucket(&self, hash: usize) -> &Bucket<C::Value> {
        let table = self.get_table();
        let bucket = table.bucket_for(hash);
        if bucket.have_redirect() {
            // Bucket retired mid-resize; the chain lives in the sibling.
            self.get_new_table().bucket_for(hash)
        } else {
            bucket
        }
    }

    /// First chain node matching `lookup`.
    ///
    /// Records whether any dead value was passed over (a lazy-cleanup hint
    /// for the insert path) and how many nodes were inspected (the grow
    /// hint). Caller must be inside a [`ScopedCs`].
    pub(crate) fn get_node<'b, L: Lookup<C::Value>>(
        &self,
        bucket: &'b Bucket<C::Value>,
        lookup: &L,
        have_dead: &mut bool,
        mut loops: Option<&mut usize>,
    ) -> Option<&'b Node<C::Value>> {
        let mut loop_count: usize = 0;
        let mut node = bucket.first();
        let found = loop {
            if node.is_null() {
                break None;
            }
            // SAFETY: chain nodes are freed only behind a quiescence
            // barrier; the caller's critical section keeps them alive.
            let node_ref = unsafe { &*node };
            let mut is_dead = false;
            loop_count += 1;
            if lookup.equals(node_ref.value(), &mut is_dead) {
                break Some(node_ref);
            }
            if is_dead {
                *have_dead = true;
            }
            node = node_ref.next();
        };
        if let Some(loops) = loops.as_mut() {
            **loops = loop_count;
        }
        found
    }

    /// Lookup inside an already-open critical section.
    pub(crate) fn internal_get<L: Lookup<C::Value>>(
        &self,
        lookup: &L,
        grow_hint: Option<&mut bool>,
    ) -> Option<&C::Value> {
        let mut have_dead = false;
        let mut loops: usize = 0;

        let bucket = self.get_bucket(lookup.hash());
        let node = self.get_node(bucket, lookup, &mut have_dead, Some(&mut loops));
        if let Some(grow_hint) = grow_hint {
            *grow_hint = loops > self.grow_hint;
        }
        node.map(|n| n.value())
    }

    // ========================================================================
    //  Public reads
    // ========================================================================

    /// Look up `lookup`; invoke `found` on the value if present.
    ///
    /// Never blocks. `grow_hint`, when supplied, reports whether the chain
    /// walk exceeded the configured threshold.
    pub fn get<L, F>(&self, lookup: &L, found: F, grow_hint: Option<&mut bool>) -> bool
    where
        L: Lookup<C::Value>,
        F: FnOnce(&C::Value),
    {
        let _cs = ScopedCs::new(ThreadId::current(), self);
        match self.internal_get(lookup, grow_hint) {
            Some(value) => {
                found(value);
                true
            }
            None => false,
        }
    }

    /// Look up `lookup` and return a clone of the value, or
    /// [`TableConfig::notfound`] if absent.
    pub fn get_copy<L>(&self, lookup: &L, grow_hint: Option<&mut bool>) -> C::Value
    where
        L: Lookup<C::Value>,
        C::Value: Clone,
    {
        let _cs = ScopedCs::new(ThreadId::current(), self);
        match self.internal_get(lookup, grow_hint) {
            Some(value) => value.clone(),
            None => C::notfound(),
        }
    }

    /// Current table size as a log2 bucket count.
    pub fn get_size_log2(&self) -> usize {
        let _cs = ScopedCs::new(ThreadId::current(), self);
        self.get_table().log2_size()
    }

    /// Open a handle performing many lookups in one read-side critical
    /// section.
    #[must_use]
    pub fn multi_get_handle(&self) -> MultiGetHandle<'_, C> {
        MultiGetHandle {
            cs: ScopedCs::new(ThreadId::current(), self),
        }
    }

    // ========================================================================
    //  Initial load
    // ========================================================================

    /// Insert without any concurrency protection. Intended for initial
    /// loading before the table is shared; refuses dead values.
    ///
    /// # Panics
    ///
    /// Panics if the target bucket is contended (locked, redirected, or
    /// concurrently modified), a sign the table was already shared.
    pub fn unsafe_insert(&self, value: C::Value) -> bool {
        let mut dead_hash = false;
        let hash = C::hash(&value, &mut dead_hash);
        if dead_hash {
            return false;
        }
        let table = self.get_table();
        let bucket = table.bucket_for(hash);
        assert!(
            !bucket.have_redirect() && !bucket.is_locked(),
            "unsafe_insert on a contended table"
        );
        let first = bucket.first();
        let node = C::allocate_node(Node::new(value, first));
        let published = bucket.cas_first(node, first);
        assert!(published, "unsafe_insert raced with a concurrent writer");
        true
    }

    // ========================================================================
    //  Teardown
    // ========================================================================

    /// Destroy every chain node. Exclusive access via `&mut self`.
    fn free_nodes(&mut self) {
        let table = self.get_table();
        for index in 0..table.size() {
            let mut node = table.get_bucket(index).first();
            while !node.is_null() {
                // SAFETY: exclusive access, nodes are live chain members
                // allocated through `C::allocate_node`.
                let next = unsafe { (*node).next() };
                unsafe { C::free_node(node) };
                node = next;
            }
        }
    }
}

impl<C: TableConfig> Drop for ConcurrentHashTable<C> {
    fn drop(&mut self) {
        debug_assert!(
            self.new_table.load(RELAXED).is_null(),
            "dropped mid-resize"
        );
        self.free_nodes();
        let table = self.table.load(RELAXED);
        // SAFETY: allocated via Box::into_raw at construction or resize
        // publication; exclusive access here.
        unsafe { drop(Box::from_raw(table)) };
    }
}

impl<C: TableConfig> fmt::Debug for ConcurrentHashTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentHashTable")
            .field("log2_start_size", &self.log2_start_size)
            .field("log2_size_limit", &self.log2_size_limit)
            .field("grow_hint", &self.grow_hint)
            .field("size_limit_reached", &self.size_limit_reached.load(RELAXED))
            .finish_non_exhaustive()
    }
}

// ============================================================================
//  MultiGetHandle
// ============================================================================

/// RAII scope batching many lookups into one read-side critical section.
///
/// Holding the handle holds readers' quiescence state, which delays node
/// reclamation and bulk writers; keep the batch short.
pub struct MultiGetHandle<'a, C: TableConfig> {
    cs: ScopedCs<'a, C>,
}

impl<C: TableConfig> MultiGetHandle<'_, C> {
    /// Look up `lookup` without re-entering the critical section.
    ///
    /// The returned reference is valid while the handle lives.
    pub fn get<'h, L: Lookup<C::Value>>(
        &'h self,
        lookup: &L,
        grow_hint: Option<&mut bool>,
    ) -> Option<&'h C::Value> {
        self.cs.cht.internal_get(lookup, grow_hint)
    }
}

// ============================================================================
//  Tests
// ============================================================================
