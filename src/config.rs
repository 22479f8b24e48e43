//! Per-instantiation configuration and lookup predicates.
//!
//! The table stores opaque values; the configuration supplies the hash,
//! the not-found sentinel, and optional node-allocation hooks. Lookups
//! carry a hash plus an equality predicate, so a caller can probe with a
//! borrowed key without materializing a value.
//!
//! Both traits use static dispatch for zero-cost abstraction.

use crate::bucket::Node;

/// Static configuration of a [`ConcurrentHashTable`](crate::ConcurrentHashTable).
///
/// # Dead values
///
/// A value may become *dead*: its hash is no longer meaningful (for
/// example, the referent it hashes by has been reclaimed elsewhere).
/// [`hash`](Self::hash) reports this through `is_dead`; dead entries are
/// dropped lazily by the insert path's cleanup, by bucket unzip during
/// grow, and by table moves. Deadness must be sticky: once dead, a value
/// stays dead.
///
/// # Node hooks
///
/// `allocate_node`/`free_node` default to `Box`. Override both together
/// when nodes must come from a custom allocator; a node is always freed by
/// the same configuration that allocated it.
pub trait TableConfig: Sized {
    /// The stored value type.
    type Value;

    /// Enables chain read-ahead during bulk-delete scans.
    ///
    /// Off by default: for inline values the payload shares the node's
    /// cache line and read-ahead only pollutes the cache. Configurations
    /// whose value points at a large out-of-line payload set this and
    /// override [`prefetch_payload`](Self::prefetch_payload).
    const PREFETCH_VALUES: bool = false;

    /// Hash of `value`. Sets `*is_dead` when the value's hash is no longer
    /// meaningful. Must be stable for live values.
    fn hash(value: &Self::Value, is_dead: &mut bool) -> usize;

    /// Sentinel returned by copy-out lookups that find nothing. Must be
    /// distinguishable from every real value.
    fn notfound() -> Self::Value;

    /// Issue a read prefetch for the payload behind `value`.
    ///
    /// Only called when [`PREFETCH_VALUES`](Self::PREFETCH_VALUES) is set.
    /// Implementations forward the payload pointer to
    /// [`prefetch_read`](crate::prefetch::prefetch_read).
    #[inline]
    fn prefetch_payload(_value: &Self::Value) {}

    /// Move a detached node to the heap and return a stable raw pointer.
    #[must_use]
    fn allocate_node(node: Node<Self::Value>) -> *mut Node<Self::Value> {
        Box::into_raw(Box::new(node))
    }

    /// Destroy a node previously returned by
    /// [`allocate_node`](Self::allocate_node).
    ///
    /// # Safety
    ///
    /// - `node` must have been allocated by this configuration.
    /// - `node` must be unlinked, and a quiescence barrier must have
    ///   completed since the unlink (no reader may still reference it).
    /// - Must be called at most once per node.
    unsafe fn free_node(node: *mut Node<Self::Value>) {
        // SAFETY: Caller guarantees the node came from `allocate_node`'s
        // `Box::into_raw` and is unreachable.
        unsafe { drop(Box::from_raw(node)) };
    }
}

/// A probe into the table: a hash plus an equality predicate over stored
/// values.
///
/// `hash()` must be consistent with [`TableConfig::hash`] for any value the
/// probe intends to match, or the probe will land in the wrong bucket.
pub trait Lookup<V> {
    /// Bucket-selection hash of the sought value.
    fn hash(&self) -> usize;

    /// Whether `value` is the sought value. Sets `*is_dead` when `value`
    /// is dead; the table uses that as a lazy-cleanup hint and never treats
    /// a dead value as a match target.
    fn equals(&self, value: &V, is_dead: &mut bool) -> bool;
}
