//! Chain nodes and the bucket header state machine.
//!
//! `Bucket` packs two state flags into the low bits of its atomic head
//! pointer, so the bucket is both a lock and a data structure: a reader's
//! single acquire load of the head observes the chain and the lock state at
//! once. Readers ignore the flag bits and never wait; writers CAS the flags.
//!
//! # Layout
//!
//! Bit 0: `LOCK` (a writer owns this bucket's chain)
//! Bit 1: `REDIRECT` (bucket retired; consult the new table)
//! Bits 2..: the first [`Node`] pointer, word-aligned so the low bits are free.
//!
//! # State machine
//!
//! ```text
//! clean ──trylock──► locked ──unlock──► clean
//!                      │
//!                  redirect
//!                      ▼
//!               locked+redirect   (terminal)
//! ```
//!
//! Once redirected a bucket is never unlocked: lookups that observe the
//! flag follow the table's redirect into the in-progress sibling table.

use std::marker::PhantomData;
use std::sync::atomic::AtomicUsize;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};

// ============================================================================
//  Bit Constants
// ============================================================================

/// Lock bit: a writer holds this bucket.
pub(crate) const STATE_LOCK_BIT: usize = 1 << 0;

/// Redirect bit: bucket retired, chain lives in the new table. Terminal.
pub(crate) const STATE_REDIRECT_BIT: usize = 1 << 1;

/// Both flag bits.
pub(crate) const STATE_MASK: usize = STATE_LOCK_BIT | STATE_REDIRECT_BIT;

/// Spin-pause attempts between yields when waiting on a bucket lock.
///
/// The loop is a fair pause-then-yield cycle. Exponential backoff would
/// starve bulk writers stuck behind a stream of single-key operations.
pub(crate) const SPINPAUSES_PER_YIELD: usize = 8192;

/// Debug pattern stored into retired bucket heads. Low two bits clear so it
/// survives the flag-preserving stores.
#[cfg(all(debug_assertions, target_pointer_width = "64"))]
pub(crate) const POISON_PTR: usize = 0xfbad_badb_adba_dbac;
#[cfg(all(debug_assertions, target_pointer_width = "32"))]
pub(crate) const POISON_PTR: usize = 0xffba_dbac;

/// Strip the flag bits from a raw head word.
#[inline]
pub(crate) fn clear_state<V>(raw: usize) -> *mut Node<V> {
    (raw & !STATE_MASK) as *mut Node<V>
}

/// The flag bits of a raw head word.
#[inline]
pub(crate) fn state_bits(raw: usize) -> usize {
    raw & STATE_MASK
}

// ============================================================================
//  Node
// ============================================================================

/// A singly-linked chain cell holding one value.
///
/// Exclusively owned by the chain it is linked into; destroyed only after a
/// quiescence barrier proves no reader still references it. The `next` link
/// is stored as a tagged word so interior links and bucket heads share the
/// flag-preserving store helpers (interior links always carry clear flags).
pub struct Node<V> {
    next: AtomicUsize,
    value: V,
}

impl<V> Node<V> {
    /// Create a detached node linking to `next`.
    pub(crate) fn new(value: V, next: *mut Self) -> Self {
        debug_assert_eq!(next as usize & STATE_MASK, 0);
        Self {
            next: AtomicUsize::new(next as usize),
            value,
        }
    }

    /// The stored value.
    #[inline]
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Successor in the chain (acquire).
    #[inline]
    pub(crate) fn next(&self) -> *mut Self {
        clear_state(self.next.load(READ_ORD))
    }

    /// The raw `next` slot, for splice-out and unzip rewiring.
    #[inline]
    pub(crate) fn next_slot(&self) -> &AtomicUsize {
        &self.next
    }

    /// Re-point a not-yet-published node. Used when a head CAS failed and
    /// the node is retried against a new chain head.
    #[inline]
    pub(crate) fn set_next(&self, next: *mut Self) {
        debug_assert_eq!(next as usize & STATE_MASK, 0);
        self.next.store(next as usize, RELAXED);
    }
}

// ============================================================================
//  Bucket
// ============================================================================

/// Head of one chain; also the unit of write-side locking.
pub(crate) struct Bucket<V> {
    first: AtomicUsize,
    _values: PhantomData<fn(V) -> V>,
}

impl<V> Bucket<V> {
    pub(crate) fn new() -> Self {
        Self {
            first: AtomicUsize::new(0),
            _values: PhantomData,
        }
    }

    // ========================================================================
    //  Head access
    // ========================================================================

    /// Head word including the flag bits (acquire).
    #[inline]
    pub(crate) fn first_raw(&self) -> usize {
        self.first.load(READ_ORD)
    }

    /// First node with the flag bits stripped (acquire).
    #[inline]
    pub(crate) fn first(&self) -> *mut Node<V> {
        clear_state(self.first_raw())
    }

    /// The head slot itself, usable wherever a `next` slot is.
    #[inline]
    pub(crate) fn first_slot(&self) -> &AtomicUsize {
        &self.first
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.first_raw() & STATE_LOCK_BIT != 0
    }

    #[inline]
    pub(crate) fn have_redirect(&self) -> bool {
        self.first_raw() & STATE_REDIRECT_BIT != 0
    }

    /// Seed this bucket from another bucket's raw head word, flags included.
    ///
    /// Only valid while this bucket is unpublished: grow and shrink copy a
    /// locked head into the sibling table before the redirect store makes
    /// it reachable, so the sibling starts locked.
    #[inline]
    pub(crate) fn store_raw(&self, raw: usize) {
        self.first.store(raw, RELAXED);
    }

    // ========================================================================
    //  Lock operations
    // ========================================================================

    /// Try to take the bucket lock. Fails if locked or redirected, or if the
    /// head moved under us.
    #[inline]
    pub(crate) fn trylock(&self) -> bool {
        if self.is_locked() {
            return false;
        }
        // Expect a clean head: a set redirect bit also fails the exchange.
        let expect = self.first() as usize;
        self.first
            .compare_exchange(expect, expect | STATE_LOCK_BIT, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Spin until the bucket lock is taken.
    pub(crate) fn lock(&self) {
        let mut i: usize = 0;
        while !self.trylock() {
            i += 1;
            if i == SPINPAUSES_PER_YIELD {
                // Yielding hands the CPU to another runnable thread when the
                // machine is saturated; the holder may be preempted.
                std::thread::yield_now();
                i = 0;
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Release the bucket lock.
    pub(crate) fn unlock(&self) {
        let raw = self.first.load(RELAXED);
        debug_assert!(raw & STATE_LOCK_BIT != 0, "unlock of unlocked bucket");
        debug_assert!(
            raw & STATE_REDIRECT_BIT == 0,
            "unlock of a bucket in terminal redirect state"
        );
        self.first.store(raw & !STATE_MASK, WRITE_ORD);
    }

    /// Retire the bucket: set the redirect flag, keeping the lock flag.
    /// Terminal; lookups arriving here follow into the new table.
    pub(crate) fn redirect(&self) {
        let raw = self.first.load(RELAXED);
        debug_assert!(raw & STATE_LOCK_BIT != 0, "redirect requires the bucket lock");
        self.first.store(raw | STATE_REDIRECT_BIT, WRITE_ORD);
    }

    // ========================================================================
    //  Chain publication
    // ========================================================================

    /// Lock-free insertion at head: publish `node` if the head is still
    /// `expect` and both flags are clear.
    #[inline]
    pub(crate) fn cas_first(&self, node: *mut Node<V>, expect: *mut Node<V>) -> bool {
        debug_assert_eq!(node as usize & STATE_MASK, 0);
        if self.is_locked() {
            return false;
        }
        self.first
            .compare_exchange(expect as usize, node as usize, CAS_SUCCESS, CAS_FAILURE)
            .is_ok()
    }

    /// Release-store `node` into `slot`, preserving whatever flag bits the
    /// slot currently carries. `slot` is either this bucket's head or a
    /// `next` link inside its chain; the bucket lock must be held.
    pub(crate) fn release_assign_node_ptr(&self, slot: &AtomicUsize, node: *mut Node<V>) {
        debug_assert!(self.is_locked(), "chain rewiring requires the bucket lock");
        debug_assert_eq!(node as usize & STATE_MASK, 0);
        let flags = state_bits(slot.load(RELAXED));
        slot.store(node as usize | flags, WRITE_ORD);
    }

    /// Walk to the end of the chain and attach `node` there. Used by shrink
    /// to append an odd sibling chain onto the merged bucket.
    pub(crate) fn release_assign_last_node_next(&self, node: *mut Node<V>) {
        debug_assert!(self.is_locked(), "chain rewiring requires the bucket lock");
        let mut slot = self.first_slot();
        loop {
            let cur = clear_state::<V>(slot.load(RELAXED));
            if cur.is_null() {
                break;
            }
            // SAFETY: cur is a live chain node; the bucket lock keeps the
            // chain from being unlinked or freed while we walk it.
            slot = unsafe { (*cur).next_slot() };
        }
        self.release_assign_node_ptr(slot, node);
    }
}

impl<V> std::fmt::Debug for Bucket<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raw = self.first.load(RELAXED);
        f.debug_struct("Bucket")
            .field("first", &clear_state::<V>(raw))
            .field("locked", &(raw & STATE_LOCK_BIT != 0))
            .field("redirect", &(raw & STATE_REDIRECT_BIT != 0))
            .finish()
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn boxed(value: u64, next: *mut Node<u64>) -> *mut Node<u64> {
        Box::into_raw(Box::new(Node::new(value, next)))
    }

    unsafe fn free(node: *mut Node<u64>) {
        // SAFETY: test-owned node created by `boxed`.
        unsafe { drop(Box::from_raw(node)) };
    }

    #[test]
    fn test_new_bucket_is_clean() {
        let b: Bucket<u64> = Bucket::new();
        assert!(b.first().is_null());
        assert!(!b.is_locked());
        assert!(!b.have_redirect());
    }

    #[test]
    fn test_trylock_and_unlock() {
        let b: Bucket<u64> = Bucket::new();
        assert!(b.trylock());
        assert!(b.is_locked());

        // Second trylock fails while held.
        assert!(!b.trylock());

        b.unlock();
        assert!(!b.is_locked());
        assert!(b.trylock());
        b.unlock();
    }

    #[test]
    fn test_cas_first_publishes_node() {
        let b: Bucket<u64> = Bucket::new();
        let node = boxed(7, ptr::null_mut());

        assert!(b.cas_first(node, ptr::null_mut()));
        assert_eq!(b.first(), node);

        // Stale expectation fails.
        let other = boxed(8, ptr::null_mut());
        assert!(!b.cas_first(other, ptr::null_mut()));

        unsafe {
            free(node);
            free(other);
        }
    }

    #[test]
    fn test_cas_first_fails_under_lock() {
        let b: Bucket<u64> = Bucket::new();
        assert!(b.trylock());

        let node = boxed(7, ptr::null_mut());
        assert!(!b.cas_first(node, ptr::null_mut()));

        b.unlock();
        unsafe { free(node) };
    }

    #[test]
    fn test_redirect_is_terminal_and_keeps_lock() {
        let b: Bucket<u64> = Bucket::new();
        assert!(b.trylock());
        b.redirect();

        assert!(b.is_locked());
        assert!(b.have_redirect());

        // A redirected bucket can never be relocked via trylock: the
        // expected clean head never matches.
        assert!(!b.trylock());
    }

    #[test]
    #[should_panic(expected = "unlock of unlocked bucket")]
    fn test_unlock_without_lock_panics() {
        let b: Bucket<u64> = Bucket::new();
        b.unlock();
    }

    #[test]
    #[should_panic(expected = "terminal redirect state")]
    fn test_unlock_after_redirect_panics() {
        let b: Bucket<u64> = Bucket::new();
        assert!(b.trylock());
        b.redirect();
        b.unlock();
    }

    #[test]
    fn test_release_assign_preserves_flags() {
        let b: Bucket<u64> = Bucket::new();
        let node = boxed(1, ptr::null_mut());

        assert!(b.trylock());
        b.release_assign_node_ptr(b.first_slot(), node);

        // Flags survived the store, pointer landed.
        assert!(b.is_locked());
        assert_eq!(b.first(), node);

        b.unlock();
        assert_eq!(b.first(), node);

        unsafe { free(node) };
    }

    #[test]
    fn test_release_assign_last_node_next_appends() {
        let b: Bucket<u64> = Bucket::new();
        let second = boxed(2, ptr::null_mut());
        let first = boxed(1, second);

        assert!(b.cas_first(first, ptr::null_mut()));
        assert!(b.trylock());

        let tail = boxed(3, ptr::null_mut());
        b.release_assign_last_node_next(tail);
        b.unlock();

        unsafe {
            assert_eq!((*first).next(), second);
            assert_eq!((*second).next(), tail);
            assert!((*tail).next().is_null());

            free(first);
            free(second);
            free(tail);
        }
    }

    #[test]
    fn test_node_set_next_relinks() {
        let a = boxed(1, ptr::null_mut());
        let b = boxed(2, ptr::null_mut());

        unsafe {
            (*a).set_next(b);
            assert_eq!((*a).next(), b);
            (*a).set_next(ptr::null_mut());
            assert!((*a).next().is_null());

            free(a);
            free(b);
        }
    }

    #[test]
    fn test_contended_lock_makes_progress() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::thread;

        let bucket: Arc<Bucket<u64>> = Arc::new(Bucket::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                let hits = Arc::clone(&hits);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        bucket.lock();
                        hits.fetch_add(1, Ordering::Relaxed);
                        bucket.unlock();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 4000);
    }
}
