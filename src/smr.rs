//! Global-counter quiescence service for safe memory reclamation.
//!
//! Readers wrap chain traversals in a critical section; writers that have
//! unlinked a node call [`write_synchronize`] and only then free it. The
//! service guarantees that every thread inside a critical section at the
//! time of the call has left it before `write_synchronize` returns, so no
//! reader can still hold a reference to the unlinked node.
//!
//! # Design
//!
//! A process-global epoch counter (always even) plus a fixed array of
//! cache-padded per-thread slots. On entry a reader tags its slot with the
//! current epoch and an active bit; on exit it clears the slot. A writer
//! bumps the epoch and then waits, per slot, until the slot is inactive or
//! was entered at (or after) the bumped epoch.
//!
//! Critical sections do not nest. The table never needs nesting and the
//! single-word slot encoding depends on it; entry is debug-asserted.
//!
//! # Concurrency Model
//!
//! 1. Readers: `critical_section_begin()`, traverse, `critical_section_end()`.
//! 2. Writers: unlink under a lock, `write_synchronize()`, then free.
//!
//! `write_synchronize` is safe to call from several threads concurrently:
//! the wait condition is "slot epoch at or past my bump", so a reader that
//! re-entered against a newer epoch never stalls an older writer.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};

use crossbeam_utils::CachePadded;

// ============================================================================
//  Constants
// ============================================================================

/// Maximum number of threads that may touch the service concurrently.
/// Slots are recycled when a thread exits.
const MAX_SLOTS: usize = 512;

/// Low bit of a slot value: the owning thread is inside a critical section.
const SLOT_ACTIVE: usize = 1;

/// Epoch step. Keeps epoch values even so the active bit is never clobbered.
const EPOCH_INCREMENT: usize = 2;

/// Slot value when the owning thread is outside any critical section.
const SLOT_INACTIVE: usize = 0;

/// Spin-pause attempts between yields while waiting out a reader.
const SPINS_PER_YIELD: usize = 512;

// ============================================================================
//  Global state
// ============================================================================

struct Slot {
    /// Epoch-at-entry | [`SLOT_ACTIVE`], or [`SLOT_INACTIVE`].
    state: CachePadded<AtomicUsize>,

    /// Slot ownership flag, claimed with a CAS on first use per thread.
    claimed: AtomicBool,
}

#[allow(clippy::declare_interior_mutable_const)]
const SLOT_INIT: Slot = Slot {
    state: CachePadded::new(AtomicUsize::new(SLOT_INACTIVE)),
    claimed: AtomicBool::new(false),
};

/// Global epoch. Even, starts past zero so slot values are never ambiguous.
static EPOCH: AtomicUsize = AtomicUsize::new(EPOCH_INCREMENT);

static SLOTS: [Slot; MAX_SLOTS] = [SLOT_INIT; MAX_SLOTS];

// ============================================================================
//  Thread identity
// ============================================================================

/// Identity of a thread registered with the quiescence service.
///
/// Encodes the slot index plus one, so zero is free to mean "no thread" in
/// atomic owner words (the resize lock owner and the invisible epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId(NonZeroUsize);

impl ThreadId {
    /// The calling thread's identity, claiming a slot on first use.
    ///
    /// # Panics
    ///
    /// Panics if more threads than the service has slots are alive and
    /// registered at once.
    #[must_use]
    pub fn current() -> Self {
        SLOT_TOKEN.with(|token| Self(token.id))
    }

    /// Raw representation for storage in an `AtomicUsize`. Never zero, so
    /// zero is free to mean "no thread".
    #[inline]
    #[must_use]
    pub(crate) fn as_raw(self) -> usize {
        self.0.get()
    }

    #[inline]
    fn slot(self) -> &'static Slot {
        // Index is in range by construction: tokens only hand out claimed
        // slot indices.
        &SLOTS[self.0.get() - 1]
    }
}

struct SlotToken {
    id: NonZeroUsize,
}

impl SlotToken {
    fn claim() -> Self {
        for (index, slot) in SLOTS.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug_assert_eq!(slot.state.load(Ordering::Relaxed), SLOT_INACTIVE);

                // index + 1 is nonzero for all indices.
                let id = NonZeroUsize::new(index + 1).unwrap();
                return Self { id };
            }
        }
        panic!("quiescence service out of thread slots ({MAX_SLOTS})");
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        let slot = &SLOTS[self.id.get() - 1];
        debug_assert_eq!(
            slot.state.load(Ordering::Relaxed),
            SLOT_INACTIVE,
            "thread exited inside a critical section"
        );
        slot.claimed.store(false, Ordering::Release);
    }
}

thread_local! {
    static SLOT_TOKEN: SlotToken = SlotToken::claim();
}

// ============================================================================
//  Critical sections
// ============================================================================

/// Enter a read-side critical section for `thread`.
///
/// Until the matching [`critical_section_end`], any chain pointer loaded
/// with acquire ordering stays dereferenceable: unlinking writers cannot
/// pass [`write_synchronize`] while this section is open.
#[inline]
pub fn critical_section_begin(thread: ThreadId) {
    let slot = thread.slot();
    debug_assert_eq!(
        slot.state.load(Ordering::Relaxed),
        SLOT_INACTIVE,
        "critical sections do not nest"
    );

    let epoch = EPOCH.load(Ordering::Relaxed);
    slot.state.store(epoch | SLOT_ACTIVE, Ordering::Relaxed);

    // Store-load barrier: traversal loads below must not float above the
    // slot store, or a concurrent synchronize could miss this reader.
    fence(Ordering::SeqCst);
}

/// Leave the read-side critical section for `thread`.
#[inline]
pub fn critical_section_end(thread: ThreadId) {
    let slot = thread.slot();
    debug_assert_ne!(
        slot.state.load(Ordering::Relaxed),
        SLOT_INACTIVE,
        "not inside a critical section"
    );

    // Release: traversal loads/stores complete before the slot clears.
    slot.state.store(SLOT_INACTIVE, Ordering::Release);
}

/// Wait until every thread currently inside a critical section has left it.
///
/// On return, memory unlinked before the call is unreachable from any
/// reader and may be freed. Callable concurrently from multiple threads;
/// also callable while the calling thread itself is outside any critical
/// section (a writer inside its own section would deadlock, and does not
/// occur in the table).
pub fn write_synchronize() {
    // SeqCst pairs with the entry fence: either the reader's slot store is
    // visible to us, or our bump is visible to the reader.
    let target = EPOCH.fetch_add(EPOCH_INCREMENT, Ordering::SeqCst) + EPOCH_INCREMENT;

    for slot in &SLOTS {
        let mut spins: usize = 0;
        loop {
            let state = slot.state.load(Ordering::Acquire);
            if state & SLOT_ACTIVE == 0 {
                break;
            }
            // Entered at or past our bump: that reader cannot hold
            // anything unlinked before it.
            if (state & !SLOT_ACTIVE).wrapping_sub(target) as isize >= 0 {
                break;
            }
            spins += 1;
            if spins % SPINS_PER_YIELD == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_thread_id_stable_within_thread() {
        let a = ThreadId::current();
        let b = ThreadId::current();
        assert_eq!(a, b);
    }

    #[test]
    fn test_thread_id_raw_is_nonzero() {
        let id = ThreadId::current();
        assert_ne!(id.as_raw(), 0);
        assert_eq!(id.as_raw(), ThreadId::current().as_raw());
    }

    #[test]
    fn test_thread_ids_distinct_across_threads() {
        let here = ThreadId::current();
        let there = thread::spawn(ThreadId::current).join().unwrap();
        assert_ne!(here.as_raw(), there.as_raw());
    }

    #[test]
    fn test_critical_section_roundtrip() {
        let id = ThreadId::current();
        critical_section_begin(id);
        critical_section_end(id);

        // Synchronize with no readers returns immediately.
        write_synchronize();
    }

    #[test]
    fn test_synchronize_waits_for_active_reader() {
        let entered = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let entered = Arc::clone(&entered);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let id = ThreadId::current();
                critical_section_begin(id);
                entered.store(true, Ordering::SeqCst);

                // Stay inside the section long enough for the writer to
                // reach its wait loop.
                thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
                critical_section_end(id);
            })
        };

        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        write_synchronize();
        assert!(
            done.load(Ordering::SeqCst),
            "write_synchronize returned while a reader was still inside"
        );

        reader.join().unwrap();
    }

    #[test]
    fn test_reader_entering_after_bump_does_not_stall_writer() {
        // A reader that begins after the epoch bump is not waited on. We
        // cannot force the interleaving from a test, but repeated rounds of
        // overlapping short sections at least exercise the comparison.
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let id = ThreadId::current();
                while !stop.load(Ordering::Relaxed) {
                    critical_section_begin(id);
                    critical_section_end(id);
                }
            })
        };

        for _ in 0..100 {
            write_synchronize();
        }

        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }
}
