//! Software prefetching utilities for cache optimization.
//!
//! Bulk delete scans entire chains deciding whether a bucket holds any
//! deletable entry before paying for its lock. Telling the CPU about the
//! next chain node (and the next bucket's head) while the predicate runs
//! hides most of the pointer-chase latency.
//!
//! # Architecture Support
//!
//! - **`x86_64`**: Uses `_mm_prefetch` with `_MM_HINT_T0` (all cache levels)
//! - **`aarch64`**: Uses `_prefetch` with locality hint 3 (keep in cache)
//! - **Other**: No-op (safe fallback)

/// Prefetch data for reading into all cache levels.
///
/// This is a hint to the CPU that we're about to read from the given
/// pointer. The CPU may begin fetching the cache line(s) containing
/// this address into L1/L2/L3 cache.
///
/// # Safety
///
/// This function is safe to call:
/// - With null pointers (becomes a no-op)
/// - With invalid pointers (prefetch is a hint, not a load)
/// - The pointer doesn't need to be aligned
#[inline(always)]
pub fn prefetch_read<T>(ptr: *const T) {
    if ptr.is_null() {
        return;
    }

    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: _mm_prefetch is always safe to call.
        // It's a hint that may be ignored by the CPU.
        // Invalid addresses cause no fault (unlike actual loads).
        unsafe {
            std::arch::x86_64::_mm_prefetch(ptr.cast::<i8>(), std::arch::x86_64::_MM_HINT_T0);
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: _prefetch is always safe to call on aarch64.
        // Parameters: pointer, read (0) vs write (1), locality (0-3)
        // Locality 3 = keep in cache as long as possible
        unsafe {
            std::arch::aarch64::_prefetch(
                ptr.cast::<i8>(),
                std::arch::aarch64::_PREFETCH_READ,
                std::arch::aarch64::_PREFETCH_LOCALITY3,
            );
        }
    }

    // No-op on unsupported architectures
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = ptr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefetch_null_is_safe() {
        // Should not panic or crash
        prefetch_read::<u64>(std::ptr::null());
    }

    #[test]
    fn test_prefetch_valid_pointer() {
        let value: u64 = 42;
        let ptr = &raw const value;

        // Should not panic
        prefetch_read(ptr);
    }

    #[test]
    fn test_prefetch_array() {
        let array: [u64; 16] = [0; 16];

        // Prefetch multiple cache lines
        for i in (0..16).step_by(8) {
            prefetch_read(&raw const array[i]);
        }
    }
}
